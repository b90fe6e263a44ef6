//! Optional downstream search-index client. Delivery is at-least-once and
//! best-effort: a rejected or failed submission is logged, never fatal to
//! the job that produced the tags.

use std::time;

use serde_derive::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("request to the index service failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("index service rejected the submission with code {0}")]
    Rejected(i64),
}

#[derive(Serialize, Debug)]
struct IndexSubmission<'a> {
    material_ids: &'a [String],
    tags: &'a serde_json::Value,
}

pub struct IndexClient {
    client: reqwest::Client,
    url: String,
}

impl IndexClient {
    pub fn new(url: &str, timeout: time::Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("vision-tagger worker")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.to_owned(),
        })
    }

    pub async fn submit(
        &self,
        material_ids: &[String],
        tags: &serde_json::Value,
    ) -> Result<(), IndexError> {
        let body = IndexSubmission { material_ids, tags };
        let response = self.client.post(&self.url).json(&body).send().await?;
        let payload: serde_json::Value = response.json().await?;

        if is_accepted(&payload) {
            Ok(())
        } else {
            Err(IndexError::Rejected(
                payload
                    .get("code")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or_default(),
            ))
        }
    }
}

/// The service acknowledges with `code == 10000`; anything else is a
/// rejection.
fn is_accepted(payload: &serde_json::Value) -> bool {
    payload.get("code").and_then(serde_json::Value::as_i64) == Some(10000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_accepted() {
        assert!(is_accepted(&serde_json::json!({"code": 10000})));
        assert!(!is_accepted(&serde_json::json!({"code": 10001})));
        assert!(!is_accepted(&serde_json::json!({"code": "10000"})));
        assert!(!is_accepted(&serde_json::json!({})));
    }

    #[test]
    fn test_submission_shape() {
        let material_ids = vec!["m-1".to_owned()];
        let tags = serde_json::json!({"vision": {"scene": "indoor"}});
        let body = IndexSubmission {
            material_ids: &material_ids,
            tags: &tags,
        };
        let encoded = serde_json::to_value(&body).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!({
                "material_ids": ["m-1"],
                "tags": {"vision": {"scene": "indoor"}},
            })
        );
    }
}
