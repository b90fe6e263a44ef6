//! Pre-dispatch validation of a submitted video URL: reachability, size
//! cap, and format allow-list, all from a single HEAD request.

use std::time;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("video url could not be parsed")]
    InvalidUrl(#[from] url::ParseError),
    #[error("video url is not reachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("video url responded with status {0}")]
    BadStatus(u16),
    #[error("video is {size_mb} MB, over the {limit_mb} MB limit")]
    TooLarge { size_mb: u64, limit_mb: u64 },
    #[error("unsupported video format {content_type:?}, supported: {supported}")]
    UnsupportedFormat {
        content_type: String,
        supported: String,
    },
}

pub struct VideoProbe {
    client: reqwest::Client,
    max_size_mb: u64,
    allowed_formats: Vec<String>,
}

impl VideoProbe {
    pub fn new(
        max_size_mb: u64,
        allowed_formats: Vec<String>,
        timeout: time::Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("vision-tagger probe")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            max_size_mb,
            allowed_formats,
        })
    }

    /// HEAD the URL and check what the server claims about the file. The
    /// worker re-validates during download; this is the fast rejection for
    /// callers.
    pub async fn validate(&self, raw_url: &str) -> Result<(), ProbeError> {
        let parsed = url::Url::parse(raw_url)?;

        let response = self.client.head(parsed).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(ProbeError::BadStatus(response.status().as_u16()));
        }

        let content_length = response.content_length();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        self.check_size(content_length)?;
        self.check_format(&content_type)?;
        Ok(())
    }

    fn check_size(&self, content_length: Option<u64>) -> Result<(), ProbeError> {
        // Servers that omit content-length get the benefit of the doubt;
        // the worker enforces the cap again on download.
        let Some(bytes) = content_length else {
            return Ok(());
        };
        let size_mb = bytes / (1024 * 1024);
        if size_mb > self.max_size_mb {
            return Err(ProbeError::TooLarge {
                size_mb,
                limit_mb: self.max_size_mb,
            });
        }
        Ok(())
    }

    fn check_format(&self, content_type: &str) -> Result<(), ProbeError> {
        let lowered = content_type.to_lowercase();
        if self
            .allowed_formats
            .iter()
            .any(|format| lowered.contains(format))
        {
            Ok(())
        } else {
            Err(ProbeError::UnsupportedFormat {
                content_type: content_type.to_owned(),
                supported: self.allowed_formats.join(", "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> VideoProbe {
        VideoProbe::new(
            100,
            vec!["mp4".to_owned(), "mov".to_owned()],
            time::Duration::from_secs(5),
        )
        .expect("failed to build probe")
    }

    #[test]
    fn test_check_size() {
        let probe = probe();
        assert!(probe.check_size(None).is_ok());
        assert!(probe.check_size(Some(50 * 1024 * 1024)).is_ok());
        assert!(probe.check_size(Some(100 * 1024 * 1024)).is_ok());

        let err = probe.check_size(Some(250 * 1024 * 1024)).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::TooLarge {
                size_mb: 250,
                limit_mb: 100
            }
        ));
    }

    #[test]
    fn test_check_format() {
        let probe = probe();
        assert!(probe.check_format("video/mp4").is_ok());
        assert!(probe.check_format("video/quicktime; codecs=mov").is_ok());
        assert!(probe.check_format("VIDEO/MP4").is_ok());
        assert!(probe.check_format("image/png").is_err());
        assert!(probe.check_format("").is_err());
    }

    #[tokio::test]
    async fn test_validate_rejects_garbage_url() {
        let err = probe().validate("not a url").await.unwrap_err();
        assert!(matches!(err, ProbeError::InvalidUrl(_)));
    }
}
