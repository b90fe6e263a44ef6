//! Shared task vocabulary: platforms and their queue routing, tagging
//! dimensions, task statuses, and the per-task coordination record kept in
//! the queue substrate.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{de::Visitor, Deserialize, Serialize};
use thiserror::Error;

/// Enumeration of errors for parsing task vocabulary from their wire forms.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{0} is not a valid Platform")]
    ParsePlatformError(String),
    #[error("{0} is not a valid Dimension")]
    ParseDimensionError(String),
    #[error("{0} is not a valid TaskStatus")]
    ParseTaskStatusError(String),
    #[error("task detail field {0} is malformed")]
    MalformedDetailField(&'static str),
}

/// Submission platforms accepted by the ingress.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Platform {
    Rpa,
    Files,
    User,
}

impl Platform {
    /// The queue prefix this platform routes to. `rpa` and `files`
    /// submissions share the rpa worker cohort; `user` submissions go to
    /// the miaobi cohort. Routing is policy, so it lives here and nowhere
    /// else.
    pub fn queue_prefix(&self) -> &'static str {
        match self {
            Platform::Rpa | Platform::Files => "rpa",
            Platform::User => "miaobi",
        }
    }
}

/// Allow casting `Platform` from strings.
impl FromStr for Platform {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rpa" => Ok(Platform::Rpa),
            "files" => Ok(Platform::Files),
            "user" => Ok(Platform::User),
            invalid => Err(ParseError::ParsePlatformError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Platform::Rpa => write!(f, "rpa"),
            Platform::Files => write!(f, "files"),
            Platform::User => write!(f, "user"),
        }
    }
}

struct PlatformVisitor;

impl<'de> Visitor<'de> for PlatformVisitor {
    type Value = Platform;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the string representation of Platform")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        match Platform::from_str(s) {
            Ok(platform) => Ok(platform),
            Err(_) => Err(serde::de::Error::invalid_value(
                serde::de::Unexpected::Str(s),
                &self,
            )),
        }
    }
}

/// Deserialize required to read `Platform` from submissions and the detail hash.
impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(PlatformVisitor)
    }
}

/// Serialize required to write `Platform` back out as its wire form.
impl Serialize for Platform {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A named axis of tag generation, each backed by its own system prompt.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum Dimension {
    Vision,
    Audio,
    Content,
    Business,
}

/// The fixed processing order for a whole-job (`all`) fan-out.
pub const DIMENSION_ORDER: [Dimension; 4] = [
    Dimension::Vision,
    Dimension::Audio,
    Dimension::Content,
    Dimension::Business,
];

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Vision => "vision",
            Dimension::Audio => "audio",
            Dimension::Content => "content",
            Dimension::Business => "business",
        }
    }
}

impl FromStr for Dimension {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vision" => Ok(Dimension::Vision),
            "audio" => Ok(Dimension::Audio),
            "content" => Ok(Dimension::Content),
            "business" => Ok(Dimension::Business),
            invalid => Err(ParseError::ParseDimensionError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the caller asked to have tagged: every configured dimension, or a
/// single one. The selector is persisted as submitted (`all` stays the
/// literal `all`) and expanded only at processing time.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DimensionSelector {
    All,
    One(Dimension),
}

impl DimensionSelector {
    /// The ordered set of dimensions a worker runs for this selector.
    pub fn dimensions(&self) -> Vec<Dimension> {
        match self {
            DimensionSelector::All => DIMENSION_ORDER.to_vec(),
            DimensionSelector::One(dimension) => vec![*dimension],
        }
    }
}

impl FromStr for DimensionSelector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(DimensionSelector::All),
            other => Ok(DimensionSelector::One(Dimension::from_str(other)?)),
        }
    }
}

impl fmt::Display for DimensionSelector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DimensionSelector::All => write!(f, "all"),
            DimensionSelector::One(dimension) => write!(f, "{}", dimension),
        }
    }
}

struct DimensionSelectorVisitor;

impl<'de> Visitor<'de> for DimensionSelectorVisitor {
    type Value = DimensionSelector;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a dimension name or \"all\"")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        DimensionSelector::from_str(s).map_err(|_| {
            serde::de::Error::invalid_value(serde::de::Unexpected::Str(s), &self)
        })
    }
}

impl<'de> Deserialize<'de> for DimensionSelector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(DimensionSelectorVisitor)
    }
}

impl Serialize for DimensionSelector {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Enumeration of possible statuses for a Task. Transitions are monotonic
/// within pending → processing → (completed | failed).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            invalid => Err(ParseError::ParseTaskStatusError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated submission as accepted by the ingress and handed to the
/// producer.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Submission {
    pub url: String,
    pub platform: Platform,
    pub dimensions: DimensionSelector,
    #[serde(default)]
    pub uid: Option<String>,
    /// Material identifiers forwarded to the downstream index service, when
    /// one is configured.
    #[serde(default)]
    pub material_ids: Option<Vec<String>>,
}

/// The per-dimension outcome recorded in the task's `message` column.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct DimensionMessage {
    pub status: String,
    pub message: String,
}

impl DimensionMessage {
    pub fn success() -> Self {
        Self {
            status: "success".to_owned(),
            message: "success".to_owned(),
        }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            status: "failed".to_owned(),
            message: message.to_owned(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// The result bundle a worker assembles while fanning out over dimensions,
/// persisted wholesale into the task row's `tags` and `message` columns.
#[derive(Debug, Default, Serialize)]
pub struct TagReport {
    pub tags: serde_json::Map<String, serde_json::Value>,
    pub message: BTreeMap<String, DimensionMessage>,
}

impl TagReport {
    pub fn record_success(&mut self, dimension: Dimension, tags: serde_json::Value) {
        self.tags.insert(dimension.to_string(), tags);
        self.message
            .insert(dimension.to_string(), DimensionMessage::success());
    }

    /// A failed dimension keeps an empty tag object so that `tags` never
    /// goes null once processing has begun.
    pub fn record_failure(&mut self, dimension: Dimension, reason: &str) {
        self.tags.insert(
            dimension.to_string(),
            serde_json::Value::Object(serde_json::Map::new()),
        );
        self.message
            .insert(dimension.to_string(), DimensionMessage::failed(reason));
    }

    /// A dimension-independent failure of the whole job, keyed `all`.
    pub fn whole_job_failure(reason: &str) -> Self {
        let mut report = Self::default();
        report
            .message
            .insert("all".to_owned(), DimensionMessage::failed(reason));
        report
    }

    /// Completed only when every recorded dimension succeeded.
    pub fn final_status(&self) -> TaskStatus {
        if self.message.values().any(|m| !m.is_success()) {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        }
    }

    pub fn tags_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.tags.clone())
    }

    pub fn message_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.message).expect("message map serializes")
    }
}

/// Join every non-success entry of a stored `message` column into the
/// user-visible summary, or `success` when nothing failed.
pub fn join_failure_messages(message: &serde_json::Value) -> String {
    let mut errors = Vec::new();
    if let Some(map) = message.as_object() {
        for (dimension, entry) in map {
            let status = entry.get("status").and_then(|s| s.as_str()).unwrap_or("");
            if status != "success" {
                if let Some(text) = entry.get("message").and_then(|m| m.as_str()) {
                    if !text.is_empty() {
                        errors.push(format!("{}: {}", dimension, text));
                    }
                }
            }
        }
    }
    if errors.is_empty() {
        "success".to_owned()
    } else {
        errors.join("; ")
    }
}

/// The ephemeral per-task coordination record, stored as a hash in the
/// queue substrate. Written by the producer, mutated by the worker, deleted
/// after terminal completion.
#[derive(Debug, PartialEq, Clone)]
pub struct TaskDetail {
    pub url: String,
    pub uid: String,
    pub platform: Platform,
    pub dimensions: DimensionSelector,
    pub retry_count: u32,
    pub created_at: i64,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub material_ids: Vec<String>,
}

impl TaskDetail {
    pub fn new(submission: &Submission, created_at: i64) -> Self {
        Self {
            url: submission.url.clone(),
            uid: submission.uid.clone().unwrap_or_default(),
            platform: submission.platform,
            dimensions: submission.dimensions,
            retry_count: 0,
            created_at,
            status: TaskStatus::Pending,
            message: None,
            material_ids: submission.material_ids.clone().unwrap_or_default(),
        }
    }

    /// Field pairs for an HSET of the detail hash.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("url", self.url.clone()),
            ("uid", self.uid.clone()),
            ("platform", self.platform.to_string()),
            ("dimensions", self.dimensions.to_string()),
            ("retry_count", self.retry_count.to_string()),
            ("created_at", self.created_at.to_string()),
            ("status", self.status.to_string()),
        ];
        if let Some(message) = &self.message {
            fields.push(("message", message.clone()));
        }
        if !self.material_ids.is_empty() {
            fields.push((
                "material_ids",
                serde_json::to_string(&self.material_ids).expect("string list serializes"),
            ));
        }
        fields
    }

    /// Rebuild a detail from an HGETALL result. An empty hash (expired or
    /// deleted key) is `None`.
    pub fn from_hash(hash: &HashMap<String, String>) -> Result<Option<Self>, ParseError> {
        if hash.is_empty() {
            return Ok(None);
        }
        let url = hash
            .get("url")
            .cloned()
            .ok_or(ParseError::MalformedDetailField("url"))?;
        let platform = hash
            .get("platform")
            .ok_or(ParseError::MalformedDetailField("platform"))?
            .parse()?;
        let dimensions = hash
            .get("dimensions")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(DimensionSelector::All);
        let retry_count = match hash.get("retry_count") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ParseError::MalformedDetailField("retry_count"))?,
            None => 0,
        };
        let created_at = match hash.get("created_at") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ParseError::MalformedDetailField("created_at"))?,
            None => 0,
        };
        let status = hash
            .get("status")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(TaskStatus::Pending);
        let material_ids = match hash.get("material_ids") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|_| ParseError::MalformedDetailField("material_ids"))?,
            None => Vec::new(),
        };

        Ok(Some(Self {
            url,
            uid: hash.get("uid").cloned().unwrap_or_default(),
            platform,
            dimensions,
            retry_count,
            created_at,
            status,
            message: hash.get("message").cloned(),
            material_ids,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_routing() {
        assert_eq!(Platform::Rpa.queue_prefix(), "rpa");
        assert_eq!(Platform::Files.queue_prefix(), "rpa");
        assert_eq!(Platform::User.queue_prefix(), "miaobi");
    }

    #[test]
    fn test_platform_from_str() {
        assert_eq!("rpa".parse::<Platform>().unwrap(), Platform::Rpa);
        assert_eq!("files".parse::<Platform>().unwrap(), Platform::Files);
        assert_eq!("user".parse::<Platform>().unwrap(), Platform::User);
        assert!("miaobi".parse::<Platform>().is_err());
    }

    #[test]
    fn test_selector_expansion() {
        assert_eq!(
            DimensionSelector::All.dimensions(),
            vec![
                Dimension::Vision,
                Dimension::Audio,
                Dimension::Content,
                Dimension::Business
            ]
        );
        assert_eq!(
            DimensionSelector::One(Dimension::Audio).dimensions(),
            vec![Dimension::Audio]
        );
    }

    #[test]
    fn test_selector_round_trip() {
        for raw in ["all", "vision", "audio", "content", "business"] {
            let selector: DimensionSelector = raw.parse().unwrap();
            assert_eq!(selector.to_string(), raw);
        }
        assert!("everything".parse::<DimensionSelector>().is_err());
    }

    #[test]
    fn test_status_transitions_vocabulary() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_report_all_success() {
        let mut report = TagReport::default();
        for dimension in DIMENSION_ORDER {
            report.record_success(dimension, serde_json::json!({"scene": "indoor"}));
        }
        assert_eq!(report.final_status(), TaskStatus::Completed);
        assert_eq!(report.tags.len(), 4);
        assert!(report.message.values().all(|m| m.is_success()));
    }

    #[test]
    fn test_report_isolates_failed_dimension() {
        let mut report = TagReport::default();
        report.record_success(Dimension::Vision, serde_json::json!({"scene": "indoor"}));
        report.record_failure(Dimension::Content, "response was not valid JSON");
        report.record_success(Dimension::Business, serde_json::json!({"intent": "ad"}));

        assert_eq!(report.final_status(), TaskStatus::Failed);
        assert_eq!(report.tags.get("content"), Some(&serde_json::json!({})));
        assert_eq!(
            report.tags.get("vision"),
            Some(&serde_json::json!({"scene": "indoor"}))
        );
        assert!(!report.message.get("content").unwrap().is_success());
    }

    #[test]
    fn test_whole_job_failure_keyed_all() {
        let report = TagReport::whole_job_failure("download failed");
        assert_eq!(report.final_status(), TaskStatus::Failed);
        let entry = report.message.get("all").unwrap();
        assert_eq!(entry.status, "failed");
        assert_eq!(entry.message, "download failed");
        assert!(report.tags.is_empty());
    }

    #[test]
    fn test_join_failure_messages() {
        let message = serde_json::json!({
            "vision": {"status": "success", "message": "success"},
            "content": {"status": "failed", "message": "response was not valid JSON"},
            "audio": {"status": "failed", "message": "empty response"},
        });
        let joined = join_failure_messages(&message);
        assert!(joined.contains("content: response was not valid JSON"));
        assert!(joined.contains("audio: empty response"));
        assert!(!joined.contains("vision"));

        let all_good = serde_json::json!({
            "vision": {"status": "success", "message": "success"},
        });
        assert_eq!(join_failure_messages(&all_good), "success");
    }

    #[test]
    fn test_detail_hash_round_trip() {
        let submission = Submission {
            url: "https://host/v.mp4".to_owned(),
            platform: Platform::Files,
            dimensions: DimensionSelector::All,
            uid: Some("u-42".to_owned()),
            material_ids: Some(vec!["m-1".to_owned(), "m-2".to_owned()]),
        };
        let detail = TaskDetail::new(&submission, 1_700_000_000);

        let hash: HashMap<String, String> = detail
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        let parsed = TaskDetail::from_hash(&hash).unwrap().unwrap();

        assert_eq!(parsed, detail);
    }

    #[test]
    fn test_detail_from_empty_hash() {
        assert!(TaskDetail::from_hash(&HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_detail_rejects_bad_retry_count() {
        let mut hash = HashMap::new();
        hash.insert("url".to_owned(), "https://host/v.mp4".to_owned());
        hash.insert("platform".to_owned(), "rpa".to_owned());
        hash.insert("retry_count".to_owned(), "many".to_owned());
        assert!(TaskDetail::from_hash(&hash).is_err());
    }
}
