use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type TaskId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Sent,
    Error,
    /// Failed `max_retries` times; never selected again.
    Exhausted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Sent => "sent",
            TaskStatus::Error => "error",
            TaskStatus::Exhausted => "exhausted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(TaskStatus::Waiting),
            "sent" => Some(TaskStatus::Sent),
            "error" => Some(TaskStatus::Error),
            "exhausted" => Some(TaskStatus::Exhausted),
            _ => None,
        }
    }

    /// Statuses the dispatcher picks up, subject to the retry bound.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, TaskStatus::Waiting | TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Address {
    pub fn new(address: impl Into<String>, label: Option<&str>) -> Self {
        Self {
            address: address.into(),
            label: label.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipients {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<Address>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<Address>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Inline,
    Attachment,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Inline => "inline",
            Disposition::Attachment => "attachment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inline" => Some(Disposition::Inline),
            "attachment" => Some(Disposition::Attachment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// A queued email as stored in the `email` table.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailTask {
    pub id: TaskId,
    pub status: TaskStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub authors: Vec<Address>,
    pub recipients: Recipients,
    pub reply_to: Option<Address>,
    pub subject: String,
    pub encoding: String,
    pub context: Option<String>,
    pub context_identifier: Option<i64>,
    pub last_error: Option<String>,
}

/// Everything the writer persists for a fresh task, minus the generated id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub authors: Vec<Address>,
    pub recipients: Recipients,
    pub reply_to: Option<Address>,
    pub subject: String,
    pub encoding: String,
    pub context: Option<String>,
    pub context_identifier: Option<i64>,
    pub headers: Vec<Header>,
}

/// Dispatcher write-back for a single task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub retry_count: u32,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// One content unit of a task, as stored in the `email_part` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailPart {
    pub mime_type: String,
    pub encoding: Option<String>,
    pub charset: Option<String>,
    pub disposition: Option<Disposition>,
    pub filename: Option<String>,
    pub content_id: Option<String>,
    pub contents: Vec<u8>,
}

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_HTML: &str = "text/html";

impl EmailPart {
    /// Compares the media type, ignoring case and any parameters.
    pub fn is_type(&self, mime_type: &str) -> bool {
        self.mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .eq_ignore_ascii_case(mime_type)
    }

    /// Body parts are the text alternatives, carrying no disposition.
    pub fn is_body(&self) -> bool {
        self.disposition.is_none()
    }

    pub fn is_inline(&self) -> bool {
        self.disposition == Some(Disposition::Inline)
    }

    pub fn is_attachment(&self) -> bool {
        self.disposition == Some(Disposition::Attachment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipients_serialize_without_empty_lists() {
        let recipients = Recipients {
            to: vec![Address::new("a@example.com", Some("A"))],
            ..Default::default()
        };
        let json = serde_json::to_string(&recipients).unwrap();
        assert_eq!(json, r#"{"to":[{"address":"a@example.com","label":"A"}]}"#);

        let decoded: Recipients = serde_json::from_str(r#"{"cc":[{"address":"c@example.com"}]}"#).unwrap();
        assert!(decoded.to.is_empty());
        assert_eq!(decoded.cc[0].label, None);
    }

    #[test]
    fn mime_type_matching_ignores_case_and_params() {
        let part = EmailPart {
            mime_type: "Text/HTML; charset=utf-8".to_string(),
            encoding: None,
            charset: None,
            disposition: None,
            filename: None,
            content_id: None,
            contents: Vec::new(),
        };
        assert!(part.is_type(TEXT_HTML));
        assert!(!part.is_type(TEXT_PLAIN));
        assert!(part.is_body());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TaskStatus::Waiting,
            TaskStatus::Sent,
            TaskStatus::Error,
            TaskStatus::Exhausted,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("queued"), None);
        assert!(!TaskStatus::Exhausted.is_dispatchable());
    }
}
