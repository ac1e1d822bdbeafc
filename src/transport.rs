use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use lettre::{AsyncFileTransport, AsyncTransport, Tokio1Executor};
use tracing::debug;

use crate::error::TransportError;
use crate::message::OutgoingMessage;
use crate::render::{self, Bcc};

/// Hands a composed message to whatever actually delivers it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError>;
}

/// Writes each message into a pickup directory as `<id>.eml`, with the
/// envelope (Bcc recipients included) next to it as `<id>.json`.
pub struct DropDirTransport {
    dir: PathBuf,
    files: AsyncFileTransport<Tokio1Executor>,
}

impl DropDirTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            files: AsyncFileTransport::with_envelope(&dir),
            dir,
        }
    }
}

#[async_trait]
impl Transport for DropDirTransport {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let email = render::build(message, Utc::now(), Bcc::Strip)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let id = self
            .files
            .send(email)
            .await
            .map_err(|e| TransportError::Provider(format!("Failed to write message: {e}")))?;

        debug!(task_id = message.task_id, id = %id, dir = %self.dir.display(), "Dropped message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::MimeNode;
    use crate::models::Address;

    fn message(task_id: i64) -> OutgoingMessage {
        OutgoingMessage {
            task_id,
            from: vec![Address::new("from@example.com", None)],
            to: vec![Address::new("to@example.com", None)],
            cc: Vec::new(),
            bcc: vec![Address::new("hidden@example.com", None)],
            reply_to: None,
            subject: "Drop".to_string(),
            encoding: "UTF-8".to_string(),
            headers: Vec::new(),
            body: MimeNode::Empty,
        }
    }

    #[tokio::test]
    async fn drop_dir_writes_message_and_envelope() {
        let dir = std::env::temp_dir().join(format!("mailq-drop-{}", std::process::id()));
        let transport = DropDirTransport::new(&dir);
        transport.send(&message(7)).await.unwrap();

        let mut eml = Vec::new();
        let mut json = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("eml") => eml.push(path),
                Some("json") => json.push(path),
                _ => {}
            }
        }
        assert_eq!(eml.len(), 1);
        assert_eq!(json.len(), 1);

        let contents = tokio::fs::read_to_string(&eml[0]).await.unwrap();
        assert!(contents.contains("Subject: Drop\r\n"));
        assert!(!contents.contains("hidden@example.com"));

        let envelope = tokio::fs::read_to_string(&json[0]).await.unwrap();
        assert!(envelope.contains("hidden@example.com"));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn unbuildable_message_writes_nothing() {
        let dir = std::env::temp_dir().join(format!("mailq-drop-bad-{}", std::process::id()));
        let transport = DropDirTransport::new(&dir);
        let mut bad = message(8);
        bad.to = vec![Address::new("nobody", None)];

        assert!(matches!(
            transport.send(&bad).await,
            Err(TransportError::InvalidMessage(_))
        ));
        assert!(tokio::fs::metadata(&dir).await.is_err());
    }
}
