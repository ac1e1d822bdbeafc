use crate::auth;
use crate::error::TransportError;
use crate::message::OutgoingMessage;
use crate::render::{self, Bcc};
use crate::transport::Transport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use google_gmail1::Gmail;
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Sends through the Gmail API as the authenticated user.
#[derive(Clone)]
pub struct GmailTransport {
    hub: Gmail<HttpsConnector<HttpConnector>>,
}

impl GmailTransport {
    pub fn new(hub: Gmail<HttpsConnector<HttpConnector>>) -> Self {
        Self { hub }
    }

    /// Authenticates with the client secret at `credentials` and builds the hub.
    /// The first run walks through the browser consent flow; later runs reuse
    /// the token from the keyring.
    pub async fn connect(credentials: &Path) -> Result<Self> {
        let secret = auth::Authenticator::load_secret(credentials).await?;
        let authenticator = auth::Authenticator::authenticate(secret).await?;
        authenticator
            .token(auth::SCOPES)
            .await
            .context("Failed to obtain Gmail token")?;

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .context("Failed to load native roots")?
            .https_only()
            .enable_http1()
            .build();
        let hub = Gmail::new(hyper::Client::builder().build(connector), authenticator);
        Ok(Self::new(hub))
    }

    async fn upload(&self, raw: Vec<u8>) -> Result<()> {
        self.hub
            .users()
            .messages_send(google_gmail1::api::Message::default(), "me")
            .upload(Cursor::new(raw), "message/rfc822".parse::<::mime::Mime>().expect("valid media type"))
            .await
            .context("Failed to send message")?;
        Ok(())
    }
}

#[async_trait]
impl Transport for GmailTransport {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let raw = raw_message(message)?;
        debug!(task_id = message.task_id, bytes = raw.len(), "Uploading message to Gmail");
        self.upload(raw).await?;
        Ok(())
    }
}

/// Gmail reads the recipients from the headers and strips Bcc itself.
fn raw_message(message: &OutgoingMessage) -> Result<Vec<u8>, TransportError> {
    render::render(message, Utc::now(), Bcc::Keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::MimeNode;
    use crate::models::Address;

    #[test]
    fn upload_keeps_bcc_recipients() {
        let message = OutgoingMessage {
            task_id: 3,
            from: vec![Address::new("app@example.com", None)],
            to: vec![Address::new("user@example.com", None)],
            cc: Vec::new(),
            bcc: vec![Address::new("audit@example.com", None)],
            reply_to: None,
            subject: "Receipt".to_string(),
            encoding: "UTF-8".to_string(),
            headers: Vec::new(),
            body: MimeNode::Empty,
        };

        let raw = String::from_utf8(raw_message(&message).unwrap()).unwrap();
        assert!(raw.contains("Bcc: audit@example.com\r\n"));
        assert!(raw.contains("Subject: Receipt\r\n"));
    }

    #[test]
    fn upload_media_type_is_a_whole_message() {
        assert_eq!(::mime::MESSAGE_RFC822.essence_str(), "message/rfc822");
    }
}
