use anyhow::{Result, Context};
use keyring::Entry;
use yup_oauth2::{InstalledFlowAuthenticator, InstalledFlowReturnMethod, ApplicationSecret, read_application_secret};
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;
use google_gmail1::oauth2;
use futures::future::BoxFuture;
use std::path::Path;
use tracing::{info, warn};

use yup_oauth2::storage::{TokenStorage, TokenInfo};
use serde::{Serialize, Deserialize};
use async_trait::async_trait;

const APP_NAME: &str = "mailq";
const TOKEN_KEY: &str = "gmail_token";

/// Sending is all the queue needs.
pub const SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.send"];

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenData {
    tokens: Vec<TokenInfo>,
}

/// Keeps the OAuth token in the OS keyring instead of a file next to the queue.
pub struct RingStorage;

#[async_trait]
impl TokenStorage for RingStorage {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> Result<()> {
        let entry = Self::entry()?;

        let data = TokenData { tokens: vec![token] };
        let serialized = serde_json::to_string(&data)
            .context("Failed to serialize tokens")?;

        entry.set_password(&serialized)
            .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))?;

        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        match self.get_all().await {
            Ok(data) => data.tokens.first().cloned(),
            Err(e) => {
                warn!(error = %e, "Could not read stored token");
                None
            }
        }
    }
}

impl RingStorage {
    fn entry() -> Result<Entry> {
        Entry::new(APP_NAME, TOKEN_KEY)
            .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))
    }

    async fn get_all(&self) -> Result<TokenData> {
        match Self::entry()?.get_password() {
            Ok(serialized) => serde_json::from_str(&serialized)
                .context("Failed to deserialize tokens"),
            Err(keyring::Error::NoEntry) => Ok(TokenData::default()),
            Err(e) => Err(anyhow::anyhow!("Keyring error: {}", e)),
        }
    }

    /// Forgets the stored token; the next run asks for consent again.
    pub async fn clear_token(&self) -> Result<()> {
        match Self::entry()?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Keyring error: {}", e)),
        }
    }
}

/// Opens the consent page in a browser, printing the link as a fallback
/// for headless hosts.
pub struct BrowserDelegate;

impl InstalledFlowDelegate for BrowserDelegate {
    fn present_user_url<'a>(
        &'a self,
        url: &'a str,
        _need_code: bool,
    ) -> BoxFuture<'a, std::result::Result<String, String>> {
        Box::pin(async move {
            info!("Authorize mailq to send mail: {}", url);
            if let Err(e) = open::that(url) {
                warn!(error = %e, "Could not open a browser, visit the link manually");
            }
            Ok(String::new())
        })
    }
}

pub struct Authenticator;

impl Authenticator {
    pub async fn load_secret<P: AsRef<Path>>(path: P) -> Result<ApplicationSecret> {
        read_application_secret(path).await.context("Failed to read application secret")
    }

    pub async fn authenticate(secret: ApplicationSecret) -> Result<oauth2::authenticator::Authenticator<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>> {
        let auth = InstalledFlowAuthenticator::builder(
            secret,
            InstalledFlowReturnMethod::HTTPRedirect,
        )
        .with_storage(Box::new(RingStorage))
        .flow_delegate(Box::new(BrowserDelegate))
        .build()
        .await
        .context("Failed to build authenticator")?;

        Ok(auth)
    }
}
