//! Assembles the outgoing message for a task: envelope, headers and body.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::config::{DeliveryConfig, Environment, FilterAction};
use crate::error::TransportError;
use crate::mime::{self, MimeNode};
use crate::models::{Address, EmailPart, EmailTask, Header, TaskId};

/// A fully built message, ready for a [`crate::transport::Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub task_id: TaskId,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Option<Address>,
    pub subject: String,
    pub encoding: String,
    pub headers: Vec<Header>,
    pub body: MimeNode,
}

impl OutgoingMessage {
    /// Every address the message is delivered to, Bcc included.
    pub fn envelope_recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(&self.cc).chain(&self.bcc)
    }
}

/// Result of preparing a task for sending.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    Ready(OutgoingMessage),
    /// Every "to" recipient was filtered out; nothing to hand to the transport.
    Suppressed { dropped: Vec<String> },
}

/// Decides which "to" recipients are allowed to receive mail.
///
/// Production delivers to everyone. Test environments only deliver to the
/// allow-list and either drop or reject the rest.
#[derive(Debug, Clone, Default)]
pub struct RecipientPolicy {
    environment: Environment,
    allowed: HashSet<String>,
    on_filtered: FilterAction,
}

impl RecipientPolicy {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            environment: config.environment,
            allowed: config
                .allowed_recipients
                .iter()
                .map(|a| a.trim().to_ascii_lowercase())
                .collect(),
            on_filtered: config.on_filtered,
        }
    }

    pub fn permits(&self, address: &str) -> bool {
        self.environment == Environment::Production
            || self.allowed.contains(&address.trim().to_ascii_lowercase())
    }

    /// Splits `to` into the kept recipients and the dropped addresses.
    fn filter(&self, to: &[Address]) -> (Vec<Address>, Vec<String>) {
        let mut kept = Vec::with_capacity(to.len());
        let mut dropped = Vec::new();
        for recipient in to {
            if self.permits(&recipient.address) {
                kept.push(recipient.clone());
            } else {
                dropped.push(recipient.address.clone());
            }
        }
        (kept, dropped)
    }
}

fn present(addresses: &[Address]) -> Vec<Address> {
    addresses
        .iter()
        .filter(|a| !a.address.trim().is_empty())
        .cloned()
        .collect()
}

/// Builds the message for `task` from its stored parts and headers.
pub fn prepare(
    task: &EmailTask,
    parts: &[EmailPart],
    headers: &[Header],
    policy: &RecipientPolicy,
) -> Result<Prepared, TransportError> {
    if task.authors.iter().any(|a| a.address.trim().is_empty()) {
        return Err(TransportError::InvalidMessage(
            "author address is missing".to_string(),
        ));
    }

    let (to, dropped) = policy.filter(&present(&task.recipients.to));
    if !dropped.is_empty() {
        match policy.on_filtered {
            FilterAction::Reject => {
                return Err(TransportError::Rejected(dropped.join(", ")));
            }
            FilterAction::Drop => {
                info!(task_id = task.id, dropped = ?dropped, "Dropped recipients outside the allow-list");
            }
        }
        if to.is_empty() {
            return Ok(Prepared::Suppressed { dropped });
        }
    }

    let reply_to = task
        .reply_to
        .clone()
        .filter(|r| !r.address.trim().is_empty());
    if task.reply_to.is_some() && reply_to.is_none() {
        debug!(task_id = task.id, "Skipping reply-to without an address");
    }

    Ok(Prepared::Ready(OutgoingMessage {
        task_id: task.id,
        from: task.authors.clone(),
        to,
        cc: present(&task.recipients.cc),
        bcc: present(&task.recipients.bcc),
        reply_to,
        subject: task.subject.clone(),
        encoding: task.encoding.clone(),
        headers: headers.to_vec(),
        body: mime::compose(parts),
    }))
}
