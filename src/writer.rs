use std::sync::Arc;

use chrono::Utc;
use encoding_rs::UTF_8;
use tracing::{info, warn};

use crate::draft::EmailDraft;
use crate::error::Result;
use crate::models::{EmailPart, NewTask, Recipients, TaskId, TEXT_HTML, TEXT_PLAIN};
use crate::store::QueueStore;

/// Validates drafts and stores them as waiting tasks.
#[derive(Clone)]
pub struct QueueWriter {
    store: Arc<dyn QueueStore>,
}

impl QueueWriter {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Queues `draft` for dispatch. Nothing is written unless the draft is
    /// valid, and the task, parts and headers land together or not at all.
    pub async fn enqueue(&self, draft: &EmailDraft) -> Result<TaskId> {
        if let Err(e) = draft.validate() {
            warn!(error = %e, "Rejected email draft");
            return Err(e.into());
        }

        let task = NewTask {
            priority: draft.priority,
            created_at: Utc::now(),
            authors: draft.authors.clone(),
            recipients: Recipients {
                to: draft.to.clone(),
                cc: draft.cc.clone(),
                bcc: draft.bcc.clone(),
            },
            reply_to: draft.reply_to.clone(),
            subject: draft.subject.clone().unwrap_or_default(),
            encoding: draft.charset().unwrap_or(UTF_8).name().to_string(),
            context: draft.context.clone(),
            context_identifier: draft.context_identifier,
            headers: draft.headers.clone(),
        };
        let parts = parts_of(draft);

        let id = self.store.insert_task(&task, &parts).await?;
        info!(
            task_id = id,
            parts = parts.len(),
            priority = task.priority,
            context = task.context.as_deref().unwrap_or("-"),
            "Queued email"
        );
        Ok(id)
    }
}

/// Stored parts in persisted order: plain body, HTML body, then attachments
/// as authored. Bodies are encoded in the draft's charset and labelled with
/// its canonical name.
pub fn parts_of(draft: &EmailDraft) -> Vec<EmailPart> {
    let charset = draft.charset().unwrap_or(UTF_8);
    let body = |mime_type: &str, contents: &str| {
        let (bytes, _, unmappable) = charset.encode(contents);
        if unmappable {
            warn!(
                charset = charset.name(),
                mime_type, "Body has characters the charset lacks, replaced with references"
            );
        }
        EmailPart {
            mime_type: mime_type.to_string(),
            encoding: None,
            charset: Some(charset.name().to_string()),
            disposition: None,
            filename: None,
            content_id: None,
            contents: bytes.into_owned(),
        }
    };

    let mut parts = Vec::with_capacity(draft.attachments.len() + 2);
    if let Some(plain) = &draft.contents_plain {
        parts.push(body(TEXT_PLAIN, plain));
    }
    if let Some(html) = &draft.contents_html {
        parts.push(body(TEXT_HTML, html));
    }
    parts.extend(draft.attachments.iter().map(|a| EmailPart {
        mime_type: a.mime_type.clone().unwrap_or_default(),
        encoding: a.encoding.clone(),
        charset: a.charset.clone(),
        disposition: a.disposition,
        filename: a.filename.clone(),
        content_id: a.content_id.clone(),
        contents: a.contents.clone().unwrap_or_default(),
    }));
    parts
}
