//! Turns an [`OutgoingMessage`] into a `lettre` message.
//!
//! `lettre` owns the wire format: header encoding and folding, transfer
//! encodings and multipart boundaries. This module only maps addresses,
//! headers and the [`MimeNode`] tree onto its builders.

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use lettre::Message;
use lettre::message::header::{
    ContentDisposition, ContentId, ContentTransferEncoding, ContentType, HeaderName, HeaderValue,
};
use lettre::message::{Body, Mailbox, MultiPart, SinglePart};
use tracing::warn;

use crate::error::TransportError;
use crate::message::OutgoingMessage;
use crate::mime::{MimeLeaf, MimeNode, MultipartKind};
use crate::models::{Address, Disposition};

/// Whether the built message keeps a `Bcc` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bcc {
    /// Bcc recipients stay in the envelope only.
    Strip,
    /// For submission APIs that read recipients from the headers and remove
    /// `Bcc` themselves before delivery.
    Keep,
}

pub fn build(
    message: &OutgoingMessage,
    date: DateTime<Utc>,
    bcc: Bcc,
) -> Result<Message, TransportError> {
    let mut builder = Message::builder()
        .date(SystemTime::from(date))
        .subject(message.subject.clone());

    for author in &message.from {
        builder = builder.from(mailbox(author)?);
    }
    // several authors need a single Sender
    if message.from.len() > 1 {
        builder = builder.sender(mailbox(&message.from[0])?);
    }
    if let Some(reply_to) = &message.reply_to {
        builder = builder.reply_to(mailbox(reply_to)?);
    }
    for to in &message.to {
        builder = builder.to(mailbox(to)?);
    }
    for cc in &message.cc {
        builder = builder.cc(mailbox(cc)?);
    }
    for hidden in &message.bcc {
        builder = builder.bcc(mailbox(hidden)?);
    }
    if bcc == Bcc::Keep {
        builder = builder.keep_bcc();
    }

    for header in &message.headers {
        let name = HeaderName::new_from_ascii(header.name.clone()).map_err(|_| {
            TransportError::InvalidMessage(format!("invalid header name {:?}", header.name))
        })?;
        builder = builder.raw_header(HeaderValue::new(name, header.value.clone()));
    }

    let built = match &message.body {
        MimeNode::Empty => builder.header(ContentType::TEXT_PLAIN).body(String::new()),
        MimeNode::Leaf(leaf) => builder.singlepart(single_part(leaf)),
        MimeNode::Multipart { kind, children } => builder.multipart(multi_part(*kind, children)),
    };
    built.map_err(|e| TransportError::InvalidMessage(e.to_string()))
}

/// The message as it goes over the wire.
pub fn render(
    message: &OutgoingMessage,
    date: DateTime<Utc>,
    bcc: Bcc,
) -> Result<Vec<u8>, TransportError> {
    Ok(build(message, date, bcc)?.formatted())
}

fn mailbox(address: &Address) -> Result<Mailbox, TransportError> {
    let email = address.address.trim().parse::<lettre::Address>().map_err(|e| {
        TransportError::InvalidMessage(format!("invalid address {:?}: {e}", address.address))
    })?;
    let name = address
        .label
        .as_deref()
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string);
    Ok(Mailbox::new(name, email))
}

fn multi_part(kind: MultipartKind, children: &[MimeNode]) -> MultiPart {
    let builder = match kind {
        MultipartKind::Mixed => MultiPart::mixed(),
        MultipartKind::Alternative => MultiPart::alternative(),
        MultipartKind::Related => MultiPart::related(),
    };
    children
        .iter()
        .fold(builder.build(), |multi, child| match child {
            MimeNode::Leaf(leaf) => multi.singlepart(single_part(leaf)),
            MimeNode::Multipart { kind, children } => {
                multi.multipart(multi_part(*kind, children))
            }
            MimeNode::Empty => multi,
        })
}

fn single_part(leaf: &MimeLeaf) -> SinglePart {
    let mut part = SinglePart::builder().header(content_type(leaf));

    match leaf.disposition {
        Some(Disposition::Attachment) => {
            let filename = leaf.filename.as_deref().unwrap_or("attachment");
            part = part.header(ContentDisposition::attachment(filename));
        }
        Some(Disposition::Inline) => {
            part = part.header(match leaf.filename.as_deref() {
                Some(filename) => ContentDisposition::inline_with_name(filename),
                None => ContentDisposition::inline(),
            });
        }
        None => {}
    }
    if let Some(content_id) = &leaf.content_id {
        let bare = content_id.trim_start_matches('<').trim_end_matches('>');
        part = part.header(ContentId::from(format!("<{bare}>")));
    }

    part.body(body(leaf))
}

fn content_type(leaf: &MimeLeaf) -> ContentType {
    let value = match &leaf.charset {
        Some(charset) if !leaf.mime_type.to_ascii_lowercase().contains("charset=") => {
            format!("{}; charset={charset}", leaf.mime_type)
        }
        _ => leaf.mime_type.clone(),
    };
    ContentType::parse(&value).unwrap_or_else(|_| {
        warn!(mime_type = %value, "Unparsable content type, sending as octet-stream");
        ContentType::parse("application/octet-stream").unwrap_or(ContentType::TEXT_PLAIN)
    })
}

/// Uses the stored transfer encoding when it fits the contents, otherwise
/// lets `lettre` pick one.
fn body(leaf: &MimeLeaf) -> Body {
    let contents = leaf.contents.clone();
    match leaf.encoding.as_deref().and_then(transfer_encoding) {
        Some(encoding) => Body::new_with_encoding(contents, encoding).unwrap_or_else(Body::new),
        None => Body::new(contents),
    }
}

fn transfer_encoding(name: &str) -> Option<ContentTransferEncoding> {
    match name.trim().to_ascii_lowercase().as_str() {
        "base64" => Some(ContentTransferEncoding::Base64),
        "quoted-printable" => Some(ContentTransferEncoding::QuotedPrintable),
        "7bit" => Some(ContentTransferEncoding::SevenBit),
        "8bit" => Some(ContentTransferEncoding::EightBit),
        "binary" => Some(ContentTransferEncoding::Binary),
        _ => None,
    }
}
