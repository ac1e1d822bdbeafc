//! Builds the multipart tree of an outgoing message from its stored parts.
//!
//! The shape depends on which kinds of content are present:
//!
//! - inline resources get a `multipart/related` wrapper around the HTML
//! - plain and HTML together get a `multipart/alternative` wrapper
//! - attachments put everything under `multipart/mixed`
//!
//! A plain-only or HTML-only message without attachments is a single part.

use crate::models::{Disposition, EmailPart, TEXT_HTML, TEXT_PLAIN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MultipartKind {
    Mixed,
    Alternative,
    Related,
}

impl MultipartKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            MultipartKind::Mixed => "multipart/mixed",
            MultipartKind::Alternative => "multipart/alternative",
            MultipartKind::Related => "multipart/related",
        }
    }
}

/// A single content part of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeLeaf {
    pub mime_type: String,
    pub contents: Vec<u8>,
    pub charset: Option<String>,
    pub encoding: Option<String>,
    pub disposition: Option<Disposition>,
    pub filename: Option<String>,
    pub content_id: Option<String>,
}

impl From<&EmailPart> for MimeLeaf {
    fn from(part: &EmailPart) -> Self {
        Self {
            mime_type: part.mime_type.clone(),
            contents: part.contents.clone(),
            charset: part.charset.clone().filter(|c| !c.is_empty()),
            encoding: part.encoding.clone().filter(|e| !e.is_empty()),
            disposition: part.disposition,
            filename: part.filename.clone().filter(|f| !f.is_empty()),
            content_id: part.content_id.clone().filter(|c| !c.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeNode {
    /// No body content at all.
    Empty,
    Leaf(MimeLeaf),
    Multipart {
        kind: MultipartKind,
        children: Vec<MimeNode>,
    },
}

impl MimeNode {
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            MimeNode::Empty => None,
            MimeNode::Leaf(leaf) => Some(&leaf.mime_type),
            MimeNode::Multipart { kind, .. } => Some(kind.mime_type()),
        }
    }

    pub fn children(&self) -> &[MimeNode] {
        match self {
            MimeNode::Multipart { children, .. } => children,
            _ => &[],
        }
    }

    pub fn as_leaf(&self) -> Option<&MimeLeaf> {
        match self {
            MimeNode::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    fn multipart(kind: MultipartKind, children: Vec<MimeNode>) -> Self {
        MimeNode::Multipart { kind, children }
    }
}

/// What kinds of content a part set holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Layout {
    pub has_plain: bool,
    pub has_html: bool,
    pub has_inline: bool,
    pub has_attachment: bool,
}

impl Layout {
    pub fn classify(parts: &[EmailPart]) -> Self {
        parts.iter().fold(Self::default(), |mut layout, part| {
            layout.has_plain |= part.is_body() && part.is_type(TEXT_PLAIN);
            layout.has_html |= part.is_body() && part.is_type(TEXT_HTML);
            layout.has_inline |= part.is_inline();
            layout.has_attachment |= part.is_attachment();
            layout
        })
    }
}

/// Turns stored parts into a document tree.
///
/// Deterministic: the same part sequence always yields the same tree, and
/// parts of the same class keep their input order.
pub fn compose(parts: &[EmailPart]) -> MimeNode {
    let layout = Layout::classify(parts);

    let mut nodes = body(parts, layout);
    if layout.has_attachment {
        nodes.extend(leaves(parts, EmailPart::is_attachment));
    }

    match nodes.len() {
        0 => MimeNode::Empty,
        1 => nodes.remove(0),
        _ => MimeNode::multipart(MultipartKind::Mixed, nodes),
    }
}

fn body(parts: &[EmailPart], layout: Layout) -> Vec<MimeNode> {
    let plain = || leaves(parts, |p| p.is_body() && p.is_type(TEXT_PLAIN));
    let html = || leaves(parts, |p| p.is_body() && p.is_type(TEXT_HTML));
    let related = || {
        let mut children = html();
        children.extend(leaves(parts, EmailPart::is_inline));
        MimeNode::multipart(MultipartKind::Related, children)
    };

    match (layout.has_plain, layout.has_html, layout.has_inline) {
        (true, false, _) => plain(),
        (false, true, false) => html(),
        (true, true, false) => {
            let mut children = plain();
            children.extend(html());
            vec![MimeNode::multipart(MultipartKind::Alternative, children)]
        }
        (false, true, true) => vec![related()],
        (true, true, true) => {
            let mut children = plain();
            children.push(related());
            vec![MimeNode::multipart(MultipartKind::Alternative, children)]
        }
        (false, false, _) => Vec::new(),
    }
}

fn leaves(parts: &[EmailPart], select: impl Fn(&EmailPart) -> bool) -> Vec<MimeNode> {
    parts
        .iter()
        .filter(|&p| select(p))
        .map(|p| MimeNode::Leaf(MimeLeaf::from(p)))
        .collect()
}
