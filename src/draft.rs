use encoding_rs::Encoding;

use crate::error::ValidationError;
use crate::models::{Address, Disposition, Header};

pub const DEFAULT_ENCODING: &str = "UTF-8";
pub const ENCODING_BASE64: &str = "base64";

/// A file or inline resource attached to a draft.
///
/// Fields are optional so an incomplete attachment can be caught by
/// [`EmailDraft::validate`] instead of at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: Option<String>,
    pub charset: Option<String>,
    pub encoding: Option<String>,
    pub disposition: Option<Disposition>,
    pub filename: Option<String>,
    pub content_id: Option<String>,
    pub contents: Option<Vec<u8>>,
}

impl Default for Attachment {
    fn default() -> Self {
        Self {
            mime_type: None,
            charset: None,
            encoding: Some(ENCODING_BASE64.to_string()),
            disposition: Some(Disposition::Attachment),
            filename: None,
            content_id: None,
            contents: None,
        }
    }
}

impl Attachment {
    /// A regular attachment offered for download.
    pub fn file(mime_type: &str, filename: &str, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: Some(mime_type.to_string()),
            filename: Some(filename.to_string()),
            contents: Some(contents.into()),
            ..Default::default()
        }
    }

    /// An inline resource the HTML body references as `cid:<content_id>`.
    pub fn inline(mime_type: &str, content_id: &str, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: Some(mime_type.to_string()),
            disposition: Some(Disposition::Inline),
            content_id: Some(content_id.to_string()),
            contents: Some(contents.into()),
            ..Default::default()
        }
    }
}

/// A message being authored, not yet queued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailDraft {
    pub authors: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Option<Address>,
    pub subject: Option<String>,
    pub encoding: Option<String>,
    pub contents_plain: Option<String>,
    pub contents_html: Option<String>,
    pub attachments: Vec<Attachment>,
    pub headers: Vec<Header>,
    pub priority: i64,
    pub context: Option<String>,
    pub context_identifier: Option<i64>,
}

impl EmailDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_author(&mut self, address: &str, label: Option<&str>) -> &mut Self {
        self.authors.push(Address::new(address, label));
        self
    }

    pub fn add_to(&mut self, address: &str, label: Option<&str>) -> &mut Self {
        self.to.push(Address::new(address, label));
        self
    }

    pub fn add_cc(&mut self, address: &str, label: Option<&str>) -> &mut Self {
        self.cc.push(Address::new(address, label));
        self
    }

    pub fn add_bcc(&mut self, address: &str, label: Option<&str>) -> &mut Self {
        self.bcc.push(Address::new(address, label));
        self
    }

    pub fn set_reply_to(&mut self, address: &str, label: Option<&str>) -> &mut Self {
        self.reply_to = Some(Address::new(address, label));
        self
    }

    pub fn set_subject(&mut self, subject: &str) -> &mut Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn set_encoding(&mut self, encoding: &str) -> &mut Self {
        self.encoding = Some(encoding.to_string());
        self
    }

    pub fn set_plain(&mut self, contents: &str) -> &mut Self {
        self.contents_plain = Some(contents.to_string());
        self
    }

    pub fn set_html(&mut self, contents: &str) -> &mut Self {
        self.contents_html = Some(contents.to_string());
        self
    }

    pub fn add_attachment(&mut self, attachment: Attachment) -> &mut Self {
        self.attachments.push(attachment);
        self
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.push(Header {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn set_priority(&mut self, priority: i64) -> &mut Self {
        self.priority = priority;
        self
    }

    pub fn set_context(&mut self, context: &str, identifier: Option<i64>) -> &mut Self {
        self.context = Some(context.to_string());
        self.context_identifier = identifier;
        self
    }

    /// Charset label for the body parts, as given.
    pub fn effective_encoding(&self) -> &str {
        self.encoding.as_deref().unwrap_or(DEFAULT_ENCODING)
    }

    /// The encoding the bodies are written in, if the label is known.
    pub fn charset(&self) -> Option<&'static Encoding> {
        Encoding::for_label(self.effective_encoding().as_bytes()).map(Encoding::output_encoding)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.subject.as_deref().is_none_or(str::is_empty) {
            return Err(ValidationError::MissingSubject);
        }

        if self.contents_plain.is_none() && self.contents_html.is_none() {
            return Err(ValidationError::MissingContents);
        }

        if self.authors.is_empty() {
            return Err(ValidationError::MissingAuthors);
        }

        if self.to.is_empty() {
            return Err(ValidationError::MissingRecipients);
        }

        if self.context_identifier.is_some() && self.context.is_none() {
            return Err(ValidationError::ContextIdentifierWithoutContext);
        }

        if self.charset().is_none() {
            return Err(ValidationError::UnknownEncoding(
                self.effective_encoding().to_string(),
            ));
        }

        let lists: [(&'static str, &[Address]); 4] = [
            ("authors", &self.authors),
            ("to", &self.to),
            ("cc", &self.cc),
            ("bcc", &self.bcc),
        ];
        for (field, addresses) in lists {
            if addresses.iter().any(|a| a.address.trim().is_empty()) {
                return Err(ValidationError::EmptyAddress(field));
            }
        }
        if let Some(reply_to) = &self.reply_to {
            if reply_to.address.trim().is_empty() {
                return Err(ValidationError::EmptyAddress("reply-to"));
            }
        }

        for (index, attachment) in self.attachments.iter().enumerate() {
            let missing = if attachment.contents.is_none() {
                Some("contents")
            } else if attachment.mime_type.is_none() {
                Some("mime type")
            } else if attachment.disposition.is_none() {
                Some("disposition")
            } else {
                None
            };
            if let Some(field) = missing {
                return Err(ValidationError::IncompleteAttachment { index, field });
            }
        }

        for header in &self.headers {
            let bad_name = header.name.is_empty()
                || header
                    .name
                    .chars()
                    .any(|c| c == ':' || c.is_whitespace() || c.is_control());
            let bad_value = header.value.contains(['\r', '\n']);
            if bad_name || bad_value {
                return Err(ValidationError::InvalidHeader(header.name.clone()));
            }
        }

        Ok(())
    }
}
