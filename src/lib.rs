//! Outbound email queue: validate and store drafts, send them in priority
//! order with bounded retries, and purge what was delivered long ago.

pub mod auth;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod draft;
pub mod error;
pub mod gmail;
pub mod guard;
pub mod logging;
pub mod message;
pub mod mime;
pub mod models;
pub mod purger;
pub mod render;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;
pub mod writer;

pub use config::Config;
pub use db::Database;
pub use dispatcher::{BatchReport, Dispatcher};
pub use draft::{Attachment, EmailDraft};
pub use error::{QueueError, StoreError, TransportError, ValidationError};
pub use purger::Purger;
pub use store::{Candidate, MemoryStore, QueueStore};
pub use transport::Transport;
pub use writer::QueueWriter;
