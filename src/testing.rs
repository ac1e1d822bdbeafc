//! Fakes for unit tests: a store with switchable failures and a scripted
//! transport that records what it was handed.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, TransportError};
use crate::message::OutgoingMessage;
use crate::models::{EmailPart, EmailTask, Header, NewTask, TaskId, TaskUpdate};
use crate::store::{Candidate, MemoryStore, QueueStore};
use crate::transport::Transport;

/// Store operations that [`TestStore`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Insert,
    /// Every read.
    Select,
    Claim,
    Update,
    Delete,
}

/// [`MemoryStore`] wrapper whose operations fail on demand with
/// `StoreError::Unavailable`.
#[derive(Debug, Clone, Default)]
pub struct TestStore {
    inner: MemoryStore,
    failures: Arc<Mutex<HashSet<FailPoint>>>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, point: FailPoint) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(point);
    }

    pub fn recover(&self, point: FailPoint) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&point);
    }

    pub fn put_task(&self, task: EmailTask) {
        self.inner.put_task(task);
    }

    pub fn task_count(&self) -> usize {
        self.inner.task_count()
    }

    pub fn part_count(&self) -> usize {
        self.inner.part_count()
    }

    fn check(&self, point: FailPoint) -> Result<(), StoreError> {
        let failing = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&point);
        if failing {
            Err(StoreError::Unavailable(format!("{point:?} disabled")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueStore for TestStore {
    async fn insert_task(&self, task: &NewTask, parts: &[EmailPart]) -> Result<TaskId, StoreError> {
        self.check(FailPoint::Insert)?;
        self.inner.insert_task(task, parts).await
    }

    async fn select_dispatchable(
        &self,
        max_retries: u32,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, StoreError> {
        self.check(FailPoint::Select)?;
        self.inner.select_dispatchable(max_retries, limit, now).await
    }

    async fn claim_task(
        &self,
        id: TaskId,
        retry_count: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check(FailPoint::Claim)?;
        self.inner.claim_task(id, retry_count, now, lease_until).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<EmailTask>, StoreError> {
        self.check(FailPoint::Select)?;
        self.inner.get_task(id).await
    }

    async fn load_parts(&self, id: TaskId) -> Result<Vec<EmailPart>, StoreError> {
        self.check(FailPoint::Select)?;
        self.inner.load_parts(id).await
    }

    async fn load_headers(&self, id: TaskId) -> Result<Vec<Header>, StoreError> {
        self.check(FailPoint::Select)?;
        self.inner.load_headers(id).await
    }

    async fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<(), StoreError> {
        self.check(FailPoint::Update)?;
        self.inner.update_task(id, update).await
    }

    async fn select_purgeable(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskId>, StoreError> {
        self.check(FailPoint::Select)?;
        self.inner.select_purgeable(cutoff, limit).await
    }

    async fn delete_tasks(&self, ids: &[TaskId]) -> Result<usize, StoreError> {
        self.check(FailPoint::Delete)?;
        self.inner.delete_tasks(ids).await
    }

    async fn find_by_context(
        &self,
        context: &str,
        identifier: Option<i64>,
    ) -> Result<Vec<EmailTask>, StoreError> {
        self.check(FailPoint::Select)?;
        self.inner.find_by_context(context, identifier).await
    }
}

/// Scripted behaviour for one [`RecordingTransport::send`] call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Accept,
    Fail(String),
    /// Accepts after a delay.
    Slow(Duration),
    /// Never completes within `Duration`.
    Hang(Duration),
}

/// In-memory transport that records what it was given.
///
/// Calls follow the queued script and accept once it runs out.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<OutgoingMessage>>>,
    attempts: Arc<Mutex<Vec<OutgoingMessage>>>,
    script: Arc<Mutex<VecDeque<Scripted>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: Scripted) {
        lock(&self.script).push_back(step);
    }

    /// Messages that were accepted.
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        lock(&self.sent).clone()
    }

    /// Every message passed to `send`, accepted or not.
    pub fn attempts(&self) -> Vec<OutgoingMessage> {
        lock(&self.attempts).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        lock(&self.attempts).push(message.clone());
        let step = lock(&self.script).pop_front().unwrap_or(Scripted::Accept);

        match step {
            Scripted::Accept => {}
            Scripted::Fail(reason) => return Err(TransportError::Provider(reason)),
            Scripted::Slow(delay) => tokio::time::sleep(delay).await,
            Scripted::Hang(duration) => {
                tokio::time::sleep(duration).await;
                return Err(TransportError::Provider("hung transport woke up".to_string()));
            }
        }
        lock(&self.sent).push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::MimeNode;
    use crate::models::Address;

    fn message() -> OutgoingMessage {
        OutgoingMessage {
            task_id: 1,
            from: vec![Address::new("from@example.com", None)],
            to: vec![Address::new("to@example.com", None)],
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
            subject: "Script".to_string(),
            encoding: "UTF-8".to_string(),
            headers: Vec::new(),
            body: MimeNode::Empty,
        }
    }

    #[tokio::test]
    async fn recording_transport_follows_script() {
        let transport = RecordingTransport::new();
        transport.push(Scripted::Fail("boom".to_string()));

        assert!(transport.send(&message()).await.is_err());
        assert!(transport.send(&message()).await.is_ok());
        assert_eq!(transport.attempts().len(), 2);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn fail_points_surface_as_unavailable() {
        let store = TestStore::new();
        store.fail(FailPoint::Select);
        assert!(matches!(
            store.select_dispatchable(3, 10, Utc::now()).await,
            Err(StoreError::Unavailable(_))
        ));

        store.recover(FailPoint::Select);
        assert!(store.select_dispatchable(3, 10, Utc::now()).await.unwrap().is_empty());
    }
}
