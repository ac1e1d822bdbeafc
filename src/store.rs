//! Repository interface over the queue tables, plus an in-memory backend.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{EmailPart, EmailTask, Header, NewTask, TaskId, TaskStatus, TaskUpdate};

/// A row picked for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Task(EmailTask),
    /// The row matched the selection but could not be decoded. It still gets
    /// its attempt counted so it cannot hold up the rows behind it.
    Unreadable {
        id: TaskId,
        retry_count: u32,
        reason: String,
    },
}

impl Candidate {
    pub fn id(&self) -> TaskId {
        match self {
            Candidate::Task(task) => task.id,
            Candidate::Unreadable { id, .. } => *id,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Candidate::Task(task) => task.retry_count,
            Candidate::Unreadable { retry_count, .. } => *retry_count,
        }
    }
}

/// Storage for queued tasks and the parts and headers they own.
///
/// Multi-row writes (`insert_task`, `delete_tasks`) are atomic: either every
/// row becomes visible or none does.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persists a task with its parts (in the given order) and headers.
    /// The task starts as `waiting` with a zero retry count.
    async fn insert_task(&self, task: &NewTask, parts: &[EmailPart]) -> Result<TaskId, StoreError>;

    /// Up to `limit` tasks in `waiting`/`error` with `retry_count < max_retries`,
    /// lowest priority value first. Tasks leased past `now` are left out.
    async fn select_dispatchable(
        &self,
        max_retries: u32,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, StoreError>;

    /// Leases a selected task until `lease_until`.
    ///
    /// Succeeds only while the task is still dispatchable with the given
    /// `retry_count` and holds no live lease at `now`. `false` means another
    /// dispatcher owns or already handled it.
    async fn claim_task(
        &self,
        id: TaskId,
        retry_count: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<EmailTask>, StoreError>;

    /// Parts in persisted order.
    async fn load_parts(&self, id: TaskId) -> Result<Vec<EmailPart>, StoreError>;

    async fn load_headers(&self, id: TaskId) -> Result<Vec<Header>, StoreError>;

    /// Records an attempt outcome and releases the task's lease.
    async fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<(), StoreError>;

    /// Up to `limit` non-waiting tasks sent before `cutoff`, lowest priority first.
    async fn select_purgeable(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskId>, StoreError>;

    /// Deletes the tasks and everything they own. Returns the number of tasks removed.
    async fn delete_tasks(&self, ids: &[TaskId]) -> Result<usize, StoreError>;

    /// Tasks enqueued for `context` (and `identifier`, when given), newest first.
    async fn find_by_context(
        &self,
        context: &str,
        identifier: Option<i64>,
    ) -> Result<Vec<EmailTask>, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredTask {
    task: EmailTask,
    parts: Vec<EmailPart>,
    headers: Vec<Header>,
    locked_until: Option<DateTime<Utc>>,
}

impl StoredTask {
    fn leased_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, StoredTask>,
}

/// In-memory store keyed by task id.
///
/// Meant for tests and transient queues. Writes take a single `RwLock`, so
/// multi-row operations are trivially atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.read().tasks.len()
    }

    #[must_use]
    pub fn part_count(&self) -> usize {
        self.read().tasks.values().map(|t| t.parts.len()).sum()
    }

    /// Overwrites the stored copy of a task, bypassing the dispatcher.
    #[cfg(test)]
    pub(crate) fn put_task(&self, task: EmailTask) {
        let mut state = self.write();
        state.next_id = state.next_id.max(task.id);
        let entry = state.tasks.entry(task.id).or_insert_with(|| StoredTask {
            task: task.clone(),
            parts: Vec::new(),
            headers: Vec::new(),
            locked_until: None,
        });
        entry.task = task;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_task(&self, task: &NewTask, parts: &[EmailPart]) -> Result<TaskId, StoreError> {
        let mut state = self.write();
        state.next_id += 1;
        let id = state.next_id;
        let stored = StoredTask {
            task: EmailTask {
                id,
                status: TaskStatus::Waiting,
                priority: task.priority,
                created_at: task.created_at,
                sent_at: None,
                retry_count: 0,
                authors: task.authors.clone(),
                recipients: task.recipients.clone(),
                reply_to: task.reply_to.clone(),
                subject: task.subject.clone(),
                encoding: task.encoding.clone(),
                context: task.context.clone(),
                context_identifier: task.context_identifier,
                last_error: None,
            },
            parts: parts.to_vec(),
            headers: task.headers.clone(),
            locked_until: None,
        };
        state.tasks.insert(id, stored);
        Ok(id)
    }

    async fn select_dispatchable(
        &self,
        max_retries: u32,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let state = self.read();
        let mut tasks: Vec<EmailTask> = state
            .tasks
            .values()
            .filter(|t| !t.leased_at(now))
            .map(|t| &t.task)
            .filter(|t| t.status.is_dispatchable() && t.retry_count < max_retries)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.priority, t.id));
        tasks.truncate(limit);
        Ok(tasks.into_iter().map(Candidate::Task).collect())
    }

    async fn claim_task(
        &self,
        id: TaskId,
        retry_count: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.write();
        let Some(stored) = state.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if !stored.task.status.is_dispatchable()
            || stored.task.retry_count != retry_count
            || stored.leased_at(now)
        {
            return Ok(false);
        }
        stored.locked_until = Some(lease_until);
        Ok(true)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<EmailTask>, StoreError> {
        Ok(self.read().tasks.get(&id).map(|t| t.task.clone()))
    }

    async fn load_parts(&self, id: TaskId) -> Result<Vec<EmailPart>, StoreError> {
        self.read()
            .tasks
            .get(&id)
            .map(|t| t.parts.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn load_headers(&self, id: TaskId) -> Result<Vec<Header>, StoreError> {
        self.read()
            .tasks
            .get(&id)
            .map(|t| t.headers.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<(), StoreError> {
        let mut state = self.write();
        let stored = state.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        stored.task.status = update.status;
        stored.task.retry_count = update.retry_count;
        stored.task.sent_at = update.sent_at;
        stored.task.last_error = update.last_error.clone();
        stored.locked_until = None;
        Ok(())
    }

    async fn select_purgeable(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskId>, StoreError> {
        let state = self.read();
        let mut tasks: Vec<&EmailTask> = state
            .tasks
            .values()
            .map(|t| &t.task)
            .filter(|t| t.status != TaskStatus::Waiting && t.sent_at.is_some_and(|s| s < cutoff))
            .collect();
        tasks.sort_by_key(|t| (t.priority, t.id));
        Ok(tasks.into_iter().take(limit).map(|t| t.id).collect())
    }

    async fn delete_tasks(&self, ids: &[TaskId]) -> Result<usize, StoreError> {
        let mut state = self.write();
        Ok(ids
            .iter()
            .filter(|id| state.tasks.remove(*id).is_some())
            .count())
    }

    async fn find_by_context(
        &self,
        context: &str,
        identifier: Option<i64>,
    ) -> Result<Vec<EmailTask>, StoreError> {
        let state = self.read();
        let mut tasks: Vec<EmailTask> = state
            .tasks
            .values()
            .map(|t| &t.task)
            .filter(|t| t.context.as_deref() == Some(context))
            .filter(|t| identifier.is_none() || t.context_identifier == identifier)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(tasks)
    }
}
