//! Sends waiting tasks and records the outcome of every attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::error::{Result, StoreError, TransportError};
use crate::guard::SingleFlight;
use crate::message::{self, Prepared, RecipientPolicy};
use crate::models::{EmailTask, TaskId, TaskStatus, TaskUpdate};
use crate::store::{Candidate, QueueStore};
use crate::transport::Transport;

/// Tally of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub selected: usize,
    pub sent: usize,
    /// Failed attempts that remain eligible for another try.
    pub failed: usize,
    /// Failed attempts that used up the last retry.
    pub exhausted: usize,
    /// Tasks whose recipients were all filtered out.
    pub suppressed: usize,
    /// Tasks another dispatcher claimed first.
    pub skipped: usize,
}

enum Outcome {
    Sent,
    Suppressed,
    Failed(TaskStatus),
    Skipped,
}

pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    config: DispatchConfig,
    policy: RecipientPolicy,
    guard: SingleFlight,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
        policy: RecipientPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            policy,
            guard: SingleFlight::new(),
        }
    }

    /// Runs one pass over the dispatchable tasks.
    ///
    /// Returns `Ok(None)` if another pass in this process is still running.
    /// Passes in other processes are kept apart by the store: each task is
    /// claimed with a lease before it is attempted, and a task somebody else
    /// claimed is skipped. Tasks are attempted one at a time in priority order
    /// and each outcome is stored before the next task is touched. A store
    /// failure ends the pass early.
    pub async fn run_batch(&self) -> Result<Option<BatchReport>> {
        let Some(_flight) = self.guard.try_enter() else {
            debug!("Dispatch already in progress, skipping");
            return Ok(None);
        };

        let candidates = self
            .store
            .select_dispatchable(self.config.max_retries, self.config.batch_limit, Utc::now())
            .await
            .inspect_err(|e| error!(error = %e, "Failed to select tasks for dispatch"))?;

        let mut report = BatchReport {
            selected: candidates.len(),
            ..BatchReport::default()
        };
        if candidates.is_empty() {
            debug!("No tasks waiting for dispatch");
            return Ok(Some(report));
        }

        for candidate in &candidates {
            match self.dispatch(candidate).await? {
                Outcome::Sent => report.sent += 1,
                Outcome::Suppressed => report.suppressed += 1,
                Outcome::Failed(TaskStatus::Exhausted) => report.exhausted += 1,
                Outcome::Failed(_) => report.failed += 1,
                Outcome::Skipped => report.skipped += 1,
            }
        }

        info!(
            selected = report.selected,
            sent = report.sent,
            failed = report.failed,
            exhausted = report.exhausted,
            suppressed = report.suppressed,
            skipped = report.skipped,
            "Dispatch batch finished"
        );
        Ok(Some(report))
    }

    async fn dispatch(&self, candidate: &Candidate) -> Result<Outcome> {
        let id = candidate.id();
        let now = Utc::now();
        let lease_until = now
            .checked_add_signed(self.config.lease())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let claimed = self
            .store
            .claim_task(id, candidate.retry_count(), now, lease_until)
            .await
            .inspect_err(|e| error!(task_id = id, error = %e, "Failed to claim task"))?;
        if !claimed {
            debug!(task_id = id, "Task claimed by another dispatcher, skipping");
            return Ok(Outcome::Skipped);
        }

        let (attempt, sent_at) = match candidate {
            Candidate::Task(task) => {
                let attempt = match self.attempt(task).await {
                    Ok(outcome) => Ok(outcome),
                    Err(AttemptError::Store(e)) => {
                        error!(task_id = id, error = %e, "Failed to load task contents");
                        return Err(e.into());
                    }
                    Err(AttemptError::Send(e)) => Err(e),
                };
                (attempt, task.sent_at)
            }
            Candidate::Unreadable { reason, .. } => (
                Err(TransportError::InvalidMessage(format!("unreadable task row: {reason}"))),
                None,
            ),
        };

        self.record(id, candidate.retry_count(), sent_at, attempt).await
    }

    /// Stores the result of an attempt, moving the task along its retry states.
    async fn record(
        &self,
        id: TaskId,
        retry_count: u32,
        sent_at: Option<DateTime<Utc>>,
        attempt: std::result::Result<Outcome, TransportError>,
    ) -> Result<Outcome> {
        let (update, outcome) = match attempt {
            Ok(outcome) => (
                TaskUpdate {
                    status: TaskStatus::Sent,
                    retry_count,
                    sent_at: Some(Utc::now()),
                    last_error: None,
                },
                outcome,
            ),
            Err(e) => {
                let retry_count = retry_count + 1;
                let status = if retry_count >= self.config.max_retries {
                    TaskStatus::Exhausted
                } else {
                    TaskStatus::Error
                };
                if status == TaskStatus::Exhausted {
                    error!(
                        task_id = id,
                        attempts = retry_count,
                        error = %e,
                        "Giving up on email after final attempt"
                    );
                } else {
                    warn!(
                        task_id = id,
                        attempt = retry_count,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "Failed to send email"
                    );
                }
                (
                    TaskUpdate {
                        status,
                        retry_count,
                        sent_at,
                        last_error: Some(e.to_string()),
                    },
                    Outcome::Failed(status),
                )
            }
        };

        self.store
            .update_task(id, &update)
            .await
            .inspect_err(|e| {
                error!(task_id = id, error = %e, "Failed to record dispatch outcome");
            })?;
        Ok(outcome)
    }

    async fn attempt(&self, task: &EmailTask) -> std::result::Result<Outcome, AttemptError> {
        let parts = self.store.load_parts(task.id).await.map_err(AttemptError::load)?;
        let headers = self.store.load_headers(task.id).await.map_err(AttemptError::load)?;

        let message = match message::prepare(task, &parts, &headers, &self.policy)? {
            Prepared::Ready(message) => message,
            Prepared::Suppressed { dropped } => {
                info!(task_id = task.id, dropped = ?dropped, "Suppressed email with no permitted recipients");
                return Ok(Outcome::Suppressed);
            }
        };

        let timeout = self.config.send_timeout();
        tokio::time::timeout(timeout, self.transport.send(&message))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        info!(task_id = task.id, recipients = message.envelope_recipients().count(), "Sent email");
        Ok(Outcome::Sent)
    }
}

/// Why a single attempt stopped short of a send.
enum AttemptError {
    /// The store could not be read; the whole pass stops.
    Store(StoreError),
    /// Counts against the task's retries.
    Send(TransportError),
}

impl AttemptError {
    /// Unreadable part or header rows belong to this task alone and count as
    /// a failed attempt.
    fn load(e: StoreError) -> Self {
        match e {
            StoreError::Corrupted { .. } | StoreError::Serialization(_) => {
                Self::Send(TransportError::InvalidMessage(e.to_string()))
            }
            e => Self::Store(e),
        }
    }
}

impl From<TransportError> for AttemptError {
    fn from(e: TransportError) -> Self {
        Self::Send(e)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{DeliveryConfig, Environment, FilterAction};
    use crate::draft::EmailDraft;
    use crate::error::QueueError;
    use crate::testing::{FailPoint, RecordingTransport, Scripted, TestStore};
    use crate::writer::QueueWriter;

    struct Harness {
        store: TestStore,
        transport: RecordingTransport,
        dispatcher: Dispatcher,
    }

    fn harness_with(config: DispatchConfig, policy: RecipientPolicy) -> Harness {
        let store = TestStore::new();
        let transport = RecordingTransport::new();
        let dispatcher = Dispatcher::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            config,
            policy,
        );
        Harness {
            store,
            transport,
            dispatcher,
        }
    }

    fn harness() -> Harness {
        harness_with(DispatchConfig::default(), RecipientPolicy::default())
    }

    async fn enqueue(store: &TestStore, subject: &str, priority: i64, to: &str) -> TaskId {
        let mut draft = EmailDraft::new();
        draft
            .add_author("app@example.com", Some("App"))
            .add_to(to, None)
            .set_subject(subject)
            .set_plain("body")
            .set_priority(priority);
        QueueWriter::new(Arc::new(store.clone()))
            .enqueue(&draft)
            .await
            .unwrap()
    }

    async fn task(store: &TestStore, id: TaskId) -> EmailTask {
        store.get_task(id).await.unwrap().expect("task exists")
    }

    #[tokio::test]
    async fn successful_send_marks_task_sent() {
        let h = harness();
        let id = enqueue(&h.store, "Welcome", 0, "user@example.com").await;

        let report = h.dispatcher.run_batch().await.unwrap().unwrap();
        assert_eq!(report.selected, 1);
        assert_eq!(report.sent, 1);

        let task = task(&h.store, id).await;
        assert_eq!(task.status, TaskStatus::Sent);
        assert_eq!(task.retry_count, 0);
        assert!(task.sent_at.is_some());
        assert_eq!(h.transport.sent()[0].subject, "Welcome");
    }

    #[tokio::test]
    async fn failures_count_up_to_exhaustion() {
        let h = harness();
        let id = enqueue(&h.store, "Flaky", 0, "user@example.com").await;
        for _ in 0..3 {
            h.transport.push(Scripted::Fail("mailbox unavailable".to_string()));
        }

        let report = h.dispatcher.run_batch().await.unwrap().unwrap();
        assert_eq!(report.failed, 1);
        let first = task(&h.store, id).await;
        assert_eq!(first.status, TaskStatus::Error);
        assert_eq!(first.retry_count, 1);
        assert!(first.last_error.as_deref().unwrap().contains("mailbox unavailable"));
        assert_eq!(first.sent_at, None);

        h.dispatcher.run_batch().await.unwrap();
        assert_eq!(task(&h.store, id).await.retry_count, 2);
        assert_eq!(task(&h.store, id).await.status, TaskStatus::Error);

        let report = h.dispatcher.run_batch().await.unwrap().unwrap();
        assert_eq!(report.exhausted, 1);
        let last = task(&h.store, id).await;
        assert_eq!(last.status, TaskStatus::Exhausted);
        assert_eq!(last.retry_count, 3);

        // never selected again
        let report = h.dispatcher.run_batch().await.unwrap().unwrap();
        assert_eq!(report.selected, 0);
        assert_eq!(h.transport.attempts().len(), 3);
    }

    #[tokio::test]
    async fn retry_after_failure_can_succeed() {
        let h = harness();
        let id = enqueue(&h.store, "Second time lucky", 0, "user@example.com").await;
        h.transport.push(Scripted::Fail("busy".to_string()));

        h.dispatcher.run_batch().await.unwrap();
        h.dispatcher.run_batch().await.unwrap();

        let task = task(&h.store, id).await;
        assert_eq!(task.status, TaskStatus::Sent);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.last_error, None);
    }

    #[tokio::test]
    async fn legacy_error_rows_at_the_limit_are_skipped() {
        let h = harness();
        let id = enqueue(&h.store, "Old", 0, "user@example.com").await;
        let mut stale = task(&h.store, id).await;
        stale.status = TaskStatus::Error;
        stale.retry_count = 3;
        h.store.put_task(stale);

        let report = h.dispatcher.run_batch().await.unwrap().unwrap();
        assert_eq!(report.selected, 0);
        assert!(h.transport.attempts().is_empty());
    }

    #[tokio::test]
    async fn batch_respects_limit_and_priority() {
        let h = harness();
        for i in 0..12 {
            enqueue(&h.store, &format!("p{}", 12 - i), 12 - i, "user@example.com").await;
        }

        let report = h.dispatcher.run_batch().await.unwrap().unwrap();
        assert_eq!(report.selected, 10);
        assert_eq!(report.sent, 10);

        let subjects: Vec<String> = h.transport.sent().into_iter().map(|m| m.subject).collect();
        let expected: Vec<String> = (1..=10).map(|p| format!("p{p}")).collect();
        assert_eq!(subjects, expected);
    }

    #[tokio::test]
    async fn selection_failure_aborts_without_changes() {
        let h = harness();
        let id = enqueue(&h.store, "Stuck", 0, "user@example.com").await;
        h.store.fail(FailPoint::Select);

        let err = h.dispatcher.run_batch().await.unwrap_err();
        assert!(matches!(err, QueueError::Store(_)));
        assert!(h.transport.attempts().is_empty());

        h.store.recover(FailPoint::Select);
        let task = task(&h.store, id).await;
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn update_failure_aborts_the_batch() {
        let h = harness();
        enqueue(&h.store, "a", 0, "user@example.com").await;
        enqueue(&h.store, "b", 1, "user@example.com").await;
        h.store.fail(FailPoint::Update);

        assert!(h.dispatcher.run_batch().await.is_err());
        assert_eq!(h.transport.attempts().len(), 1);
    }

    #[tokio::test]
    async fn hung_transport_times_out() {
        let config = DispatchConfig {
            send_timeout_secs: 1,
            ..DispatchConfig::default()
        };
        let h = harness_with(config, RecipientPolicy::default());
        let id = enqueue(&h.store, "Slow", 0, "user@example.com").await;
        h.transport.push(Scripted::Hang(Duration::from_secs(30)));

        let report = h.dispatcher.run_batch().await.unwrap().unwrap();
        assert_eq!(report.failed, 1);

        let task = task(&h.store, id).await;
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.retry_count, 1);
        assert!(task.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn overlapping_pass_is_skipped() {
        let h = harness();
        enqueue(&h.store, "Once", 0, "user@example.com").await;

        let _flight = h.dispatcher.guard.try_enter().unwrap();
        assert_eq!(h.dispatcher.run_batch().await.unwrap(), None);
        assert!(h.transport.attempts().is_empty());
    }

    fn test_policy(on_filtered: FilterAction) -> RecipientPolicy {
        RecipientPolicy::new(&DeliveryConfig {
            environment: Environment::Test,
            allowed_recipients: vec!["qa@example.com".to_string()],
            on_filtered,
        })
    }

    #[tokio::test]
    async fn filtered_task_is_suppressed_and_marked_sent() {
        let h = harness_with(DispatchConfig::default(), test_policy(FilterAction::Drop));
        let kept = enqueue(&h.store, "Internal", 0, "QA@example.com").await;
        let dropped = enqueue(&h.store, "Customer", 1, "customer@example.org").await;

        let report = h.dispatcher.run_batch().await.unwrap().unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.suppressed, 1);
        assert_eq!(h.transport.attempts().len(), 1);
        assert_eq!(task(&h.store, kept).await.status, TaskStatus::Sent);
        assert_eq!(task(&h.store, dropped).await.status, TaskStatus::Sent);
    }

    #[tokio::test]
    async fn rejecting_policy_fails_the_task() {
        let h = harness_with(DispatchConfig::default(), test_policy(FilterAction::Reject));
        let id = enqueue(&h.store, "Customer", 0, "customer@example.org").await;

        let report = h.dispatcher.run_batch().await.unwrap().unwrap();
        assert_eq!(report.failed, 1);
        assert!(h.transport.attempts().is_empty());

        let task = task(&h.store, id).await;
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.last_error.unwrap().contains("customer@example.org"));
    }

    #[tokio::test]
    async fn claim_failure_aborts_before_sending() {
        let h = harness();
        let id = enqueue(&h.store, "Unclaimed", 0, "user@example.com").await;
        h.store.fail(FailPoint::Claim);

        assert!(matches!(
            h.dispatcher.run_batch().await,
            Err(QueueError::Store(StoreError::Unavailable(_)))
        ));
        assert!(h.transport.attempts().is_empty());
        assert_eq!(task(&h.store, id).await.status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn task_leased_by_another_dispatcher_is_left_alone() {
        let h = harness();
        let id = enqueue(&h.store, "Taken", 0, "user@example.com").await;
        let now = Utc::now();
        assert!(
            h.store
                .claim_task(id, 0, now, now + chrono::Duration::seconds(600))
                .await
                .unwrap()
        );

        let report = h.dispatcher.run_batch().await.unwrap().unwrap();
        assert_eq!(report.selected, 0);
        assert!(h.transport.attempts().is_empty());
        assert_eq!(task(&h.store, id).await.retry_count, 0);
    }

    #[tokio::test]
    async fn concurrent_dispatchers_send_each_task_once() {
        let store = TestStore::new();
        let transport = RecordingTransport::new();
        transport.push(Scripted::Slow(Duration::from_millis(200)));
        transport.push(Scripted::Slow(Duration::from_millis(200)));
        let dispatcher = || {
            Dispatcher::new(
                Arc::new(store.clone()),
                Arc::new(transport.clone()),
                DispatchConfig::default(),
                RecipientPolicy::default(),
            )
        };
        let (first, second) = (dispatcher(), dispatcher());
        let id = enqueue(&store, "Once only", 0, "user@example.com").await;

        let (a, b) = tokio::join!(first.run_batch(), second.run_batch());
        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());

        assert_eq!(a.sent + b.sent, 1);
        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(task(&store, id).await.status, TaskStatus::Sent);
    }
}
