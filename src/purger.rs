use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use crate::config::PurgeConfig;
use crate::guard::SingleFlight;
use crate::store::QueueStore;

/// Removes tasks that finished long ago, together with their parts and headers.
pub struct Purger {
    store: Arc<dyn QueueStore>,
    config: PurgeConfig,
    guard: SingleFlight,
}

impl Purger {
    pub fn new(store: Arc<dyn QueueStore>, config: PurgeConfig) -> Self {
        Self {
            store,
            config,
            guard: SingleFlight::new(),
        }
    }

    /// Purges against the current time. See [`Purger::purge_at`].
    pub async fn purge(&self) -> usize {
        self.purge_at(Utc::now()).await
    }

    /// Deletes up to `batch_limit` non-waiting tasks sent more than
    /// `retention_days` before `now`.
    ///
    /// Never fails: errors are logged and reported as zero deletions, and a
    /// failed delete leaves every row in place.
    pub async fn purge_at(&self, now: DateTime<Utc>) -> usize {
        let Some(_flight) = self.guard.try_enter() else {
            debug!("Purge already in progress, skipping");
            return 0;
        };

        let retention_days = self.config.retention_days;
        let Some(cutoff) = Duration::try_days(retention_days)
            .filter(|_| retention_days >= 0)
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            error!(retention_days, "Retention period out of range, nothing purged");
            return 0;
        };
        let ids = match self
            .store
            .select_purgeable(cutoff, self.config.batch_limit)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, cutoff = %cutoff, "Failed to select tasks for purge");
                return 0;
            }
        };
        if ids.is_empty() {
            debug!(cutoff = %cutoff, "Nothing to purge");
            return 0;
        }

        match self.store.delete_tasks(&ids).await {
            Ok(deleted) => {
                info!(deleted, cutoff = %cutoff, "Purged old emails");
                deleted
            }
            Err(e) => {
                error!(error = %e, tasks = ?ids, "Failed to purge emails, rolled back");
                0
            }
        }
    }
}
