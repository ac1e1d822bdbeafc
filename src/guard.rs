use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lets at most one pass run at a time; overlapping callers are turned away
/// instead of queued. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    slot: Arc<Mutex<()>>,
}

/// Held for the duration of a pass.
pub type Flight = OwnedMutexGuard<()>;

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` while another pass holds the slot.
    pub fn try_enter(&self) -> Option<Flight> {
        self.slot.clone().try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_is_refused_until_release() {
        let guard = SingleFlight::new();
        let shared = guard.clone();

        let flight = guard.try_enter().expect("first entry");
        assert!(shared.try_enter().is_none());

        drop(flight);
        assert!(shared.try_enter().is_some());
    }
}
