use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use super::models::AttemptId;

/// One async mutex per attempt. Commands against the same attempt run one at
/// a time; different attempts never contend.
#[derive(Debug, Default)]
pub struct AttemptLocks {
    locks: Mutex<HashMap<AttemptId, Arc<tokio::sync::Mutex<()>>>>,
}

impl AttemptLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: AttemptId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }
}
