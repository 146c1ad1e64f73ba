use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::models::{AttemptId, FixAttempt};
use crate::errors::FixError;

/// Registry of fix attempts, owned by the orchestrator.
///
/// Implementations must return snapshots: mutating a returned attempt never
/// changes the stored one until it is `put` back.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn get(&self, id: AttemptId) -> Result<Option<FixAttempt>, FixError>;

    /// Insert or replace.
    async fn put(&self, attempt: FixAttempt) -> Result<(), FixError>;

    /// Every attempt, oldest first.
    async fn list(&self) -> Result<Vec<FixAttempt>, FixError>;
}

/// Process-lifetime store. A restart loses every attempt.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    attempts: RwLock<HashMap<AttemptId, FixAttempt>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for InMemoryStore {
    async fn get(&self, id: AttemptId) -> Result<Option<FixAttempt>, FixError> {
        Ok(self.attempts.read().await.get(&id).cloned())
    }

    async fn put(&self, attempt: FixAttempt) -> Result<(), FixError> {
        self.attempts.write().await.insert(attempt.id, attempt);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FixAttempt>, FixError> {
        let mut all: Vec<FixAttempt> = self.attempts.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }
}
