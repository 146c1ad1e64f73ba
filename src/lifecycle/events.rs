use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::{ApplyStep, FixAttempt};
use crate::errors::RecordedError;

/// Capacity of the event channel. Slow subscribers skip ahead rather than
/// holding back the orchestrator.
pub const EVENT_CAPACITY: usize = 256;

/// Published after every stored transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecycleEvent {
    AttemptCreated { attempt: FixAttempt },
    AttemptUpdated { attempt: FixAttempt },
    /// An apply stopped on a timeout or cancellation. `attempt` is the
    /// restored pre-apply snapshot; no transition is recorded.
    ApplyInterrupted {
        attempt: FixAttempt,
        step: ApplyStep,
        error: RecordedError,
    },
}

impl LifecycleEvent {
    pub fn attempt(&self) -> &FixAttempt {
        match self {
            Self::AttemptCreated { attempt }
            | Self::AttemptUpdated { attempt }
            | Self::ApplyInterrupted { attempt, .. } => attempt,
        }
    }
}

pub fn channel() -> (broadcast::Sender<LifecycleEvent>, broadcast::Receiver<LifecycleEvent>) {
    broadcast::channel(EVENT_CAPACITY)
}

/// Publish without caring whether anyone is listening.
pub fn publish(tx: &broadcast::Sender<LifecycleEvent>, event: LifecycleEvent) {
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ErrorCandidate;
    use crate::lifecycle::models::RepositoryRef;

    #[test]
    fn test_event_serialization_is_tagged() {
        let attempt = FixAttempt::new(
            ErrorCandidate::new(None, None, "ERROR x", "ERROR x"),
            RepositoryRef::new("https://example.com/r.git"),
        );
        let json = serde_json::to_string(&LifecycleEvent::AttemptCreated { attempt }).unwrap();
        assert!(json.contains("\"type\":\"AttemptCreated\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"status\":\"pending\""));
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let (tx, rx) = channel();
        drop(rx);
        let attempt = FixAttempt::new(
            ErrorCandidate::new(None, None, "ERROR x", "ERROR x"),
            RepositoryRef::new("https://example.com/r.git"),
        );
        publish(&tx, LifecycleEvent::AttemptUpdated { attempt });
    }
}
