//! Fix attempt lifecycle: the registry, the state machine and the commands
//! that drive it.
//!
//! | Module         | Responsibility                                         |
//! |----------------|--------------------------------------------------------|
//! | `models`       | `FixAttempt`, `AttemptStatus`, history entries         |
//! | `orchestrator` | `Orchestrator`, every lifecycle command                |
//! | `store`        | `AttemptStore` trait and the in-memory registry        |
//! | `locks`        | Per-attempt command serialization                      |
//! | `events`       | `LifecycleEvent` broadcast                             |
//! | `dedup`        | `DedupPolicy` and error fingerprints                   |

pub mod dedup;
pub mod events;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod store;

pub use dedup::DedupPolicy;
pub use events::LifecycleEvent;
pub use models::{
    Actor, ApplyStep, AttemptId, AttemptStatus, FixAttempt, HistoryEntry, Proposal, RepositoryRef,
};
pub use orchestrator::{Orchestrator, OrchestratorSettings, ScanOutcome};
pub use store::{AttemptStore, InMemoryStore};
