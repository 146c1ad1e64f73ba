//! HTTP command surface for the lifecycle orchestrator.
//!
//! | Module   | Responsibility                                             |
//! |----------|------------------------------------------------------------|
//! | `api`    | JSON routes, `ApiError` status mapping                      |
//! | `server` | Router assembly, state construction, graceful shutdown     |
//! | `ws`     | `/ws` stream of lifecycle events                           |

pub mod api;
pub mod server;
pub mod ws;

pub use api::{AppState, SharedState};
pub use server::{ServerConfig, build_router, build_state, start_server};
