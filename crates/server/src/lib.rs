//! The gantry upload coordinator server.
//!
//! Wires the session manager, scheduler, validator layers, reaper, rate
//! limiting, and the HTTP surface over the registry and blob store crates.

pub mod error;
pub mod handlers;
pub mod manager;
pub mod metrics;
pub mod ratelimit;
pub mod reaper;
pub mod routes;
pub mod scheduler;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
