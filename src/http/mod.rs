//! HTTP API server for external control
//!
//! This module provides a REST API for the live session:
//! - POST /session/start - Acquire devices and connect
//! - POST /session/stop - Tear the session down
//! - POST /session/retry - Recover from the error state
//! - GET /session/status - Current session snapshot
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use handlers::ErrorResponse;
pub use routes::create_router;
pub use state::AppState;
