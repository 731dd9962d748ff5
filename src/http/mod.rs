//! HTTP endpoints for the host process
//!
//! - GET /health - Liveness probe of the supervisor loop
//! - GET /status - Joined sessions and running pipelines

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
