//! Andock Daemon - Docker engine API gateway.
//!
//! Translates Docker engine API requests into calls on the runtime and
//! serves them over a Unix socket and a loopback TCP listener.
//!
//! ```text
//! docker CLI ──► andock.sock / 127.0.0.1:2375 ──► axum router ──► Runtime
//! ```

pub mod api;
pub mod error;
pub mod handlers;
pub mod server;
pub mod stream;
pub mod types;

pub use api::{create_router, AppState};
pub use error::ApiError;
pub use server::serve;
