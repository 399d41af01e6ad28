//! HTTP route handlers for the tracehound server.

pub mod traces;

/// Health check endpoint.
pub async fn health() -> &'static str {
    "OK"
}
