//! HTTP integration: axum middleware, forward-auth check endpoint, admin
//! routes and the standalone server.

pub mod admin;
pub mod check;
pub mod middleware;
pub mod server;

pub use middleware::{admission_middleware, request_context};
pub use server::{AppState, HttpServer};
