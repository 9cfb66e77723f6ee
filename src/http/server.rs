//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{any, get},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::admin::admin_router;
use super::check::check_handler;
use crate::config::ServerConfig;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::AdmissionController;

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<AdmissionController>,
    pub trust_identity_headers: bool,
    pub admin_token: Option<Arc<str>>,
}

/// HTTP front end for the admission controller.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    pub fn new(config: &ServerConfig, controller: Arc<AdmissionController>) -> Self {
        Self {
            addr: config.listen_addr,
            state: AppState {
                controller,
                trust_identity_headers: config.trust_identity_headers,
                admin_token: config.admin_token.as_deref().map(Arc::from),
            },
        }
    }

    /// Build the router. Admin routes are only mounted when a token is set.
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(health))
            .route("/v1/check", any(check_handler))
            .with_state(self.state.clone());

        if self.state.admin_token.is_some() {
            router.merge(admin_router(self.state.clone()))
        } else {
            router
        }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let app = self.router();

        info!(
            addr = %self.addr,
            admin = self.state.admin_token.is_some(),
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GatekeeperError::Http(e.to_string())
            })?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
