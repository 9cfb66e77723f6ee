//! Forward-auth decision endpoint.
//!
//! A reverse proxy (nginx `auth_request`, Envoy `ext_authz` over HTTP,
//! Traefik `forwardAuth`) sends a subrequest here before proxying. The
//! original path and method travel in `X-Original-URI` and
//! `X-Original-Method`. A 2xx response admits the original request.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
};

use super::middleware::{apply_headers, denial_response, header_str, request_context};
use super::server::AppState;
use crate::ratelimit::{Identity, RequestContext};

pub const X_ORIGINAL_URI: &str = "x-original-uri";
pub const X_ORIGINAL_METHOD: &str = "x-original-method";
pub const X_AUTHENTICATED_USER: &str = "x-authenticated-user";
pub const X_AUTHENTICATED_ROLE: &str = "x-authenticated-role";

fn original_path(uri: &str) -> &str {
    uri.split(['?', '#']).next().unwrap_or(uri)
}

/// Admission context for the original request described by `request`.
fn check_context(request: &Request<Body>, trust_identity_headers: bool) -> RequestContext {
    let headers = request.headers();
    let mut ctx = request_context(request);

    if let Some(uri) = header_str(headers, X_ORIGINAL_URI) {
        ctx.path = original_path(uri).to_string();
    }
    if let Some(method) = header_str(headers, X_ORIGINAL_METHOD) {
        ctx.method = method.to_ascii_uppercase();
    }
    if trust_identity_headers {
        if let Some(identity) = identity_from_headers(headers) {
            ctx = ctx.with_identity(identity);
        }
    }
    ctx
}

fn identity_from_headers(headers: &HeaderMap) -> Option<Identity> {
    let user_id = header_str(headers, X_AUTHENTICATED_USER)
        .map(str::trim)
        .filter(|u| !u.is_empty())?;
    Some(Identity {
        user_id: user_id.to_string(),
        role: header_str(headers, X_AUTHENTICATED_ROLE).map(|r| r.trim().to_string()),
    })
}

pub async fn check_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let ctx = check_context(&request, state.trust_identity_headers);
    let decision = state.controller.decide(&ctx).await;

    if !decision.admit {
        return denial_response(&decision);
    }

    if let Some(delay) = decision.delay {
        tokio::time::sleep(delay).await;
    }

    let mut response = StatusCode::OK.into_response();
    apply_headers(response.headers_mut(), &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AdmissionConfig, ServerConfig};
    use crate::http::server::HttpServer;
    use crate::ratelimit::{AdmissionController, LimitConfig};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn server(trust_identity_headers: bool) -> HttpServer {
        let config = AdmissionConfig {
            per_ip: Some(LimitConfig::new(60_000, 1)),
            ..Default::default()
        };
        let controller = AdmissionController::builder(config)
            .clock(Arc::new(ManualClock::new(0)))
            .build()
            .unwrap();
        let server_config = ServerConfig {
            trust_identity_headers,
            ..Default::default()
        };
        HttpServer::new(&server_config, Arc::new(controller))
    }

    fn check(ip: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .uri("/v1/check")
            .header("x-forwarded-for", ip)
            .header(X_ORIGINAL_URI, uri)
            .header(X_ORIGINAL_METHOD, "get")
            .header("user-agent", "Mozilla/5.0 (X11; Linux x86_64)")
    }

    #[test]
    fn test_original_path_strips_query() {
        assert_eq!(original_path("/search?q=rust"), "/search");
        assert_eq!(original_path("/docs#intro"), "/docs");
        assert_eq!(original_path("/plain"), "/plain");
    }

    #[test]
    fn test_check_context_uses_original_request() {
        let request = check("203.0.113.9", "/orders?page=2")
            .header(X_AUTHENTICATED_USER, "alice")
            .body(Body::empty())
            .unwrap();

        let ctx = check_context(&request, false);
        assert_eq!(ctx.client_ip, "203.0.113.9");
        assert_eq!(ctx.path, "/orders");
        assert_eq!(ctx.method, "GET");
        assert!(ctx.user_id.is_none());

        let trusted = check_context(&request, true);
        assert_eq!(trusted.user_id.as_deref(), Some("alice"));
        assert!(trusted.role.is_none());
    }

    #[tokio::test]
    async fn test_check_endpoint_decides() {
        let app = server(false).router();

        let ok = app
            .clone()
            .oneshot(check("9.9.9.9", "/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()["x-ratelimit-remaining"], "0");

        let denied = app
            .clone()
            .oneshot(check("9.9.9.9", "/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

        // Health checks of the original service are exempt
        let health = app
            .oneshot(check("9.9.9.9", "/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_trusted_identity_headers_apply_exempt_roles() {
        let app = server(true).router();
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(
                    check("8.8.8.8", "/api")
                        .header(X_AUTHENTICATED_USER, "ops")
                        .header(X_AUTHENTICATED_ROLE, "system")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
}
