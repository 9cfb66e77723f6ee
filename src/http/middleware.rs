//! Admission middleware for axum routers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        header::{AsHeaderName, RETRY_AFTER, USER_AGENT},
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};

use crate::ratelimit::{
    resolve_client_ip, AdmissionController, Decision, Identity, RequestContext,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

pub(crate) fn header_str<K: AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Build the admission view of an incoming request.
///
/// The caller identity comes from an [`Identity`] extension inserted by an
/// upstream authentication layer; without one the request is anonymous.
pub fn request_context<B>(request: &Request<B>) -> RequestContext {
    let headers = request.headers();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let ip = resolve_client_ip(
        header_str(headers, X_FORWARDED_FOR),
        header_str(headers, X_REAL_IP),
        peer.as_deref(),
    );

    let mut ctx =
        RequestContext::new(ip, request.uri().path()).with_method(request.method().as_str());
    if let Some(ua) = header_str(headers, USER_AGENT) {
        ctx = ctx.with_user_agent(ua);
    }
    if let Some(identity) = request.extensions().get::<Identity>() {
        ctx = ctx.with_identity(identity.clone());
    }
    ctx
}

/// Unix epoch second at which a window `reset_after_ms` from `now` resets.
pub fn reset_epoch_secs(reset_after_ms: u64, now: DateTime<Utc>) -> u64 {
    let now_ms = now.timestamp_millis().max(0) as u64;
    now_ms.saturating_add(reset_after_ms).div_ceil(1_000)
}

/// Write rate limit and retry headers for `decision`.
pub fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    if let Some(limits) = decision.headers {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limits.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(limits.remaining));
        headers.insert(
            X_RATELIMIT_RESET,
            HeaderValue::from(reset_epoch_secs(limits.reset_after_ms, Utc::now())),
        );
    }
    if let Some(secs) = decision.retry_after_secs {
        headers.insert(RETRY_AFTER, HeaderValue::from(secs));
    }
}

/// Response for a denied decision: status, JSON body and headers.
pub fn denial_response(decision: &Decision) -> Response {
    let status =
        StatusCode::from_u16(decision.status).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
    let mut response = match &decision.body {
        Some(body) => (status, Json(body)).into_response(),
        None => status.into_response(),
    };
    apply_headers(response.headers_mut(), decision);
    response
}

/// Gate every request through `controller`.
///
/// ```ignore
/// let app = Router::new()
///     .route("/api/items", get(list_items))
///     .layer(middleware::from_fn_with_state(controller, admission_middleware));
/// ```
pub async fn admission_middleware(
    State(controller): State<Arc<AdmissionController>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ctx = request_context(&request);
    let decision = controller.decide(&ctx).await;

    if !decision.admit {
        return denial_response(&decision);
    }

    if let Some(delay) = decision.delay {
        tokio::time::sleep(delay).await;
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AdmissionConfig;
    use crate::ratelimit::{CustomRule, LimitConfig, RuleAction};
    use axum::{
        body::to_bytes,
        middleware::{from_fn, from_fn_with_state},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    fn controller(max: u64) -> Arc<AdmissionController> {
        let config = AdmissionConfig {
            per_ip: Some(LimitConfig::new(60_000, max)),
            ..Default::default()
        };
        Arc::new(
            AdmissionController::builder(config)
                .clock(Arc::new(ManualClock::new(0)))
                .build()
                .unwrap(),
        )
    }

    fn app(controller: Arc<AdmissionController>) -> Router {
        Router::new()
            .route("/api/items", get(|| async { "items" }))
            .route("/admin/panel", get(|| async { "panel" }))
            .layer(from_fn_with_state(controller, admission_middleware))
    }

    fn get_from(ip: &str, path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(X_FORWARDED_FOR, format!("{}, 10.0.0.1", ip))
            .header(USER_AGENT, "Mozilla/5.0 (X11; Linux x86_64)")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_request_context_from_parts() {
        let mut request = Request::builder()
            .method("POST")
            .uri("/login?next=/home")
            .header(X_REAL_IP, "198.51.100.4")
            .header(USER_AGENT, "curl/8.4.0")
            .body(())
            .unwrap();
        request.extensions_mut().insert(Identity {
            user_id: "42".into(),
            role: Some("premium".into()),
        });

        let ctx = request_context(&request);
        assert_eq!(ctx.client_ip, "198.51.100.4");
        assert_eq!(ctx.path, "/login");
        assert_eq!(ctx.method, "POST");
        assert_eq!(ctx.user_agent.as_deref(), Some("curl/8.4.0"));
        assert_eq!(ctx.user_id.as_deref(), Some("42"));
        assert_eq!(ctx.role.as_deref(), Some("premium"));
    }

    #[test]
    fn test_request_context_peer_and_unknown() {
        let mut request = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(request_context(&request).client_ip, "unknown");

        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 5000))));
        assert_eq!(request_context(&request).client_ip, "127.0.0.1");
    }

    #[test]
    fn test_reset_epoch_rounds_up() {
        let now = DateTime::from_timestamp_millis(1_700_000_000_250).unwrap();
        assert_eq!(reset_epoch_secs(60_000, now), 1_700_000_061);
        assert_eq!(reset_epoch_secs(750, now), 1_700_000_001);
    }

    #[tokio::test]
    async fn test_middleware_admits_then_denies() {
        let app = app(controller(1));

        let ok = app.clone().oneshot(get_from("9.9.9.9", "/api/items")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()[&X_RATELIMIT_LIMIT], "1");
        assert_eq!(ok.headers()[&X_RATELIMIT_REMAINING], "0");
        let reset: u64 = ok.headers()[&X_RATELIMIT_RESET].to_str().unwrap().parse().unwrap();
        assert!(reset >= Utc::now().timestamp() as u64);

        let denied = app.oneshot(get_from("9.9.9.9", "/api/items")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers()[RETRY_AFTER], "60");

        let body = to_bytes(denied.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "too_many_requests");
        assert_eq!(json["retryAfter"], 60);
    }

    #[tokio::test]
    async fn test_middleware_separates_clients() {
        let app = app(controller(1));
        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            let response = app.clone().oneshot(get_from(ip, "/api/items")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_identity_extension_reaches_admission() {
        async fn authenticate(mut request: Request<Body>, next: Next) -> Response {
            request.extensions_mut().insert(Identity {
                user_id: "root".into(),
                role: Some("admin".into()),
            });
            next.run(request).await
        }

        let app = app(controller(1)).layer(from_fn(authenticate));
        for _ in 0..3 {
            let response = app.clone().oneshot(get_from("4.4.4.4", "/admin/panel")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            // Exempt roles bypass, so no limit headers
            assert!(response.headers().get(&X_RATELIMIT_LIMIT).is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_action_holds_request() {
        let controller = Arc::new(
            AdmissionController::builder(AdmissionConfig::default())
                .clock(Arc::new(ManualClock::new(0)))
                .rule(
                    CustomRule::new("slow", "slow", |_| true, LimitConfig::block_all(60_000))
                        .with_action(RuleAction::Delay { ms: 500 }),
                )
                .build()
                .unwrap(),
        );

        let started = tokio::time::Instant::now();
        let response = app(controller).oneshot(get_from("5.5.5.5", "/api/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(started.elapsed() >= std::time::Duration::from_millis(500));
    }
}
