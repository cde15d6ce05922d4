//! Axum middleware implementing the rate-limiter's "Middleware contract"
//! (spec §4.J), in the teacher's bare-`async fn` shape (`State`, the
//! request, `Next` — see the teacher's `api_auth`/`analytics_middleware`).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::key;
use crate::limiter::{PredictiveResult, RateLimiter};

/// Shared state for `rate_limit_layer`.
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub allow_listed_ips: HashSet<String>,
    /// Mount prefix concatenated onto the request path before
    /// canonicalization (spec §4.J: "Canonical path: concatenate base +
    /// path").
    pub base_path: String,
}

/// spec §4.J "Middleware contract" steps 1-5.
pub async fn rate_limit_layer(State(state): State<Arc<RateLimitState>>, request: Request, next: Next) -> Response {
    let forwarded_for = request
        .headers()
        .get(header::HeaderName::from_static("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());

    let candidates = key::candidate_ips(forwarded_for.as_deref(), remote.as_deref());
    if candidates.iter().any(|ip| state.allow_listed_ips.contains(ip)) {
        return next.run(request).await;
    }

    let client_ip = key::canonical_client_ip(forwarded_for.as_deref(), remote.as_deref()).unwrap_or_else(|| "unknown".to_string());
    let method = request.method().as_str().to_string();
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let canonical_path = key::canonicalize_path(&state.base_path, request.uri().path());

    let resource_key = key::resource_key(&method, &host, &canonical_path);
    let ip_key = key::ip_key(&client_ip);

    let decision = match state.limiter.predictive(&resource_key, &ip_key, &host).await {
        Ok(PredictiveResult::Allowed(decision)) => decision,
        Ok(PredictiveResult::Blocked { .. }) => return StatusCode::TOO_MANY_REQUESTS.into_response(),
        Err(e) => {
            warn!(error = %e, "rate limiter store error, passing request through");
            return next.run(request).await;
        }
    };

    let response = next.run(request).await;
    let observed_bytes = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let limiter = Arc::clone(&state.limiter);
    tokio::spawn(async move {
        limiter.corrective(&decision, observed_bytes).await;
    });

    response
}
