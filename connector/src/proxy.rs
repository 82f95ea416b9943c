use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use metrics::counter;
use once_cell::sync::Lazy;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use connector_core::config::ProxyConfig;
use connector_core::retry::{retry, RetryPolicy};
use connector_core::{Error, Result};

const USER_AGENT_VALUE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Owned by each hop, never replayed from the upstream reply. Content
/// length and encoding are recomputed locally: the outbound client already
/// decompressed the body.
static HOP_BY_HOP: Lazy<Vec<HeaderName>> = Lazy::new(|| {
    vec![
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::CONTENT_LENGTH,
        header::CONTENT_ENCODING,
    ]
});

/// Gateway in front of the query API: replays caller credentials, retries
/// flaky upstream replies, and optionally serializes outbound calls through
/// a global rate limit.
pub struct ProxyState {
    http: reqwest::Client,
    retry: RetryPolicy,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl ProxyState {
    pub fn new(config: &ProxyConfig, retry: RetryPolicy, request_timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()?;

        let limiter = match config.rate_limit_window_ms {
            Some(window_ms) => {
                let quota = Quota::with_period(Duration::from_millis(window_ms)).ok_or_else(
                    || Error::Config("proxy.rate_limit_window_ms must be greater than 0".into()),
                )?;
                Some(RateLimiter::direct(quota))
            }
            None => None,
        };

        Ok(Self {
            http,
            retry,
            limiter,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ForwardQuery {
    endpoint: String,
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/proxy", get(forward_get).post(forward_post))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn forward_get(
    State(state): State<Arc<ProxyState>>,
    Query(query): Query<ForwardQuery>,
    headers: HeaderMap,
) -> Response {
    forward(&state, Method::GET, &query.endpoint, &headers, None).await
}

async fn forward_post(
    State(state): State<Arc<ProxyState>>,
    Query(query): Query<ForwardQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(body) = std::str::from_utf8(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    // The upstream API takes its JSON query wrapped in a form-style field.
    let wrapped = format!("query={body}");
    forward(&state, Method::POST, &query.endpoint, &headers, Some(wrapped)).await
}

async fn forward(
    state: &ProxyState,
    method: Method,
    endpoint: &str,
    headers: &HeaderMap,
    body: Option<String>,
) -> Response {
    if reqwest::Url::parse(endpoint).is_err() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let auth = headers.get(header::AUTHORIZATION).cloned();

    let result = retry(&state.retry, endpoint, || {
        let method = method.clone();
        let auth = auth.clone();
        let body = body.clone();
        async move {
            // Every attempt takes its turn at the global limit, so retries
            // cannot jump the queue.
            if let Some(limiter) = &state.limiter {
                limiter.until_ready().await;
            }

            let mut request = state
                .http
                .request(method, endpoint)
                .header(header::ACCEPT, "application/json")
                .header(header::USER_AGENT, USER_AGENT_VALUE);
            if let Some(auth) = auth {
                request = request.header(header::AUTHORIZATION, auth);
            }
            if let Some(body) = body {
                request = request.body(body);
            }

            let response = request.send().await?;
            let status = response.status();
            if status != StatusCode::OK {
                return Err(Error::UpstreamStatus {
                    status: status.as_u16(),
                    url: endpoint.to_string(),
                });
            }

            let headers = response.headers().clone();
            let bytes = response.bytes().await?;
            Ok((headers, bytes))
        }
    })
    .await;

    match result {
        Ok((upstream_headers, bytes)) => {
            counter!("connector_proxy_requests", "outcome" => "ok").increment(1);
            (StatusCode::OK, replayable_headers(&upstream_headers), bytes).into_response()
        }
        Err(e) => {
            counter!("connector_proxy_requests", "outcome" => "error").increment(1);
            let status = e
                .last_upstream_status()
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            warn!(endpoint, status = status.as_u16(), error = %e, "forwarding failed");
            status.into_response()
        }
    }
}

/// Upstream reply headers minus the hop-owned set.
fn replayable_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut replay = HeaderMap::new();
    for (name, value) in upstream {
        if !HOP_BY_HOP.contains(name) {
            replay.append(name.clone(), value.clone());
        }
    }
    replay
}

pub async fn serve(state: Arc<ProxyState>, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "proxy gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
