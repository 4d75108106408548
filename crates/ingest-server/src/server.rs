//! HTTP layer
//!
//! Three endpoints:
//!
//! - `/collect` is the hot path. GET collects the raw query string,
//!   POST collects the raw body. The handler populates a pooled event
//!   and pushes it onto the event channel without blocking; a full
//!   channel is answered with 503, which is the only backpressure
//!   signal clients see.
//! - `/metrics` serves the plain-text counter snapshot.
//! - `/health` answers load-balancer liveness with a literal `ok`.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use ingest_core::prelude::*;
use tokio::sync::mpsc;
use tracing::debug;

use crate::ip::client_ip;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<Metrics>,
    pub clock: Arc<TimeCache>,
    pub events: mpsc::Sender<Box<Event>>,
    pub event_pool: Arc<EventPool>,
    pub max_body_size: usize,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/collect",
            get(collect_get).post(collect_post).options(preflight),
        )
        .route("/metrics", get(metrics_snapshot))
        .route("/health", get(health))
        .with_state(state)
}

/// GET collection: the query string is the payload.
async fn collect_get(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> StatusCode {
    let query = query.unwrap_or_default();
    if query.len() > state.max_body_size {
        state
            .metrics
            .http_requests_rejected_body_too_large_total
            .fetch_add(1, Ordering::Relaxed);
        return StatusCode::PAYLOAD_TOO_LARGE;
    }

    accept_event(&state, &headers, remote, query)
}

/// POST collection: the raw body is the payload.
async fn collect_post(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Body,
) -> StatusCode {
    let bytes = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            state
                .metrics
                .http_requests_rejected_body_too_large_total
                .fetch_add(1, Ordering::Relaxed);
            return StatusCode::PAYLOAD_TOO_LARGE;
        }
    };

    let body = String::from_utf8_lossy(&bytes).into_owned();
    accept_event(&state, &headers, remote, body)
}

/// CORS preflight.
async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Populate a pooled event and attempt a non-blocking push onto the
/// event channel. Full (or closing) channel: recycle and reject.
fn accept_event(
    state: &AppState,
    headers: &HeaderMap,
    remote: SocketAddr,
    body: String,
) -> StatusCode {
    let mut event = state.event_pool.acquire();
    event.ts = state.clock.unix();
    event.ip = client_ip(headers, remote);
    event.user_agent = header_string(headers, header::USER_AGENT.as_str());
    event.cookie = header_string(headers, header::COOKIE.as_str());
    event.body = body;

    state
        .metrics
        .http_requests_total
        .fetch_add(1, Ordering::Relaxed);

    match state.events.try_send(event) {
        Ok(()) => {
            state
                .metrics
                .http_requests_accepted_total
                .fetch_add(1, Ordering::Relaxed);
            StatusCode::OK
        }
        Err(err) => {
            let event = match err {
                mpsc::error::TrySendError::Full(ev) => ev,
                mpsc::error::TrySendError::Closed(ev) => ev,
            };
            state.event_pool.release(event);
            state
                .metrics
                .http_requests_rejected_queue_full_total
                .fetch_add(1, Ordering::Relaxed);
            debug!("event channel full, rejecting");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}

/// Counter snapshot, one `name=value` per line.
async fn metrics_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

/// Liveness for the load-balancer target group.
async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_capacity(capacity: usize) -> (AppState, mpsc::Receiver<Box<Event>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let state = AppState {
            metrics: Arc::new(Metrics::new()),
            clock: TimeCache::frozen(1700000000, "2023-11-15", "08"),
            events: tx,
            event_pool: EventPool::new(),
            max_body_size: 1024,
        };
        (state, rx)
    }

    fn remote() -> SocketAddr {
        "203.0.113.10:55555".parse().unwrap()
    }

    #[tokio::test]
    async fn accepts_until_channel_full_then_rejects() {
        let (state, _rx) = state_with_capacity(2);
        let headers = HeaderMap::new();

        assert_eq!(
            accept_event(&state, &headers, remote(), "a=1".into()),
            StatusCode::OK
        );
        assert_eq!(
            accept_event(&state, &headers, remote(), "a=2".into()),
            StatusCode::OK
        );
        assert_eq!(
            accept_event(&state, &headers, remote(), "a=3".into()),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let m = &state.metrics;
        assert_eq!(m.http_requests_total.load(Ordering::Relaxed), 3);
        assert_eq!(m.http_requests_accepted_total.load(Ordering::Relaxed), 2);
        assert_eq!(
            m.http_requests_rejected_queue_full_total.load(Ordering::Relaxed),
            1
        );
        // Rejected event went back to the pool.
        assert_eq!(state.event_pool.idle(), 1);
    }

    #[tokio::test]
    async fn populates_event_from_request_context() {
        let (state, mut rx) = state_with_capacity(4);
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, "test-agent".parse().unwrap());
        headers.insert(header::COOKIE, "sid=xyz".parse().unwrap());

        accept_event(&state, &headers, remote(), "payload".into());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.ts, 1700000000);
        assert_eq!(event.ip, "203.0.113.10");
        assert_eq!(event.user_agent, "test-agent");
        assert_eq!(event.cookie, "sid=xyz");
        assert_eq!(event.body, "payload");
    }
}
