//! Preview reverse proxy: `/{method} /preview/{sandbox_id}/{port}/{path…}`.
//!
//! Resolution goes through the runtime's lock-free port registry. Upstream
//! failures are counted per target; once the consecutive-failure budget is
//! reached the proxy asks the runtime to promote the target to the fallback
//! driver and retries the request once against the new upstream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use prometheus_gauge::InFlight;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::{debug, warn};

use sbx_core::config::Config;
use sbx_core::error::{Error, Result};
use sbx_runtime::UpstreamDescriptor;

use crate::AppState;

/// Request bodies are buffered up to this size so a failed dial can be
/// retried; response bodies always stream.
const MAX_REQUEST_BUFFER: usize = 32 * 1024 * 1024;

/// Headers that never cross the proxy in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Proxy-side shared state: the upstream client and per-target
/// consecutive-failure counters.
pub struct ProxyState {
    client: reqwest::Client,
    error_budget: u32,
    failures: Mutex<HashMap<(String, u16), u32>>,
}

impl ProxyState {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.proxy.upstream_timeout_seconds))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::fatal(format!("proxy client: {}", e)))?;
        Ok(Self {
            client,
            error_budget: config.proxy.error_budget,
            failures: Mutex::new(HashMap::new()),
        })
    }

    fn record_failure(&self, sandbox_id: &str, port: u16) -> u32 {
        let mut failures = self.failures.lock().expect("failure map lock");
        let count = failures
            .entry((sandbox_id.to_string(), port))
            .or_insert(0);
        *count += 1;
        *count
    }

    fn reset_failures(&self, sandbox_id: &str, port: u16) {
        self.failures
            .lock()
            .expect("failure map lock")
            .remove(&(sandbox_id.to_string(), port));
    }
}

/// Entry point for every preview request, HTTP or WebSocket.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
    upgrade: Option<WebSocketUpgrade>,
    request: axum::extract::Request,
) -> Response {
    let _in_flight = InFlight::enter(state.metrics.preview_proxy_in_flight.clone());

    let sandbox_id = params.get("sandbox_id").cloned().unwrap_or_default();
    let port: u16 = match params.get("port").and_then(|p| p.parse().ok()) {
        Some(p) if p > 0 => p,
        _ => {
            return (StatusCode::BAD_REQUEST, "port must be in 1..=65535").into_response();
        }
    };
    let rest = params.get("path").cloned().unwrap_or_default();

    let target = match state.manager.resolve_preview(&sandbox_id, port).await {
        Ok(target) => target,
        Err(_) => return (StatusCode::BAD_GATEWAY, "NotListening").into_response(),
    };

    let upstream_path = if rest.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", rest)
    };
    let query = request
        .uri()
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();

    match upgrade {
        Some(upgrade) => {
            proxy_websocket(
                state,
                upgrade,
                sandbox_id,
                port,
                target.upstream,
                upstream_path,
                query,
            )
            .await
        }
        None => {
            proxy_http(
                state,
                sandbox_id,
                port,
                target.upstream,
                upstream_path,
                query,
                request,
            )
            .await
        }
    }
}

async fn proxy_http(
    state: Arc<AppState>,
    sandbox_id: String,
    port: u16,
    mut upstream: UpstreamDescriptor,
    path: String,
    query: String,
    request: axum::extract::Request,
) -> Response {
    let method = request.method().clone();
    let headers = request.headers().clone();
    let body = match axum::body::to_bytes(request.into_body(), MAX_REQUEST_BUFFER).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response(),
    };

    let mut promoted = false;
    loop {
        let result = send_upstream(
            &state.proxy.client,
            &method,
            &upstream,
            &path,
            &query,
            &headers,
            body.clone(),
        )
        .await;

        match result {
            Ok(response)
                if response.status() != StatusCode::BAD_GATEWAY
                    && response.status() != StatusCode::SERVICE_UNAVAILABLE =>
            {
                state.proxy.reset_failures(&sandbox_id, port);
                return stream_response(response);
            }
            outcome => {
                let failures = state.proxy.record_failure(&sandbox_id, port);
                if promoted {
                    // One retry against the promoted upstream only.
                    return (
                        StatusCode::BAD_GATEWAY,
                        "upstream failed after fallback promotion",
                    )
                        .into_response();
                }
                if failures >= state.proxy.error_budget {
                    match state.manager.promote_to_fallback(&sandbox_id, port).await {
                        Ok(new_upstream) => {
                            debug!(
                                sandbox = %sandbox_id,
                                port,
                                upstream = %new_upstream.base_url(),
                                "retrying against promoted upstream"
                            );
                            state.proxy.reset_failures(&sandbox_id, port);
                            upstream = new_upstream;
                            promoted = true;
                            continue;
                        }
                        Err(e) => {
                            warn!(sandbox = %sandbox_id, port, error = %e, "fallback promotion failed");
                            return (StatusCode::BAD_GATEWAY, "upstream unreachable")
                                .into_response();
                        }
                    }
                }
                match outcome {
                    // The upstream answered with a bad-gateway status of its
                    // own; pass it through verbatim (status is preserved).
                    Ok(response) => return stream_response(response),
                    // Dial failure under budget: try the dial again.
                    Err(_) => continue,
                }
            }
        }
    }
}

async fn send_upstream(
    client: &reqwest::Client,
    method: &Method,
    upstream: &UpstreamDescriptor,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> std::result::Result<reqwest::Response, reqwest::Error> {
    let url = format!("{}{}{}", upstream.base_url(), path, query);
    let mut request = client.request(method.clone(), &url);
    for (name, value) in filtered_headers(headers) {
        request = request.header(name, value);
    }
    if !body.is_empty() {
        request = request.body(body);
    }
    request.send().await
}

fn stream_response(response: reqwest::Response) -> Response {
    let status = response.status();
    let headers = response.headers().clone();

    let mut builder = Response::builder().status(status);
    for (name, value) in filtered_headers(&headers) {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Everything except hop-by-hop headers and `host` (the client dials the
/// upstream itself).
fn filtered_headers(headers: &HeaderMap) -> Vec<(HeaderName, axum::http::HeaderValue)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.as_str().to_ascii_lowercase();
            lower != "host" && !HOP_BY_HOP.contains(&lower.as_str())
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

async fn proxy_websocket(
    state: Arc<AppState>,
    upgrade: WebSocketUpgrade,
    sandbox_id: String,
    port: u16,
    upstream: UpstreamDescriptor,
    path: String,
    query: String,
) -> Response {
    let url = format!("ws://{}:{}{}{}", upstream.host, upstream.port, path, query);

    let connection = match connect_async(url.as_str()).await {
        Ok((ws, _)) => Ok(ws),
        Err(first_err) => {
            let failures = state.proxy.record_failure(&sandbox_id, port);
            if failures >= state.proxy.error_budget {
                match state.manager.promote_to_fallback(&sandbox_id, port).await {
                    Ok(new_upstream) => {
                        state.proxy.reset_failures(&sandbox_id, port);
                        let retry_url = format!(
                            "ws://{}:{}{}{}",
                            new_upstream.host, new_upstream.port, path, query
                        );
                        connect_async(retry_url.as_str()).await.map(|(ws, _)| ws)
                    }
                    Err(_) => Err(first_err),
                }
            } else {
                Err(first_err)
            }
        }
    };

    let upstream_ws = match connection {
        Ok(ws) => {
            state.proxy.reset_failures(&sandbox_id, port);
            ws
        }
        Err(e) => {
            warn!(sandbox = %sandbox_id, port, error = %e, "websocket upstream dial failed");
            return (StatusCode::BAD_GATEWAY, "upstream unreachable").into_response();
        }
    };

    upgrade.on_upgrade(move |client| bridge_websocket(client, upstream_ws, sandbox_id))
}

async fn bridge_websocket(
    client: WebSocket,
    upstream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    sandbox_id: String,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let forward = match message {
                WsMessage::Text(text) => TungsteniteMessage::Text(text),
                WsMessage::Binary(bytes) => TungsteniteMessage::Binary(bytes),
                WsMessage::Ping(bytes) => TungsteniteMessage::Ping(bytes),
                WsMessage::Pong(bytes) => TungsteniteMessage::Pong(bytes),
                WsMessage::Close(_) => break,
            };
            if upstream_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.send(TungsteniteMessage::Close(None)).await;
    };

    let upstream_to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let forward = match message {
                TungsteniteMessage::Text(text) => WsMessage::Text(text),
                TungsteniteMessage::Binary(bytes) => WsMessage::Binary(bytes),
                TungsteniteMessage::Ping(bytes) => WsMessage::Ping(bytes),
                TungsteniteMessage::Pong(bytes) => WsMessage::Pong(bytes),
                TungsteniteMessage::Close(_) => break,
                TungsteniteMessage::Frame(_) => continue,
            };
            if client_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = client_tx.send(WsMessage::Close(None)).await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
    debug!(sandbox = %sandbox_id, "websocket preview closed");
}

/// RAII guard for the in-flight gauge.
mod prometheus_gauge {
    pub struct InFlight(prometheus::IntGauge);

    impl InFlight {
        pub fn enter(gauge: prometheus::IntGauge) -> Self {
            gauge.inc();
            Self(gauge)
        }
    }

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert("host", "proxy.example".parse().unwrap());
        headers.insert("x-custom", "kept".parse().unwrap());
        headers.insert("accept", "text/html".parse().unwrap());

        let kept: Vec<String> = filtered_headers(&headers)
            .into_iter()
            .map(|(name, _)| name.as_str().to_string())
            .collect();
        assert!(kept.contains(&"x-custom".to_string()));
        assert!(kept.contains(&"accept".to_string()));
        assert!(!kept.contains(&"connection".to_string()));
        assert!(!kept.contains(&"transfer-encoding".to_string()));
        assert!(!kept.contains(&"upgrade".to_string()));
        assert!(!kept.contains(&"host".to_string()));
    }

    #[test]
    fn test_failure_counter_rolls_and_resets() {
        let state = ProxyState::new(&Config::default()).unwrap();
        assert_eq!(state.record_failure("sbx-a", 3000), 1);
        assert_eq!(state.record_failure("sbx-a", 3000), 2);
        // Distinct targets do not share a counter.
        assert_eq!(state.record_failure("sbx-a", 3001), 1);
        assert_eq!(state.record_failure("sbx-b", 3000), 1);

        state.reset_failures("sbx-a", 3000);
        assert_eq!(state.record_failure("sbx-a", 3000), 1);
    }
}
