//! HTTP surface of the bridge worker
//!
//! Front-ends in other processes connect over `/bridge` (WebSocket, JSON
//! messages from [`super::protocol`]); `/assets/*` serves the cache-first
//! asset store and `POST /wake` injects a wake from outside.
//!
//! Only loopback callers are served: a request whose `Origin` or `Host`
//! names another host is refused before it reaches a handler.

use axum::{
    Json, Router,
    extract::{
        Path, Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, HeaderValue, Method, StatusCode, header, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use url::{Host, Url};

use super::{BridgeHandle, ClientMessage, Lifecycle};
use crate::Result;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: String,
    lifecycle: Lifecycle,
    clients: usize,
}

/// Bridge HTTP server
pub struct BridgeServer {
    handle: BridgeHandle,
    port: u16,
}

impl BridgeServer {
    #[must_use]
    pub const fn new(handle: BridgeHandle, port: u16) -> Self {
        Self { handle, port }
    }

    /// Build the router
    #[must_use]
    pub fn router(handle: BridgeHandle) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _: &Parts| {
                is_loopback_origin(origin)
            }))
            .allow_methods([Method::GET, Method::POST]);

        Router::new()
            .route("/bridge", get(ws_handler))
            .route("/health", get(health))
            .route("/wake", post(wake))
            .route("/assets/{*path}", get(asset))
            .with_state(handle)
            .layer(cors)
            .layer(middleware::from_fn(loopback_only))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Bridge(format!("failed to bind bridge server: {e}")))?;

        tracing::info!(port = self.port, "bridge server listening");

        axum::serve(listener, Self::router(self.handle))
            .await
            .map_err(|e| crate::Error::Bridge(format!("bridge server error: {e}")))?;

        Ok(())
    }

    /// Run the server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

fn is_loopback(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(name) => name.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(ip) => ip.is_loopback(),
        Host::Ipv6(ip) => ip.is_loopback(),
    }
}

fn is_loopback_origin(origin: &HeaderValue) -> bool {
    origin
        .to_str()
        .ok()
        .and_then(|raw| Url::parse(raw).ok())
        .is_some_and(|url| url.host().as_ref().is_some_and(is_loopback))
}

/// `Host` carries an authority (`127.0.0.1:18790`), not a URL
fn is_loopback_authority(authority: &HeaderValue) -> bool {
    authority
        .to_str()
        .ok()
        .and_then(|raw| Url::parse(&format!("http://{raw}")).ok())
        .is_some_and(|url| url.host().as_ref().is_some_and(is_loopback))
}

fn is_local_request(headers: &HeaderMap) -> bool {
    headers.get(header::ORIGIN).is_none_or(is_loopback_origin)
        && headers.get(header::HOST).is_none_or(is_loopback_authority)
}

async fn loopback_only(request: Request, next: Next) -> Response {
    if is_local_request(request.headers()) {
        return next.run(request).await;
    }
    tracing::warn!(
        origin = ?request.headers().get(header::ORIGIN),
        host = ?request.headers().get(header::HOST),
        path = %request.uri().path(),
        "refused non-local bridge request"
    );
    StatusCode::FORBIDDEN.into_response()
}

async fn health(State(handle): State<BridgeHandle>) -> Response {
    match handle.status().await {
        Ok(status) => Json(HealthResponse {
            status: "ok",
            version: status.version,
            lifecycle: status.lifecycle,
            clients: status.clients,
        })
        .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// Relay a wake to every connected front-end
async fn wake(State(handle): State<BridgeHandle>) -> StatusCode {
    let client = handle.connect();
    match client.send(ClientMessage::WakewordDetected) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn asset(State(handle): State<BridgeHandle>, Path(path): Path<String>) -> Response {
    match handle.lookup(&format!("/{path}")).await {
        Ok(Some(bytes)) => bytes.into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(crate::Error::Bridge(msg)) => (StatusCode::BAD_REQUEST, msg).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(handle): State<BridgeHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, handle))
}

async fn handle_socket(socket: WebSocket, handle: BridgeHandle) {
    let client = handle.connect();
    let id = client.id();
    let (mut sender, mut receiver) = socket.split();
    tracing::info!(client = %id, "bridge socket connected");

    let (client_tx, mut inbound) = client.into_split();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            match frame {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => {
                        if let Err(e) = client_tx.send(message) {
                            tracing::debug!(client = %id, error = %e, "bridge worker gone");
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(client = %id, error = %e, "ignoring malformed message"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        // Dropping the client unregisters it
        drop(client_tx);
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::info!(client = %id, "bridge socket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(header::HeaderName, &'static str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(name, value)| (name.clone(), HeaderValue::from_static(value)))
            .collect()
    }

    #[test]
    fn loopback_callers_are_local() {
        assert!(is_local_request(&HeaderMap::new()));
        assert!(is_local_request(&headers(&[
            (header::ORIGIN, "http://localhost:5173"),
            (header::HOST, "127.0.0.1:18790"),
        ])));
        assert!(is_local_request(&headers(&[(header::HOST, "[::1]:18790")])));
    }

    #[test]
    fn foreign_origins_and_hosts_are_refused() {
        assert!(!is_local_request(&headers(&[(header::ORIGIN, "https://evil.example")])));
        assert!(!is_local_request(&headers(&[(header::ORIGIN, "null")])));
        assert!(!is_local_request(&headers(&[(header::HOST, "rebind.example:18790")])));
    }
}
