// WebSocket bridge for external credential validation
//
// Every socket connected to /ws is a validator: it receives each
// ValidationRequest as a JSON text frame and answers with
// {"request_id": ..., "status": "SUCCESS" | "REJECTED" | ...}.

use credreader_core::validation::ValidationRequest;
use credreader_core::ValidationDelegate;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warp::Filter;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub validators: usize,
    pub pending: usize,
    pub version: String,
}

/// Resolve the configured bind host; `localhost` maps to the IPv4 loopback.
pub fn bind_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = if host.eq_ignore_ascii_case("localhost") {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        host.parse()
            .map_err(|_| anyhow::anyhow!("Invalid validation host: {}", host))?
    };
    Ok(SocketAddr::new(ip, port))
}

pub fn start(addr: SocketAddr, delegate: Arc<ValidationDelegate>) -> JoinHandle<()> {
    let delegate_filter = warp::any().map({
        let delegate = delegate.clone();
        move || delegate.clone()
    });

    // 1. WebSocket at /ws
    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(delegate_filter.clone())
        .map(|ws: warp::ws::Ws, delegate: Arc<ValidationDelegate>| {
            ws.on_upgrade(move |socket| handle_connection(socket, delegate))
        })
        .boxed();

    // 2. Status at /status
    let status_route = warp::path("status")
        .and(warp::get())
        .and(delegate_filter)
        .map(|delegate: Arc<ValidationDelegate>| warp::reply::json(&status(&delegate)))
        .boxed();

    let routes = ws_route.or(status_route).boxed();

    info!("Validation endpoint on ws://{}/ws", addr);

    tokio::spawn(async move {
        warp::serve(routes).run(addr).await;
    })
}

fn status(delegate: &ValidationDelegate) -> StatusResponse {
    StatusResponse {
        validators: delegate.subscriber_count(),
        pending: delegate.pending_count(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

async fn handle_connection(ws: warp::ws::WebSocket, delegate: Arc<ValidationDelegate>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut requests = delegate.subscribe();
    info!(validators = delegate.subscriber_count(), "Validator connected");

    // Task to forward validation requests -> WebSocket
    let forward_task = tokio::spawn(async move {
        loop {
            let request: ValidationRequest = match requests.recv().await {
                Ok(request) => request,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Validator fell behind, requests dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Ok(json) = serde_json::to_string(&request) else {
                continue;
            };
            if ws_tx.send(warp::ws::Message::text(json)).await.is_err() {
                break;
            }
        }
    });

    // Handle WebSocket -> delegate
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) => {
                if let Ok(text) = msg.to_str() {
                    // Rejected responses are logged by the delegate
                    let _ = delegate.handle_response_json(text);
                } else if msg.is_close() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Validator socket error");
                break;
            }
        }
    }

    // The subscription lives in the forward task; it must go before the count
    // is reported.
    forward_task.abort();
    let _ = forward_task.await;
    info!(validators = delegate.subscriber_count(), "Validator disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use credreader_core::ValidationConfig;

    #[test]
    fn test_bind_addr() {
        assert_eq!(
            bind_addr("localhost", 8799).unwrap(),
            "127.0.0.1:8799".parse().unwrap()
        );
        assert_eq!(
            bind_addr("0.0.0.0", 1).unwrap(),
            "0.0.0.0:1".parse().unwrap()
        );
        assert!(bind_addr("not a host", 1).is_err());
    }

    #[test]
    fn test_status_counts_validators() {
        let delegate = ValidationDelegate::new(ValidationConfig::default());
        assert_eq!(status(&delegate).validators, 0);

        let _rx = delegate.subscribe();
        let report = status(&delegate);
        assert_eq!(report.validators, 1);
        assert_eq!(report.pending, 0);
    }
}
