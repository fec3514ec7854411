//! The ambient HTTP health/status endpoint: plain liveness at `/health`,
//! node/network counts at `/status`. Not part of the agent-facing wire
//! protocol — this is the operator-facing surface `parleyd` exposes
//! alongside the duplex transport.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::{response::Json, routing::get, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::Network;

/// Builds the health/status router bound to a running [`Network`].
#[must_use]
pub fn create_router(network: Arc<Network>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(status))
        .with_state(network)
}

async fn status(State(network): State<Arc<Network>>) -> Json<serde_json::Value> {
    Json(json!({
        "node_id": network.node_id().to_string(),
        "agent_count": network.list_agents(None).len(),
    }))
}

/// Binds `addr` and returns the listener and the address actually bound
/// (useful when `addr`'s port is `0`).
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    Ok((listener, actual_addr))
}

/// Serves `router` on `listener` until `shutdown_token` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails during operation.
pub async fn serve_with_graceful_shutdown(
    listener: TcpListener,
    router: Router,
    shutdown_token: CancellationToken,
) -> Result<(), std::io::Error> {
    let shutdown_signal = async move {
        shutdown_token.cancelled().await;
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::mods::ModHost;
    use tokio::time::{timeout, Duration};

    async fn test_network() -> Arc<Network> {
        let config = NetworkConfig::testing();
        let mod_host = Arc::new(ModHost::build(&config));
        Arc::new(Network::new(config, mod_host).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_responds_ok() {
        let network = test_network().await;
        let router = create_router(network);
        let (listener, addr) = bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let handle = tokio::spawn(async move { axum::serve(listener, router).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let client = reqwest::Client::new();
        let response = timeout(Duration::from_secs(1), client.get(format!("http://{addr}/health")).send())
            .await
            .unwrap()
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.text().await.unwrap(), "OK");
        handle.abort();
    }

    #[tokio::test]
    async fn status_endpoint_reports_node_id() {
        let network = test_network().await;
        let expected_node_id = network.node_id().to_string();
        let router = create_router(network);
        let (listener, addr) = bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let handle = tokio::spawn(async move { axum::serve(listener, router).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let client = reqwest::Client::new();
        let response = timeout(Duration::from_secs(1), client.get(format!("http://{addr}/status")).send())
            .await
            .unwrap()
            .unwrap();
        assert!(response.status().is_success());
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["node_id"], expected_node_id);
        assert_eq!(body["agent_count"], 0);
        handle.abort();
    }
}
