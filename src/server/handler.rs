// Control plane — start/cancel/status routes plus the server lifecycle.

use std::net::SocketAddr;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::coordinator::{CancelAccepted, Coordinator};
use crate::core::error::ControlError;
use crate::server::telemetry::telemetry_handler;

pub struct ControlServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl ControlServer {
    /// Bind `addr` and serve in the background.
    pub async fn start(coordinator: Coordinator, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(coordinator);

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        info!(%local_addr, "control server listening");
        Ok(Self { local_addr, shutdown_tx: Some(shutdown_tx), task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.local_addr, path)
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

pub fn router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/start", post(start_handler))
        .route("/start-torrent", post(start_handler))
        .route("/cancel", post(cancel_handler))
        .route("/cancel-torrent", post(cancel_handler))
        .route("/status", get(status_handler))
        .route("/telemetry", get(telemetry_handler))
        .with_state(coordinator)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(default, alias = "magnetURI")]
    resource_id: Option<String>,
}

fn rejection(err: ControlError) -> Response {
    let status = if err.is_rejection() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    warn!(%status, "control request rejected: {}", err);
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// POST /start — body `{resourceId}`.
async fn start_handler(State(coordinator): State<Coordinator>, body: Bytes) -> Response {
    // Unparseable bodies count as a missing identifier.
    let req: StartRequest = serde_json::from_slice(&body).unwrap_or_default();
    let resource_id = req.resource_id.unwrap_or_default();

    match coordinator.start(&resource_id).await {
        Ok(accepted) => (
            StatusCode::OK,
            Json(json!({ "message": "Transfer started.", "jobId": accepted.job_id })),
        )
            .into_response(),
        Err(e) => rejection(e),
    }
}

/// POST /cancel — confirmation arrives on the telemetry channel.
async fn cancel_handler(State(coordinator): State<Coordinator>) -> Response {
    match coordinator.cancel() {
        Ok(CancelAccepted::Requested) => {
            (StatusCode::OK, Json(json!({ "message": "Cancellation requested." }))).into_response()
        }
        Ok(CancelAccepted::AlreadyRequested) => {
            (StatusCode::OK, Json(json!({ "message": "Cancellation already requested." }))).into_response()
        }
        Err(e) => rejection(e),
    }
}

async fn status_handler(State(coordinator): State<Coordinator>) -> Response {
    let body = match coordinator.status() {
        Some(job) => json!({ "active": true, "job": job }),
        None => json!({ "active": false }),
    };
    Json(body).into_response()
}
