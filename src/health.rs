//! gRPC health endpoint.

use eyre::Result;
use std::net::SocketAddr;
use tokio::sync::watch;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::warn;

/// Handle flipping the advertised `grpc.health.v1` status. The merger sets
/// `SERVING` once bootstrap is done and the polling loop is running.
pub struct Readiness {
    reporter: HealthReporter,
}

impl Readiness {
    pub async fn set_serving(&mut self) {
        self.reporter
            .set_service_status("", ServingStatus::Serving)
            .await;
    }
}

/// Start the health server and return the readiness handle. The endpoint
/// reports `NOT_SERVING` until the merger flips it.
pub async fn start(bind: SocketAddr, mut shutdown_rx: watch::Receiver<bool>) -> Result<Readiness> {
    let (mut reporter, service) = tonic_health::server::health_reporter();
    reporter
        .set_service_status("", ServingStatus::NotServing)
        .await;

    tokio::spawn(async move {
        let shutdown = async move {
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        };
        if let Err(err) = tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_shutdown(bind, shutdown)
            .await
        {
            warn!(error = %err, "grpc health server terminated");
        }
    });

    Ok(Readiness { reporter })
}
