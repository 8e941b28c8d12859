//! Subscriber-facing snapshot endpoint
//!
//! A thin HTTP surface over the published snapshot: subscribers fetch the
//! current generation and resources, and poll or long-poll as they see
//! fit. Streaming delta transport to proxy instances is a separate
//! concern and lives outside this process.
//!
//! Reads are lockless: each request loads the current `Arc` from the
//! snapshot cache and serializes it, so a publish never blocks a reader
//! and a reader never observes a partially updated snapshot.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use crate::snapshot::{ConfigSnapshot, SnapshotCache};
use crate::{Error, Result};

/// Build the subscriber router
pub fn router(snapshots: Arc<SnapshotCache>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/snapshot", get(current_snapshot))
        .route("/snapshot/generation", get(current_generation))
        .with_state(snapshots)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn current_snapshot(State(snapshots): State<Arc<SnapshotCache>>) -> Json<ConfigSnapshot> {
    Json(snapshots.current().as_ref().clone())
}

async fn current_generation(State(snapshots): State<Arc<SnapshotCache>>) -> Json<u64> {
    Json(snapshots.current().generation)
}

/// Serve the subscriber endpoint until the process shuts down
pub async fn serve(addr: SocketAddr, snapshots: Arc<SnapshotCache>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::serve(format!("bind {addr}: {e}")))?;
    info!(%addr, "serving configuration snapshots");
    axum::serve(listener, router(snapshots))
        .await
        .map_err(|e| Error::serve(e.to_string()))
}
