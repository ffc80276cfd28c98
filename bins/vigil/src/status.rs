use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::module::{shutdown_requested, Module, ModuleCtx};
use crate::scheduler::ActivityDirectory;

#[derive(Clone)]
struct AppState {
    activities: ActivityDirectory,
    started: Instant,
}

#[derive(Serialize)]
struct Status {
    activities: usize,
    uptime_ms: u64,
}

/// Read-only HTTP view of the agent.
pub struct StatusServer {
    addr: SocketAddr,
    activities: ActivityDirectory,
}

impl StatusServer {
    /// Serve on `addr`, answering lookups from `activities`.
    pub fn new(addr: SocketAddr, activities: ActivityDirectory) -> Self {
        Self { addr, activities }
    }
}

/// Routes of the status surface.
pub fn router(activities: ActivityDirectory) -> Router {
    let state = AppState { activities, started: Instant::now() };
    Router::new()
        .route("/status", get(status))
        .route("/activities/:id", get(activity))
        .with_state(state)
}

impl Module for StatusServer {
    fn name(&self) -> &'static str { "status" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let app = router(self.activities.clone());
            let listener = tokio::net::TcpListener::bind(self.addr).await?;
            info!("status server listening on http://{}", self.addr);

            let mut shutdown = ctx.shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
                .await?;
            Ok(())
        })
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(Status {
        activities: state.activities.len(),
        uptime_ms: state.started.elapsed().as_millis() as u64,
    })
}

async fn activity(Path(id): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    match state.activities.describe(&id) {
        Some(view) => Json(view).into_response(),
        None => (StatusCode::NOT_FOUND, format!("activity {id} is not tracked")).into_response(),
    }
}
