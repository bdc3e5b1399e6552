use crate::error::{Result, WorkerError};
use crate::idle::IdleTimer;
use crate::service::StageService;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(300);
const DEFAULT_IDLE_POLL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct AppState {
    service: Arc<dyn StageService>,
    idle: Arc<IdleTimer>,
}

/// HTTP runtime shared by every stage worker.
///
/// Mounts a health endpoint at `/` and the service's task endpoint at
/// `POST /{task_route}`, records activity on every request, and shuts the
/// process down gracefully once the idle window elapses.
pub struct WorkerHarness {
    service: Arc<dyn StageService>,
    idle: Arc<IdleTimer>,
    poll: Duration,
}

impl WorkerHarness {
    pub fn new(service: Arc<dyn StageService>) -> Self {
        Self::with_idle_window(service, DEFAULT_IDLE_WINDOW, DEFAULT_IDLE_POLL)
    }

    pub fn with_idle_window(
        service: Arc<dyn StageService>,
        window: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            service,
            idle: Arc::new(IdleTimer::new(window)),
            poll,
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            service: self.service.clone(),
            idle: self.idle.clone(),
        };
        Router::new()
            .route("/", get(health))
            .route(&format!("/{}", self.service.task_route()), post(task))
            .with_state(state)
    }

    /// Bind the worker to an address. Port 0 picks an ephemeral port; the
    /// bound address is readable before serving starts.
    pub async fn bind(&self, addr: SocketAddr) -> Result<BoundWorker> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Worker '{}' listening on {} (task route /{})",
            self.service.service_name(),
            local_addr,
            self.service.task_route()
        );
        Ok(BoundWorker {
            listener,
            router: self.router(),
            idle: self.idle.clone(),
            poll: self.poll,
            local_addr,
        })
    }
}

/// A bound, not-yet-serving worker.
pub struct BoundWorker {
    listener: TcpListener,
    router: Router,
    idle: Arc<IdleTimer>,
    poll: Duration,
    local_addr: SocketAddr,
}

impl BoundWorker {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the idle window expires, then shut down gracefully.
    pub async fn serve(self) -> Result<()> {
        let idle = self.idle;
        let poll = self.poll;
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                idle.expired_after_polling(poll).await;
            })
            .await?;
        info!("Worker shut down after idle window expiry");
        Ok(())
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    state.idle.record_activity();
    Json(json!({
        "status": "healthy",
        "service": state.service.service_name(),
    }))
}

async fn task(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.idle.record_activity();
    match state.service.handle(request).await {
        Ok(result) => (
            StatusCode::OK,
            Json(json!({"status": "success", "result": result})),
        ),
        Err(e) => {
            error!("Task on '{}' failed: {}", state.service.service_name(), e);
            let status = StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({"detail": e.to_string()})))
        }
    }
}
