use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::config::CourseGenConfig;

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, GenerationDb};
use super::events::EventPublisher;
use super::ledger::LookupRetry;
use super::orchestrator::Orchestrator;
use super::provider::{ContentProvider, HttpProvider};
use super::queue::{InMemoryQueue, WorkerPool};

/// Configuration for the generation server.
pub struct ServerConfig {
    pub config: CourseGenConfig,
    /// Bind on all interfaces with permissive CORS.
    pub dev_mode: bool,
}

/// Everything a run needs, wired together: shared state for the HTTP layer
/// and the queue the worker pool drains.
pub struct Services {
    pub state: SharedState,
    pub queue: Arc<InMemoryQueue>,
}

impl Services {
    pub fn new(db: DbHandle, provider: Arc<dyn ContentProvider>, config: &CourseGenConfig) -> Self {
        let queue = Arc::new(InMemoryQueue::new());
        let events = EventPublisher::new(db.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            provider,
            queue.clone(),
            events.clone(),
            LookupRetry::from(&config.ledger),
            config.limits,
        ));
        let state = Arc::new(AppState {
            db,
            orchestrator,
            queue: queue.clone(),
            events,
        });
        Self { state, queue }
    }

    pub fn spawn_workers(&self, config: &CourseGenConfig) -> WorkerPool {
        WorkerPool::spawn(
            self.queue.clone(),
            self.state.orchestrator.clone(),
            config.worker.concurrency,
            Duration::from_secs(config.worker.job_timeout_secs),
        )
    }
}

/// Build the full application router: REST API plus the session WebSocket.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the generation server and its worker pool.
pub async fn start_server(server: ServerConfig) -> Result<()> {
    let config = server.config;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let db = GenerationDb::new(&config.database.path)
        .context("Failed to initialize generation database")?;
    let provider = HttpProvider::new(&config.provider).context("Failed to build content provider")?;
    let services = Services::new(DbHandle::new(db), Arc::new(provider), &config);
    let workers = services.spawn_workers(&config);
    tracing::info!(workers = workers.size(), "worker pool started");

    let mut app = build_router(services.state.clone());
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server.dev_mode {
        "0.0.0.0"
    } else {
        config.server.host.as_str()
    };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "coursegen server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    workers.shutdown();
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::generation::models::{SessionStatus, TaskStatus};
    use crate::generation::testing::ScriptedProvider;

    fn test_services() -> Services {
        let db = DbHandle::new(GenerationDb::new_in_memory().unwrap());
        let mut config = CourseGenConfig::default();
        config.ledger.lookup_delay_ms = 1;
        Services::new(db, Arc::new(ScriptedProvider::default()), &config)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = build_router(test_services().state);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = build_router(test_services().state);
        let req = Request::builder()
            .uri("/api/courses")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"[]");
    }

    #[tokio::test]
    async fn test_triggered_run_completes_on_worker_pool() {
        let services = test_services();
        let mut config = CourseGenConfig::default();
        config.worker.concurrency = 2;
        let workers = services.spawn_workers(&config);

        let req = Request::builder()
            .method("POST")
            .uri("/api/sessions/s-1/generate")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"history": "SQL basics", "depth": "course_plan"}).to_string(),
            ))
            .unwrap();
        let resp = build_router(services.state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let sessions = services.state.orchestrator.sessions();
        let mut progress = sessions.snapshot("s-1").await.unwrap();
        for _ in 0..200 {
            if progress.status == SessionStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            progress = sessions.snapshot("s-1").await.unwrap();
        }
        assert_eq!(progress.status, SessionStatus::Done);
        assert!(!progress.in_progress);

        let tasks = services
            .state
            .db
            .lock_sync()
            .unwrap()
            .list_session_tasks("s-1")
            .unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Success));
        workers.shutdown();
    }
}
