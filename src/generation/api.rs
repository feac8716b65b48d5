use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::errors::GenerationError;

use super::db::DbHandle;
use super::events::{EventPublisher, session_ws_handler};
use super::models::Depth;
use super::orchestrator::Orchestrator;
use super::queue::{Job, JobQueue};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub orchestrator: Arc<Orchestrator>,
    pub queue: Arc<dyn JobQueue>,
    pub events: EventPublisher,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct GenerateCourseRequest {
    pub history: String,
    pub depth: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
pub struct GenerateLessonRequest {
    pub session_id: String,
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    /// Only events appended after this log sequence number.
    pub after: Option<i64>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::NotFound { .. } | GenerationError::TaskNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/events", get(get_session_events))
        .route("/api/sessions/{id}/generate", post(generate_course))
        .route("/api/lessons/{id}/generate", post(generate_lesson))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/children", get(get_task_children))
        .route("/api/courses", get(list_courses))
        .route("/api/courses/{id}", get(get_course).delete(delete_course))
        .route("/ws/sessions/{id}", get(session_ws_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let progress = state.orchestrator.sessions().snapshot(&session_id).await?;
    Ok(Json(progress))
}

async fn get_session_events(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let events = state
        .db
        .call(move |db| db.list_events(&session_id, query.after))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(events))
}

/// Queue a course run. A session that is already generating is left alone;
/// the worker re-checks the guard atomically before creating anything.
async fn generate_course(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    Json(req): Json<GenerateCourseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.history.trim().is_empty() {
        return Err(ApiError::BadRequest("history must not be empty".into()));
    }
    let depth = match req.depth.as_deref() {
        Some(raw) => Depth::from_str(raw).map_err(ApiError::BadRequest)?,
        None => Depth::Full,
    };

    let progress = state.orchestrator.sessions().snapshot(&session_id).await?;
    if progress.in_progress {
        return Ok((
            StatusCode::OK,
            Json(serde_json::json!({"status": "already_running", "session_id": session_id})),
        ));
    }

    let job = Job::GenerateCourse {
        history: req.history,
        depth,
        session_id: session_id.clone(),
        user_id: req.user_id,
    };
    let name = job.name();
    state
        .queue
        .enqueue(job)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to enqueue job: {}", e)))?;
    tracing::info!(session_id = %session_id, depth = depth.as_str(), "course generation queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "queued",
            "job": name,
            "session_id": session_id,
            "depth": depth,
        })),
    ))
}

async fn generate_lesson(
    State(state): State<SharedState>,
    Path(lesson_id): Path<i64>,
    Json(req): Json<GenerateLessonRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let lesson = state
        .db
        .call(move |db| db.get_lesson(lesson_id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if lesson.is_none() {
        return Err(ApiError::NotFound(format!("Lesson {} not found", lesson_id)));
    }

    let job = Job::GenerateLesson {
        lesson_id,
        session_id: req.session_id.clone(),
        user_id: req.user_id,
    };
    let name = job.name();
    state
        .queue
        .enqueue(job)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to enqueue job: {}", e)))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "queued",
            "job": name,
            "session_id": req.session_id,
            "lesson_id": lesson_id,
        })),
    ))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.orchestrator.ledger().get(&id).await? {
        Some(task) => Ok(Json(task)),
        None => Err(ApiError::NotFound(format!("Task {} not found", id))),
    }
}

async fn get_task_children(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.orchestrator.ledger().get(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Task {} not found", id)));
    }
    let children = state.orchestrator.ledger().children(&id).await?;
    Ok(Json(children))
}

async fn list_courses(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let courses = state
        .db
        .call(|db| db.list_courses())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(courses))
}

/// Full ordered tree. Partially generated courses are returned as they are.
async fn get_course(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let tree = state
        .db
        .call(move |db| db.load_course_tree(id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match tree {
        Some(tree) => Ok(Json(tree)),
        None => Err(ApiError::NotFound(format!("Course {} not found", id))),
    }
}

async fn delete_course(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .db
        .call(move |db| db.delete_course(id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Course {} not found", id)));
    }
    tracing::info!(course_id = id, "course deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::LimitsSection;
    use crate::generation::db::GenerationDb;
    use crate::generation::ledger::LookupRetry;
    use crate::generation::models::{CourseSkeleton, OutlineSpec, ProgressEvent};
    use crate::generation::queue::InMemoryQueue;
    use crate::generation::testing::ScriptedProvider;

    struct TestApp {
        state: SharedState,
        queue: Arc<InMemoryQueue>,
    }

    impl TestApp {
        fn new() -> Self {
            let db = DbHandle::new(GenerationDb::new_in_memory().unwrap());
            let queue = Arc::new(InMemoryQueue::new());
            let events = EventPublisher::new(db.clone());
            let orchestrator = Arc::new(Orchestrator::new(
                db.clone(),
                Arc::new(ScriptedProvider::default()),
                queue.clone(),
                events.clone(),
                LookupRetry {
                    attempts: 1,
                    delay: Duration::from_millis(1),
                },
                LimitsSection::default(),
            ));
            let state = Arc::new(AppState {
                db,
                orchestrator,
                queue: queue.clone(),
                events,
            });
            Self { state, queue }
        }

        fn router(&self) -> Router {
            api_router().with_state(self.state.clone())
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = TestApp::new();
        let response = app.router().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_unknown_session_reads_idle() {
        let app = TestApp::new();
        let response = app.router().oneshot(get("/api/sessions/s-1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["in_progress"], false);
        assert!(json["generated_courses"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generate_course_enqueues_job() {
        let app = TestApp::new();
        let request = post_json(
            "/api/sessions/s-1/generate",
            serde_json::json!({"history": "I want to learn SQL", "depth": "course_base"}),
        );
        let response = app.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["job"], "generate_course");
        assert_eq!(json["depth"], "course_base");

        match app.queue.try_next() {
            Some(Job::GenerateCourse {
                depth, session_id, ..
            }) => {
                assert_eq!(depth, Depth::CourseBase);
                assert_eq!(session_id, "s-1");
            }
            other => panic!("Expected GenerateCourse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_course_rejects_unknown_depth() {
        let app = TestApp::new();
        let request = post_json(
            "/api/sessions/s-1/generate",
            serde_json::json!({"history": "SQL", "depth": "everything"}),
        );
        let response = app.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(app.queue.try_next().is_none());
    }

    #[tokio::test]
    async fn test_generate_course_while_running_is_noop() {
        let app = TestApp::new();
        app.state.db.lock_sync().unwrap().begin_run("s-1").unwrap();

        let request = post_json(
            "/api/sessions/s-1/generate",
            serde_json::json!({"history": "SQL"}),
        );
        let response = app.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["status"], "already_running");
        assert!(app.queue.try_next().is_none());
    }

    #[tokio::test]
    async fn test_generate_lesson_requires_existing_lesson() {
        let app = TestApp::new();
        let request = post_json(
            "/api/lessons/77/generate",
            serde_json::json!({"session_id": "s-1"}),
        );
        let response = app.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(app.queue.try_next().is_none());
    }

    #[tokio::test]
    async fn test_session_events_catch_up() {
        let app = TestApp::new();
        app.state
            .events
            .publish("s-1", ProgressEvent::system("started"))
            .await;
        app.state
            .events
            .publish("s-1", ProgressEvent::done("finished"))
            .await;

        let response = app
            .router()
            .oneshot(get("/api/sessions/s-1/events"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let events: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["type"], "course_generation_done");
    }

    #[tokio::test]
    async fn test_task_not_found() {
        let app = TestApp::new();
        let response = app.router().oneshot(get("/api/tasks/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .router()
            .oneshot(get("/api/tasks/nope/children"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_and_delete_course() {
        let app = TestApp::new();
        let course_id = {
            let db = app.state.db.lock_sync().unwrap();
            let course = db
                .create_course(
                    None,
                    None,
                    &CourseSkeleton {
                        title: "SQL".to_string(),
                        description: "Basics".to_string(),
                        goal: String::new(),
                        estimated_time_hours: 2.0,
                    },
                )
                .unwrap();
            db.create_modules(
                course.id,
                &[OutlineSpec {
                    title: "Intro".to_string(),
                    description: String::new(),
                    goal: String::new(),
                    estimated_time_hours: 1.0,
                }],
            )
            .unwrap();
            course.id
        };

        let uri = format!("/api/courses/{}", course_id);
        let response = app.router().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let tree: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(tree["course"]["title"], "SQL");
        assert_eq!(tree["modules"][0]["module"]["title"], "Intro");

        let delete = Request::builder()
            .method("DELETE")
            .uri(&uri)
            .body(Body::empty())
            .unwrap();
        let response = app.router().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.router().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
