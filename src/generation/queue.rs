use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::models::{Depth, GenerationContext, TaskKind};

// ── Jobs ─────────────────────────────────────────────────────────────

/// Arguments of one stage, keyed by stage kind. Only ids and primitives
/// travel through the queue; artifacts are re-read from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageArgs {
    UserSummary {
        history: String,
    },
    CourseBase {
        profile_id: i64,
    },
    CoursePlan {
        course_id: i64,
        profile_id: i64,
    },
    ModulePlan {
        module_id: i64,
        profile_id: i64,
    },
    LessonContentPlan {
        lesson_id: i64,
        profile_id: Option<i64>,
    },
    ContentGeneration {
        block_id: i64,
        lesson_id: i64,
        profile_id: Option<i64>,
    },
}

impl StageArgs {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::UserSummary { .. } => TaskKind::UserSummary,
            Self::CourseBase { .. } => TaskKind::CourseBase,
            Self::CoursePlan { .. } => TaskKind::CoursePlan,
            Self::ModulePlan { .. } => TaskKind::ModulePlan,
            Self::LessonContentPlan { .. } => TaskKind::LessonContentPlan,
            Self::ContentGeneration { .. } => TaskKind::ContentGeneration,
        }
    }

    /// Stored as the Task's `params`.
    pub fn to_params(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "kind": self.kind().as_str() }))
    }
}

/// A queued stage: the Task it executes, the run context, and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageJob {
    pub task_id: String,
    pub ctx: GenerationContext,
    pub args: StageArgs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Entry point for a course run.
    GenerateCourse {
        history: String,
        depth: Depth,
        session_id: String,
        user_id: Option<String>,
    },
    /// Entry point for planning and realising one existing lesson.
    GenerateLesson {
        lesson_id: i64,
        session_id: String,
        user_id: Option<String>,
    },
    Stage(StageJob),
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GenerateCourse { .. } => "generate_course",
            Self::GenerateLesson { .. } => "generate_lesson",
            Self::Stage(stage) => stage.args.kind().job_name(),
        }
    }
}

// ── Queue ────────────────────────────────────────────────────────────

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<()>;
}

/// Consumer side of the worker pool.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job);
}

/// In-process FIFO queue backed by an unbounded tokio channel.
pub struct InMemoryQueue {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<mpsc::UnboundedReceiver<Job>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Wait for the next job.
    pub async fn recv(&self) -> Option<Job> {
        self.rx.lock().await.recv().await
    }

    /// Pop a job if one is ready. Never waits.
    pub fn try_next(&self) -> Option<Job> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let name = job.name();
        self.tx
            .send(job)
            .map_err(|_| anyhow!("job queue closed, dropped {}", name))?;
        tracing::debug!(job = name, "job enqueued");
        Ok(())
    }
}

// ── Workers ──────────────────────────────────────────────────────────

/// N workers pulling from one queue. Each job runs under a hard timeout;
/// a job that exceeds it is dropped and its Task stays in progress.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        queue: Arc<InMemoryQueue>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        job_timeout: Duration,
    ) -> Self {
        let handles = (0..concurrency.max(1))
            .map(|worker| {
                let queue = queue.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    while let Some(job) = queue.recv().await {
                        let name = job.name();
                        tracing::debug!(worker, job = name, "job started");
                        if tokio::time::timeout(job_timeout, handler.handle(job))
                            .await
                            .is_err()
                        {
                            tracing::error!(
                                worker,
                                job = name,
                                timeout_secs = job_timeout.as_secs(),
                                "job exceeded hard timeout; its task and session stay in progress"
                            );
                        }
                    }
                    tracing::debug!(worker, "queue closed, worker exiting");
                })
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}
