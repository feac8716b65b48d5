//! Stage handlers and run lifecycle.
//!
//! A run is a chain of stage jobs. Each handler claims its Task, produces and
//! persists one artifact, decides the next stage from the requested depth and
//! the course tree, then either hands the next stage to the queue or
//! finalises the run. The next step is always data on the queue, never a
//! call on the stack.

use std::sync::Arc;

use tracing::Instrument;

use crate::config::LimitsSection;
use crate::errors::{GenerationError, ProviderError, Result};

use super::db::{DbHandle, GenerationDb};
use super::events::EventPublisher;
use super::ledger::{LookupRetry, TaskLedger};
use super::models::{
    ContentBlock, CourseTree, Depth, GenerationContext, NewTask, ProgressEvent, RunOutcome,
    StageArtifact, TaskKind, TaskStatus,
};
use super::provider::{
    ContentProvider, validate_blocks, validate_content, validate_outlines, validate_skeleton,
    validate_summary,
};
use super::queue::{Job, JobHandler, JobQueue, StageArgs, StageJob};
use super::session::SessionStore;
use super::traversal::{
    TraversalScope, first_block, first_block_in_lesson, first_lesson, first_module, locate_block,
    locate_lesson, next_block, next_lesson, next_module,
};

/// Result of one stage: the persisted artifact and the stage to run next,
/// if the run continues.
struct StageStep {
    artifact: StageArtifact,
    next: Option<StageArgs>,
}

impl StageStep {
    fn new(artifact: StageArtifact, next: Option<StageArgs>) -> Self {
        Self { artifact, next }
    }
}

fn provider_failure(stage: TaskKind) -> impl FnOnce(ProviderError) -> GenerationError {
    move |err| GenerationError::from_provider(stage, err)
}

pub struct Orchestrator {
    db: DbHandle,
    ledger: TaskLedger,
    sessions: SessionStore,
    events: EventPublisher,
    provider: Arc<dyn ContentProvider>,
    queue: Arc<dyn JobQueue>,
    limits: LimitsSection,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        provider: Arc<dyn ContentProvider>,
        queue: Arc<dyn JobQueue>,
        events: EventPublisher,
        retry: LookupRetry,
        limits: LimitsSection,
    ) -> Self {
        Self {
            ledger: TaskLedger::new(db.clone(), retry),
            sessions: SessionStore::new(db.clone()),
            db,
            events,
            provider,
            queue,
            limits,
        }
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    // ── Run entry points ─────────────────────────────────────────────

    /// Start a course run. Returns the top-level Task id, or `None` when the
    /// session already has a run in flight (nothing is created then).
    pub async fn start_run(
        &self,
        history: &str,
        depth: Depth,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<Option<String>> {
        if !self.sessions.begin_run(session_id).await? {
            tracing::info!(session_id, "run already in progress, ignoring start");
            return Ok(None);
        }
        let args = StageArgs::UserSummary {
            history: history.to_string(),
        };
        self.launch(args, depth, session_id, user_id).await.map(Some)
    }

    /// Content-plan one existing lesson and realise its blocks. The summary
    /// comes from the profile the lesson's course was generated from.
    pub async fn start_lesson_run(
        &self,
        lesson_id: i64,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<Option<String>> {
        let profile_id = self
            .persist(move |db| {
                if db.get_lesson(lesson_id)?.is_none() {
                    return Ok(None);
                }
                let course = match db.course_id_for_lesson(lesson_id)? {
                    Some(course_id) => db.get_course(course_id)?,
                    None => None,
                };
                Ok(Some(course.and_then(|c| c.profile_id)))
            })
            .await?
            .ok_or_else(|| GenerationError::not_found("Lesson", lesson_id))?;

        if !self.sessions.begin_run(session_id).await? {
            tracing::info!(session_id, lesson_id, "run already in progress, ignoring start");
            return Ok(None);
        }
        let args = StageArgs::LessonContentPlan {
            lesson_id,
            profile_id,
        };
        self.launch(args, Depth::LessonContent, session_id, user_id)
            .await
            .map(Some)
    }

    /// Create the top-level Task and enqueue its stage. The session flag is
    /// already held; any failure here releases it.
    async fn launch(
        &self,
        args: StageArgs,
        depth: Depth,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<String> {
        let main_kind = args.kind();
        let task = match self
            .ledger
            .create(NewTask::new(main_kind, args.to_params()).with_owner(session_id, user_id))
            .await
        {
            Ok(task) => task,
            Err(err) => {
                tracing::error!(session_id, error = %err, "failed to create top-level task");
                if let Err(e) = self.sessions.end_run(session_id, RunOutcome::Error).await {
                    tracing::warn!(session_id, error = %e, "failed to release session flag");
                }
                self.events
                    .publish(session_id, ProgressEvent::error(err.user_message()))
                    .await;
                return Err(err);
            }
        };

        let ctx = GenerationContext {
            main_task_id: task.id.clone(),
            main_kind,
            depth,
            session_id: session_id.to_string(),
            user_id: user_id.map(str::to_string),
        };
        tracing::info!(
            session_id,
            run = %task.id,
            depth = depth.as_str(),
            stage = main_kind.as_str(),
            "starting generation run"
        );
        self.events
            .publish(session_id, ProgressEvent::system("Course generation started"))
            .await;

        let job = Job::Stage(StageJob {
            task_id: task.id.clone(),
            ctx: ctx.clone(),
            args,
        });
        if let Err(e) = self.queue.enqueue(job).await {
            let err = GenerationError::Enqueue(e);
            self.fail_run(&ctx, Some(&task.id), &err).await;
            return Err(err);
        }
        Ok(task.id)
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    pub async fn dispatch(&self, job: Job) -> Result<()> {
        match job {
            Job::GenerateCourse {
                history,
                depth,
                session_id,
                user_id,
            } => self
                .start_run(&history, depth, &session_id, user_id.as_deref())
                .await
                .map(|_| ()),
            Job::GenerateLesson {
                lesson_id,
                session_id,
                user_id,
            } => self
                .start_lesson_run(lesson_id, &session_id, user_id.as_deref())
                .await
                .map(|_| ()),
            Job::Stage(stage) => {
                let span = tracing::info_span!(
                    "stage",
                    stage = stage.args.kind().as_str(),
                    task_id = %stage.task_id,
                    session_id = %stage.ctx.session_id,
                    run = %stage.ctx.main_task_id,
                );
                self.run_stage(stage).instrument(span).await
            }
        }
    }

    async fn run_stage(&self, job: StageJob) -> Result<()> {
        let StageJob { task_id, ctx, args } = job;

        let task = match self.ledger.find_with_retry(&task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                let err = GenerationError::TaskNotFound { id: task_id };
                self.fail_run(&ctx, None, &err).await;
                return Err(err);
            }
            Err(err) => {
                self.fail_run(&ctx, None, &err).await;
                return Err(err);
            }
        };
        // Only a pending Task is runnable. Anything else was claimed by an
        // earlier delivery of this job.
        if task.status != TaskStatus::Pending {
            tracing::info!(status = %task.status, "task already claimed, skipping redelivered job");
            return Ok(());
        }
        match self.ledger.transition_to_in_progress(&task_id).await {
            Ok(_) => {}
            Err(GenerationError::InvalidTransition { from, .. }) => {
                tracing::info!(status = %from, "task claimed concurrently, skipping redelivered job");
                return Ok(());
            }
            Err(err) => {
                self.fail_run(&ctx, Some(&task_id), &err).await;
                return Err(err);
            }
        }

        let outcome = async {
            let step = self.execute(&ctx, args).await?;
            self.complete(&task_id, &ctx, step).await
        }
        .await;

        if let Err(err) = outcome {
            self.fail_run(&ctx, Some(&task_id), &err).await;
            return Err(err);
        }
        Ok(())
    }

    async fn execute(&self, ctx: &GenerationContext, args: StageArgs) -> Result<StageStep> {
        match args {
            StageArgs::UserSummary { history } => self.user_summary(ctx, history).await,
            StageArgs::CourseBase { profile_id } => self.course_base(ctx, profile_id).await,
            StageArgs::CoursePlan {
                course_id,
                profile_id,
            } => self.course_plan(ctx, course_id, profile_id).await,
            StageArgs::ModulePlan {
                module_id,
                profile_id,
            } => self.module_plan(ctx, module_id, profile_id).await,
            StageArgs::LessonContentPlan {
                lesson_id,
                profile_id,
            } => self.lesson_content_plan(ctx, lesson_id, profile_id).await,
            StageArgs::ContentGeneration {
                block_id,
                lesson_id,
                profile_id,
            } => {
                self.content_generation(ctx, block_id, lesson_id, profile_id)
                    .await
            }
        }
    }

    // ── Stage handlers ───────────────────────────────────────────────

    async fn user_summary(&self, ctx: &GenerationContext, history: String) -> Result<StageStep> {
        let summary = self
            .provider
            .profile_summary(&history)
            .await
            .and_then(validate_summary)
            .map_err(provider_failure(TaskKind::UserSummary))?;

        let session_id = ctx.session_id.clone();
        let user_id = ctx.user_id.clone();
        let stored = summary.clone();
        let profile = self
            .persist(move |db| db.create_profile(Some(&session_id), user_id.as_deref(), &stored))
            .await?;
        self.events
            .publish(&ctx.session_id, ProgressEvent::bot_info("Learner profile ready"))
            .await;

        let next = (ctx.depth != Depth::UserSummary).then_some(StageArgs::CourseBase {
            profile_id: profile.id,
        });
        Ok(StageStep::new(
            StageArtifact::ProfileSummary {
                profile_id: profile.id,
                summary,
            },
            next,
        ))
    }

    async fn course_base(&self, ctx: &GenerationContext, profile_id: i64) -> Result<StageStep> {
        let summary = self.load_summary(Some(profile_id)).await?;
        let skeleton = self
            .provider
            .course_skeleton(&summary)
            .await
            .and_then(validate_skeleton)
            .map_err(provider_failure(TaskKind::CourseBase))?;

        let owner = ctx.user_id.clone();
        let course = self
            .persist(move |db| db.create_course(Some(profile_id), owner.as_deref(), &skeleton))
            .await?;
        self.sessions
            .mark_course_ready(&ctx.session_id, &course)
            .await?;
        self.events
            .publish(
                &ctx.session_id,
                ProgressEvent::system(format!("Course \"{}\" is ready", course.title)),
            )
            .await;

        let next = (ctx.depth != Depth::CourseBase).then_some(StageArgs::CoursePlan {
            course_id: course.id,
            profile_id,
        });
        Ok(StageStep::new(StageArtifact::Course { course }, next))
    }

    async fn course_plan(
        &self,
        ctx: &GenerationContext,
        course_id: i64,
        profile_id: i64,
    ) -> Result<StageStep> {
        let summary = self.load_summary(Some(profile_id)).await?;
        let course = self
            .persist(move |db| db.get_course(course_id))
            .await?
            .ok_or_else(|| GenerationError::not_found("Course", course_id))?;

        let limit = self.limits.max_modules;
        let specs = self
            .provider
            .module_plan(&summary, &course, limit)
            .await
            .and_then(|specs| validate_outlines(specs, limit, "module"))
            .map_err(provider_failure(TaskKind::CoursePlan))?;
        let modules = self
            .persist(move |db| db.create_modules(course_id, &specs))
            .await?;
        self.events
            .publish(
                &ctx.session_id,
                ProgressEvent::bot_info(format!("Planned {} modules", modules.len())),
            )
            .await;

        let next = if ctx.depth == Depth::CoursePlan {
            None
        } else {
            let tree = self.load_tree(course_id).await?;
            first_module(&tree).map(|module| StageArgs::ModulePlan {
                module_id: module.id,
                profile_id,
            })
        };
        Ok(StageStep::new(StageArtifact::Modules { course_id, modules }, next))
    }

    /// Lessons for one module. Every module is planned before any lesson is
    /// content-planned.
    async fn module_plan(
        &self,
        ctx: &GenerationContext,
        module_id: i64,
        profile_id: i64,
    ) -> Result<StageStep> {
        let summary = self.load_summary(Some(profile_id)).await?;
        let (module, course) = self
            .persist(move |db| {
                let Some(module) = db.get_module(module_id)? else {
                    return Ok(None);
                };
                Ok(db.get_course(module.course_id)?.map(|course| (module, course)))
            })
            .await?
            .ok_or_else(|| GenerationError::not_found("Module", module_id))?;

        let limit = self.limits.max_lessons;
        let specs = self
            .provider
            .lesson_plan(&summary, &course, &module, limit)
            .await
            .and_then(|specs| validate_outlines(specs, limit, "lesson"))
            .map_err(provider_failure(TaskKind::ModulePlan))?;
        let lessons = self
            .persist(move |db| db.create_lessons(module_id, &specs))
            .await?;
        self.events
            .publish(
                &ctx.session_id,
                ProgressEvent::bot_info(format!(
                    "Planned {} lessons for \"{}\"",
                    lessons.len(),
                    module.title
                )),
            )
            .await;

        let tree = self.load_tree(course.id).await?;
        let next = if let Some(next) = next_module(&tree, module_id) {
            Some(StageArgs::ModulePlan {
                module_id: next.id,
                profile_id,
            })
        } else if ctx.depth == Depth::ModulePlan {
            None
        } else {
            first_lesson(&tree).map(|lesson| StageArgs::LessonContentPlan {
                lesson_id: lesson.id,
                profile_id: Some(profile_id),
            })
        };
        Ok(StageStep::new(StageArtifact::Lessons { module_id, lessons }, next))
    }

    async fn lesson_content_plan(
        &self,
        ctx: &GenerationContext,
        lesson_id: i64,
        profile_id: Option<i64>,
    ) -> Result<StageStep> {
        let summary = self.load_summary(profile_id).await?;
        let course_id = self.course_of_lesson(lesson_id).await?;
        let tree = self.load_tree(course_id).await?;
        let lesson = locate_lesson(&tree, lesson_id)
            .map(|(_, node)| node.lesson.clone())
            .ok_or_else(|| GenerationError::not_found("Lesson", lesson_id))?;

        let limit = self.limits.max_blocks;
        let specs = self
            .provider
            .block_plan(&summary, &tree, &lesson, limit)
            .await
            .and_then(|specs| validate_blocks(specs, limit))
            .map_err(provider_failure(TaskKind::LessonContentPlan))?;
        let blocks = self
            .persist(move |db| db.create_blocks(lesson_id, &specs))
            .await?;
        self.events
            .publish(
                &ctx.session_id,
                ProgressEvent::bot_info(format!("Planned content for \"{}\"", lesson.title)),
            )
            .await;

        let tree = self.load_tree(course_id).await?;
        let content_stage = |block: &ContentBlock| StageArgs::ContentGeneration {
            block_id: block.id,
            lesson_id: block.lesson_id,
            profile_id,
        };
        let next = if ctx.depth.is_lesson_scoped() {
            first_block_in_lesson(&tree, lesson_id).map(content_stage)
        } else if let Some(next) = next_lesson(&tree, lesson_id) {
            Some(StageArgs::LessonContentPlan {
                lesson_id: next.id,
                profile_id,
            })
        } else if ctx.depth == Depth::Full {
            first_block(&tree).map(content_stage)
        } else {
            None
        };
        Ok(StageStep::new(StageArtifact::Blocks { lesson_id, blocks }, next))
    }

    async fn content_generation(
        &self,
        ctx: &GenerationContext,
        block_id: i64,
        lesson_id: i64,
        profile_id: Option<i64>,
    ) -> Result<StageStep> {
        let summary = self.load_summary(profile_id).await?;
        let course_id = self.course_of_lesson(lesson_id).await?;
        let tree = self.load_tree(course_id).await?;
        let (_, lesson, block) = locate_block(&tree, block_id)
            .ok_or_else(|| GenerationError::not_found("ContentBlock", block_id))?;

        let content = self
            .provider
            .block_content(&summary, &tree, &lesson.lesson, block)
            .await
            .and_then(validate_content)
            .map_err(provider_failure(TaskKind::ContentGeneration))?;
        let stored = content.clone();
        self.persist(move |db| db.update_block_content(block_id, &stored))
            .await?
            .ok_or_else(|| GenerationError::not_found("ContentBlock", block_id))?;
        self.events
            .publish(
                &ctx.session_id,
                ProgressEvent::bot_info(format!(
                    "Generated {} block for \"{}\"",
                    block.block_type, lesson.lesson.title
                )),
            )
            .await;

        let scope = if ctx.depth.is_lesson_scoped() {
            TraversalScope::Lesson
        } else {
            TraversalScope::Course
        };
        let next = next_block(&tree, block_id, scope).map(|next| StageArgs::ContentGeneration {
            block_id: next.id,
            lesson_id: next.lesson_id,
            profile_id,
        });
        Ok(StageStep::new(StageArtifact::Content { block_id, content }, next))
    }

    // ── Completion ───────────────────────────────────────────────────

    async fn complete(&self, task_id: &str, ctx: &GenerationContext, step: StageStep) -> Result<()> {
        let result = step.artifact.to_value();
        let Some(args) = step.next else {
            return self.finalize_run(task_id, ctx, result).await;
        };

        // The top-level Task stays open until the whole run finishes.
        if task_id == ctx.main_task_id {
            self.ledger.record_result(task_id, result).await?;
        } else {
            self.ledger.transition_to_success(task_id, Some(result)).await?;
        }
        self.spawn_stage(task_id, ctx, args).await
    }

    /// Create the successor's Task, then hand its job to the queue.
    async fn spawn_stage(
        &self,
        parent_id: &str,
        ctx: &GenerationContext,
        args: StageArgs,
    ) -> Result<()> {
        let task = self
            .ledger
            .create(
                NewTask::new(args.kind(), args.to_params())
                    .with_parent(parent_id)
                    .with_owner(&ctx.session_id, ctx.user_id.as_deref()),
            )
            .await?;
        tracing::debug!(next_task_id = %task.id, next_stage = task.kind.as_str(), "enqueueing next stage");
        let job = Job::Stage(StageJob {
            task_id: task.id,
            ctx: ctx.clone(),
            args,
        });
        self.queue
            .enqueue(job)
            .await
            .map_err(GenerationError::Enqueue)
    }

    async fn finalize_run(
        &self,
        task_id: &str,
        ctx: &GenerationContext,
        result: serde_json::Value,
    ) -> Result<()> {
        self.ledger.transition_to_success(task_id, Some(result)).await?;
        if task_id != ctx.main_task_id {
            self.ledger
                .transition_to_success(&ctx.main_task_id, None)
                .await?;
        }
        self.sessions
            .end_run(&ctx.session_id, RunOutcome::Done)
            .await?;
        tracing::info!(depth = ctx.depth.as_str(), "generation run finished");
        self.events
            .publish(&ctx.session_id, ProgressEvent::done("Course generation finished"))
            .await;
        Ok(())
    }

    /// Failure path shared by every stage: own Task and top-level Task go to
    /// Failed, the session flag is released, one error event is published.
    /// A top-level Task that was already terminal means the run has already
    /// ended, so nothing beyond the own Task is touched.
    async fn fail_run(&self, ctx: &GenerationContext, task_id: Option<&str>, err: &GenerationError) {
        let message = err.to_string();
        tracing::error!(error = %err, "stage failed, aborting run");

        let own = match task_id {
            Some(id) => match self.ledger.fail_if_open(id, &message).await {
                Ok(changed) => Some(changed),
                Err(e) => {
                    tracing::warn!(task_id = id, error = %e, "failed to mark task failed");
                    None
                }
            },
            None => None,
        };
        let main = if task_id == Some(ctx.main_task_id.as_str()) {
            own
        } else {
            match self.ledger.fail_if_open(&ctx.main_task_id, &message).await {
                Ok(changed) => Some(changed),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to mark top-level task failed");
                    None
                }
            }
        };
        if main == Some(false) {
            tracing::debug!("top-level task already terminal, run was already closed");
            return;
        }

        if let Err(e) = self
            .sessions
            .end_run(&ctx.session_id, RunOutcome::Error)
            .await
        {
            tracing::warn!(error = %e, "failed to release session flag");
        }
        self.events
            .publish(&ctx.session_id, ProgressEvent::error(err.user_message()))
            .await;
    }

    // ── Storage helpers ──────────────────────────────────────────────

    async fn persist<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&GenerationDb) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.db.call(f).await.map_err(GenerationError::Persistence)
    }

    /// Profile summary text; a lesson run on a course without a stored
    /// profile generates from an empty summary.
    async fn load_summary(&self, profile_id: Option<i64>) -> Result<String> {
        let Some(profile_id) = profile_id else {
            return Ok(String::new());
        };
        self.persist(move |db| db.get_profile(profile_id))
            .await?
            .map(|profile| profile.summary)
            .ok_or_else(|| GenerationError::not_found("Profile", profile_id))
    }

    async fn course_of_lesson(&self, lesson_id: i64) -> Result<i64> {
        self.persist(move |db| db.course_id_for_lesson(lesson_id))
            .await?
            .ok_or_else(|| GenerationError::not_found("Lesson", lesson_id))
    }

    async fn load_tree(&self, course_id: i64) -> Result<CourseTree> {
        self.persist(move |db| db.load_course_tree(course_id))
            .await?
            .ok_or_else(|| GenerationError::not_found("Course", course_id))
    }
}

#[async_trait::async_trait]
impl JobHandler for Orchestrator {
    async fn handle(&self, job: Job) {
        let name = job.name();
        if let Err(e) = self.dispatch(job).await {
            tracing::error!(job = name, error = %e, "job failed");
        }
    }
}
