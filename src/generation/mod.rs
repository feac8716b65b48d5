//! Course generation — queued, depth-limited stage chains.
//!
//! ## Overview
//!
//! A learner's preference dialog is turned into a course tree
//! (course → modules → lessons → content blocks) by a chain of stages. Each
//! stage is a separate job: it produces one artifact through the content
//! provider, persists it, and hands the next stage to the queue until the
//! requested depth is reached or the tree is exhausted.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (Router, Services, worker startup)   │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ Job::GenerateCourse → JobQueue         │
//!                       │         v                                        │
//!                       │  queue.rs  (Job, InMemoryQueue, WorkerPool)      │
//!                       │         │                                        │
//!                       │         │ JobHandler::handle()                   │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (stage handlers, run lifecycle)│
//!                       │    ├─ ledger.rs     (Task records, retry lookup) │
//!                       │    ├─ session.rs    (exclusive-run guard)        │
//!                       │    ├─ traversal.rs  (next module/lesson/block)   │
//!                       │    ├─ provider.rs   (ContentProvider trait)      │
//!                       │    └─ events.rs     (progress broadcast + log)   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                              |
//! |----------|-------------------------------------------------------------|
//! | `models` | Shared types: `Task`, `Depth`, course tree, `ProgressEvent` |
//! | `db`     | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//!
//! ## Typical Run (depth = `full`)
//!
//! 1. `POST /api/sessions/{id}/generate` queues `generate_course`.
//! 2. A worker claims the session flag and creates the top-level
//!    UserSummary Task, then queues its stage.
//! 3. UserSummary → CourseBase → CoursePlan → ModulePlan for every module →
//!    LessonContentPlan for every lesson → ContentGeneration for every block.
//! 4. The last stage finalises the top-level Task, releases the session flag
//!    and publishes `course_generation_done`.

pub mod api;
pub mod db;
pub mod events;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod server;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;
pub mod traversal;
