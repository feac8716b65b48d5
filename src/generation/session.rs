//! Session progress store and the per-session exclusive-run guard.

use crate::errors::{GenerationError, Result};

use super::db::DbHandle;
use super::models::{Course, CourseSummary, RunOutcome, SessionProgress, SessionStatus};

#[derive(Clone)]
pub struct SessionStore {
    db: DbHandle,
}

impl SessionStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Claim the session for a new run. Returns false, and changes nothing,
    /// while a previous run still holds the flag.
    pub async fn begin_run(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.db
            .call(move |db| db.begin_run(&session_id))
            .await
            .map_err(GenerationError::Persistence)
    }

    /// Release the flag and record how the run ended.
    pub async fn end_run(&self, session_id: &str, outcome: RunOutcome) -> Result<()> {
        let session_id = session_id.to_string();
        self.db
            .call(move |db| db.end_run(&session_id, outcome.session_status()))
            .await
            .map_err(GenerationError::Persistence)
    }

    /// Record a freshly created course and move the session to `course_ready`.
    /// The run flag stays set.
    pub async fn mark_course_ready(&self, session_id: &str, course: &Course) -> Result<()> {
        let session_id = session_id.to_string();
        let summary = CourseSummary {
            course_id: course.id,
            title: course.title.clone(),
            description: course.description.clone(),
            estimated_time_hours: course.estimated_time_hours,
        };
        self.db
            .call(move |db| {
                db.add_generated_course(&session_id, &summary)?;
                db.set_session_status(&session_id, SessionStatus::CourseReady)
            })
            .await
            .map_err(GenerationError::Persistence)
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<SessionProgress> {
        let session_id = session_id.to_string();
        self.db
            .call(move |db| db.get_session_progress(&session_id))
            .await
            .map_err(GenerationError::Persistence)
    }
}
