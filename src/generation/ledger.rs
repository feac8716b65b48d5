//! Task ledger: the durable record of every unit of generation work.

use std::time::Duration;

use crate::config::LedgerSection;
use crate::errors::{GenerationError, Result};

use super::db::DbHandle;
use super::models::{NewTask, Task, TaskStatus};

/// Bounded retry window for the read-after-write race between a stage's
/// enqueue and the visibility of its Task row.
#[derive(Debug, Clone, Copy)]
pub struct LookupRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for LookupRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(200),
        }
    }
}

impl From<&LedgerSection> for LookupRetry {
    fn from(section: &LedgerSection) -> Self {
        Self {
            attempts: section.lookup_retries.max(1),
            delay: Duration::from_millis(section.lookup_delay_ms),
        }
    }
}

#[derive(Clone)]
pub struct TaskLedger {
    db: DbHandle,
    retry: LookupRetry,
}

impl TaskLedger {
    pub fn new(db: DbHandle, retry: LookupRetry) -> Self {
        Self { db, retry }
    }

    pub async fn create(&self, task: NewTask) -> Result<Task> {
        self.db
            .call(move |db| db.create_task(&task))
            .await
            .map_err(GenerationError::Persistence)
    }

    /// Single lookup without retry.
    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let id = id.to_string();
        self.db
            .call(move |db| db.get_task(&id))
            .await
            .map_err(GenerationError::Persistence)
    }

    /// Lookup that tolerates the row not being visible yet. Returns `None`
    /// only after every attempt came back empty.
    pub async fn find_with_retry(&self, id: &str) -> Result<Option<Task>> {
        for attempt in 1..=self.retry.attempts {
            if let Some(task) = self.get(id).await? {
                return Ok(Some(task));
            }
            if attempt < self.retry.attempts {
                tracing::debug!(task_id = %id, attempt, "task not visible yet, retrying");
                tokio::time::sleep(self.retry.delay).await;
            }
        }
        Ok(None)
    }

    /// Like `find_with_retry`, but a task missing after the window is fatal.
    pub async fn require(&self, id: &str) -> Result<Task> {
        self.find_with_retry(id)
            .await?
            .ok_or_else(|| GenerationError::TaskNotFound { id: id.to_string() })
    }

    pub async fn children(&self, parent_id: &str) -> Result<Vec<Task>> {
        let parent_id = parent_id.to_string();
        self.db
            .call(move |db| db.list_child_tasks(&parent_id))
            .await
            .map_err(GenerationError::Persistence)
    }

    pub async fn transition_to_in_progress(&self, id: &str) -> Result<Task> {
        let key = id.to_string();
        let changed = self
            .db
            .call(move |db| db.mark_task_in_progress(&key))
            .await
            .map_err(GenerationError::Persistence)?;
        self.after_transition(id, changed, TaskStatus::InProgress).await
    }

    pub async fn transition_to_success(
        &self,
        id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Task> {
        let key = id.to_string();
        let changed = self
            .db
            .call(move |db| db.finish_task(&key, TaskStatus::Success, result.as_ref(), None))
            .await
            .map_err(GenerationError::Persistence)?;
        self.after_transition(id, changed, TaskStatus::Success).await
    }

    pub async fn transition_to_failed(&self, id: &str, error: &str) -> Result<Task> {
        let key = id.to_string();
        let error = error.to_string();
        let changed = self
            .db
            .call(move |db| db.finish_task(&key, TaskStatus::Failed, None, Some(error.as_str())))
            .await
            .map_err(GenerationError::Persistence)?;
        self.after_transition(id, changed, TaskStatus::Failed).await
    }

    /// Mark a task Failed unless it is already terminal. Returns whether
    /// this call performed the transition.
    pub async fn fail_if_open(&self, id: &str, error: &str) -> Result<bool> {
        match self.transition_to_failed(id, error).await {
            Ok(_) => Ok(true),
            Err(GenerationError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Store a stage artifact on a task that stays open.
    pub async fn record_result(&self, id: &str, result: serde_json::Value) -> Result<()> {
        let key = id.to_string();
        let changed = self
            .db
            .call(move |db| db.record_task_result(&key, &result))
            .await
            .map_err(GenerationError::Persistence)?;
        if changed {
            return Ok(());
        }
        let task = self.require(id).await?;
        Err(GenerationError::InvalidTransition {
            id: id.to_string(),
            from: task.status,
            to: task.status,
        })
    }

    async fn after_transition(&self, id: &str, changed: bool, to: TaskStatus) -> Result<Task> {
        let task = self.require(id).await?;
        if changed {
            Ok(task)
        } else {
            Err(GenerationError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::db::GenerationDb;
    use crate::generation::models::TaskKind;
    use serde_json::json;

    fn ledger() -> anyhow::Result<TaskLedger> {
        let db = DbHandle::new(GenerationDb::new_in_memory()?);
        Ok(TaskLedger::new(
            db,
            LookupRetry {
                attempts: 3,
                delay: Duration::from_millis(5),
            },
        ))
    }

    #[tokio::test]
    async fn test_forward_transitions() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let task = ledger
            .create(NewTask::new(TaskKind::CourseBase, json!({"profile_id": 1})))
            .await?;

        let running = ledger.transition_to_in_progress(&task.id).await?;
        assert_eq!(running.status, TaskStatus::InProgress);
        assert!(running.started_at.is_some());

        let done = ledger
            .transition_to_success(&task.id, Some(json!({"course_id": 3})))
            .await?;
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.result, Some(json!({"course_id": 3})));
        assert_eq!(done.params, json!({"profile_id": 1}));
        Ok(())
    }

    #[tokio::test]
    async fn test_terminal_task_rejects_transitions() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let task = ledger
            .create(NewTask::new(TaskKind::CoursePlan, json!({})))
            .await?;
        ledger.transition_to_failed(&task.id, "provider down").await?;

        let err = ledger
            .transition_to_success(&task.id, None)
            .await
            .unwrap_err();
        match err {
            GenerationError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, TaskStatus::Failed);
                assert_eq!(to, TaskStatus::Success);
            }
            other => panic!("Expected InvalidTransition, got {other:?}"),
        }
        assert!(!ledger.fail_if_open(&task.id, "again").await?);

        let stored = ledger.get(&task.id).await?.unwrap();
        assert_eq!(stored.error.as_deref(), Some("provider down"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_task_is_fatal_after_retries() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let started = std::time::Instant::now();
        assert!(ledger.find_with_retry("nope").await?.is_none());
        // Two sleeps between three attempts.
        assert!(started.elapsed() >= Duration::from_millis(10));

        let err = ledger.transition_to_in_progress("nope").await.unwrap_err();
        assert!(matches!(err, GenerationError::TaskNotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_find_with_retry_sees_late_insert() -> anyhow::Result<()> {
        let db = DbHandle::new(GenerationDb::new_in_memory()?);
        let ledger = TaskLedger::new(
            db.clone(),
            LookupRetry {
                attempts: 10,
                delay: Duration::from_millis(20),
            },
        );
        let task = NewTask::new(TaskKind::UserSummary, json!({}));
        let id = task.id.clone();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            db.call(move |db| db.create_task(&task)).await
        });

        let found = ledger.find_with_retry(&id).await?;
        writer.await??;
        assert_eq!(found.map(|t| t.id), Some(id));
        Ok(())
    }

    #[tokio::test]
    async fn test_record_result_keeps_task_open() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let task = ledger
            .create(NewTask::new(TaskKind::UserSummary, json!({})))
            .await?;
        ledger.transition_to_in_progress(&task.id).await?;
        ledger.record_result(&task.id, json!({"summary": "x"})).await?;

        let stored = ledger.get(&task.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert_eq!(stored.result, Some(json!({"summary": "x"})));
        Ok(())
    }

    #[tokio::test]
    async fn test_children_listed_in_creation_order() -> anyhow::Result<()> {
        let ledger = ledger()?;
        let parent = ledger
            .create(NewTask::new(TaskKind::UserSummary, json!({})))
            .await?;
        let a = ledger
            .create(NewTask::new(TaskKind::CourseBase, json!({})).with_parent(&parent.id))
            .await?;
        let b = ledger
            .create(NewTask::new(TaskKind::CoursePlan, json!({})).with_parent(&parent.id))
            .await?;
        let ids: Vec<_> = ledger
            .children(&parent.id)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id]);
        Ok(())
    }
}
