//! Typed error hierarchy for the course generation subsystem.
//!
//! `GenerationError` covers every failure a stage handler, the task ledger
//! or the repository can surface. Handlers return it; the orchestrator maps
//! it onto the run's failure path. `ProviderError` is what a content
//! provider reports before a stage is attached to it.

use thiserror::Error;

use crate::generation::models::{TaskKind, TaskStatus};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Provider call failed during {stage}: {message}")]
    Provider { stage: TaskKind, message: String },

    #[error("Provider returned malformed output during {stage}: {message}")]
    MalformedOutput { stage: TaskKind, message: String },

    #[error("Database error: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Failed to enqueue job: {0}")]
    Enqueue(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GenerationError {
    /// Attach the failing stage to a provider error.
    pub fn from_provider(stage: TaskKind, err: ProviderError) -> Self {
        match err {
            ProviderError::Request(message) => Self::Provider { stage, message },
            ProviderError::Malformed(message) => Self::MalformedOutput { stage, message },
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Short, user-facing explanation used in the error progress event.
    /// Internal details stay in the logs and the task's `error` column.
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider { stage, .. } | Self::MalformedOutput { stage, .. } => format!(
                "Course generation failed while building the {}. Please try again.",
                stage_label(*stage)
            ),
            Self::NotFound { entity, .. } => {
                format!("Course generation failed: {} is no longer available.", entity)
            }
            _ => "Course generation failed. Please try again.".to_string(),
        }
    }
}

fn stage_label(stage: TaskKind) -> &'static str {
    match stage {
        TaskKind::UserSummary => "learner profile",
        TaskKind::CourseBase => "course outline",
        TaskKind::CoursePlan => "module plan",
        TaskKind::ModulePlan => "lesson plan",
        TaskKind::LessonContentPlan => "lesson content plan",
        TaskKind::ContentGeneration => "lesson content",
    }
}

/// Failures reported by a content provider, before the orchestrator knows
/// which stage they belong to.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Request(String),

    #[error("{0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_carries_stage() {
        let err = GenerationError::Provider {
            stage: TaskKind::CoursePlan,
            message: "timeout".to_string(),
        };
        match &err {
            GenerationError::Provider { stage, message } => {
                assert_eq!(*stage, TaskKind::CoursePlan);
                assert_eq!(message, "timeout");
            }
            _ => panic!("Expected Provider"),
        }
        assert!(err.to_string().contains("course_plan"));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = GenerationError::InvalidTransition {
            id: "t-1".to_string(),
            from: TaskStatus::Success,
            to: TaskStatus::Failed,
        };
        let msg = err.to_string();
        assert!(msg.contains("t-1"));
        assert!(msg.contains("success"));
        assert!(msg.contains("failed"));
    }

    #[test]
    fn user_message_hides_internal_details() {
        let err = GenerationError::MalformedOutput {
            stage: TaskKind::ContentGeneration,
            message: "expected value at line 1 column 1".to_string(),
        };
        let msg = err.user_message();
        assert!(msg.contains("lesson content"));
        assert!(!msg.contains("line 1"));

        let err = GenerationError::Persistence(anyhow::anyhow!("disk I/O error"));
        assert!(!err.user_message().contains("disk"));
    }

    #[test]
    fn provider_errors_map_onto_stage_variants() {
        let err = GenerationError::from_provider(
            TaskKind::ModulePlan,
            ProviderError::Malformed("expected a list".to_string()),
        );
        assert!(matches!(
            err,
            GenerationError::MalformedOutput { stage: TaskKind::ModulePlan, .. }
        ));

        let err = GenerationError::from_provider(
            TaskKind::UserSummary,
            ProviderError::Request("HTTP 500".to_string()),
        );
        assert!(matches!(err, GenerationError::Provider { .. }));
    }

    #[test]
    fn not_found_helper_formats_entity() {
        let err = GenerationError::not_found("Lesson", 12);
        assert!(matches!(err, GenerationError::NotFound { entity: "Lesson", .. }));
        assert_eq!(err.to_string(), "Lesson 12 not found");
    }

    #[test]
    fn anyhow_converts_into_other() {
        let err: GenerationError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, GenerationError::Other(_)));
    }

    #[test]
    fn generation_error_implements_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&GenerationError::TaskNotFound {
            id: "t-1".to_string(),
        });
    }
}
