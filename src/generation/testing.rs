//! Scripted content provider shared by unit tests.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::errors::ProviderError;

use super::models::{
    BlockSpec, ContentBlock, ContentType, Course, CourseSkeleton, CourseTree, Lesson, Module,
    OutlineSpec, TaskKind,
};
use super::provider::{ContentProvider, ProviderResult};

/// Two modules, two lessons each, three blocks per lesson. Fails the
/// `fail_at`-th call (1-based) of one stage when set.
#[derive(Default)]
pub struct ScriptedProvider {
    fail_at: Option<(TaskKind, usize)>,
    calls: Mutex<Vec<TaskKind>>,
}

impl ScriptedProvider {
    pub fn failing(stage: TaskKind, nth: usize) -> Self {
        Self {
            fail_at: Some((stage, nth)),
            ..Self::default()
        }
    }

    fn record(&self, stage: TaskKind) -> ProviderResult<()> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(stage);
        let count = calls.iter().filter(|k| **k == stage).count();
        match self.fail_at {
            Some((kind, nth)) if kind == stage && nth == count => {
                Err(ProviderError::Request("simulated outage".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn outlines(n: usize, prefix: &str) -> Vec<OutlineSpec> {
        (1..=n)
            .map(|i| OutlineSpec {
                title: format!("{} {}", prefix, i),
                description: String::new(),
                goal: String::new(),
                estimated_time_hours: 1.0,
            })
            .collect()
    }
}

#[async_trait]
impl ContentProvider for ScriptedProvider {
    async fn profile_summary(&self, history: &str) -> ProviderResult<String> {
        self.record(TaskKind::UserSummary)?;
        Ok(format!("Learner wants: {}", history))
    }

    async fn course_skeleton(&self, _summary: &str) -> ProviderResult<CourseSkeleton> {
        self.record(TaskKind::CourseBase)?;
        Ok(CourseSkeleton {
            title: "SQL Basics".to_string(),
            description: "Queries from scratch".to_string(),
            goal: "Write SELECTs".to_string(),
            estimated_time_hours: 6.0,
        })
    }

    async fn module_plan(
        &self,
        _summary: &str,
        _course: &Course,
        max_modules: usize,
    ) -> ProviderResult<Vec<OutlineSpec>> {
        self.record(TaskKind::CoursePlan)?;
        Ok(Self::outlines(2.min(max_modules), "Module"))
    }

    async fn lesson_plan(
        &self,
        _summary: &str,
        _course: &Course,
        _module: &Module,
        max_lessons: usize,
    ) -> ProviderResult<Vec<OutlineSpec>> {
        self.record(TaskKind::ModulePlan)?;
        Ok(Self::outlines(2.min(max_lessons), "Lesson"))
    }

    async fn block_plan(
        &self,
        _summary: &str,
        _tree: &CourseTree,
        _lesson: &Lesson,
        _max_blocks: usize,
    ) -> ProviderResult<Vec<BlockSpec>> {
        self.record(TaskKind::LessonContentPlan)?;
        Ok((0..3)
            .map(|i| BlockSpec {
                block_type: ContentType::Text,
                description: format!("Block {}", i),
                goal: String::new(),
                outline: String::new(),
            })
            .collect())
    }

    async fn block_content(
        &self,
        _summary: &str,
        _tree: &CourseTree,
        _lesson: &Lesson,
        block: &ContentBlock,
    ) -> ProviderResult<serde_json::Value> {
        self.record(TaskKind::ContentGeneration)?;
        Ok(json!({ "text": format!("content for block {}", block.id) }))
    }
}
