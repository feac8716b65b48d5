use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ProviderSection;
use crate::errors::ProviderError;
use crate::util::extract_json_value;

use super::models::{
    BlockSpec, ContentBlock, ContentType, Course, CourseSkeleton, CourseTree, Lesson, Module,
    OutlineSpec,
};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Black-box content generation: spec in, content or failure out.
///
/// Injected into the orchestrator as `Arc<dyn ContentProvider>` so stage
/// handlers can run against a scripted fake in tests.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Condense the preference dialog into a learner-profile summary.
    async fn profile_summary(&self, history: &str) -> ProviderResult<String>;

    async fn course_skeleton(&self, summary: &str) -> ProviderResult<CourseSkeleton>;

    async fn module_plan(
        &self,
        summary: &str,
        course: &Course,
        max_modules: usize,
    ) -> ProviderResult<Vec<OutlineSpec>>;

    async fn lesson_plan(
        &self,
        summary: &str,
        course: &Course,
        module: &Module,
        max_lessons: usize,
    ) -> ProviderResult<Vec<OutlineSpec>>;

    async fn block_plan(
        &self,
        summary: &str,
        tree: &CourseTree,
        lesson: &Lesson,
        max_blocks: usize,
    ) -> ProviderResult<Vec<BlockSpec>>;

    async fn block_content(
        &self,
        summary: &str,
        tree: &CourseTree,
        lesson: &Lesson,
        block: &ContentBlock,
    ) -> ProviderResult<serde_json::Value>;
}

// ── Output validation ────────────────────────────────────────────────

pub fn validate_summary(summary: String) -> ProviderResult<String> {
    let trimmed = summary.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::Malformed("profile summary is empty".to_string()));
    }
    Ok(trimmed.to_string())
}

pub fn validate_skeleton(skeleton: CourseSkeleton) -> ProviderResult<CourseSkeleton> {
    if skeleton.title.trim().is_empty() {
        return Err(ProviderError::Malformed("course title is empty".to_string()));
    }
    if skeleton.description.trim().is_empty() {
        return Err(ProviderError::Malformed("course description is empty".to_string()));
    }
    if !skeleton.estimated_time_hours.is_finite() || skeleton.estimated_time_hours < 0.0 {
        return Err(ProviderError::Malformed(format!(
            "invalid estimated_time_hours {}",
            skeleton.estimated_time_hours
        )));
    }
    Ok(skeleton)
}

/// A plan must be a non-empty list of titled entries. Entries past `limit`
/// are dropped.
pub fn validate_outlines(
    mut specs: Vec<OutlineSpec>,
    limit: usize,
    what: &str,
) -> ProviderResult<Vec<OutlineSpec>> {
    if specs.is_empty() {
        return Err(ProviderError::Malformed(format!("{} plan is empty", what)));
    }
    if let Some(index) = specs.iter().position(|s| s.title.trim().is_empty()) {
        return Err(ProviderError::Malformed(format!(
            "{} plan entry {} has no title",
            what, index
        )));
    }
    if specs.len() > limit {
        tracing::debug!(what, returned = specs.len(), limit, "truncating plan");
        specs.truncate(limit);
    }
    Ok(specs)
}

pub fn validate_blocks(mut specs: Vec<BlockSpec>, limit: usize) -> ProviderResult<Vec<BlockSpec>> {
    if specs.is_empty() {
        return Err(ProviderError::Malformed("content plan is empty".to_string()));
    }
    if specs.len() > limit {
        tracing::debug!(returned = specs.len(), limit, "truncating content plan");
        specs.truncate(limit);
    }
    Ok(specs)
}

pub fn validate_content(content: serde_json::Value) -> ProviderResult<serde_json::Value> {
    match &content {
        serde_json::Value::Object(map) if !map.is_empty() => Ok(content),
        _ => Err(ProviderError::Malformed(
            "block content must be a non-empty JSON object".to_string(),
        )),
    }
}

/// Accept either a bare list or an object wrapping the list under `key`.
fn list_payload<T: DeserializeOwned>(value: serde_json::Value, key: &str) -> ProviderResult<Vec<T>> {
    let list = match value {
        serde_json::Value::Object(mut map) => map.remove(key).ok_or_else(|| {
            ProviderError::Malformed(format!("expected a list or an object with '{}'", key))
        })?,
        other => other,
    };
    if !list.is_array() {
        return Err(ProviderError::Malformed(format!("'{}' is not a list", key)));
    }
    serde_json::from_value(list)
        .map_err(|e| ProviderError::Malformed(format!("invalid {} entry: {}", key, e)))
}

// ── Prompts ──────────────────────────────────────────────────────────

const SUMMARY_SYSTEM_PROMPT: &str = r#"You are an instructional designer. Read the conversation between a learner and an assistant and write a concise learner profile: what they want to learn, why, their current level, preferred formats, and time budget.

Respond with plain text only, at most 150 words."#;

const COURSE_SYSTEM_PROMPT: &str = r#"You are an instructional designer. From the learner profile, design one course.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "title": "Course title",
  "description": "Two or three sentences on what the course covers",
  "goal": "What the learner can do after finishing",
  "estimated_time_hours": 6.0
}"#;

const MODULE_SYSTEM_PROMPT: &str = r#"You are an instructional designer. Split the course into modules that build on each other.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "modules": [
    {"title": "...", "description": "...", "goal": "...", "estimated_time_hours": 2.0}
  ]
}"#;

const LESSON_SYSTEM_PROMPT: &str = r#"You are an instructional designer. Split the module into lessons in teaching order.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "lessons": [
    {"title": "...", "description": "...", "goal": "...", "estimated_time_hours": 0.5}
  ]
}"#;

const BLOCK_PLAN_SYSTEM_PROMPT: &str = r#"You are an instructional designer. Plan the content blocks of one lesson. Vary the block types to keep the learner engaged and end with a check of understanding.

Allowed types: text, video, dialog, practice, examples, mistakes, reflection, test, code, open_answer.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "blocks": [
    {"type": "text", "description": "What the block covers", "goal": "Why it is here", "outline": "Key points"}
  ]
}"#;

const CONTENT_SYSTEM_PROMPT: &str = r#"You are an instructional designer writing the material for one lesson block. Use the course and lesson context so the block fits what comes before and after it.

Respond with a single JSON object only (no markdown, no explanation). Its shape depends on the block type:
- text: {"text": "..."}
- video: {"title": "...", "description": "...", "url": "https://example.com"}
- dialog: {"dialog": [{"role": "student", "text": "..."}, {"role": "teacher", "text": "..."}]}
- practice: {"task": "..."}
- examples: {"examples": ["...", "..."]}
- mistakes: {"mistakes": ["...", "..."]}
- reflection: {"prompt": "..."}
- test: {"question": "...", "options": ["...", "...", "..."], "answer": "..."}
- code: {"language": "...", "code": "...", "explanation": "..."}
- open_answer: {"question": "...", "reference_answer": "..."}

Do not add fields beyond the ones listed for the type."#;

// ── OpenAI-compatible HTTP provider ──────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    api_key: Option<String>,
}

impl HttpProvider {
    pub fn new(config: &ProviderSection) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build provider HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key: config.api_key.clone(),
        })
    }

    async fn complete(&self, system: &str, user: String) -> ProviderResult<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::Request(format!("HTTP {}: {}", status, body)));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("Failed to parse response: {}", e)))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed("No choices in response".to_string()))
    }

    async fn complete_json(&self, system: &str, user: String) -> ProviderResult<serde_json::Value> {
        let text = self.complete(system, user).await?;
        extract_json_value(&text)
            .ok_or_else(|| ProviderError::Malformed("response contains no JSON".to_string()))
    }
}

fn course_context(course: &Course) -> String {
    format!(
        "Course: {}\nDescription: {}\nGoal: {}",
        course.title, course.description, course.goal
    )
}

fn tree_outline(tree: &CourseTree) -> String {
    let mut out = course_context(&tree.course);
    for module in &tree.modules {
        out.push_str(&format!("\n- Module: {}", module.module.title));
        for lesson in &module.lessons {
            out.push_str(&format!("\n  - Lesson: {}", lesson.lesson.title));
        }
    }
    out
}

#[async_trait]
impl ContentProvider for HttpProvider {
    async fn profile_summary(&self, history: &str) -> ProviderResult<String> {
        self.complete(SUMMARY_SYSTEM_PROMPT, format!("Conversation:\n{}", history))
            .await
    }

    async fn course_skeleton(&self, summary: &str) -> ProviderResult<CourseSkeleton> {
        let value = self
            .complete_json(COURSE_SYSTEM_PROMPT, format!("Learner profile:\n{}", summary))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| ProviderError::Malformed(format!("invalid course: {}", e)))
    }

    async fn module_plan(
        &self,
        summary: &str,
        course: &Course,
        max_modules: usize,
    ) -> ProviderResult<Vec<OutlineSpec>> {
        let prompt = format!(
            "Learner profile:\n{}\n\n{}\n\nReturn at most {} modules.",
            summary,
            course_context(course),
            max_modules
        );
        let value = self.complete_json(MODULE_SYSTEM_PROMPT, prompt).await?;
        list_payload(value, "modules")
    }

    async fn lesson_plan(
        &self,
        summary: &str,
        course: &Course,
        module: &Module,
        max_lessons: usize,
    ) -> ProviderResult<Vec<OutlineSpec>> {
        let prompt = format!(
            "Learner profile:\n{}\n\n{}\n\nModule: {}\nDescription: {}\nGoal: {}\n\nReturn at most {} lessons.",
            summary,
            course_context(course),
            module.title,
            module.description,
            module.goal,
            max_lessons
        );
        let value = self.complete_json(LESSON_SYSTEM_PROMPT, prompt).await?;
        list_payload(value, "lessons")
    }

    async fn block_plan(
        &self,
        summary: &str,
        tree: &CourseTree,
        lesson: &Lesson,
        max_blocks: usize,
    ) -> ProviderResult<Vec<BlockSpec>> {
        let prompt = format!(
            "Learner profile:\n{}\n\nCourse structure:\n{}\n\nLesson: {}\nDescription: {}\nGoal: {}\n\nReturn at most {} blocks.",
            summary,
            tree_outline(tree),
            lesson.title,
            lesson.description,
            lesson.goal,
            max_blocks
        );
        let value = self.complete_json(BLOCK_PLAN_SYSTEM_PROMPT, prompt).await?;
        list_payload(value, "blocks")
    }

    async fn block_content(
        &self,
        summary: &str,
        tree: &CourseTree,
        lesson: &Lesson,
        block: &ContentBlock,
    ) -> ProviderResult<serde_json::Value> {
        let prompt = format!(
            "Learner profile:\n{}\n\nCourse structure:\n{}\n\nLesson: {}\n{}\n\nBlock type: {}\nDescription: {}\nGoal: {}\nOutline: {}",
            summary,
            tree_outline(tree),
            lesson.title,
            lesson.description,
            block.block_type,
            block.description,
            block.goal,
            block.outline
        );
        let value = self.complete_json(CONTENT_SYSTEM_PROMPT, prompt).await?;
        if block.block_type == ContentType::Text && value.is_string() {
            return Ok(serde_json::json!({ "text": value }));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outline(title: &str) -> OutlineSpec {
        OutlineSpec {
            title: title.to_string(),
            description: String::new(),
            goal: String::new(),
            estimated_time_hours: 1.0,
        }
    }

    #[test]
    fn test_validate_outlines_truncates_to_limit() {
        let specs = vec![outline("A"), outline("B"), outline("C")];
        let kept = validate_outlines(specs, 2, "module").unwrap();
        assert_eq!(kept.iter().map(|s| s.title.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn test_validate_outlines_rejects_empty_and_untitled() {
        assert!(matches!(
            validate_outlines(vec![], 2, "module"),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(
            validate_outlines(vec![outline("A"), outline("  ")], 2, "lesson"),
            Err(ProviderError::Malformed(msg)) if msg.contains("entry 1")
        ));
    }

    #[test]
    fn test_validate_skeleton_requires_title_and_description() {
        let skeleton = CourseSkeleton {
            title: "SQL".to_string(),
            description: String::new(),
            goal: String::new(),
            estimated_time_hours: 1.0,
        };
        assert!(validate_skeleton(skeleton).is_err());
    }

    #[test]
    fn test_validate_skeleton_rejects_non_finite_hours() {
        let skeleton = |hours: f64| CourseSkeleton {
            title: "SQL".to_string(),
            description: "Basics".to_string(),
            goal: String::new(),
            estimated_time_hours: hours,
        };
        for hours in [f64::NAN, f64::INFINITY, -1.0] {
            assert!(matches!(
                validate_skeleton(skeleton(hours)),
                Err(ProviderError::Malformed(msg)) if msg.contains("estimated_time_hours")
            ));
        }
        assert!(validate_skeleton(skeleton(0.0)).is_ok());
    }

    #[test]
    fn test_validate_content_requires_object() {
        assert!(validate_content(json!({"text": "hi"})).is_ok());
        assert!(validate_content(json!({})).is_err());
        assert!(validate_content(json!(["a"])).is_err());
        assert!(validate_content(json!("text")).is_err());
    }

    #[test]
    fn test_list_payload_accepts_bare_and_wrapped_lists() {
        let bare: Vec<OutlineSpec> = list_payload(json!([{"title": "M1"}]), "modules").unwrap();
        assert_eq!(bare[0].title, "M1");

        let wrapped: Vec<BlockSpec> = list_payload(
            json!({"blocks": [{"type": "test", "description": "Quiz"}]}),
            "blocks",
        )
        .unwrap();
        assert_eq!(wrapped[0].block_type, ContentType::Test);

        let wrong: ProviderResult<Vec<OutlineSpec>> = list_payload(json!({"items": []}), "modules");
        assert!(wrong.is_err());
        let not_list: ProviderResult<Vec<OutlineSpec>> =
            list_payload(json!({"modules": "none"}), "modules");
        assert!(not_list.is_err());
    }

    #[test]
    fn test_unknown_block_type_is_malformed() {
        let result: ProviderResult<Vec<BlockSpec>> =
            list_payload(json!([{"type": "podcast"}]), "blocks");
        assert!(matches!(result, Err(ProviderError::Malformed(_))));
    }

    #[test]
    fn test_http_provider_trims_base_url() {
        let config = ProviderSection {
            base_url: "http://localhost:11434/v1/".to_string(),
            ..ProviderSection::default()
        };
        let provider = HttpProvider::new(&config).unwrap();
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
        assert!(provider.api_key.is_none());
    }

    #[test]
    fn test_chat_request_shape() {
        let request = ChatCompletionRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "system",
                content: "x".to_string(),
            }],
            temperature: 0.5,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "m");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["temperature"], 0.5);
    }
}
