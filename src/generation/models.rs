use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Task ledger types ────────────────────────────────────────────────

/// One kind of generation step. Every Task row carries exactly one kind and
/// every kind has exactly one handler in the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    UserSummary,
    CourseBase,
    CoursePlan,
    ModulePlan,
    LessonContentPlan,
    ContentGeneration,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserSummary => "user_summary",
            Self::CourseBase => "course_base",
            Self::CoursePlan => "course_plan",
            Self::ModulePlan => "module_plan",
            Self::LessonContentPlan => "lesson_content_plan",
            Self::ContentGeneration => "content_generation",
        }
    }

    /// Name of the queue job that executes this stage.
    pub fn job_name(&self) -> &'static str {
        match self {
            Self::UserSummary => "generate_user_summary",
            Self::CourseBase => "generate_course_base",
            Self::CoursePlan => "generate_course_plan",
            Self::ModulePlan => "generate_module_plan",
            Self::LessonContentPlan => "generate_lesson_content_plan",
            Self::ContentGeneration => "generate_content",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_summary" => Ok(Self::UserSummary),
            "course_base" => Ok(Self::CourseBase),
            "course_plan" => Ok(Self::CoursePlan),
            "module_plan" => Ok(Self::ModulePlan),
            "lesson_content_plan" => Ok(Self::LessonContentPlan),
            "content_generation" => Ok(Self::ContentGeneration),
            _ => Err(format!("Invalid task kind: {}", s)),
        }
    }
}

/// Lifecycle of a Task. Moves forward only:
/// `Pending → InProgress → {Success, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether a ledger transition from `self` to `next` is allowed.
    /// `InProgress` is entered once; a second claim means a duplicate job.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::InProgress) => true,
            (Self::Pending | Self::InProgress, Self::Success | Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub parent_id: Option<String>,
    pub kind: TaskKind,
    pub params: serde_json::Value,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Insert payload for a Task row. New tasks always start `Pending`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub id: String,
    pub parent_id: Option<String>,
    pub kind: TaskKind,
    pub params: serde_json::Value,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

impl NewTask {
    pub fn new(kind: TaskKind, params: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            kind,
            params,
            session_id: None,
            user_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_owner(mut self, session_id: &str, user_id: Option<&str>) -> Self {
        self.session_id = Some(session_id.to_string());
        self.user_id = user_id.map(str::to_string);
        self
    }
}

// ── Run context ──────────────────────────────────────────────────────

/// Client-chosen cutoff: the last stage whose artifact a run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    UserSummary,
    CourseBase,
    CoursePlan,
    ModulePlan,
    LessonContentPlan,
    FirstLessonContent,
    LessonContent,
    /// Plan every lesson, then realise every block in the course.
    Full,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserSummary => "user_summary",
            Self::CourseBase => "course_base",
            Self::CoursePlan => "course_plan",
            Self::ModulePlan => "module_plan",
            Self::LessonContentPlan => "lesson_content_plan",
            Self::FirstLessonContent => "first_lesson_content",
            Self::LessonContent => "lesson_content",
            Self::Full => "full",
        }
    }

    /// Content generation stays inside the lesson that was content-planned.
    pub fn is_lesson_scoped(&self) -> bool {
        matches!(self, Self::FirstLessonContent | Self::LessonContent)
    }

    pub fn all() -> [Depth; 8] {
        [
            Self::UserSummary,
            Self::CourseBase,
            Self::CoursePlan,
            Self::ModulePlan,
            Self::LessonContentPlan,
            Self::FirstLessonContent,
            Self::LessonContent,
            Self::Full,
        ]
    }
}

impl std::fmt::Display for Depth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Depth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_summary" => Ok(Self::UserSummary),
            "course_base" => Ok(Self::CourseBase),
            "course_plan" => Ok(Self::CoursePlan),
            "module_plan" => Ok(Self::ModulePlan),
            "lesson_content_plan" => Ok(Self::LessonContentPlan),
            "first_lesson_content" => Ok(Self::FirstLessonContent),
            "lesson_content" => Ok(Self::LessonContent),
            "full" => Ok(Self::Full),
            _ => Err(format!("Invalid depth: {}", s)),
        }
    }
}

/// Immutable run context forwarded unchanged to every successor stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    pub main_task_id: String,
    pub main_kind: TaskKind,
    pub depth: Depth,
    pub session_id: String,
    pub user_id: Option<String>,
}

// ── Course tree ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub summary: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: i64,
    pub profile_id: Option<i64>,
    pub owner: Option<String>,
    pub title: String,
    pub description: String,
    pub goal: String,
    pub estimated_time_hours: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: i64,
    pub course_id: i64,
    pub title: String,
    pub description: String,
    pub goal: String,
    pub estimated_time_hours: f64,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: i64,
    pub module_id: i64,
    pub title: String,
    pub description: String,
    pub goal: String,
    pub estimated_time_hours: f64,
    pub position: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Video,
    Dialog,
    Practice,
    Examples,
    Mistakes,
    Reflection,
    Test,
    Code,
    OpenAnswer,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Video => "video",
            Self::Dialog => "dialog",
            Self::Practice => "practice",
            Self::Examples => "examples",
            Self::Mistakes => "mistakes",
            Self::Reflection => "reflection",
            Self::Test => "test",
            Self::Code => "code",
            Self::OpenAnswer => "open_answer",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "video" => Ok(Self::Video),
            "dialog" => Ok(Self::Dialog),
            "practice" => Ok(Self::Practice),
            "examples" => Ok(Self::Examples),
            "mistakes" => Ok(Self::Mistakes),
            "reflection" => Ok(Self::Reflection),
            "test" => Ok(Self::Test),
            "code" => Ok(Self::Code),
            "open_answer" => Ok(Self::OpenAnswer),
            _ => Err(format!("Invalid content type: {}", s)),
        }
    }
}

/// Leaf of the course tree. `content` stays `None` until the
/// ContentGeneration stage realises the block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub id: i64,
    pub lesson_id: i64,
    pub block_type: ContentType,
    pub description: String,
    pub goal: String,
    pub outline: String,
    pub content: Option<serde_json::Value>,
    pub position: i32,
}

impl ContentBlock {
    pub fn is_realized(&self) -> bool {
        self.content.is_some()
    }
}

/// Anything ordered within its sibling group by `position`.
pub trait Positioned {
    fn position(&self) -> i32;
}

impl Positioned for Module {
    fn position(&self) -> i32 {
        self.position
    }
}

impl Positioned for Lesson {
    fn position(&self) -> i32 {
        self.position
    }
}

impl Positioned for ContentBlock {
    fn position(&self) -> i32 {
        self.position
    }
}

impl Positioned for ModuleNode {
    fn position(&self) -> i32 {
        self.module.position
    }
}

impl Positioned for LessonNode {
    fn position(&self) -> i32 {
        self.lesson.position
    }
}

/// Ordered snapshot of a whole course, children sorted by ascending position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseTree {
    pub course: Course,
    pub modules: Vec<ModuleNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleNode {
    pub module: Module,
    pub lessons: Vec<LessonNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonNode {
    pub lesson: Lesson,
    pub blocks: Vec<ContentBlock>,
}

// ── Provider output specs ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseSkeleton {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub estimated_time_hours: f64,
}

/// Spec for a Module or Lesson shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub estimated_time_hours: f64,
}

/// Spec for a ContentBlock shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSpec {
    #[serde(rename = "type")]
    pub block_type: ContentType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub outline: String,
}

// ── Session progress ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Chatting,
    Generating,
    CourseReady,
    Error,
    Done,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chatting => "chatting",
            Self::Generating => "generating",
            Self::CourseReady => "course_ready",
            Self::Error => "error",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chatting" => Ok(Self::Chatting),
            "generating" => Ok(Self::Generating),
            "course_ready" => Ok(Self::CourseReady),
            "error" => Ok(Self::Error),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// How a run ended, as recorded on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Error,
}

impl RunOutcome {
    pub fn session_status(&self) -> SessionStatus {
        match self {
            Self::Done => SessionStatus::Done,
            Self::Error => SessionStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseSummary {
    pub course_id: i64,
    pub title: String,
    pub description: String,
    pub estimated_time_hours: f64,
}

/// Session read model consumed by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionProgress {
    pub session_id: String,
    pub in_progress: bool,
    pub status: SessionStatus,
    pub generated_courses: Vec<CourseSummary>,
}

impl SessionProgress {
    /// A session that has never started a run.
    pub fn idle(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            in_progress: false,
            status: SessionStatus::Chatting,
            generated_courses: Vec::new(),
        }
    }
}

// ── Progress events ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventWho {
    Bot,
    System,
}

impl EventWho {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::System => "system",
        }
    }
}

impl FromStr for EventWho {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bot" => Ok(Self::Bot),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid event author: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Chat,
    ChatInfo,
    System,
    CourseGenerationDone,
    CourseGenerationError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::ChatInfo => "chat_info",
            Self::System => "system",
            Self::CourseGenerationDone => "course_generation_done",
            Self::CourseGenerationError => "course_generation_error",
        }
    }

    /// Terminal types end a consumer's listen loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CourseGenerationDone | Self::CourseGenerationError
        )
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "chat_info" => Ok(Self::ChatInfo),
            "system" => Ok(Self::System),
            "course_generation_done" => Ok(Self::CourseGenerationDone),
            "course_generation_error" => Ok(Self::CourseGenerationError),
            _ => Err(format!("Invalid event type: {}", s)),
        }
    }
}

/// Event payload `{who, type, text, id, ts}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub who: EventWho,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub text: String,
    pub id: String,
    pub ts: f64,
}

impl ProgressEvent {
    pub fn new(who: EventWho, event_type: EventType, text: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            who,
            event_type,
            text: text.into(),
            id: uuid::Uuid::new_v4().to_string(),
            ts: now.timestamp_millis() as f64 / 1000.0,
        }
    }

    pub fn bot_info(text: impl Into<String>) -> Self {
        Self::new(EventWho::Bot, EventType::ChatInfo, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(EventWho::System, EventType::System, text)
    }

    pub fn done(text: impl Into<String>) -> Self {
        Self::new(EventWho::System, EventType::CourseGenerationDone, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(EventWho::System, EventType::CourseGenerationError, text)
    }
}

// ── Stage artifacts ──────────────────────────────────────────────────

/// What a stage produced. Stored in `Task.result` as a generic JSON blob;
/// the tag names the artifact kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "artifact", rename_all = "snake_case")]
pub enum StageArtifact {
    ProfileSummary { profile_id: i64, summary: String },
    Course { course: Course },
    Modules { course_id: i64, modules: Vec<Module> },
    Lessons { module_id: i64, lessons: Vec<Lesson> },
    Blocks { lesson_id: i64, blocks: Vec<ContentBlock> },
    Content { block_id: i64, content: serde_json::Value },
}

impl StageArtifact {
    pub fn to_value(&self) -> serde_json::Value {
        // Every variant is plain data; serialisation cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
