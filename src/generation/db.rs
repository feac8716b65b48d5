use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the generation database.
///
/// Wraps `GenerationDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<GenerationDb>>,
}

impl DbHandle {
    pub fn new(db: GenerationDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&GenerationDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, GenerationDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

const TASK_COLUMNS: &str = "id, parent_id, kind, params, status, result, error, session_id, user_id, created_at, started_at, finished_at";
const MODULE_COLUMNS: &str =
    "id, course_id, title, description, goal, estimated_time_hours, position";
const LESSON_COLUMNS: &str =
    "id, module_id, title, description, goal, estimated_time_hours, position";
const BLOCK_COLUMNS: &str =
    "id, lesson_id, block_type, description, goal, outline, content, position";
const COURSE_COLUMNS: &str =
    "id, profile_id, owner, title, description, goal, estimated_time_hours, created_at";

pub struct GenerationDb {
    conn: Connection,
}

impl GenerationDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    parent_id TEXT REFERENCES tasks(id),
                    kind TEXT NOT NULL,
                    params TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    result TEXT,
                    error TEXT,
                    session_id TEXT,
                    user_id TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    started_at TEXT,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS profiles (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT,
                    user_id TEXT,
                    summary TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS courses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    profile_id INTEGER REFERENCES profiles(id) ON DELETE SET NULL,
                    owner TEXT,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    goal TEXT NOT NULL DEFAULT '',
                    estimated_time_hours REAL NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS modules (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    course_id INTEGER NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    goal TEXT NOT NULL DEFAULT '',
                    estimated_time_hours REAL NOT NULL DEFAULT 0,
                    position INTEGER NOT NULL,
                    UNIQUE(course_id, position)
                );

                CREATE TABLE IF NOT EXISTS lessons (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    module_id INTEGER NOT NULL REFERENCES modules(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    goal TEXT NOT NULL DEFAULT '',
                    estimated_time_hours REAL NOT NULL DEFAULT 0,
                    position INTEGER NOT NULL,
                    UNIQUE(module_id, position)
                );

                CREATE TABLE IF NOT EXISTS content_blocks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    lesson_id INTEGER NOT NULL REFERENCES lessons(id) ON DELETE CASCADE,
                    block_type TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    goal TEXT NOT NULL DEFAULT '',
                    outline TEXT NOT NULL DEFAULT '',
                    content TEXT,
                    position INTEGER NOT NULL,
                    UNIQUE(lesson_id, position)
                );

                CREATE TABLE IF NOT EXISTS session_progress (
                    session_id TEXT PRIMARY KEY,
                    in_progress INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'chatting',
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS session_courses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    course_id INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    estimated_time_hours REAL NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS session_events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    event_id TEXT NOT NULL,
                    who TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    text TEXT NOT NULL,
                    ts REAL NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_session ON tasks(session_id);
                CREATE INDEX IF NOT EXISTS idx_modules_course ON modules(course_id);
                CREATE INDEX IF NOT EXISTS idx_lessons_module ON lessons(module_id);
                CREATE INDEX IF NOT EXISTS idx_blocks_lesson ON content_blocks(lesson_id);
                CREATE INDEX IF NOT EXISTS idx_session_courses ON session_courses(session_id);
                CREATE INDEX IF NOT EXISTS idx_session_events ON session_events(session_id, seq);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Task ledger ───────────────────────────────────────────────────

    pub fn create_task(&self, task: &NewTask) -> Result<Task> {
        let params_json =
            serde_json::to_string(&task.params).context("Failed to serialize task params")?;
        self.conn
            .execute(
                "INSERT INTO tasks (id, parent_id, kind, params, status, session_id, user_id)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
                params![
                    task.id,
                    task.parent_id,
                    task.kind.as_str(),
                    params_json,
                    task.session_id,
                    task.user_id,
                ],
            )
            .with_context(|| format!("Failed to insert task {}", task.id))?;
        self.get_task(&task.id)?
            .context("Task not found after insert")
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                task_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn list_child_tasks(&self, parent_id: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE parent_id = ?1 ORDER BY rowid",
                TASK_COLUMNS
            ),
            parent_id,
        )
    }

    pub fn list_session_tasks(&self, session_id: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE session_id = ?1 ORDER BY rowid",
                TASK_COLUMNS
            ),
            session_id,
        )
    }

    fn query_tasks(&self, sql: &str, key: &str) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params![key], task_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    /// Claim a pending task for the handler about to run it. Returns false
    /// when no row changed: the task is missing, already claimed or terminal.
    pub fn mark_task_in_progress(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE tasks SET status = 'in_progress', started_at = {NOW}
                     WHERE id = ?1 AND status = 'pending'"
                ),
                params![id],
            )
            .context("Failed to mark task in progress")?;
        Ok(changed > 0)
    }

    /// Move a non-terminal task to a terminal status. A `None` result keeps
    /// whatever result was recorded earlier.
    pub fn finish_task(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        anyhow::ensure!(
            status.is_terminal(),
            "finish_task called with non-terminal status {}",
            status
        );
        let result_json = result
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize task result")?;
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE tasks SET status = ?2, result = COALESCE(?3, result), error = ?4,
                         finished_at = COALESCE(finished_at, {NOW})
                     WHERE id = ?1 AND status IN ('pending', 'in_progress')"
                ),
                params![id, status.as_str(), result_json, error],
            )
            .context("Failed to finish task")?;
        Ok(changed > 0)
    }

    /// Record a result on a task that stays open.
    pub fn record_task_result(&self, id: &str, result: &serde_json::Value) -> Result<bool> {
        let result_json =
            serde_json::to_string(result).context("Failed to serialize task result")?;
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET result = ?2 WHERE id = ?1 AND status IN ('pending', 'in_progress')",
                params![id, result_json],
            )
            .context("Failed to record task result")?;
        Ok(changed > 0)
    }

    // ── Profiles ──────────────────────────────────────────────────────

    pub fn create_profile(
        &self,
        session_id: Option<&str>,
        user_id: Option<&str>,
        summary: &str,
    ) -> Result<Profile> {
        self.conn
            .execute(
                "INSERT INTO profiles (session_id, user_id, summary) VALUES (?1, ?2, ?3)",
                params![session_id, user_id, summary],
            )
            .context("Failed to insert profile")?;
        let id = self.conn.last_insert_rowid();
        self.get_profile(id)?
            .context("Profile not found after insert")
    }

    pub fn get_profile(&self, id: i64) -> Result<Option<Profile>> {
        self.conn
            .query_row(
                "SELECT id, session_id, user_id, summary, created_at FROM profiles WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Profile {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        user_id: row.get(2)?,
                        summary: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to query profile")
    }

    // ── Course tree CRUD ──────────────────────────────────────────────

    pub fn create_course(
        &self,
        profile_id: Option<i64>,
        owner: Option<&str>,
        skeleton: &CourseSkeleton,
    ) -> Result<Course> {
        self.conn
            .execute(
                "INSERT INTO courses (profile_id, owner, title, description, goal, estimated_time_hours)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    profile_id,
                    owner,
                    skeleton.title,
                    skeleton.description,
                    skeleton.goal,
                    skeleton.estimated_time_hours,
                ],
            )
            .context("Failed to insert course")?;
        let id = self.conn.last_insert_rowid();
        self.get_course(id)?.context("Course not found after insert")
    }

    pub fn get_course(&self, id: i64) -> Result<Option<Course>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM courses WHERE id = ?1", COURSE_COLUMNS),
                params![id],
                |row| {
                    Ok(Course {
                        id: row.get(0)?,
                        profile_id: row.get(1)?,
                        owner: row.get(2)?,
                        title: row.get(3)?,
                        description: row.get(4)?,
                        goal: row.get(5)?,
                        estimated_time_hours: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .context("Failed to query course")
    }

    pub fn list_courses(&self) -> Result<Vec<Course>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM courses ORDER BY id", COURSE_COLUMNS))
            .context("Failed to prepare list_courses")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Course {
                    id: row.get(0)?,
                    profile_id: row.get(1)?,
                    owner: row.get(2)?,
                    title: row.get(3)?,
                    description: row.get(4)?,
                    goal: row.get(5)?,
                    estimated_time_hours: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .context("Failed to query courses")?;
        let mut courses = Vec::new();
        for row in rows {
            courses.push(row.context("Failed to read course row")?);
        }
        Ok(courses)
    }

    /// Delete a course; modules, lessons and blocks go with it.
    pub fn delete_course(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM courses WHERE id = ?1", params![id])
            .context("Failed to delete course")?;
        Ok(changed > 0)
    }

    /// Append module shells after any existing modules of the course.
    pub fn create_modules(&self, course_id: i64, specs: &[OutlineSpec]) -> Result<Vec<Module>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut position = self.next_position("modules", "course_id", course_id)?;
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            self.conn
                .execute(
                    "INSERT INTO modules (course_id, title, description, goal, estimated_time_hours, position)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        course_id,
                        spec.title,
                        spec.description,
                        spec.goal,
                        spec.estimated_time_hours,
                        position,
                    ],
                )
                .context("Failed to insert module")?;
            ids.push(self.conn.last_insert_rowid());
            position += 1;
        }
        tx.commit().context("Failed to commit module shells")?;

        let mut modules = Vec::with_capacity(ids.len());
        for id in ids {
            modules.push(self.get_module(id)?.context("Module not found after insert")?);
        }
        Ok(modules)
    }

    pub fn get_module(&self, id: i64) -> Result<Option<Module>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM modules WHERE id = ?1", MODULE_COLUMNS),
                params![id],
                module_row,
            )
            .optional()
            .context("Failed to query module")
    }

    pub fn list_modules(&self, course_id: i64) -> Result<Vec<Module>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM modules WHERE course_id = ?1 ORDER BY position",
                MODULE_COLUMNS
            ))
            .context("Failed to prepare list_modules")?;
        let rows = stmt
            .query_map(params![course_id], module_row)
            .context("Failed to query modules")?;
        let mut modules = Vec::new();
        for row in rows {
            modules.push(row.context("Failed to read module row")?);
        }
        Ok(modules)
    }

    /// Append lesson shells after any existing lessons of the module.
    pub fn create_lessons(&self, module_id: i64, specs: &[OutlineSpec]) -> Result<Vec<Lesson>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut position = self.next_position("lessons", "module_id", module_id)?;
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            self.conn
                .execute(
                    "INSERT INTO lessons (module_id, title, description, goal, estimated_time_hours, position)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        module_id,
                        spec.title,
                        spec.description,
                        spec.goal,
                        spec.estimated_time_hours,
                        position,
                    ],
                )
                .context("Failed to insert lesson")?;
            ids.push(self.conn.last_insert_rowid());
            position += 1;
        }
        tx.commit().context("Failed to commit lesson shells")?;

        let mut lessons = Vec::with_capacity(ids.len());
        for id in ids {
            lessons.push(self.get_lesson(id)?.context("Lesson not found after insert")?);
        }
        Ok(lessons)
    }

    pub fn get_lesson(&self, id: i64) -> Result<Option<Lesson>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM lessons WHERE id = ?1", LESSON_COLUMNS),
                params![id],
                lesson_row,
            )
            .optional()
            .context("Failed to query lesson")
    }

    pub fn list_lessons(&self, module_id: i64) -> Result<Vec<Lesson>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM lessons WHERE module_id = ?1 ORDER BY position",
                LESSON_COLUMNS
            ))
            .context("Failed to prepare list_lessons")?;
        let rows = stmt
            .query_map(params![module_id], lesson_row)
            .context("Failed to query lessons")?;
        let mut lessons = Vec::new();
        for row in rows {
            lessons.push(row.context("Failed to read lesson row")?);
        }
        Ok(lessons)
    }

    /// Course that owns a lesson, via its module.
    pub fn course_id_for_lesson(&self, lesson_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT m.course_id FROM lessons l JOIN modules m ON m.id = l.module_id WHERE l.id = ?1",
                params![lesson_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to resolve course for lesson")
    }

    /// Append block shells (no content) after any existing blocks of the lesson.
    pub fn create_blocks(&self, lesson_id: i64, specs: &[BlockSpec]) -> Result<Vec<ContentBlock>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut position = self.next_position("content_blocks", "lesson_id", lesson_id)?;
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            self.conn
                .execute(
                    "INSERT INTO content_blocks (lesson_id, block_type, description, goal, outline, position)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        lesson_id,
                        spec.block_type.as_str(),
                        spec.description,
                        spec.goal,
                        spec.outline,
                        position,
                    ],
                )
                .context("Failed to insert content block")?;
            ids.push(self.conn.last_insert_rowid());
            position += 1;
        }
        tx.commit().context("Failed to commit content block shells")?;

        let mut blocks = Vec::with_capacity(ids.len());
        for id in ids {
            blocks.push(self.get_block(id)?.context("Block not found after insert")?);
        }
        Ok(blocks)
    }

    pub fn get_block(&self, id: i64) -> Result<Option<ContentBlock>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM content_blocks WHERE id = ?1", BLOCK_COLUMNS),
                params![id],
                block_row,
            )
            .optional()
            .context("Failed to query content block")?;
        row.map(BlockRow::into_block).transpose()
    }

    pub fn list_blocks(&self, lesson_id: i64) -> Result<Vec<ContentBlock>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM content_blocks WHERE lesson_id = ?1 ORDER BY position",
                BLOCK_COLUMNS
            ))
            .context("Failed to prepare list_blocks")?;
        let rows = stmt
            .query_map(params![lesson_id], block_row)
            .context("Failed to query content blocks")?;
        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row.context("Failed to read content block row")?.into_block()?);
        }
        Ok(blocks)
    }

    pub fn update_block_content(
        &self,
        id: i64,
        content: &serde_json::Value,
    ) -> Result<Option<ContentBlock>> {
        let content_json =
            serde_json::to_string(content).context("Failed to serialize block content")?;
        let changed = self
            .conn
            .execute(
                "UPDATE content_blocks SET content = ?2 WHERE id = ?1",
                params![id, content_json],
            )
            .context("Failed to update block content")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_block(id)
    }

    /// Ordered snapshot of the whole course. `None` if the course is gone.
    pub fn load_course_tree(&self, course_id: i64) -> Result<Option<CourseTree>> {
        let Some(course) = self.get_course(course_id)? else {
            return Ok(None);
        };
        let mut modules = Vec::new();
        for module in self.list_modules(course_id)? {
            let mut lessons = Vec::new();
            for lesson in self.list_lessons(module.id)? {
                let blocks = self.list_blocks(lesson.id)?;
                lessons.push(LessonNode { lesson, blocks });
            }
            modules.push(ModuleNode { module, lessons });
        }
        Ok(Some(CourseTree { course, modules }))
    }

    fn next_position(&self, table: &str, parent_column: &str, parent_id: i64) -> Result<i32> {
        let max_pos: i32 = self
            .conn
            .query_row(
                &format!(
                    "SELECT COALESCE(MAX(position), -1) FROM {} WHERE {} = ?1",
                    table, parent_column
                ),
                params![parent_id],
                |row| row.get(0),
            )
            .context("Failed to get max position")?;
        Ok(max_pos + 1)
    }

    // ── Session progress ──────────────────────────────────────────────

    /// Atomically claim the session's run flag. Returns false when a run
    /// already holds it.
    pub fn begin_run(&self, session_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO session_progress (session_id, in_progress, status, updated_at)
                 VALUES (?1, 1, 'generating', datetime('now'))
                 ON CONFLICT(session_id) DO UPDATE
                     SET in_progress = 1, status = 'generating', updated_at = excluded.updated_at
                     WHERE session_progress.in_progress = 0",
                params![session_id],
            )
            .context("Failed to claim session run flag")?;
        Ok(changed > 0)
    }

    /// Clear the run flag and record the final status.
    pub fn end_run(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO session_progress (session_id, in_progress, status, updated_at)
                 VALUES (?1, 0, ?2, datetime('now'))
                 ON CONFLICT(session_id) DO UPDATE
                     SET in_progress = 0, status = excluded.status, updated_at = excluded.updated_at",
                params![session_id, status.as_str()],
            )
            .context("Failed to release session run flag")?;
        Ok(())
    }

    /// Update the coarse status without touching the run flag.
    pub fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO session_progress (session_id, in_progress, status, updated_at)
                 VALUES (?1, 0, ?2, datetime('now'))
                 ON CONFLICT(session_id) DO UPDATE
                     SET status = excluded.status, updated_at = excluded.updated_at",
                params![session_id, status.as_str()],
            )
            .context("Failed to update session status")?;
        Ok(())
    }

    pub fn add_generated_course(&self, session_id: &str, summary: &CourseSummary) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO session_courses (session_id, course_id, title, description, estimated_time_hours)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_id,
                    summary.course_id,
                    summary.title,
                    summary.description,
                    summary.estimated_time_hours,
                ],
            )
            .context("Failed to append generated course")?;
        Ok(())
    }

    pub fn get_session_progress(&self, session_id: &str) -> Result<SessionProgress> {
        let row: Option<(bool, String)> = self
            .conn
            .query_row(
                "SELECT in_progress, status FROM session_progress WHERE session_id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query session progress")?;

        let mut progress = SessionProgress::idle(session_id);
        if let Some((in_progress, status)) = row {
            progress.in_progress = in_progress;
            progress.status = SessionStatus::from_str(&status)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse session status")?;
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT course_id, title, description, estimated_time_hours
                 FROM session_courses WHERE session_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare session courses query")?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(CourseSummary {
                    course_id: row.get(0)?,
                    title: row.get(1)?,
                    description: row.get(2)?,
                    estimated_time_hours: row.get(3)?,
                })
            })
            .context("Failed to query session courses")?;
        for row in rows {
            progress
                .generated_courses
                .push(row.context("Failed to read session course row")?);
        }
        Ok(progress)
    }

    // ── Session event log ─────────────────────────────────────────────

    pub fn append_event(&self, session_id: &str, event: &ProgressEvent) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO session_events (session_id, event_id, who, event_type, text, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session_id,
                    event.id,
                    event.who.as_str(),
                    event.event_type.as_str(),
                    event.text,
                    event.ts,
                ],
            )
            .context("Failed to append session event")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Events in publish order, optionally only those after `after_seq`.
    pub fn list_events(&self, session_id: &str, after_seq: Option<i64>) -> Result<Vec<ProgressEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT event_id, who, event_type, text, ts FROM session_events
                 WHERE session_id = ?1 AND seq > ?2 ORDER BY seq",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![session_id, after_seq.unwrap_or(0)], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    who: row.get(1)?,
                    event_type: row.get(2)?,
                    text: row.get(3)?,
                    ts: row.get(4)?,
                })
            })
            .context("Failed to query session events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read session event row")?.into_event()?);
        }
        Ok(events)
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

struct TaskRow {
    id: String,
    parent_id: Option<String>,
    kind: String,
    params: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    session_id: Option<String>,
    user_id: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

fn task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        kind: row.get(2)?,
        params: row.get(3)?,
        status: row.get(4)?,
        result: row.get(5)?,
        error: row.get(6)?,
        session_id: row.get(7)?,
        user_id: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        finished_at: row.get(11)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let kind = TaskKind::from_str(&self.kind)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task kind")?;
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        let params =
            serde_json::from_str(&self.params).context("Failed to parse task params JSON")?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse task result JSON")?;

        Ok(Task {
            id: self.id,
            parent_id: self.parent_id,
            kind,
            params,
            status,
            result,
            error: self.error,
            session_id: self.session_id,
            user_id: self.user_id,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

fn module_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Module> {
    Ok(Module {
        id: row.get(0)?,
        course_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        goal: row.get(4)?,
        estimated_time_hours: row.get(5)?,
        position: row.get(6)?,
    })
}

fn lesson_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lesson> {
    Ok(Lesson {
        id: row.get(0)?,
        module_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        goal: row.get(4)?,
        estimated_time_hours: row.get(5)?,
        position: row.get(6)?,
    })
}

struct BlockRow {
    id: i64,
    lesson_id: i64,
    block_type: String,
    description: String,
    goal: String,
    outline: String,
    content: Option<String>,
    position: i32,
}

fn block_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockRow> {
    Ok(BlockRow {
        id: row.get(0)?,
        lesson_id: row.get(1)?,
        block_type: row.get(2)?,
        description: row.get(3)?,
        goal: row.get(4)?,
        outline: row.get(5)?,
        content: row.get(6)?,
        position: row.get(7)?,
    })
}

impl BlockRow {
    fn into_block(self) -> Result<ContentBlock> {
        let block_type = ContentType::from_str(&self.block_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse content block type")?;
        let content = self
            .content
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse block content JSON")?;
        Ok(ContentBlock {
            id: self.id,
            lesson_id: self.lesson_id,
            block_type,
            description: self.description,
            goal: self.goal,
            outline: self.outline,
            content,
            position: self.position,
        })
    }
}

struct EventRow {
    id: String,
    who: String,
    event_type: String,
    text: String,
    ts: f64,
}

impl EventRow {
    fn into_event(self) -> Result<ProgressEvent> {
        let who = EventWho::from_str(&self.who)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse event author")?;
        let event_type = EventType::from_str(&self.event_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse event type")?;
        Ok(ProgressEvent {
            who,
            event_type,
            text: self.text,
            id: self.id,
            ts: self.ts,
        })
    }
}
