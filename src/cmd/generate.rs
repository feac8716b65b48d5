//! In-process generation run — `coursegen generate`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use coursegen::config::CourseGenConfig;
use coursegen::generation::db::{DbHandle, GenerationDb};
use coursegen::generation::events::next_session_event;
use coursegen::generation::models::{Depth, EventType};
use coursegen::generation::provider::HttpProvider;
use coursegen::generation::server::Services;

pub async fn cmd_generate(
    config: &CourseGenConfig,
    transcript: &Path,
    depth: Depth,
    session: Option<&str>,
    user_id: Option<&str>,
) -> Result<()> {
    let history = std::fs::read_to_string(transcript)
        .with_context(|| format!("Failed to read transcript: {}", transcript.display()))?;
    if history.trim().is_empty() {
        bail!("Transcript {} is empty", transcript.display());
    }

    let db = GenerationDb::new(&config.database.path)?;
    let provider = HttpProvider::new(&config.provider)?;
    let services = Services::new(DbHandle::new(db), Arc::new(provider), config);
    let workers = services.spawn_workers(config);

    let session_id = session
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    // Subscribe before starting so the first events are not missed.
    let mut rx = services.state.events.subscribe();
    let orchestrator = services.state.orchestrator.clone();

    let Some(run_id) = orchestrator
        .start_run(&history, depth, &session_id, user_id)
        .await?
    else {
        workers.shutdown();
        bail!("Session {} already has a generation run in progress", session_id);
    };
    println!("Run {} started (session {}, depth {})", run_id, session_id, depth);

    // A stage stuck past the worker timeout never reports again.
    let idle_limit = Duration::from_secs(config.worker.job_timeout_secs + 5);
    let mut failure = None;
    loop {
        let next = next_session_event(&mut rx, &session_id);
        let event = match tokio::time::timeout(idle_limit, next).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                workers.shutdown();
                bail!(
                    "No progress for {}s; run {} is still marked in progress",
                    idle_limit.as_secs(),
                    run_id
                );
            }
        };
        println!("[{}] {}", event.event_type.as_str(), event.text);
        if event.event_type == EventType::CourseGenerationError {
            failure = Some(event.text);
            break;
        }
        if event.event_type.is_terminal() {
            break;
        }
    }
    workers.shutdown();

    if let Some(message) = failure {
        bail!("Generation failed: {}", message);
    }

    let progress = orchestrator.sessions().snapshot(&session_id).await?;
    for course in &progress.generated_courses {
        println!(
            "Course {}: {} ({:.1} h)",
            course.course_id, course.title, course.estimated_time_hours
        );
    }
    Ok(())
}
