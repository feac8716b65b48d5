use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use coursegen::config::CourseGenConfig;
use coursegen::generation::models::Depth;
use coursegen::logging::{LogFormat, init_logging};

mod cmd;

#[derive(Parser)]
#[command(name = "coursegen")]
#[command(version, about = "Queued, depth-limited course generation")]
pub struct Cli {
    /// Directory holding `.coursegen/` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Database path. Overrides coursegen.toml and COURSEGEN_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Log filter, e.g. "info" or "coursegen=debug". RUST_LOG wins when set.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log output format: text or json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP/WebSocket server and the worker pool
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of parallel stage workers
        #[arg(long)]
        workers: Option<usize>,

        /// Enable dev mode (bind 0.0.0.0, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and its schema, then exit
    InitDb,
    /// Run one generation in-process and print progress events
    Generate {
        /// File holding the learner's preference dialog
        #[arg(long)]
        transcript: PathBuf,

        /// Last stage to produce
        #[arg(long, default_value = "full")]
        depth: Depth,

        /// Session id (a fresh one is generated when omitted)
        #[arg(long)]
        session: Option<String>,

        /// Owner recorded on the generated course
        #[arg(long)]
        user_id: Option<String>,
    },
    /// View, validate or initialise coursegen.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default coursegen.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let mut config = CourseGenConfig::load_or_default(&project_dir)?;
    if let Some(path) = &cli.db_path {
        config.database.path = path.clone();
    } else if config.database.path.is_relative() {
        config.database.path = project_dir.join(&config.database.path);
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging)?;

    match &cli.command {
        Commands::Serve { port, workers, dev } => {
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(workers) = workers {
                config.worker.concurrency = *workers;
            }
            cmd::cmd_serve(config, *dev).await?;
        }
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::Generate {
            transcript,
            depth,
            session,
            user_id,
        } => {
            cmd::cmd_generate(
                &config,
                transcript,
                *depth,
                session.as_deref(),
                user_id.as_deref(),
            )
            .await?;
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, &config, command.clone())?,
    }

    Ok(())
}
