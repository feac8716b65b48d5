//! Configuration view and validation commands — `coursegen config`.

use anyhow::Result;

use coursegen::config::{CONFIG_DIR, CONFIG_FILE, CourseGenConfig};

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &std::path::Path,
    effective: &CourseGenConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Coursegen Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}; using defaults.", CONFIG_FILE, config_path.display());
            }
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!("[server]");
            println!("  host = \"{}\"", effective.server.host);
            println!("  port = {}", effective.server.port);
            println!("[database]");
            println!("  path = \"{}\"", effective.database.path.display());
            println!("[worker]");
            println!("  concurrency = {}", effective.worker.concurrency);
            println!("  job_timeout_secs = {}", effective.worker.job_timeout_secs);
            println!("[ledger]");
            println!("  lookup_retries = {}", effective.ledger.lookup_retries);
            println!("  lookup_delay_ms = {}", effective.ledger.lookup_delay_ms);
            println!("[provider]");
            println!("  base_url = \"{}\"", effective.provider.base_url);
            println!("  model = \"{}\"", effective.provider.model);
            println!("  temperature = {}", effective.provider.temperature);
            println!(
                "  api_key = {}",
                if effective.provider.api_key.is_some() {
                    "(set)"
                } else {
                    "(not set)"
                }
            );
            println!("[limits]");
            println!("  max_modules = {}", effective.limits.max_modules);
            println!("  max_lessons = {}", effective.limits.max_lessons);
            println!("  max_blocks = {}", effective.limits.max_blocks);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = effective.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir)?;
            }

            CourseGenConfig::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [provider] base_url, model, temperature");
            println!("  - [limits] max_modules, max_lessons, max_blocks");
            println!("  - [worker] concurrency, job_timeout_secs");
            println!("Set COURSEGEN_API_KEY in the environment or .env; it is never written to the file.");
            println!();
        }
    }

    Ok(())
}
