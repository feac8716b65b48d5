//! Server and database commands — `coursegen serve`, `coursegen init-db`.

use anyhow::Result;

use coursegen::config::CourseGenConfig;
use coursegen::generation::db::GenerationDb;
use coursegen::generation::server::{ServerConfig, start_server};

pub async fn cmd_serve(config: CourseGenConfig, dev: bool) -> Result<()> {
    start_server(ServerConfig {
        config,
        dev_mode: dev,
    })
    .await
}

pub fn cmd_init_db(config: &CourseGenConfig) -> Result<()> {
    GenerationDb::new(&config.database.path)?;
    println!(
        "Generation database initialized at {}",
        config.database.path.display()
    );
    Ok(())
}
