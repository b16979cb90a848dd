use std::sync::Arc;
use std::time::Duration;

use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drumline=info".into()),
        )
        .init();

    // load config: DRUMLINE_CONFIG env > ~/.drumline/drumline.toml
    let config_path = std::env::var("DRUMLINE_CONFIG").ok();
    let config = drumline_core::DrumlineConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        let mut cfg = drumline_core::DrumlineConfig::default();
        cfg.validate();
        cfg
    });

    // initialize SQLite database — single file for all subsystems
    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(&db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

    // run all schema migrations (idempotent)
    drumline_exec::db::init_db(&db)?;
    drumline_scheduler::db::init_db(&db)?;
    info!("database schema ready");
    drop(db);

    // query backend client + retry policy shared by all executions
    let backend: Arc<dyn drumline_backend::QueryBackend> =
        Arc::new(drumline_backend::HttpQueryBackend::new(
            config.backend.base_url.clone(),
            config.backend.api_token.clone(),
            Duration::from_secs(config.backend.request_timeout_secs),
        ));
    let retry = drumline_backend::RetryPolicy::from(&config.retry);

    // build subsystems — each gets its own connection for thread safety
    let exec_store = drumline_exec::ExecutionStore::new(rusqlite::Connection::open(&db_path)?)?;
    let executions = Arc::new(drumline_exec::ExecutionManager::new(
        exec_store,
        backend,
        retry,
        &config.execution,
        &config.backend,
    ));
    let templates = Arc::new(drumline_exec::TemplateStore::new(rusqlite::Connection::open(
        &db_path,
    )?)?);
    let schedules = Arc::new(drumline_scheduler::ScheduleStore::new(
        rusqlite::Connection::open(&db_path)?,
    )?);

    let engine =
        drumline_scheduler::SchedulerEngine::new(schedules, templates, executions, &config.scheduler);

    // ctrl-c → watch channel → graceful engine shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(shutdown_rx).await;
    info!("scheduler stopped");
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
