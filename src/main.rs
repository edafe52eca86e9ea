use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use rori::config::RoriConfig;
use rori::modules::{ModuleContext, StaticLoader};
use rori::registry::ModuleRegistry;
use rori::router::Router;
use rori::scheduler::{Scheduler, spawn_ticker};
use rori::sink::StdoutSink;
use rori::source::{Dispatcher, FileSource, InteractionSource, StdinSource};
use rori::store::{LibSqlBackend, ModuleCatalog};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RoriConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref())?;

    eprintln!("🤖 RORI v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Modules: {}", config.modules_dir.display());
    match &config.input_path {
        Some(path) => eprintln!("   Replaying interactions from {}.\n", path.display()),
        None => eprintln!("   Reading one JSON interaction per line from stdin.\n"),
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Registry ─────────────────────────────────────────────────────────
    let registry = Arc::new(
        ModuleRegistry::load(db.as_ref())
            .await
            .context("failed to load module registry")?,
    );
    if registry.is_empty().await {
        tracing::warn!("No modules registered; run rori-seed to install the defaults");
    }
    let content_types = db.module_content_types().await?;
    tracing::info!(content_types = ?content_types, "Accepted payload kinds");

    // ── Router ───────────────────────────────────────────────────────────
    let loader = Arc::new(StaticLoader::with_builtins(
        config.modules_dir.clone(),
        config.lang.clone(),
    ));
    tracing::info!(
        dir = %loader.modules_dir().display(),
        locations = ?loader.locations(),
        "Module implementations available"
    );

    let ctx = ModuleContext::new(db.clone(), db.clone(), Arc::new(StdoutSink::new()));
    let router = Arc::new(
        Router::new(registry, loader, ctx).with_module_timeout(config.module_timeout),
    );

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(db.clone(), db.clone(), router.clone()));
    let planned = scheduler
        .refresh(chrono::Utc::now().naive_utc())
        .await
        .context("failed to load scheduled tasks")?;
    tracing::info!(tasks = planned, "Scheduler started");
    let ticker = spawn_ticker(scheduler, config.scheduler_tick);

    // ── Dispatch ─────────────────────────────────────────────────────────
    let dispatcher = Dispatcher::new(router, config.max_concurrent_cycles);
    let source: Box<dyn InteractionSource> = match &config.input_path {
        Some(path) => Box::new(FileSource::new(path.clone())),
        None => Box::new(StdinSource::new()),
    };
    tokio::select! {
        stats = dispatcher.run(source.as_ref()) => {
            let stats = stats?;
            tracing::info!(
                received = stats.received,
                rejected = stats.rejected,
                dispatched = stats.dispatched,
                "Shutting down"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

    ticker.abort();
    Ok(())
}

/// Console logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(dir) = log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        return Ok(None);
    };

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("rori")
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("failed to create log file in {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}
