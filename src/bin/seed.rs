//! Install the default modules into the registry table.
//!
//! Existing rows with the same names are updated in place, so running this twice
//! is harmless. Pass `--list` to print the table afterwards.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use rori::config::RoriConfig;
use rori::registry::default_descriptors;
use rori::store::{LibSqlBackend, ModuleCatalog};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let list = std::env::args().skip(1).any(|arg| arg == "--list");
    let config = RoriConfig::from_env().context("invalid configuration")?;
    let db = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;

    for descriptor in default_descriptors() {
        descriptor
            .compile_condition()
            .with_context(|| format!("default module {} is invalid", descriptor.name))?;
        db.upsert_module(&descriptor).await?;
        tracing::info!(
            module = %descriptor.name,
            priority = descriptor.priority,
            location = %descriptor.location,
            "Module installed"
        );
    }

    if list {
        for d in db.list_modules().await? {
            println!(
                "{:<16} priority={:<3} enabled={:<5} type={:<12} path={:<20} condition={}",
                d.name, d.priority, d.enabled, d.content_type, d.location, d.condition
            );
        }
    }
    Ok(())
}
