//! Database and config bootstrap: `leadboard init`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use leadboard::config::{DEFAULT_CONFIG_FILE, LeadboardConfig};
use leadboard::crm::server::open_database;

pub fn cmd_init(
    mut config: LeadboardConfig,
    db_path: Option<PathBuf>,
    config_path: Option<&Path>,
) -> Result<()> {
    if let Some(db_path) = db_path {
        config.server.db_path = db_path;
    }
    open_database(&config)?;
    println!(
        "Leadboard database initialized at {}",
        config.server.db_path.display()
    );

    let config_path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    if config_path.exists() {
        return Ok(());
    }
    // Secrets stay in the environment.
    config.payments.webhook_secret = None;
    let content = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
    std::fs::write(config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Wrote default configuration to {}", config_path.display());
    Ok(())
}
