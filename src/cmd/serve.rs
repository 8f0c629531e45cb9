//! HTTP server command: `leadboard serve`.

use std::path::PathBuf;

use anyhow::Result;
use leadboard::config::LeadboardConfig;

/// CLI overrides applied on top of file and environment configuration.
pub struct ServeOverrides {
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
}

pub async fn cmd_serve(mut config: LeadboardConfig, overrides: ServeOverrides) -> Result<()> {
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(db_path) = overrides.db_path {
        config.server.db_path = db_path;
    }
    if overrides.dev {
        config.server.dev_mode = true;
    }

    leadboard::crm::server::start_server(config).await
}
