//! Layered configuration for leadboard.
//!
//! Settings are read from `leadboard.toml`, then overridden by environment
//! variables, then by CLI flags (applied by the `serve` command).
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! db_path = ".leadboard/leadboard.db"
//! dev_mode = false
//!
//! [pipeline]
//! intake_stage_label = "Nuevo"
//! move_timeout_secs = 15
//! feed_capacity = 256
//! board_tag_limit = 3
//!
//! [payments]
//! platform_fee_percent = 3
//! processor_fee_percent = 0
//! signature_tolerance_secs = 300
//! default_currency = "mxn"
//! webhook_secret = "whsec_..."
//!
//! [notifications]
//! relay_url = "https://mail-relay.internal/send"
//! from_address = "no-reply@promedia.mx"
//! ```
//!
//! Environment overrides: `LEADBOARD_PORT`, `LEADBOARD_DB_PATH`,
//! `STRIPE_WEBHOOK_SECRET`, `LEADBOARD_MAIL_RELAY_URL`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "leadboard.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadboardConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub payments: PaymentsSection,
    #[serde(default)]
    pub notifications: NotificationsSection,
}

/// HTTP listener and storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS and bind on all interfaces.
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".leadboard/leadboard.db")
}

/// Board behaviour: intake column, stage-move timeout, feed sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Display name of the column that receives newly inserted leads
    /// (matched case-insensitively; falls back to the first column).
    #[serde(default = "default_intake_stage_label")]
    pub intake_stage_label: String,
    /// Seconds an optimistic stage move may stay pending before rollback.
    #[serde(default = "default_move_timeout_secs")]
    pub move_timeout_secs: u64,
    /// Buffered events per tenant change-feed channel.
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
    /// Tags shown per lead card on the board.
    #[serde(default = "default_board_tag_limit")]
    pub board_tag_limit: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            intake_stage_label: default_intake_stage_label(),
            move_timeout_secs: default_move_timeout_secs(),
            feed_capacity: default_feed_capacity(),
            board_tag_limit: default_board_tag_limit(),
        }
    }
}

impl PipelineSection {
    pub fn move_timeout(&self) -> Duration {
        Duration::from_secs(self.move_timeout_secs)
    }
}

fn default_intake_stage_label() -> String {
    "Nuevo".to_string()
}

fn default_move_timeout_secs() -> u64 {
    15
}

fn default_feed_capacity() -> usize {
    256
}

fn default_board_tag_limit() -> usize {
    3
}

/// Fee schedule and webhook verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentsSection {
    #[serde(default = "default_platform_fee_percent")]
    pub platform_fee_percent: Decimal,
    #[serde(default)]
    pub processor_fee_percent: Decimal,
    #[serde(default = "default_signature_tolerance_secs")]
    pub signature_tolerance_secs: u64,
    #[serde(default = "default_currency")]
    pub default_currency: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl Default for PaymentsSection {
    fn default() -> Self {
        Self {
            platform_fee_percent: default_platform_fee_percent(),
            processor_fee_percent: Decimal::ZERO,
            signature_tolerance_secs: default_signature_tolerance_secs(),
            default_currency: default_currency(),
            webhook_secret: None,
        }
    }
}

fn default_platform_fee_percent() -> Decimal {
    Decimal::from(3)
}

fn default_signature_tolerance_secs() -> u64 {
    300
}

fn default_currency() -> String {
    "mxn".to_string()
}

/// Payment confirmation delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsSection {
    /// HTTP mail relay endpoint; confirmations are only logged when unset.
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default = "default_from_address")]
    pub from_address: String,
}

impl Default for NotificationsSection {
    fn default() -> Self {
        Self {
            relay_url: None,
            from_address: default_from_address(),
        }
    }
}

fn default_from_address() -> String {
    "no-reply@promedia.mx".to_string()
}

impl LeadboardConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse leadboard.toml")
    }

    /// Load the file if present (defaults otherwise), then apply the
    /// process environment.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("LEADBOARD_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid LEADBOARD_PORT '{}'", port))?;
        }
        if let Some(db_path) = lookup("LEADBOARD_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Some(secret) = lookup("STRIPE_WEBHOOK_SECRET").filter(|s| !s.is_empty()) {
            self.payments.webhook_secret = Some(secret);
        }
        if let Some(url) = lookup("LEADBOARD_MAIL_RELAY_URL").filter(|s| !s.is_empty()) {
            self.notifications.relay_url = Some(url);
        }
        Ok(())
    }

    /// Signature timestamp tolerance as a `Duration`.
    pub fn signature_tolerance(&self) -> Duration {
        Duration::from_secs(self.payments.signature_tolerance_secs)
    }
}
