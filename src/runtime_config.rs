// =============================================================================
// Runtime Configuration — guardian settings and exchange credentials
// =============================================================================
//
// Layering: serde defaults → optional JSON file → environment overrides →
// validation. Every field carries `#[serde(default)]` so that a partial file
// (or none at all) still loads.
//
// Credentials never live in the JSON file; they come from the environment and
// their absence is fatal at startup.
// =============================================================================

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_stop_loss_check_interval_secs() -> u64 {
    30
}

fn default_max_loss_usdt() -> Decimal {
    Decimal::from(100)
}

fn default_notification_interval_secs() -> u64 {
    300
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_error_cooldown_secs() -> u64 {
    60
}

fn default_close_max_attempts() -> u32 {
    3
}

fn default_close_retry_delay_ms() -> u64 {
    1000
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_health_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_health_stale_after_secs() -> u64 {
    120
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Cadence ------------------------------------------------------------

    /// Seconds between position-monitor ticks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Seconds between stop-loss detection cycles.
    #[serde(default = "default_stop_loss_check_interval_secs")]
    pub stop_loss_check_interval_secs: u64,

    // --- Risk ---------------------------------------------------------------

    /// Unrealized loss (quote currency, positive number) at which a position
    /// is force-closed.
    #[serde(default = "default_max_loss_usdt")]
    pub max_loss_usdt: Decimal,

    /// Log the intended close and skip every mutating exchange call.
    #[serde(default)]
    pub dry_run: bool,

    // --- Alerts -------------------------------------------------------------

    /// Minimum seconds between repeated alerts for the same symbol.
    #[serde(default = "default_notification_interval_secs")]
    pub notification_interval_secs: u64,

    // --- Error handling -----------------------------------------------------

    /// Consecutive failed ticks before the monitor takes an extended cooldown.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    #[serde(default = "default_error_cooldown_secs")]
    pub error_cooldown_secs: u64,

    /// Attempts for the mandatory close submission.
    #[serde(default = "default_close_max_attempts")]
    pub close_max_attempts: u32,

    #[serde(default = "default_close_retry_delay_ms")]
    pub close_retry_delay_ms: u64,

    // --- Exchange -----------------------------------------------------------

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,

    /// Upper bound on any single outbound HTTP call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // --- Health -------------------------------------------------------------

    #[serde(default = "default_health_bind_addr")]
    pub health_bind_addr: String,

    /// A guardian whose last successful tick is older than this is unhealthy.
    #[serde(default = "default_health_stale_after_secs")]
    pub health_stale_after_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            stop_loss_check_interval_secs: default_stop_loss_check_interval_secs(),
            max_loss_usdt: default_max_loss_usdt(),
            dry_run: false,
            notification_interval_secs: default_notification_interval_secs(),
            max_consecutive_errors: default_max_consecutive_errors(),
            error_cooldown_secs: default_error_cooldown_secs(),
            close_max_attempts: default_close_max_attempts(),
            close_retry_delay_ms: default_close_retry_delay_ms(),
            base_url: default_base_url(),
            recv_window_ms: default_recv_window_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            health_bind_addr: default_health_bind_addr(),
            health_stale_after_secs: default_health_stale_after_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    /// File (if readable) + environment, validated.
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::load(path).unwrap_or_else(|e| {
            warn!(error = %e, "no usable config file, using defaults");
            Self::default()
        });
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment-style variables supplied by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn set<T: FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) -> Result<()>
        where
            T::Err: std::fmt::Display,
        {
            if let Some(raw) = lookup(key) {
                *slot = raw
                    .trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid value for {key} ('{raw}'): {e}"))?;
            }
            Ok(())
        }

        set(&lookup, "POLL_INTERVAL_SECS", &mut self.poll_interval_secs)?;
        set(&lookup, "STOP_LOSS_CHECK_INTERVAL_SECS", &mut self.stop_loss_check_interval_secs)?;
        set(&lookup, "MAX_LOSS_USDT", &mut self.max_loss_usdt)?;
        set(&lookup, "DRY_RUN", &mut self.dry_run)?;
        set(&lookup, "NOTIFICATION_INTERVAL_SECS", &mut self.notification_interval_secs)?;
        set(&lookup, "MAX_CONSECUTIVE_ERRORS", &mut self.max_consecutive_errors)?;
        set(&lookup, "ERROR_COOLDOWN_SECS", &mut self.error_cooldown_secs)?;
        set(&lookup, "CLOSE_MAX_ATTEMPTS", &mut self.close_max_attempts)?;
        set(&lookup, "CLOSE_RETRY_DELAY_MS", &mut self.close_retry_delay_ms)?;
        set(&lookup, "BINANCE_BASE_URL", &mut self.base_url)?;
        set(&lookup, "RECV_WINDOW_MS", &mut self.recv_window_ms)?;
        set(&lookup, "REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs)?;
        set(&lookup, "HEALTH_BIND_ADDR", &mut self.health_bind_addr)?;
        set(&lookup, "HEALTH_STALE_AFTER_SECS", &mut self.health_stale_after_secs)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 || self.stop_loss_check_interval_secs == 0 {
            bail!("poll and stop-loss check intervals must be positive");
        }
        if self.max_loss_usdt <= Decimal::ZERO {
            bail!("max_loss_usdt must be positive (got {})", self.max_loss_usdt);
        }
        if self.close_max_attempts == 0 {
            bail!("close_max_attempts must be at least 1");
        }
        if self.max_consecutive_errors == 0 {
            bail!("max_consecutive_errors must be at least 1");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stop_loss_check_interval(&self) -> Duration {
        Duration::from_secs(self.stop_loss_check_interval_secs)
    }

    pub fn notification_interval(&self) -> Duration {
        Duration::from_secs(self.notification_interval_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }

    pub fn close_retry_delay(&self) -> Duration {
        Duration::from_millis(self.close_retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_stale_after(&self) -> Duration {
        Duration::from_secs(self.health_stale_after_secs)
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Secrets read from the environment. Never serialised.
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub telegram: Option<TelegramCredentials>,
}

pub struct TelegramCredentials {
    pub bot_token: String,
    pub chat_id: i64,
}

impl Credentials {
    /// Missing exchange credentials are fatal; Telegram is optional but must
    /// be complete and well-formed when present.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .with_context(|| format!("required environment variable {key} is not set"))
        };

        let api_key = required("BINANCE_API_KEY")?;
        let api_secret = required("BINANCE_API_SECRET")?;

        let token = lookup("TELEGRAM_BOT_TOKEN").filter(|v| !v.trim().is_empty());
        let chat = lookup("TELEGRAM_CHAT_ID").filter(|v| !v.trim().is_empty());
        let telegram = match (token, chat) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramCredentials {
                bot_token: bot_token.trim().to_string(),
                chat_id: chat_id
                    .trim()
                    .parse()
                    .with_context(|| format!("TELEGRAM_CHAT_ID '{chat_id}' is not an integer"))?,
            }),
            (None, None) => None,
            _ => bail!("TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together"),
        };

        Ok(Self {
            api_key,
            api_secret,
            telegram,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("telegram", &self.telegram.is_some())
            .finish()
    }
}
