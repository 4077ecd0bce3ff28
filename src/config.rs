// =============================================================================
// Application Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Alphadesk execution core.  Every tunable
// the pipeline, overlay, or sentiment recombiner consumes lives here.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_database_path() -> String {
    "alphadesk.db".to_string()
}

fn default_min_signals() -> usize {
    2
}

fn default_min_scale() -> f64 {
    0.25
}

fn default_max_scale() -> f64 {
    1.25
}

fn default_news_weight() -> f64 {
    0.4
}

fn default_social_weight() -> f64 {
    0.3
}

fn default_velocity_weight() -> f64 {
    0.3
}

fn default_sentiment_lookback_days() -> i64 {
    30
}

fn default_broker_timeout_secs() -> u64 {
    30
}

fn default_store_busy_timeout_ms() -> u64 {
    5000
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level configuration for the Alphadesk execution core.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // --- Storage -------------------------------------------------------------

    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_store_busy_timeout_ms")]
    pub store_busy_timeout_ms: u64,

    // --- Macro risk overlay --------------------------------------------------

    /// When false, no overlay is computed or applied (scale factor = 1.0).
    #[serde(default = "default_true")]
    pub macro_overlay_enabled: bool,

    /// Minimum available macro signals required for a non-neutral overlay.
    #[serde(default = "default_min_signals")]
    pub macro_overlay_min_signals: usize,

    /// Lower clamp for the overlay position scale factor.
    #[serde(default = "default_min_scale")]
    pub macro_overlay_min_scale: f64,

    /// Upper clamp for the overlay position scale factor.
    #[serde(default = "default_max_scale")]
    pub macro_overlay_max_scale: f64,

    // --- Sentiment recombination ---------------------------------------------
    // Weights used by the nightly sentiment stage when folding news and social
    // scores into the combined score (must sum to 1.0 with velocity).

    #[serde(default = "default_news_weight")]
    pub sentiment_news_weight: f64,

    #[serde(default = "default_social_weight")]
    pub sentiment_social_weight: f64,

    #[serde(default = "default_velocity_weight")]
    pub sentiment_velocity_weight: f64,

    /// Days of sentiment_history consulted by the temporal analyzer.
    #[serde(default = "default_sentiment_lookback_days")]
    pub sentiment_lookback_days: i64,

    // --- Broker --------------------------------------------------------------

    /// Per-request timeout for broker calls, in seconds.
    #[serde(default = "default_broker_timeout_secs")]
    pub broker_timeout_secs: u64,

    /// Operator-level credentials consumed by the external data fetchers.
    /// Agent execution always uses the owning user's stored credentials;
    /// agents whose owner has none are skipped, never rerouted here.
    #[serde(default)]
    pub alpaca_api_key: Option<String>,

    #[serde(default)]
    pub alpaca_api_secret: Option<String>,

    #[serde(default = "default_true")]
    pub alpaca_paper_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            store_busy_timeout_ms: default_store_busy_timeout_ms(),
            macro_overlay_enabled: true,
            macro_overlay_min_signals: default_min_signals(),
            macro_overlay_min_scale: default_min_scale(),
            macro_overlay_max_scale: default_max_scale(),
            sentiment_news_weight: default_news_weight(),
            sentiment_social_weight: default_social_weight(),
            sentiment_velocity_weight: default_velocity_weight(),
            sentiment_lookback_days: default_sentiment_lookback_days(),
            broker_timeout_secs: default_broker_timeout_secs(),
            alpaca_api_key: None,
            alpaca_api_secret: None,
            alpaca_paper_mode: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            database = %config.database_path,
            overlay_enabled = config.macro_overlay_enabled,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Apply environment variable overrides on top of the loaded file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("ALPHADESK_DB") {
            if !path.is_empty() {
                self.database_path = path;
            }
        }
        if let Ok(key) = std::env::var("ALPACA_API_KEY") {
            if !key.is_empty() {
                self.alpaca_api_key = Some(key);
            }
        }
        if let Ok(secret) = std::env::var("ALPACA_API_SECRET") {
            if !secret.is_empty() {
                self.alpaca_api_secret = Some(secret);
            }
        }
        if let Ok(v) = std::env::var("MACRO_OVERLAY_ENABLED") {
            if let Ok(flag) = v.parse::<bool>() {
                self.macro_overlay_enabled = flag;
            }
        }
    }
}
