// =============================================================================
// Sentiment pipeline — temporal enrichment + factor integration
// =============================================================================

pub mod integrator;
pub mod temporal;

use serde::{Deserialize, Serialize};

/// Sentiment data for a single stock, sourced from the stocks table and
/// enriched with temporal features before integration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentimentInput {
    pub symbol: String,
    /// -100 to +100
    pub news_sentiment: Option<f64>,
    /// -100 to +100
    pub social_sentiment: Option<f64>,
    /// -100 to +100
    pub combined_sentiment: Option<f64>,
    /// Daily rate of change in sentiment points.
    pub velocity: Option<f64>,

    // Temporal features (populated by the temporal analyzer)
    /// Consecutive days positive (>0) or negative (<0).
    pub streak_days: i64,
    /// Least-squares slope over the lookback window.
    pub trend_slope: Option<f64>,
    /// 0-1; low variance = high persistence.
    pub persistence: Option<f64>,
    /// Sudden sentiment regime change.
    pub is_breakout: bool,
}

impl SentimentInput {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }
}
