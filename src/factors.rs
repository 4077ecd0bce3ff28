// =============================================================================
// Factor Calculator — cross-sectional percentile scoring
// =============================================================================
//
// Produces the five quantitative factor scores (momentum, value, quality,
// dividend, volatility) for a stock universe, each a 0-100 percentile within
// the universe, plus a weighted composite.
//
// Error policy: any missing or non-finite input yields a neutral 50 for that
// factor; nothing is raised upward.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Per-symbol market data consumed by the scoring stages and strategies.
///
/// `price_history` is ordered oldest to newest and capped at ~400 trading
/// days by the loader.  `integrated_composite` is injected per-agent by the
/// strategy engine after sentiment integration.
#[derive(Debug, Clone, Default)]
pub struct MarketRecord {
    pub symbol: String,
    pub current_price: Option<f64>,
    pub price_history: Vec<f64>,
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub roe: Option<f64>,
    pub profit_margin: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub dividend_growth_5y: Option<f64>,
    pub ma_30: Option<f64>,
    pub ma_100: Option<f64>,
    pub ma_200: Option<f64>,
    pub atr: Option<f64>,
    pub sector: Option<String>,
    /// Factor composite persisted by the nightly scoring stage.
    pub composite_score: Option<f64>,
    /// Agent-specific blended score injected by the strategy engine.
    pub integrated_composite: Option<f64>,
}

impl MarketRecord {
    /// Current price, falling back to the latest close.
    pub fn price(&self) -> Option<f64> {
        self.current_price.or_else(|| self.price_history.last().copied())
    }
}

/// Weights over the five quant factors plus sentiment.
///
/// The factor calculator consumes only the five quant weights (renormalised
/// to sum to 1); the sentiment weight is used by the integrator's blend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorWeights {
    pub momentum: f64,
    pub value: f64,
    pub quality: f64,
    pub dividend: f64,
    pub volatility: f64,
    pub sentiment: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            momentum: 0.2,
            value: 0.2,
            quality: 0.2,
            dividend: 0.2,
            volatility: 0.2,
            sentiment: 0.0,
        }
    }
}

impl FactorWeights {
    /// The five quant weights renormalised to sum to 1.0 (sentiment ignored).
    pub fn quant_normalised(&self) -> (f64, f64, f64, f64, f64) {
        let total =
            self.momentum + self.value + self.quality + self.dividend + self.volatility;
        if total <= 0.0 {
            return (0.2, 0.2, 0.2, 0.2, 0.2);
        }
        (
            self.momentum / total,
            self.value / total,
            self.quality / total,
            self.dividend / total,
            self.volatility / total,
        )
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// All factor scores for a single stock (0-100; 100 = best).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorScores {
    pub symbol: String,
    pub momentum_score: f64,
    pub value_score: f64,
    pub quality_score: f64,
    pub dividend_score: f64,
    pub volatility_score: f64,
    pub composite_score: f64,

    // Component details for transparency
    pub momentum_6m: Option<f64>,
    pub momentum_12m: Option<f64>,
    pub ma_alignment: Option<f64>,
    pub atr_percent: Option<f64>,
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

/// Minimum daily closes required before a symbol contributes momentum.
const MIN_MOMENTUM_HISTORY: usize = 126;

/// Calculates factor scores for a universe of stocks.
///
/// Uses percentile ranking within the universe (average rank for ties) so
/// scores are comparable across factors.  Value and quality percentiles are
/// computed within sectors when `sector_aware` is set.
pub struct FactorCalculator {
    sector_aware: bool,
}

impl FactorCalculator {
    pub fn new(sector_aware: bool) -> Self {
        Self { sector_aware }
    }

    /// Calculate all factor scores for a universe.
    pub fn calculate_all(
        &self,
        market_data: &HashMap<String, MarketRecord>,
        factor_weights: Option<&FactorWeights>,
    ) -> HashMap<String, FactorScores> {
        let mut results = HashMap::new();
        if market_data.is_empty() {
            return results;
        }

        let momentum_raw = Self::momentum_raw(market_data);
        let value_raw = self.value_raw(market_data);
        let quality_raw = Self::quality_raw(market_data);
        let dividend_raw = Self::dividend_raw(market_data);
        let volatility_raw = Self::volatility_raw(market_data);

        let momentum_scores = to_percentiles(&momentum_raw, false);
        let value_scores = to_percentiles(&value_raw, false);
        let quality_scores = to_percentiles(&quality_raw, false);
        let dividend_scores = to_percentiles(&dividend_raw, false);
        // Lower volatility = higher score.
        let volatility_scores = to_percentiles(&volatility_raw, true);

        let weights = factor_weights.copied().unwrap_or_default();
        let (w_m, w_v, w_q, w_d, w_vol) = weights.quant_normalised();

        for (symbol, record) in market_data {
            let m_score = momentum_scores.get(symbol).copied().unwrap_or(50.0);
            let v_score = value_scores.get(symbol).copied().unwrap_or(50.0);
            let q_score = quality_scores.get(symbol).copied().unwrap_or(50.0);
            let d_score = dividend_scores.get(symbol).copied().unwrap_or(50.0);
            let vol_score = volatility_scores.get(symbol).copied().unwrap_or(50.0);

            let composite = m_score * w_m
                + v_score * w_v
                + q_score * w_q
                + d_score * w_d
                + vol_score * w_vol;

            let current = record.price();

            results.insert(
                symbol.clone(),
                FactorScores {
                    symbol: symbol.clone(),
                    momentum_score: round2(m_score),
                    value_score: round2(v_score),
                    quality_score: round2(q_score),
                    dividend_score: round2(d_score),
                    volatility_score: round2(vol_score),
                    composite_score: round2(composite),
                    momentum_6m: safe_momentum(&record.price_history, 126),
                    momentum_12m: safe_momentum(&record.price_history, 252),
                    ma_alignment: ma_alignment(record, current),
                    atr_percent: atr_percent(record, current),
                },
            );
        }

        results
    }

    // -------------------------------------------------------------------------
    // Raw factor values
    // -------------------------------------------------------------------------

    /// Momentum raw = 0.4·6m + 0.3·12m-skip-1m + 0.3·MA-alignment, all on a
    /// percent scale.  Symbols with fewer than 126 closes contribute nothing.
    fn momentum_raw(market_data: &HashMap<String, MarketRecord>) -> HashMap<String, f64> {
        let mut results = HashMap::new();

        for (symbol, record) in market_data {
            let prices = &record.price_history;
            if prices.len() < MIN_MOMENTUM_HISTORY {
                continue;
            }

            let current = record.price();
            let mom_6m = match safe_momentum(prices, 126) {
                Some(m) => m,
                None => continue,
            };

            let mom_12m_skip = if prices.len() >= 252 {
                let price_12m_ago = prices[prices.len() - 252];
                let price_1m_ago = if prices.len() >= 21 {
                    prices[prices.len() - 21]
                } else {
                    prices[prices.len() - 1]
                };
                if price_12m_ago > 0.0 {
                    (price_1m_ago - price_12m_ago) / price_12m_ago
                } else {
                    0.0
                }
            } else {
                mom_6m * 0.5
            };

            // Normalize MA alignment from [-1,1] to [0,1]
            let ma_norm = ma_alignment(record, current)
                .map(|a| (a + 1.0) / 2.0)
                .unwrap_or(0.5);

            let raw = 0.4 * (mom_6m * 100.0)
                + 0.3 * (mom_12m_skip * 100.0)
                + 0.3 * (ma_norm * 100.0);
            results.insert(symbol.clone(), raw);
        }

        results
    }

    /// Value raw = 0.5·inverted-P/E percentile + 0.5·inverted-P/B percentile,
    /// computed within sectors when sector-aware.
    fn value_raw(&self, market_data: &HashMap<String, MarketRecord>) -> HashMap<String, f64> {
        if !self.sector_aware {
            return Self::value_for_group(market_data.iter().collect());
        }

        let mut sector_groups: HashMap<String, Vec<(&String, &MarketRecord)>> = HashMap::new();
        for entry in market_data {
            let sector = entry
                .1
                .sector
                .clone()
                .unwrap_or_else(|| "Unknown".to_string());
            sector_groups.entry(sector).or_default().push(entry);
        }

        let mut results = HashMap::new();
        for (_, group) in sector_groups {
            results.extend(Self::value_for_group(group));
        }
        results
    }

    fn value_for_group(group: Vec<(&String, &MarketRecord)>) -> HashMap<String, f64> {
        let mut pe_values = HashMap::new();
        let mut pb_values = HashMap::new();

        for (symbol, record) in &group {
            // Filter out negative and extreme multiples.
            if let Some(pe) = finite(record.pe_ratio) {
                if pe > 0.0 && pe < 200.0 {
                    pe_values.insert((*symbol).clone(), pe);
                }
            }
            if let Some(pb) = finite(record.pb_ratio) {
                if pb > 0.0 && pb < 50.0 {
                    pb_values.insert((*symbol).clone(), pb);
                }
            }
        }

        let pe_percentiles = to_percentiles(&pe_values, true);
        let pb_percentiles = to_percentiles(&pb_values, true);

        let mut results = HashMap::new();
        for (symbol, _) in group {
            let pe_score = pe_percentiles.get(symbol).copied().unwrap_or(50.0);
            let pb_score = pb_percentiles.get(symbol).copied().unwrap_or(50.0);
            results.insert(symbol.clone(), 0.5 * pe_score + 0.5 * pb_score);
        }
        results
    }

    /// Quality raw = 0.4·ROE + 0.3·margin + 0.3·inverted-debt percentiles.
    fn quality_raw(market_data: &HashMap<String, MarketRecord>) -> HashMap<String, f64> {
        let mut roe_values = HashMap::new();
        let mut margin_values = HashMap::new();
        let mut debt_values = HashMap::new();

        for (symbol, record) in market_data {
            if let Some(roe) = finite(record.roe) {
                if roe > -0.5 && roe < 1.0 {
                    roe_values.insert(symbol.clone(), roe);
                }
            }
            if let Some(margin) = finite(record.profit_margin) {
                if margin > -0.5 && margin < 1.0 {
                    margin_values.insert(symbol.clone(), margin);
                }
            }
            if let Some(debt) = finite(record.debt_to_equity) {
                if (0.0..10.0).contains(&debt) {
                    debt_values.insert(symbol.clone(), debt);
                }
            }
        }

        let roe_percentiles = to_percentiles(&roe_values, false);
        let margin_percentiles = to_percentiles(&margin_values, false);
        let debt_percentiles = to_percentiles(&debt_values, true);

        let mut results = HashMap::new();
        for symbol in market_data.keys() {
            let roe_score = roe_percentiles.get(symbol).copied().unwrap_or(50.0);
            let margin_score = margin_percentiles.get(symbol).copied().unwrap_or(50.0);
            let debt_score = debt_percentiles.get(symbol).copied().unwrap_or(50.0);
            results.insert(
                symbol.clone(),
                0.4 * roe_score + 0.3 * margin_score + 0.3 * debt_score,
            );
        }
        results
    }

    /// Dividend raw = 0.6·yield percentile + 0.4·5y-growth percentile;
    /// non-payers score 0.
    fn dividend_raw(market_data: &HashMap<String, MarketRecord>) -> HashMap<String, f64> {
        let mut yield_values = HashMap::new();
        let mut growth_values = HashMap::new();

        for (symbol, record) in market_data {
            if let Some(div_yield) = finite(record.dividend_yield) {
                if div_yield > 0.0 {
                    yield_values.insert(symbol.clone(), div_yield);
                }
            }
            if let Some(growth) = finite(record.dividend_growth_5y) {
                growth_values.insert(symbol.clone(), growth);
            }
        }

        let yield_percentiles = to_percentiles(&yield_values, false);
        let growth_percentiles = to_percentiles(&growth_values, false);

        let mut results = HashMap::new();
        for (symbol, record) in market_data {
            let pays = finite(record.dividend_yield).map(|y| y > 0.0).unwrap_or(false);
            if pays {
                let yield_score = yield_percentiles.get(symbol).copied().unwrap_or(50.0);
                let growth_score = growth_percentiles.get(symbol).copied().unwrap_or(50.0);
                results.insert(symbol.clone(), 0.6 * yield_score + 0.4 * growth_score);
            } else {
                results.insert(symbol.clone(), 0.0);
            }
        }
        results
    }

    /// Volatility raw = ATR/price·100, falling back to 20-day annualised
    /// stdev of daily returns when ATR is absent.
    fn volatility_raw(market_data: &HashMap<String, MarketRecord>) -> HashMap<String, f64> {
        let mut results = HashMap::new();

        for (symbol, record) in market_data {
            let current = record.current_price;
            match (current, finite(record.atr)) {
                (Some(price), Some(atr)) if price > 0.0 => {
                    results.insert(symbol.clone(), atr / price * 100.0);
                }
                _ => {
                    let prices = &record.price_history;
                    if prices.len() >= 21 {
                        let window = &prices[prices.len() - 21..];
                        let returns: Vec<f64> = window
                            .windows(2)
                            .filter(|w| w[0] > 0.0)
                            .map(|w| (w[1] - w[0]) / w[0])
                            .collect();
                        if returns.len() >= 2 {
                            let vol = stdev(&returns) * (252.0_f64).sqrt() * 100.0;
                            results.insert(symbol.clone(), vol);
                        }
                    }
                }
            }
        }
        results
    }
}

// ---------------------------------------------------------------------------
// Shared math
// ---------------------------------------------------------------------------

/// Convert raw values to percentile scores (0-100) by average rank.
///
/// Ties share their average rank.  With `invert`, lower values score higher.
pub fn to_percentiles(values: &HashMap<String, f64>, invert: bool) -> HashMap<String, f64> {
    let n = values.len();
    if n == 0 {
        return HashMap::new();
    }
    if n == 1 {
        let symbol = values.keys().next().unwrap().clone();
        return HashMap::from([(symbol, 50.0)]);
    }

    let mut entries: Vec<(&String, f64)> = values.iter().map(|(k, v)| (k, *v)).collect();
    entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    // Average rank over tied runs (1-based ranks).
    let mut ranks: HashMap<String, f64> = HashMap::with_capacity(n);
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && entries[j + 1].1 == entries[i].1 {
            j += 1;
        }
        let avg_rank = ((i + 1) + (j + 1)) as f64 / 2.0;
        for entry in &entries[i..=j] {
            ranks.insert(entry.0.clone(), avg_rank);
        }
        i = j + 1;
    }

    ranks
        .into_iter()
        .map(|(symbol, rank)| {
            let pct = (rank - 1.0) / (n as f64 - 1.0) * 100.0;
            (symbol, if invert { 100.0 - pct } else { pct })
        })
        .collect()
}

/// Simple return over the trailing `days` closes; None with too little data.
fn safe_momentum(prices: &[f64], days: usize) -> Option<f64> {
    if prices.len() < days {
        return None;
    }
    let old_price = prices[prices.len() - days];
    let new_price = *prices.last()?;
    if old_price > 0.0 {
        Some((new_price - old_price) / old_price)
    } else {
        None
    }
}

/// MA alignment score in [-1, +1]: four ordered price/MA30/MA100/MA200
/// relations contribute ±0.25 each.
fn ma_alignment(record: &MarketRecord, current_price: Option<f64>) -> Option<f64> {
    let price = current_price?;
    let ma_30 = finite(record.ma_30)?;
    let ma_100 = finite(record.ma_100)?;
    let ma_200 = finite(record.ma_200)?;

    let mut score = 0.0;
    score += if price > ma_30 { 0.25 } else { -0.25 };
    score += if ma_30 > ma_100 { 0.25 } else { -0.25 };
    score += if ma_100 > ma_200 { 0.25 } else { -0.25 };
    score += if price > ma_200 { 0.25 } else { -0.25 };
    Some(score)
}

fn atr_percent(record: &MarketRecord, current_price: Option<f64>) -> Option<f64> {
    let price = current_price.filter(|p| *p > 0.0)?;
    let atr = finite(record.atr)?;
    Some(atr / price * 100.0)
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn stdev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn record(symbol: &str) -> MarketRecord {
        MarketRecord {
            symbol: symbol.to_string(),
            ..Default::default()
        }
    }

    fn trending_prices(days: usize, start: f64, daily_gain: f64) -> Vec<f64> {
        (0..days).map(|i| start + i as f64 * daily_gain).collect()
    }

    #[test]
    fn percentiles_rank_and_invert() {
        let values = HashMap::from([
            ("A".to_string(), 1.0),
            ("B".to_string(), 2.0),
            ("C".to_string(), 3.0),
        ]);

        let pct = to_percentiles(&values, false);
        assert_eq!(pct["A"], 0.0);
        assert_eq!(pct["B"], 50.0);
        assert_eq!(pct["C"], 100.0);

        let inv = to_percentiles(&values, true);
        assert_eq!(inv["A"], 100.0);
        assert_eq!(inv["C"], 0.0);
    }

    #[test]
    fn percentiles_ties_share_rank() {
        let values = HashMap::from([
            ("A".to_string(), 1.0),
            ("B".to_string(), 2.0),
            ("C".to_string(), 2.0),
            ("D".to_string(), 3.0),
        ]);
        let pct = to_percentiles(&values, false);
        assert_eq!(pct["B"], pct["C"]);
        assert!(pct["A"] < pct["B"]);
        assert!(pct["C"] < pct["D"]);
    }

    #[test]
    fn percentiles_single_symbol_is_neutral() {
        let values = HashMap::from([("A".to_string(), 42.0)]);
        let pct = to_percentiles(&values, false);
        assert_eq!(pct["A"], 50.0);
    }

    #[test]
    fn ma_alignment_full_uptrend() {
        let mut rec = record("A");
        rec.ma_30 = Some(105.0);
        rec.ma_100 = Some(100.0);
        rec.ma_200 = Some(95.0);
        assert_eq!(ma_alignment(&rec, Some(110.0)), Some(1.0));
        assert_eq!(ma_alignment(&rec, Some(90.0)), Some(0.0));
    }

    #[test]
    fn momentum_requires_history() {
        let mut data = HashMap::new();
        let mut a = record("A");
        a.price_history = trending_prices(200, 100.0, 0.5);
        a.current_price = a.price_history.last().copied();
        data.insert("A".to_string(), a);

        let mut b = record("B");
        b.price_history = trending_prices(50, 100.0, 0.5); // too short
        data.insert("B".to_string(), b);

        let raw = FactorCalculator::momentum_raw(&data);
        assert!(raw.contains_key("A"));
        assert!(!raw.contains_key("B"));
    }

    #[test]
    fn non_dividend_payers_score_zero() {
        let mut data = HashMap::new();
        let mut payer = record("PAY");
        payer.dividend_yield = Some(0.03);
        payer.dividend_growth_5y = Some(0.05);
        data.insert("PAY".to_string(), payer);

        let none = record("NONE");
        data.insert("NONE".to_string(), none);

        let raw = FactorCalculator::dividend_raw(&data);
        assert_eq!(raw["NONE"], 0.0);
        assert!(raw["PAY"] > 0.0);
    }

    #[test]
    fn extreme_value_multiples_filtered() {
        let mut data = HashMap::new();
        let mut cheap = record("CHEAP");
        cheap.pe_ratio = Some(8.0);
        cheap.pb_ratio = Some(1.0);
        data.insert("CHEAP".to_string(), cheap);

        let mut rich = record("RICH");
        rich.pe_ratio = Some(40.0);
        rich.pb_ratio = Some(10.0);
        data.insert("RICH".to_string(), rich);

        let mut broken = record("BROKEN");
        broken.pe_ratio = Some(-12.0); // loss-maker, filtered
        broken.pb_ratio = Some(400.0); // extreme, filtered
        data.insert("BROKEN".to_string(), broken);

        let calc = FactorCalculator::new(false);
        let raw = calc.value_raw(&data);
        assert!(raw["CHEAP"] > raw["RICH"]);
        // Filtered symbol falls back to neutral.
        assert_eq!(raw["BROKEN"], 50.0);
    }

    #[test]
    fn scores_stay_in_bounds_and_default_neutral() {
        let mut data = HashMap::new();
        for i in 0..5 {
            let symbol = format!("S{i}");
            let mut rec = record(&symbol);
            rec.current_price = Some(100.0 + i as f64);
            rec.price_history = trending_prices(260, 50.0, 0.2 * (i as f64 + 1.0));
            rec.pe_ratio = Some(10.0 + i as f64 * 5.0);
            rec.pb_ratio = Some(1.0 + i as f64);
            rec.roe = Some(0.05 * (i as f64 + 1.0));
            rec.profit_margin = Some(0.04 * (i as f64 + 1.0));
            rec.debt_to_equity = Some(0.5 + i as f64 * 0.3);
            rec.dividend_yield = Some(0.01 * (i as f64 + 1.0));
            rec.dividend_growth_5y = Some(0.02 * (i as f64 + 1.0));
            rec.atr = Some(1.0 + i as f64 * 0.5);
            data.insert(symbol, rec);
        }
        // A symbol with nothing at all defaults to 50s.
        data.insert("EMPTY".to_string(), record("EMPTY"));

        let calc = FactorCalculator::new(true);
        let scores = calc.calculate_all(&data, None);

        for fs in scores.values() {
            for score in [
                fs.momentum_score,
                fs.value_score,
                fs.quality_score,
                fs.dividend_score,
                fs.volatility_score,
                fs.composite_score,
            ] {
                assert!((0.0..=100.0).contains(&score), "score {score} out of range");
            }
        }

        let empty = &scores["EMPTY"];
        assert_eq!(empty.momentum_score, 50.0);
        assert_eq!(empty.value_score, 50.0);
        assert_eq!(empty.quality_score, 50.0);
        assert_eq!(empty.dividend_score, 0.0); // non-payer
    }

    #[test]
    fn composite_uses_renormalised_weights() {
        let weights = FactorWeights {
            momentum: 0.55,
            value: 0.0,
            quality: 0.10,
            dividend: 0.0,
            volatility: 0.10,
            sentiment: 0.25, // ignored by the quant renormalisation
        };
        let (w_m, w_v, w_q, w_d, w_vol) = weights.quant_normalised();
        let total = w_m + w_v + w_q + w_d + w_vol;
        assert!((total - 1.0).abs() < 1e-6);
        assert!((w_m - 0.55 / 0.75).abs() < 1e-9);
        assert_eq!(w_v, 0.0);
        assert_eq!(w_d, 0.0);
        assert!((w_q - w_vol).abs() < 1e-12);
    }

    #[test]
    fn volatility_fallback_uses_price_history() {
        let mut data = HashMap::new();
        let mut rec = record("A");
        // No ATR: 21 days of noisy closes trigger the stdev fallback.
        rec.price_history = vec![
            100.0, 101.0, 99.5, 102.0, 100.5, 103.0, 101.5, 104.0, 102.5, 105.0, 103.5,
            106.0, 104.5, 107.0, 105.5, 108.0, 106.5, 109.0, 107.5, 110.0, 108.5,
        ];
        data.insert("A".to_string(), rec);

        let raw = FactorCalculator::volatility_raw(&data);
        assert!(raw["A"] > 0.0);
    }
}
