// =============================================================================
// Macro Risk Overlay — cross-agent position-size coordinator
// =============================================================================
//
// Sits above individual agent strategies and scales position sizes from
// uncorrelated macro signals.  It never overrides strategy direction, only
// sizes.  Multiple signals must confirm before large adjustments, and a
// missing data source degrades the overlay toward neutral.
//
// Signals and base weights:
//   credit_spread    0.30   widening spreads → reduce risk
//   vol_regime       0.30   VIX spike / inverted term structure → reduce risk
//   yield_curve      0.20   flat or inverted curve → reduce risk
//   seasonality      0.10   calendar bias
//   insider_breadth  0.10   broad insider buying → add risk
//
// Output: a risk scale factor in [min_scale, max_scale] applied to every
// target weight before diffing.
// =============================================================================

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AppConfig;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Latest stats for one macro indicator series.
#[derive(Debug, Clone, Default)]
pub struct IndicatorStats {
    pub current: Option<f64>,
    pub z_score: f64,
    pub rate_of_change: f64,
}

/// Volatility regime reading derived from VIX level and term structure.
#[derive(Debug, Clone, Default)]
pub struct VolRegimeInput {
    pub vix_current: Option<f64>,
    /// Continuous [-1, +1]: -1 = crisis, +1 = calm.
    pub regime_score: f64,
}

/// Everything the overlay consumes for one computation.
#[derive(Debug, Clone)]
pub struct OverlayInputs {
    pub credit_spread: Option<IndicatorStats>,
    pub yield_curve: Option<IndicatorStats>,
    pub vol_regime: Option<VolRegimeInput>,
    /// Per-stock insider net sentiment values (-100..+100).
    pub insider_net_sentiment: Vec<f64>,
    /// Calendar date used for the seasonality signal.
    pub today: NaiveDate,
}

/// Derive a vol regime score from VIX level and term structure, the way the
/// volatility fetcher reports it: 0.6 on the level, 0.4 on the curve.
pub fn vol_regime_score(vix_current: f64, term_structure: f64) -> f64 {
    let vix_component = (1.0 - (vix_current - 12.0) / 25.0).clamp(-1.0, 1.0);
    let ts_component = (term_structure * 5.0).clamp(-1.0, 1.0);
    (0.6 * vix_component + 0.4 * ts_component).clamp(-1.0, 1.0)
}

// ---------------------------------------------------------------------------
// Snapshot & result
// ---------------------------------------------------------------------------

/// Current state of all macro signals, each in [-100, +100] with an
/// availability flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MacroSignalSnapshot {
    pub credit_spread_signal: f64,
    pub credit_spread_available: bool,

    pub vol_regime_signal: f64,
    pub vol_regime_available: bool,

    pub yield_curve_signal: f64,
    pub yield_curve_available: bool,

    pub seasonality_signal: f64,
    pub seasonality_available: bool,

    pub insider_breadth_signal: f64,
    pub insider_breadth_available: bool,
}

/// Output of one overlay computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayResult {
    /// Multiply every position target weight by this factor.
    pub risk_scale_factor: f64,
    /// -100 (max danger) to +100 (max safety).
    pub composite_risk_score: f64,
    pub signal_contributions: HashMap<String, f64>,
    pub warnings: Vec<String>,
    pub regime_label: String,
    pub snapshot: MacroSignalSnapshot,
}

impl OverlayResult {
    /// Neutral result used when the overlay is disabled or starved of data.
    pub fn neutral(regime_label: &str, snapshot: MacroSignalSnapshot) -> Self {
        Self {
            risk_scale_factor: 1.0,
            composite_risk_score: 0.0,
            signal_contributions: HashMap::new(),
            warnings: Vec::new(),
            regime_label: regime_label.to_string(),
            snapshot,
        }
    }
}

// ---------------------------------------------------------------------------
// Overlay
// ---------------------------------------------------------------------------

/// No renormalised weight may exceed this share of the composite.
const MAX_NORM_WEIGHT: f64 = 0.50;

const SIGNAL_NAMES: [&str; 5] = [
    "credit_spread",
    "vol_regime",
    "yield_curve",
    "seasonality",
    "insider_breadth",
];

fn base_weight(name: &str) -> f64 {
    match name {
        "credit_spread" | "vol_regime" => 0.30,
        "yield_curve" => 0.20,
        _ => 0.10,
    }
}

/// Average historical monthly return bias, as a fraction.  Scaled into the
/// seasonality signal via bias/0.015·60.
const MONTHLY_BIAS: [f64; 12] = [
    0.010,  // Jan
    0.002,  // Feb
    0.010,  // Mar
    0.015,  // Apr
    0.002,  // May
    -0.002, // Jun
    0.010,  // Jul
    -0.005, // Aug
    -0.012, // Sep
    0.006,  // Oct
    0.015,  // Nov
    0.013,  // Dec
];

/// Cross-agent risk coordinator.  Computed once per pipeline run and shared
/// by every agent so the whole cohort gets identical macro treatment.
pub struct MacroRiskOverlay {
    min_signals_required: usize,
    min_scale: f64,
    max_scale: f64,
}

impl MacroRiskOverlay {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            min_signals_required: config.macro_overlay_min_signals.max(1),
            min_scale: config.macro_overlay_min_scale,
            max_scale: config.macro_overlay_max_scale,
        }
    }

    /// Compute the risk overlay from available macro data.
    pub fn compute(&self, inputs: &OverlayInputs) -> OverlayResult {
        let snapshot = Self::build_snapshot(inputs);

        let available_count = [
            snapshot.credit_spread_available,
            snapshot.vol_regime_available,
            snapshot.yield_curve_available,
            snapshot.seasonality_available,
            snapshot.insider_breadth_available,
        ]
        .iter()
        .filter(|a| **a)
        .count();

        if available_count < self.min_signals_required {
            info!(
                available = available_count,
                required = self.min_signals_required,
                "macro overlay: too few signals — neutral"
            );
            return OverlayResult::neutral("insufficient_data", snapshot);
        }

        let (composite, contributions) = Self::compute_composite(&snapshot);

        // Corrupted upstream data must never propagate into sizing.
        if !composite.is_finite() {
            warn!("macro overlay: composite is NaN/Inf — returning neutral");
            let mut result = OverlayResult::neutral("normal", snapshot);
            result
                .warnings
                .push("Macro composite was not finite — overlay neutralised".to_string());
            return result;
        }

        let risk_scale = self.score_to_scale(composite);
        let warnings = Self::generate_warnings(&snapshot, composite);

        let regime_label = if composite < -40.0 {
            "high_risk"
        } else if composite < -15.0 {
            "elevated_risk"
        } else if composite > 30.0 {
            "low_risk"
        } else {
            "normal"
        };

        let result = OverlayResult {
            risk_scale_factor: (risk_scale * 10_000.0).round() / 10_000.0,
            composite_risk_score: (composite * 100.0).round() / 100.0,
            signal_contributions: contributions,
            warnings,
            regime_label: regime_label.to_string(),
            snapshot,
        };

        info!(
            composite = result.composite_risk_score,
            scale = result.risk_scale_factor,
            regime = %result.regime_label,
            signals = available_count,
            warnings = result.warnings.len(),
            "macro overlay computed"
        );

        result
    }

    // -------------------------------------------------------------------------
    // Snapshot construction
    // -------------------------------------------------------------------------

    fn build_snapshot(inputs: &OverlayInputs) -> MacroSignalSnapshot {
        let mut snapshot = MacroSignalSnapshot::default();

        // Credit spread: high/widening spread = bearish (inverted sign).
        if let Some(credit) = &inputs.credit_spread {
            if credit.current.is_some() {
                let signal = -credit.z_score * 30.0 - credit.rate_of_change * 5.0;
                snapshot.credit_spread_signal = signal.clamp(-100.0, 100.0);
                snapshot.credit_spread_available = true;
            }
        }

        // Volatility regime, amplified at the extremes.
        if let Some(vol) = &inputs.vol_regime {
            if let Some(vix) = vol.vix_current {
                let mut signal = vol.regime_score * 100.0;
                if vix > 35.0 {
                    signal = signal.min(-80.0);
                } else if vix < 12.0 {
                    signal = signal.max(60.0);
                }
                snapshot.vol_regime_signal = signal.clamp(-100.0, 100.0);
                snapshot.vol_regime_available = true;
            }
        }

        // Yield curve: slope and rate of change.
        if let Some(yc) = &inputs.yield_curve {
            if let Some(current) = yc.current {
                let signal = current * 50.0 + yc.rate_of_change * 20.0;
                snapshot.yield_curve_signal = signal.clamp(-100.0, 100.0);
                snapshot.yield_curve_available = true;
            }
        }

        // Seasonality: purely calendar-based, always available.
        snapshot.seasonality_signal = Self::seasonality_signal(inputs.today);
        snapshot.seasonality_available = true;

        // Insider breadth: cross-sectional mean of per-stock net sentiment.
        if !inputs.insider_net_sentiment.is_empty() {
            let breadth = inputs.insider_net_sentiment.iter().sum::<f64>()
                / inputs.insider_net_sentiment.len() as f64;
            snapshot.insider_breadth_signal = breadth.clamp(-100.0, 100.0);
            snapshot.insider_breadth_available = true;
        }

        snapshot
    }

    /// Monthly bias plus end-of-month and end-of-quarter boosts.
    fn seasonality_signal(today: NaiveDate) -> f64 {
        let month = today.month() as usize;
        let day = today.day();
        let days_in_month = Self::days_in_month(today);

        let monthly_bias = MONTHLY_BIAS[month - 1];
        let base_signal = monthly_bias / 0.015 * 60.0;

        // Last 3 calendar days of the month tend to be positive.
        let eom_boost = if day >= days_in_month - 2 { 15.0 } else { 0.0 };

        let eoq_boost = if matches!(month, 3 | 6 | 9 | 12) && day >= days_in_month - 2 {
            10.0
        } else {
            0.0
        };

        (base_signal + eom_boost + eoq_boost).clamp(-100.0, 100.0)
    }

    fn days_in_month(date: NaiveDate) -> u32 {
        let (year, month) = (date.year(), date.month());
        let first_of_next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        };
        first_of_next
            .and_then(|d| d.pred_opt())
            .map(|d| d.day())
            .unwrap_or(30)
    }

    // -------------------------------------------------------------------------
    // Composite
    // -------------------------------------------------------------------------

    /// Weighted composite over available signals.  Weights are renormalised
    /// over the available set, then capped at 0.50 with the excess
    /// redistributed so one weak signal cannot dominate a thin snapshot.
    fn compute_composite(snapshot: &MacroSignalSnapshot) -> (f64, HashMap<String, f64>) {
        let signal_map: [(&str, f64, bool); 5] = [
            (
                "credit_spread",
                snapshot.credit_spread_signal,
                snapshot.credit_spread_available,
            ),
            (
                "vol_regime",
                snapshot.vol_regime_signal,
                snapshot.vol_regime_available,
            ),
            (
                "yield_curve",
                snapshot.yield_curve_signal,
                snapshot.yield_curve_available,
            ),
            (
                "seasonality",
                snapshot.seasonality_signal,
                snapshot.seasonality_available,
            ),
            (
                "insider_breadth",
                snapshot.insider_breadth_signal,
                snapshot.insider_breadth_available,
            ),
        ];

        let mut active_signals: HashMap<String, f64> = HashMap::new();
        let mut total_weight = 0.0;
        for (name, value, available) in signal_map {
            if available && value.is_finite() {
                active_signals.insert(name.to_string(), value);
                total_weight += base_weight(name);
            }
        }

        if total_weight <= 0.0 {
            return (0.0, HashMap::new());
        }

        let mut norm_weights: HashMap<String, f64> = active_signals
            .keys()
            .map(|name| (name.clone(), base_weight(name) / total_weight))
            .collect();

        // Iteratively cap and redistribute until stable.
        for _ in 0..5 {
            let mut excess = 0.0;
            let mut uncapped_total = 0.0;
            for weight in norm_weights.values_mut() {
                if *weight > MAX_NORM_WEIGHT {
                    excess += *weight - MAX_NORM_WEIGHT;
                    *weight = MAX_NORM_WEIGHT;
                } else {
                    uncapped_total += *weight;
                }
            }

            if excess <= 0.0 || uncapped_total <= 0.0 {
                break;
            }

            for name in SIGNAL_NAMES {
                if let Some(weight) = norm_weights.get_mut(name) {
                    if *weight < MAX_NORM_WEIGHT {
                        *weight += excess * (*weight / uncapped_total);
                    }
                }
            }
        }

        let mut contributions = HashMap::new();
        let mut composite = 0.0;
        for (name, value) in &active_signals {
            let contribution = value * norm_weights[name];
            contributions.insert(name.clone(), (contribution * 10_000.0).round() / 10_000.0);
            composite += contribution;
        }

        (composite, contributions)
    }

    /// Asymmetric piecewise-linear map anchored at 0 ↔ 1.0.  Cutting risk is
    /// more aggressive than adding it: a 50% loss needs a 100% gain back.
    fn score_to_scale(&self, composite: f64) -> f64 {
        let scale = if composite <= 0.0 {
            1.0 + (composite / 100.0) * (1.0 - self.min_scale)
        } else {
            1.0 + (composite / 100.0) * (self.max_scale - 1.0)
        };
        scale.clamp(self.min_scale, self.max_scale)
    }

    fn generate_warnings(snapshot: &MacroSignalSnapshot, composite: f64) -> Vec<String> {
        let mut warnings = Vec::new();

        if snapshot.credit_spread_available && snapshot.credit_spread_signal < -50.0 {
            warnings.push(
                "Credit spreads widening significantly — credit markets pricing risk"
                    .to_string(),
            );
        }
        if snapshot.vol_regime_available && snapshot.vol_regime_signal < -50.0 {
            warnings.push(
                "Elevated volatility regime — VIX elevated or term structure inverted"
                    .to_string(),
            );
        }
        if snapshot.yield_curve_available && snapshot.yield_curve_signal < -30.0 {
            warnings.push("Yield curve flat or inverted — recession risk elevated".to_string());
        }

        if composite < -60.0 {
            warnings.push(
                "CRITICAL: Multiple macro signals confirm high risk — position sizes \
                 reduced to minimum"
                    .to_string(),
            );
        } else if composite < -30.0 {
            warnings.push("WARNING: Macro risk elevated — position sizes reduced".to_string());
        }

        if composite > 40.0 {
            warnings.push(
                "Macro conditions favourable — all signals confirm low risk environment"
                    .to_string(),
            );
        }

        warnings
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn overlay_with(min_signals: usize) -> MacroRiskOverlay {
        let mut config = AppConfig::default();
        config.macro_overlay_min_signals = min_signals;
        MacroRiskOverlay::new(&config)
    }

    fn mid_june() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 15).unwrap()
    }

    fn empty_inputs(today: NaiveDate) -> OverlayInputs {
        OverlayInputs {
            credit_spread: None,
            yield_curve: None,
            vol_regime: None,
            insider_net_sentiment: Vec::new(),
            today,
        }
    }

    #[test]
    fn insufficient_signals_returns_neutral() {
        // Seasonality alone is one signal; with min 2 the overlay is neutral.
        let overlay = overlay_with(2);
        let result = overlay.compute(&empty_inputs(mid_june()));
        assert_eq!(result.risk_scale_factor, 1.0);
        assert_eq!(result.regime_label, "insufficient_data");
    }

    #[test]
    fn single_signal_capped_at_half() {
        let overlay = overlay_with(1);
        let result = overlay.compute(&empty_inputs(mid_june()));
        // Only seasonality available: its renormalised weight (1.0) is
        // capped at 0.50, so the composite is half the signal.
        let seasonality = result.snapshot.seasonality_signal;
        assert!((result.composite_risk_score - seasonality * 0.5).abs() < 0.01);
    }

    #[test]
    fn cap_and_redistribute_two_signals() {
        // Seasonality 80 at base weight .10 plus credit -40 at base .30:
        // renormalised .25/.75, credit capped at .50, excess flows back,
        // final .50/.50 → composite 20 → scale 1.05.
        let overlay = overlay_with(2);

        let snapshot = MacroSignalSnapshot {
            seasonality_signal: 80.0,
            seasonality_available: true,
            credit_spread_signal: -40.0,
            credit_spread_available: true,
            ..Default::default()
        };
        let (composite, contributions) = MacroRiskOverlay::compute_composite(&snapshot);
        assert!((composite - 20.0).abs() < 1e-9);
        assert!((contributions["seasonality"] - 40.0).abs() < 1e-6);
        assert!((contributions["credit_spread"] + 20.0).abs() < 1e-6);

        let scale = overlay.score_to_scale(composite);
        assert!((scale - 1.05).abs() < 1e-9);
    }

    #[test]
    fn scale_bounds_and_asymmetry() {
        let overlay = overlay_with(2);
        assert!((overlay.score_to_scale(-100.0) - 0.25).abs() < 1e-9);
        assert!((overlay.score_to_scale(100.0) - 1.25).abs() < 1e-9);
        assert!((overlay.score_to_scale(0.0) - 1.0).abs() < 1e-9);
        // -50 cuts 37.5%; +50 only adds 12.5%.
        assert!((overlay.score_to_scale(-50.0) - 0.625).abs() < 1e-9);
        assert!((overlay.score_to_scale(50.0) - 1.125).abs() < 1e-9);
    }

    #[test]
    fn vix_extremes_amplified() {
        let mut inputs = empty_inputs(mid_june());
        inputs.vol_regime = Some(VolRegimeInput {
            vix_current: Some(40.0),
            regime_score: -0.3,
        });
        let snapshot = MacroRiskOverlay::build_snapshot(&inputs);
        assert!(snapshot.vol_regime_available);
        assert!(snapshot.vol_regime_signal <= -80.0);

        inputs.vol_regime = Some(VolRegimeInput {
            vix_current: Some(10.0),
            regime_score: 0.1,
        });
        let snapshot = MacroRiskOverlay::build_snapshot(&inputs);
        assert!(snapshot.vol_regime_signal >= 60.0);
    }

    #[test]
    fn seasonality_is_deterministic_with_boosts() {
        let eoq = NaiveDate::from_ymd_opt(2026, 12, 30).unwrap();
        let plain = NaiveDate::from_ymd_opt(2026, 12, 10).unwrap();

        let s1 = MacroRiskOverlay::seasonality_signal(eoq);
        let s2 = MacroRiskOverlay::seasonality_signal(eoq);
        assert_eq!(s1, s2);
        // End-of-month (+15) plus end-of-quarter (+10) boosts.
        assert!((s1 - (MacroRiskOverlay::seasonality_signal(plain) + 25.0)).abs() < 1e-9);
    }

    #[test]
    fn overlay_is_deterministic() {
        let overlay = overlay_with(2);
        let mut inputs = empty_inputs(mid_june());
        inputs.credit_spread = Some(IndicatorStats {
            current: Some(4.5),
            z_score: 1.5,
            rate_of_change: 0.2,
        });
        inputs.yield_curve = Some(IndicatorStats {
            current: Some(-0.4),
            z_score: -1.0,
            rate_of_change: -0.1,
        });

        let a = overlay.compute(&inputs);
        let b = overlay.compute(&inputs);
        assert_eq!(a.risk_scale_factor, b.risk_scale_factor);
        assert_eq!(a.composite_risk_score, b.composite_risk_score);
        assert_eq!(a.regime_label, b.regime_label);
    }

    #[test]
    fn crisis_snapshot_yields_high_risk_and_warnings() {
        let overlay = overlay_with(2);
        let mut inputs = empty_inputs(NaiveDate::from_ymd_opt(2026, 9, 15).unwrap());
        // Credit blowing out, curve inverted, VIX panicking.
        inputs.credit_spread = Some(IndicatorStats {
            current: Some(6.5),
            z_score: 3.0,
            rate_of_change: 2.0,
        });
        inputs.yield_curve = Some(IndicatorStats {
            current: Some(-1.2),
            z_score: -2.0,
            rate_of_change: -0.5,
        });
        inputs.vol_regime = Some(VolRegimeInput {
            vix_current: Some(42.0),
            regime_score: -0.8,
        });

        let result = overlay.compute(&inputs);
        assert_eq!(result.regime_label, "high_risk");
        assert!(result.risk_scale_factor < 0.7);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("Credit spreads")));
        assert!(result.warnings.iter().any(|w| w.contains("CRITICAL")));
    }

    #[test]
    fn insider_breadth_is_mean_of_net_sentiment() {
        let mut inputs = empty_inputs(mid_june());
        inputs.insider_net_sentiment = vec![100.0, 100.0, 100.0];
        let snapshot = MacroRiskOverlay::build_snapshot(&inputs);
        assert!(snapshot.insider_breadth_available);
        // The Form-4 placeholder feed reports +100 everywhere until
        // transaction codes are parsed; the overlay consumes it as-is.
        assert_eq!(snapshot.insider_breadth_signal, 100.0);
    }

    #[test]
    fn vol_regime_score_shape() {
        // Calm: low VIX, contango.
        assert!(vol_regime_score(13.0, 0.08) > 0.5);
        // Crisis: high VIX, backwardation.
        assert!(vol_regime_score(45.0, -0.10) < -0.5);
    }
}
