// =============================================================================
// Temporal Sentiment Analyzer — streaks, trends, persistence, breakouts
// =============================================================================
//
// Computes temporal features from each symbol's combined-sentiment history
// (oldest to newest) and writes them onto the SentimentInput records.  Pure
// in its inputs: the same series always yields the same features.
// =============================================================================

use std::collections::HashMap;

use tracing::info;

use super::SentimentInput;

/// Days in the recent window used for breakout detection.
const BREAKOUT_RECENT_DAYS: usize = 3;

/// Enrich sentiment inputs with temporal features computed from
/// `history` (symbol → combined-sentiment series, oldest first).
pub fn enrich(
    sentiment_data: &mut HashMap<String, SentimentInput>,
    history: &HashMap<String, Vec<f64>>,
) {
    for (symbol, sent) in sentiment_data.iter_mut() {
        let series = match history.get(symbol) {
            Some(s) if s.len() >= 2 => s,
            _ => continue,
        };

        sent.streak_days = calc_streak(series);
        sent.trend_slope = Some(calc_trend_slope(series));
        sent.persistence = Some(calc_persistence(series));
        sent.is_breakout = calc_breakout(series, BREAKOUT_RECENT_DAYS);
    }

    let enriched = sentiment_data
        .values()
        .filter(|s| s.streak_days != 0)
        .count();
    info!(
        enriched,
        total = sentiment_data.len(),
        "temporal sentiment enrichment complete"
    );
}

/// Count consecutive days at the end of the series where sentiment stays on
/// the same side of zero.  Positive for bullish streaks, negative for bearish.
pub fn calc_streak(series: &[f64]) -> i64 {
    let last = match series.last() {
        Some(v) => *v,
        None => return 0,
    };
    let last_sign: i64 = if last >= 0.0 { 1 } else { -1 };

    let mut streak = 0;
    for value in series.iter().rev() {
        let sign: i64 = if *value >= 0.0 { 1 } else { -1 };
        if sign == last_sign {
            streak += 1;
        } else {
            break;
        }
    }
    streak * last_sign
}

/// Least-squares slope of the series in points per day.
pub fn calc_trend_slope(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 3 {
        return 0.0;
    }

    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = series.iter().sum::<f64>() / n as f64;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in series.iter().enumerate() {
        let dx = i as f64 - x_mean;
        numerator += dx * (y - y_mean);
        denominator += dx * dx;
    }

    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// How stable sentiment has been: 1/(1 + (stdev/20)^1.5), so a flat series
/// scores 1.0 and a very noisy one approaches 0.  Short series default 0.5.
pub fn calc_persistence(series: &[f64]) -> f64 {
    if series.len() < 3 {
        return 0.5;
    }
    let mean = series.iter().sum::<f64>() / series.len() as f64;
    let variance =
        series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / series.len() as f64;
    let std = variance.sqrt();
    1.0 / (1.0 + (std / 20.0).powf(1.5))
}

/// Breakout: the trailing `recent_days` average differs from the prior
/// average by ≥30 points and crosses zero.
pub fn calc_breakout(series: &[f64], recent_days: usize) -> bool {
    if series.len() < recent_days + 5 {
        return false;
    }

    let split = series.len() - recent_days;
    let recent = &series[split..];
    let prior = &series[..split];

    let recent_avg = recent.iter().sum::<f64>() / recent.len() as f64;
    let prior_avg = prior.iter().sum::<f64>() / prior.len() as f64;

    let crossed_zero = (recent_avg >= 0.0) != (prior_avg >= 0.0);
    let large_move = (recent_avg - prior_avg).abs() >= 30.0;

    crossed_zero && large_move
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streak_counts_trailing_run() {
        assert_eq!(calc_streak(&[-5.0, 10.0, 20.0, 30.0]), 3);
        assert_eq!(calc_streak(&[5.0, -10.0, -20.0]), -2);
        assert_eq!(calc_streak(&[]), 0);
        // Zero counts as positive.
        assert_eq!(calc_streak(&[-1.0, 0.0, 5.0]), 2);
    }

    #[test]
    fn trend_slope_matches_linear_series() {
        let series: Vec<f64> = (0..10).map(|i| 2.0 * i as f64).collect();
        assert!((calc_trend_slope(&series) - 2.0).abs() < 1e-9);

        let flat = vec![5.0; 10];
        assert_eq!(calc_trend_slope(&flat), 0.0);
    }

    #[test]
    fn persistence_rewards_stability() {
        let stable = vec![20.0; 10];
        let noisy = vec![-60.0, 70.0, -50.0, 80.0, -40.0, 60.0, -70.0, 50.0];
        assert!((calc_persistence(&stable) - 1.0).abs() < 1e-9);
        assert!(calc_persistence(&noisy) < 0.3);
        assert_eq!(calc_persistence(&[1.0, 2.0]), 0.5);
    }

    #[test]
    fn breakout_requires_zero_cross_and_magnitude() {
        // Bearish baseline flipping sharply positive.
        let mut series = vec![-20.0; 8];
        series.extend_from_slice(&[30.0, 35.0, 40.0]);
        assert!(calc_breakout(&series, 3));

        // Big move but no zero cross.
        let mut same_side = vec![10.0; 8];
        same_side.extend_from_slice(&[60.0, 65.0, 70.0]);
        assert!(!calc_breakout(&same_side, 3));

        // Zero cross but small move.
        let mut small = vec![-5.0; 8];
        small.extend_from_slice(&[5.0, 6.0, 7.0]);
        assert!(!calc_breakout(&small, 3));

        // Too little history.
        assert!(!calc_breakout(&[-20.0, 30.0, 35.0, 40.0], 3));
    }

    #[test]
    fn enrichment_is_deterministic() {
        let mut a = HashMap::from([("AAPL".to_string(), SentimentInput::new("AAPL"))]);
        let mut b = HashMap::from([("AAPL".to_string(), SentimentInput::new("AAPL"))]);
        let history = HashMap::from([(
            "AAPL".to_string(),
            vec![-10.0, -5.0, 5.0, 15.0, 25.0, 30.0, 35.0, 40.0, 45.0],
        )]);

        enrich(&mut a, &history);
        enrich(&mut b, &history);

        let (sa, sb) = (&a["AAPL"], &b["AAPL"]);
        assert_eq!(sa.streak_days, sb.streak_days);
        assert_eq!(sa.trend_slope, sb.trend_slope);
        assert_eq!(sa.persistence, sb.persistence);
        assert_eq!(sa.is_breakout, sb.is_breakout);
        assert_eq!(sa.streak_days, 7);
    }

    #[test]
    fn short_history_leaves_input_untouched() {
        let mut data = HashMap::from([("X".to_string(), SentimentInput::new("X"))]);
        let history = HashMap::from([("X".to_string(), vec![10.0])]);
        enrich(&mut data, &history);
        assert_eq!(data["X"].streak_days, 0);
        assert!(data["X"].trend_slope.is_none());
    }
}
