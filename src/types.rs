// =============================================================================
// Shared types used across the Alphadesk execution core
// =============================================================================

use serde::{Deserialize, Serialize};

/// Lifecycle status of a trading agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Paused,
    Stopped,
    Completed,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Direction of a held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl Default for PositionSide {
    fn default() -> Self {
        Self::Long
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Whether a position row is live or settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Concrete order action produced by the portfolio diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Buy,
    Sell,
    Hold,
    Increase,
    Decrease,
}

impl ActionKind {
    /// Actions that consume buying power.
    pub fn is_accumulating(self) -> bool {
        matches!(self, Self::Buy | Self::Increase)
    }

    /// Actions that release buying power.
    pub fn is_reducing(self) -> bool {
        matches!(self, Self::Sell | Self::Decrease)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Hold => write!(f, "hold"),
            Self::Increase => write!(f, "increase"),
            Self::Decrease => write!(f, "decrease"),
        }
    }
}

/// How often an agent is allowed to rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceFrequency {
    Intraday,
    Daily,
    Weekly,
    Monthly,
}

impl Default for RebalanceFrequency {
    fn default() -> Self {
        Self::Daily
    }
}

impl RebalanceFrequency {
    /// Minimum hours that must elapse between rebalances.
    ///
    /// Intraday agents use their configured `min_interval_hours`; the other
    /// frequencies map to fixed windows (monthly uses 28 days).
    pub fn min_hours(self, min_interval_hours: f64) -> f64 {
        match self {
            Self::Intraday => min_interval_hours,
            Self::Daily => 24.0,
            Self::Weekly => 24.0 * 7.0,
            Self::Monthly => 24.0 * 28.0,
        }
    }
}

impl std::fmt::Display for RebalanceFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Intraday => write!(f, "intraday"),
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

/// Category of an audit row in `agent_activity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Rebalance,
    Buy,
    Sell,
    StopHit,
    TargetHit,
    Paused,
    Resumed,
    Signal,
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rebalance => write!(f, "rebalance"),
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::StopHit => write!(f, "stop_hit"),
            Self::TargetHit => write!(f, "target_hit"),
            Self::Paused => write!(f, "paused"),
            Self::Resumed => write!(f, "resumed"),
            Self::Signal => write!(f, "signal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebalance_frequency_windows() {
        assert_eq!(RebalanceFrequency::Intraday.min_hours(0.0), 0.0);
        assert_eq!(RebalanceFrequency::Intraday.min_hours(1.0), 1.0);
        assert_eq!(RebalanceFrequency::Daily.min_hours(1.0), 24.0);
        assert_eq!(RebalanceFrequency::Weekly.min_hours(1.0), 168.0);
        assert_eq!(RebalanceFrequency::Monthly.min_hours(1.0), 672.0);
    }

    #[test]
    fn action_kind_direction() {
        assert!(ActionKind::Buy.is_accumulating());
        assert!(ActionKind::Increase.is_accumulating());
        assert!(ActionKind::Sell.is_reducing());
        assert!(ActionKind::Decrease.is_reducing());
        assert!(!ActionKind::Hold.is_accumulating());
        assert!(!ActionKind::Hold.is_reducing());
    }

    #[test]
    fn serde_lowercase_round_trip() {
        let s = serde_json::to_string(&AgentStatus::Active).unwrap();
        assert_eq!(s, "\"active\"");
        let back: AgentStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(back, AgentStatus::Paused);

        let s = serde_json::to_string(&ActivityType::StopHit).unwrap();
        assert_eq!(s, "\"stop_hit\"");
    }
}
