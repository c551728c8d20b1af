use serde::{Deserialize, Serialize};

/// Metric computed by the engine, one per calculator.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Consumed resting bid/ask quantity per instrument.
    EatenDelta,
    /// Directional tick pattern of each instrument's last traded price.
    LtpMovement,
    /// Weighted futures/calls/puts trend classification for the chain.
    TrendScore,
    /// Net movement of the underlying spot price.
    SpotTrend,
}

impl Feature {
    pub const ALL: [Feature; 4] = [
        Feature::EatenDelta,
        Feature::LtpMovement,
        Feature::TrendScore,
        Feature::SpotTrend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::EatenDelta => "eaten_delta",
            Feature::LtpMovement => "ltp_movement",
            Feature::TrendScore => "trend_score",
            Feature::SpotTrend => "spot_trend",
        }
    }

    /// Window lengths (seconds) this feature accepts, ascending.
    pub fn supported_windows(&self) -> &'static [i64] {
        match self {
            Feature::EatenDelta => &[1, 3, 5, 7, 9, 11, 13, 15, 17, 19],
            Feature::LtpMovement => &[1, 2, 3, 5, 10],
            Feature::TrendScore => &[5, 10, 15, 20, 30, 45, 60],
            Feature::SpotTrend => &[3, 5, 10, 15, 20, 25, 30, 35, 40, 45, 50],
        }
    }

    pub fn default_window(&self) -> i64 {
        match self {
            Feature::EatenDelta => 5,
            Feature::LtpMovement => 1,
            Feature::TrendScore => 10,
            Feature::SpotTrend => 10,
        }
    }

    /// Whether results are keyed by instrument id rather than by the underlying symbol.
    pub fn is_per_instrument(&self) -> bool {
        matches!(self, Feature::EatenDelta | Feature::LtpMovement)
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Feature {
    type Err = crate::error::MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|feature| feature.as_str() == s)
            .ok_or_else(|| crate::error::MetricError::InvalidInput(format!("unknown feature: {s}")))
    }
}
