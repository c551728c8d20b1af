//! Runtime configuration of the metrics engine.
//!
//! Defaults are overridable via `CHAINFLOW_*` environment variables. Every value goes through
//! the same clamping as the administrative setters, so an out-of-range setting is corrected,
//! never rejected.

use crate::{error::MetricError, feature::Feature, window::normalize};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Smallest movement pattern FIFO.
pub const MIN_MOVEMENT_CACHE: usize = 2;
/// Largest movement pattern FIFO.
pub const MAX_MOVEMENT_CACHE: usize = 20;
pub const DEFAULT_MOVEMENT_CACHE: usize = 5;

pub const DEFAULT_BULLISH_THRESHOLD: f64 = 3.0;
pub const DEFAULT_BEARISH_THRESHOLD: f64 = -3.0;
const BULLISH_THRESHOLD_RANGE: (f64, f64) = (0.5, 10.0);
const BEARISH_THRESHOLD_RANGE: (f64, f64) = (-10.0, -0.5);

/// What the enriched snapshot shows before a key's first window completes.
///
/// The versioned store is always strict: nothing is published until a window completes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdStartPolicy {
    /// Null until the first completed window.
    Strict,
    /// The in-progress calculation, flagged as provisional.
    #[default]
    Provisional,
}

impl FromStr for ColdStartPolicy {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(ColdStartPolicy::Strict),
            "provisional" => Ok(ColdStartPolicy::Provisional),
            other => Err(MetricError::InvalidInput(format!(
                "unknown cold start policy: {other}"
            ))),
        }
    }
}

/// Bullish/bearish classification thresholds of the segment trend scorer.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TrendThresholds {
    pub bullish: f64,
    pub bearish: f64,
}

impl Default for TrendThresholds {
    fn default() -> Self {
        Self {
            bullish: DEFAULT_BULLISH_THRESHOLD,
            bearish: DEFAULT_BEARISH_THRESHOLD,
        }
    }
}

impl TrendThresholds {
    /// Clamp both thresholds into their allowed ranges; non-finite values fall back to the
    /// defaults.
    pub fn clamped(self) -> Self {
        Self {
            bullish: clamp_or(self.bullish, BULLISH_THRESHOLD_RANGE, DEFAULT_BULLISH_THRESHOLD),
            bearish: clamp_or(self.bearish, BEARISH_THRESHOLD_RANGE, DEFAULT_BEARISH_THRESHOLD),
        }
    }
}

fn clamp_or(value: f64, (min, max): (f64, f64), fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

pub fn clamp_movement_cache(size: usize) -> usize {
    size.clamp(MIN_MOVEMENT_CACHE, MAX_MOVEMENT_CACHE)
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    pub eaten_window_secs: i64,
    pub movement_window_secs: i64,
    pub trend_window_secs: i64,
    pub spot_window_secs: i64,
    pub movement_cache_size: usize,
    pub thresholds: TrendThresholds,
    pub result_ttl_secs: i64,
    pub cold_start: ColdStartPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            eaten_window_secs: Feature::EatenDelta.default_window(),
            movement_window_secs: Feature::LtpMovement.default_window(),
            trend_window_secs: Feature::TrendScore.default_window(),
            spot_window_secs: Feature::SpotTrend.default_window(),
            movement_cache_size: DEFAULT_MOVEMENT_CACHE,
            thresholds: TrendThresholds::default(),
            result_ttl_secs: 300,
            cold_start: ColdStartPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `CHAINFLOW_*` environment variables that parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            eaten_window_secs: env_or("CHAINFLOW_EATEN_WINDOW_SECS", defaults.eaten_window_secs),
            movement_window_secs: env_or(
                "CHAINFLOW_MOVEMENT_WINDOW_SECS",
                defaults.movement_window_secs,
            ),
            trend_window_secs: env_or("CHAINFLOW_TREND_WINDOW_SECS", defaults.trend_window_secs),
            spot_window_secs: env_or("CHAINFLOW_SPOT_WINDOW_SECS", defaults.spot_window_secs),
            movement_cache_size: env_or(
                "CHAINFLOW_MOVEMENT_CACHE_SIZE",
                defaults.movement_cache_size,
            ),
            thresholds: TrendThresholds {
                bullish: env_or("CHAINFLOW_BULLISH_THRESHOLD", defaults.thresholds.bullish),
                bearish: env_or("CHAINFLOW_BEARISH_THRESHOLD", defaults.thresholds.bearish),
            },
            result_ttl_secs: env_or("CHAINFLOW_RESULT_TTL_SECS", defaults.result_ttl_secs),
            cold_start: env_or("CHAINFLOW_COLD_START", defaults.cold_start),
        }
        .normalized()
    }

    /// Apply window normalisation and range clamps.
    pub fn normalized(self) -> Self {
        Self {
            eaten_window_secs: normalize(Feature::EatenDelta, self.eaten_window_secs),
            movement_window_secs: normalize(Feature::LtpMovement, self.movement_window_secs),
            trend_window_secs: normalize(Feature::TrendScore, self.trend_window_secs),
            spot_window_secs: normalize(Feature::SpotTrend, self.spot_window_secs),
            movement_cache_size: clamp_movement_cache(self.movement_cache_size),
            thresholds: self.thresholds.clamped(),
            result_ttl_secs: self.result_ttl_secs.max(1),
            cold_start: self.cold_start,
        }
    }

    pub fn window_secs(&self, feature: Feature) -> i64 {
        match feature {
            Feature::EatenDelta => self.eaten_window_secs,
            Feature::LtpMovement => self.movement_window_secs,
            Feature::TrendScore => self.trend_window_secs,
            Feature::SpotTrend => self.spot_window_secs,
        }
    }

    pub fn with_window_secs(mut self, feature: Feature, secs: i64) -> Self {
        let secs = normalize(feature, secs);
        match feature {
            Feature::EatenDelta => self.eaten_window_secs = secs,
            Feature::LtpMovement => self.movement_window_secs = secs,
            Feature::TrendScore => self.trend_window_secs = secs,
            Feature::SpotTrend => self.spot_window_secs = secs,
        }
        self
    }

    pub fn with_movement_cache_size(mut self, size: usize) -> Self {
        self.movement_cache_size = clamp_movement_cache(size);
        self
    }

    pub fn with_thresholds(mut self, thresholds: TrendThresholds) -> Self {
        self.thresholds = thresholds.clamped();
        self
    }

    pub fn with_result_ttl_secs(mut self, secs: i64) -> Self {
        self.result_ttl_secs = secs.max(1);
        self
    }

    pub fn with_cold_start(mut self, policy: ColdStartPolicy) -> Self {
        self.cold_start = policy;
        self
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
