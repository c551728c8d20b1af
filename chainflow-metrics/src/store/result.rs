use crate::{
    feature::Feature,
    snapshot::{Direction, Intensity, SegmentScores, TrendClass},
    window::WindowBounds,
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Lifecycle of a [`MetricResult`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    /// Frozen completed-window value, committed with compare-and-publish.
    #[display("final")]
    Final,
    /// Live value not bound to a completed window, last write wins.
    #[display("partial")]
    Partial,
    /// Nothing has been published for this (symbol, feature).
    #[display("missing")]
    Missing,
    /// A version exists but its payload is not readable.
    #[display("pending")]
    Pending,
}

/// Feature-specific fields carried alongside the headline value.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct MetricExtras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<Intensity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<TrendClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_scores: Option<SegmentScores>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bullish_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearish_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_eaten: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_eaten: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

/// Versioned output of one feature for one symbol or instrument.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MetricResult {
    pub symbol: SmolStr,
    pub feature: Feature,
    /// Headline value; `None` means "no data", which is distinct from a computed zero.
    pub value: Option<f64>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
    pub status: MetricStatus,
    pub version: u64,
    #[serde(default)]
    pub extras: MetricExtras,
}

impl MetricResult {
    /// Result for a completed window, ready to be committed as [`MetricStatus::Final`].
    pub fn windowed(
        symbol: impl Into<SmolStr>,
        feature: Feature,
        bounds: WindowBounds,
        value: Option<f64>,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            feature,
            value,
            window_start: Some(bounds.start),
            window_end: Some(bounds.end),
            computed_at,
            status: MetricStatus::Final,
            version: 0,
            extras: MetricExtras::default(),
        }
    }

    /// Result for an event-driven value, written as [`MetricStatus::Partial`].
    pub fn live(
        symbol: impl Into<SmolStr>,
        feature: Feature,
        value: Option<f64>,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            feature,
            value,
            window_start: None,
            window_end: None,
            computed_at,
            status: MetricStatus::Partial,
            version: 0,
            extras: MetricExtras::default(),
        }
    }

    pub fn missing(symbol: impl Into<SmolStr>, feature: Feature, computed_at: DateTime<Utc>) -> Self {
        Self {
            status: MetricStatus::Missing,
            ..Self::live(symbol, feature, None, computed_at)
        }
    }

    pub fn pending(
        symbol: impl Into<SmolStr>,
        feature: Feature,
        version: u64,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: MetricStatus::Pending,
            version,
            ..Self::live(symbol, feature, None, computed_at)
        }
    }

    pub fn with_extras(mut self, extras: MetricExtras) -> Self {
        self.extras = extras;
        self
    }

    pub fn is_missing(&self) -> bool {
        self.status == MetricStatus::Missing
    }
}
