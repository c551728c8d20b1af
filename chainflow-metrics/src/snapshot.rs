//! Point-in-time chain data delivered by the ingestion layer once per poll cycle.
//!
//! The engine treats the raw fields as input and attaches its computed fields in place, so
//! consumers that read the enriched snapshot directly see the same values that are published
//! to the [`ResultStore`](crate::store::ResultStore).

use crate::{feature::Feature, window::WindowBounds};
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeMap;

/// Contract segment of a derivatives chain.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    #[display("futures")]
    Futures,
    #[display("calls")]
    Calls,
    #[display("puts")]
    Puts,
}

impl Segment {
    pub const ALL: [Segment; 3] = [Segment::Futures, Segment::Calls, Segment::Puts];
}

/// Direction of a price move or trend.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[display("UP")]
    Up,
    #[display("DOWN")]
    Down,
    #[display("NEUTRAL")]
    Neutral,
}

/// Speed of an LTP movement signal.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Intensity {
    #[display("HIGH")]
    High,
    #[display("SLOW")]
    Slow,
}

/// Chain-wide trend classification.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
pub enum TrendClass {
    Bullish,
    Bearish,
    Neutral,
}

/// One instrument's market state at a poll.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ContractSnapshot {
    pub instrument: SmolStr,
    pub last_price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_qty: Option<i64>,
    pub ask_qty: Option<i64>,
    pub volume: Option<i64>,
    pub open_interest: Option<i64>,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    pub timestamp: DateTime<Utc>,

    // Engine-attached fields
    #[serde(default)]
    pub eaten_delta: Option<i64>,
    #[serde(default)]
    pub bid_eaten: Option<i64>,
    #[serde(default)]
    pub ask_eaten: Option<i64>,
    #[serde(default)]
    pub movement_direction: Option<Direction>,
    #[serde(default)]
    pub movement_confidence: Option<f64>,
    #[serde(default)]
    pub movement_intensity: Option<Intensity>,
}

impl ContractSnapshot {
    /// Construct a snapshot with only the identifier and timestamp populated.
    pub fn new(instrument: impl Into<SmolStr>, timestamp: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.into(),
            last_price: None,
            bid: None,
            ask: None,
            bid_qty: None,
            ask_qty: None,
            volume: None,
            open_interest: None,
            open: None,
            high: None,
            low: None,
            close: None,
            timestamp,
            eaten_delta: None,
            bid_eaten: None,
            ask_eaten: None,
            movement_direction: None,
            movement_confidence: None,
            movement_intensity: None,
        }
    }

    pub fn with_last_price(mut self, last_price: f64) -> Self {
        self.last_price = Some(last_price);
        self
    }

    pub fn with_quote(mut self, bid: f64, bid_qty: i64, ask: f64, ask_qty: i64) -> Self {
        self.bid = Some(bid);
        self.bid_qty = Some(bid_qty);
        self.ask = Some(ask);
        self.ask_qty = Some(ask_qty);
        self
    }
}

/// Per-segment components of the trend score.
#[derive(Copy, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SegmentScores {
    pub futures: f64,
    pub calls: f64,
    pub puts: f64,
}

impl SegmentScores {
    pub fn get(&self, segment: Segment) -> f64 {
        match segment {
            Segment::Futures => self.futures,
            Segment::Calls => self.calls,
            Segment::Puts => self.puts,
        }
    }

    pub fn set(&mut self, segment: Segment, score: f64) {
        match segment {
            Segment::Futures => self.futures = score,
            Segment::Calls => self.calls = score,
            Segment::Puts => self.puts = score,
        }
    }
}

/// A named underlying's full chain at a poll.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ChainSnapshot {
    pub symbol: SmolStr,
    pub spot_price: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub futures: Vec<ContractSnapshot>,
    #[serde(default)]
    pub calls: Vec<ContractSnapshot>,
    #[serde(default)]
    pub puts: Vec<ContractSnapshot>,

    // Engine-attached fields
    #[serde(default)]
    pub trend_score: Option<f64>,
    #[serde(default)]
    pub trend_classification: Option<TrendClass>,
    #[serde(default)]
    pub segment_scores: Option<SegmentScores>,
    #[serde(default)]
    pub spot_trend_percent: Option<f64>,
    #[serde(default)]
    pub spot_trend_direction: Option<Direction>,
    #[serde(default)]
    pub windows: BTreeMap<Feature, WindowBounds>,
}

impl ChainSnapshot {
    pub fn new(symbol: impl Into<SmolStr>, spot_price: Option<f64>, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            spot_price,
            timestamp,
            futures: Vec::new(),
            calls: Vec::new(),
            puts: Vec::new(),
            trend_score: None,
            trend_classification: None,
            segment_scores: None,
            spot_trend_percent: None,
            spot_trend_direction: None,
            windows: BTreeMap::new(),
        }
    }

    pub fn segment(&self, segment: Segment) -> &[ContractSnapshot] {
        match segment {
            Segment::Futures => &self.futures,
            Segment::Calls => &self.calls,
            Segment::Puts => &self.puts,
        }
    }

    pub fn contracts_mut(&mut self) -> impl Iterator<Item = &mut ContractSnapshot> {
        self.futures
            .iter_mut()
            .chain(self.calls.iter_mut())
            .chain(self.puts.iter_mut())
    }

    /// Representative contract of a segment: the first one carrying a last price.
    pub fn representative(&self, segment: Segment) -> Option<&ContractSnapshot> {
        self.segment(segment)
            .iter()
            .find(|contract| contract.last_price.is_some())
    }
}
