//! Net movement of the underlying's spot price over a window.

use super::percent_change;
use crate::{
    config::ColdStartPolicy,
    error::{MetricError, ensure_finite},
    feature::Feature,
    snapshot::Direction,
    window::{WindowBounds, WindowRegistry},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use itertools::Itertools;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::VecDeque;

/// Net change (percent) below which a window is NEUTRAL regardless of its moves.
pub const NOISE_FLOOR_PERCENT: f64 = 0.02;
/// Share of moves that must agree for a directional classification.
pub const DOMINANCE_RATIO: f64 = 0.60;
const MAX_BUFFERED_POINTS: usize = 4_096;

#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SpotTrendReading {
    pub bounds: WindowBounds,
    pub percent: f64,
    pub direction: Direction,
    pub ups: usize,
    pub downs: usize,
    pub samples: usize,
    pub provisional: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpotUpdate {
    pub symbol: SmolStr,
    pub completed: Option<SpotTrendReading>,
    pub display: Option<SpotTrendReading>,
}

/// Classify a price path, oldest first. Returns `(percent, direction, ups, downs)`, or `None`
/// for an empty path.
pub fn classify(prices: &[f64]) -> Option<(f64, Direction, usize, usize)> {
    let (&first, &last) = (prices.first()?, prices.last()?);
    let percent = percent_change(first, last).unwrap_or(0.0);

    let (ups, downs) = prices
        .iter()
        .tuple_windows()
        .fold((0usize, 0usize), |(ups, downs), (previous, next)| {
            if next > previous {
                (ups + 1, downs)
            } else if next < previous {
                (ups, downs + 1)
            } else {
                (ups, downs)
            }
        });

    let moves = (ups + downs) as f64;
    let direction = if percent.abs() < NOISE_FLOOR_PERCENT || moves == 0.0 {
        Direction::Neutral
    } else if ups as f64 / moves >= DOMINANCE_RATIO {
        Direction::Up
    } else if downs as f64 / moves >= DOMINANCE_RATIO {
        Direction::Down
    } else {
        Direction::Neutral
    };

    Some((percent, direction, ups, downs))
}

#[derive(Clone, Debug, Default)]
struct SymbolSpot {
    points: VecDeque<(DateTime<Utc>, f64)>,
    last_completed: Option<SpotTrendReading>,
}

impl SymbolSpot {
    fn reading(&self, bounds: WindowBounds, provisional: bool) -> Option<SpotTrendReading> {
        let prices = self
            .points
            .iter()
            .filter(|(time, _)| bounds.contains(*time))
            .map(|(_, price)| *price)
            .collect::<Vec<_>>();

        classify(&prices).map(|(percent, direction, ups, downs)| SpotTrendReading {
            bounds,
            percent,
            direction,
            ups,
            downs,
            samples: prices.len(),
            provisional,
        })
    }
}

#[derive(Debug)]
struct Inner {
    windows: WindowRegistry,
    symbols: FnvHashMap<SmolStr, SymbolSpot>,
}

#[derive(Debug)]
pub struct SpotTrend {
    inner: RwLock<Inner>,
    policy: ColdStartPolicy,
}

impl SpotTrend {
    pub fn new(window_secs: i64, policy: ColdStartPolicy) -> Self {
        Self {
            inner: RwLock::new(Inner {
                windows: WindowRegistry::new(Feature::SpotTrend, window_secs),
                symbols: FnvHashMap::default(),
            }),
            policy,
        }
    }

    pub fn window_secs(&self) -> i64 {
        self.inner.read().windows.length_secs()
    }

    pub fn set_window_secs(&self, requested: i64) -> i64 {
        let mut inner = self.inner.write();
        let applied = inner.windows.reconfigure(requested);
        inner.symbols.values_mut().for_each(|spot| *spot = SymbolSpot::default());
        applied
    }

    pub fn update(
        &self,
        symbol: &SmolStr,
        spot_price: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> Result<SpotUpdate, MetricError> {
        let price = spot_price
            .map(|price| ensure_finite(price, "spot_price", symbol))
            .transpose()?;
        if let Some(price) = price.filter(|price| *price <= 0.0) {
            return Err(MetricError::InvalidInput(format!(
                "non-positive spot price {price} for {symbol}"
            )));
        }

        let mut inner = self.inner.write();
        let Inner { windows, symbols } = &mut *inner;

        let state = windows.state_mut(symbol);
        let rolled = state.check_and_advance(timestamp);
        let closed = if rolled { state.completed_bounds() } else { None };
        let current = state.current_bounds();

        let spot = symbols.entry(symbol.clone()).or_default();

        let completed = closed.and_then(|bounds| spot.reading(bounds, false));
        if let Some(reading) = completed {
            spot.last_completed = Some(reading);
        }
        if let (true, Some(current)) = (rolled, current) {
            spot.points.retain(|(time, _)| *time >= current.start);
        }

        if let Some(price) = price {
            // Late samples are counted in the open window
            let time = current.map_or(timestamp, |current| timestamp.max(current.start));
            spot.points.push_back((time, price));
            if spot.points.len() > MAX_BUFFERED_POINTS {
                spot.points.pop_front();
            }
        }

        let display = match (spot.last_completed, self.policy, current) {
            (Some(reading), _, _) => Some(reading),
            (None, ColdStartPolicy::Provisional, Some(current)) => spot.reading(current, true),
            _ => None,
        };

        Ok(SpotUpdate {
            symbol: symbol.clone(),
            completed,
            display,
        })
    }

    pub fn last_completed(&self, symbol: &str) -> Option<SpotTrendReading> {
        self.inner
            .read()
            .symbols
            .get(symbol)
            .and_then(|spot| spot.last_completed)
    }

    pub fn bounds(&self, symbol: &str, now: DateTime<Utc>) -> WindowBounds {
        self.inner.read().windows.bounds(symbol, now)
    }
}
