//! Last-traded-price movement patterns.
//!
//! Every move of at least [`MIN_MOVE_PERCENT`] is pushed into a bounded per-instrument FIFO and
//! the FIFO is scanned for adjacent (older, newer) pairs:
//!
//! | pair           | pattern     | confirms |
//! |----------------|-------------|----------|
//! | `(UP, UP)`     | higher high | UP       |
//! | `(UP, DOWN)`   | higher low  | UP       |
//! | `(DOWN, UP)`   | lower high  | DOWN     |
//! | `(DOWN, DOWN)` | lower low   | DOWN     |
//!
//! The signal is event-driven. It only changes when the price moves, and otherwise the cached
//! signal is returned unchanged.
//!
//! The reference price only advances when a move is recorded. Sub-threshold ticks leave it in
//! place, so slow drift accumulates until it crosses [`MIN_MOVE_PERCENT`] and counts as one move.

use super::percent_change;
use crate::{
    config::clamp_movement_cache,
    error::{MetricError, ensure_finite},
    feature::Feature,
    snapshot::{ContractSnapshot, Direction, Intensity},
    window::normalize,
};
use fnv::FnvHashMap;
use itertools::Itertools;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::VecDeque;

/// Smallest relative change (percent) that counts as a move.
pub const MIN_MOVE_PERCENT: f64 = 0.01;
/// Single-tick change (percent) that marks a movement as fast on its own.
pub const HIGH_INTENSITY_CHANGE_PERCENT: f64 = 0.5;
const HIGH_INTENSITY_CONFIDENCE: f64 = 50.0;
const DUAL_PATTERN_BOOST: f64 = 1.2;

#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MovementSignal {
    pub direction: Direction,
    /// 0..=100
    pub confidence: f64,
    pub intensity: Intensity,
    /// Relative change of the tick that produced this signal, in percent.
    pub last_change_percent: f64,
}

impl MovementSignal {
    fn pattern(self) -> (Direction, f64, Intensity) {
        (self.direction, self.confidence, self.intensity)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MovementUpdate {
    pub instrument: SmolStr,
    pub signal: Option<MovementSignal>,
    /// True when the signal differs from the cached one, ignoring the tick change itself.
    pub changed: bool,
}

#[derive(Default, Copy, Clone)]
struct PatternCount {
    higher_high: usize,
    higher_low: usize,
    lower_high: usize,
    lower_low: usize,
}

impl PatternCount {
    fn from_moves(moves: &VecDeque<Direction>) -> Self {
        moves
            .iter()
            .copied()
            .tuple_windows()
            .fold(Self::default(), |mut count, pair| {
                match pair {
                    (Direction::Up, Direction::Up) => count.higher_high += 1,
                    (Direction::Up, Direction::Down) => count.higher_low += 1,
                    (Direction::Down, Direction::Up) => count.lower_high += 1,
                    (Direction::Down, Direction::Down) => count.lower_low += 1,
                    _ => {}
                }
                count
            })
    }

    fn confirms_up(&self) -> bool {
        self.higher_high + self.higher_low > 0
    }

    fn confirms_down(&self) -> bool {
        self.lower_high + self.lower_low > 0
    }

    fn both_sub_patterns(&self, direction: Direction) -> bool {
        match direction {
            Direction::Up => self.higher_high > 0 && self.higher_low > 0,
            Direction::Down => self.lower_high > 0 && self.lower_low > 0,
            Direction::Neutral => false,
        }
    }
}

/// Derive a signal from a FIFO of moves, oldest first.
///
/// Returns `None` when fewer than two moves are available.
pub fn detect(moves: &VecDeque<Direction>, last_change_percent: f64) -> Option<MovementSignal> {
    if moves.len() < 2 {
        return None;
    }

    let patterns = PatternCount::from_moves(moves);
    let ups = moves.iter().filter(|&&direction| direction == Direction::Up).count();
    let downs = moves.iter().filter(|&&direction| direction == Direction::Down).count();

    let direction = match (patterns.confirms_up(), patterns.confirms_down()) {
        (true, false) => Direction::Up,
        (false, true) => Direction::Down,
        (true, true) if ups > downs => Direction::Up,
        (true, true) if downs > ups => Direction::Down,
        (true, true) => moves.back().copied().unwrap_or(Direction::Neutral),
        (false, false) => return None,
    };

    let same = match direction {
        Direction::Up => ups,
        Direction::Down => downs,
        Direction::Neutral => 0,
    };
    let mut confidence = same as f64 / moves.len() as f64 * 100.0;
    if patterns.both_sub_patterns(direction) {
        confidence *= DUAL_PATTERN_BOOST;
    }
    let confidence = confidence.min(100.0);

    let intensity = if confidence >= HIGH_INTENSITY_CONFIDENCE
        || last_change_percent.abs() >= HIGH_INTENSITY_CHANGE_PERCENT
    {
        Intensity::High
    } else {
        Intensity::Slow
    };

    Some(MovementSignal {
        direction,
        confidence,
        intensity,
        last_change_percent,
    })
}

#[derive(Clone, Debug, Default)]
struct InstrumentMoves {
    previous_price: Option<f64>,
    moves: VecDeque<Direction>,
    signal: Option<MovementSignal>,
}

#[derive(Debug)]
struct Inner {
    cache_size: usize,
    window_secs: i64,
    instruments: FnvHashMap<SmolStr, InstrumentMoves>,
}

#[derive(Debug)]
pub struct PriceMovement {
    inner: RwLock<Inner>,
}

impl PriceMovement {
    pub fn new(cache_size: usize, window_secs: i64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                cache_size: clamp_movement_cache(cache_size),
                window_secs: normalize(Feature::LtpMovement, window_secs),
                instruments: FnvHashMap::default(),
            }),
        }
    }

    pub fn cache_size(&self) -> usize {
        self.inner.read().cache_size
    }

    /// Clamp and apply a new FIFO size; every instrument's history and signal is cleared.
    pub fn set_cache_size(&self, requested: usize) -> usize {
        let mut inner = self.inner.write();
        let cache_size = clamp_movement_cache(requested);
        if cache_size != requested {
            tracing::info!(requested, cache_size, "movement cache size clamped");
        }
        inner.cache_size = cache_size;
        inner.instruments.clear();
        cache_size
    }

    /// Length of the window reported alongside the signal. The signal itself is not windowed.
    pub fn window_secs(&self) -> i64 {
        self.inner.read().window_secs
    }

    pub fn set_window_secs(&self, requested: i64) -> i64 {
        let window_secs = normalize(Feature::LtpMovement, requested);
        self.inner.write().window_secs = window_secs;
        window_secs
    }

    pub fn update(&self, contract: &ContractSnapshot) -> Result<MovementUpdate, MetricError> {
        let instrument = &contract.instrument;
        let price = contract
            .last_price
            .map(|price| ensure_finite(price, "last_price", instrument))
            .transpose()?;
        if let Some(price) = price.filter(|price| *price <= 0.0) {
            return Err(MetricError::InvalidInput(format!(
                "non-positive last price {price} for {instrument}"
            )));
        }

        let mut inner = self.inner.write();
        let Inner {
            cache_size,
            instruments,
            ..
        } = &mut *inner;

        let state = instruments.entry(instrument.clone()).or_default();
        let unchanged = |state: &InstrumentMoves| MovementUpdate {
            instrument: instrument.clone(),
            signal: state.signal,
            changed: false,
        };

        let Some(price) = price else {
            return Ok(unchanged(state));
        };
        let Some(previous) = state.previous_price else {
            state.previous_price = Some(price);
            return Ok(unchanged(state));
        };
        let Some(change) = percent_change(previous, price) else {
            return Ok(unchanged(state));
        };
        if change.abs() < MIN_MOVE_PERCENT {
            return Ok(unchanged(state));
        }

        state.previous_price = Some(price);
        state.moves.push_back(if change > 0.0 { Direction::Up } else { Direction::Down });
        while state.moves.len() > *cache_size {
            state.moves.pop_front();
        }

        let signal = detect(&state.moves, change);
        let changed = signal.map(MovementSignal::pattern) != state.signal.map(MovementSignal::pattern);
        state.signal = signal;

        Ok(MovementUpdate {
            instrument: instrument.clone(),
            signal,
            changed,
        })
    }

    pub fn signal(&self, instrument: &str) -> Option<MovementSignal> {
        self.inner
            .read()
            .instruments
            .get(instrument)
            .and_then(|state| state.signal)
    }

    /// Number of moves currently held for an instrument.
    pub fn history_len(&self, instrument: &str) -> usize {
        self.inner
            .read()
            .instruments
            .get(instrument)
            .map_or(0, |state| state.moves.len())
    }

}
