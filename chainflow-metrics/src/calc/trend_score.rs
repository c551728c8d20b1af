//! Weighted futures/calls/puts trend classification of a chain.
//!
//! Each segment contributes the movement of one representative contract. Every metric of the
//! representative (ltp, volume, bid, ask, bid qty, ask qty) is compared with the average of its
//! earlier observations in the current window and mapped to a direction of `+1`, `0` or `-1`.
//! The directions are weighted into a segment sub-score (inverted for puts) and the sub-scores
//! into a bullish and a bearish score in `[-10, 10]`.
//!
//! Classification is smoothed: a change of class is accepted only once the new class makes up
//! at least two of the last three raw classifications.

use crate::{
    config::{ColdStartPolicy, TrendThresholds},
    error::{MetricError, ensure_finite},
    feature::Feature,
    snapshot::{ChainSnapshot, ContractSnapshot, Segment, SegmentScores, TrendClass},
    window::{WindowBounds, WindowRegistry},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::VecDeque;

/// Observations held per metric and segment within one window.
pub const MAX_CACHE_OBSERVATIONS: usize = 32;
const DIRECTION_THRESHOLD_PERCENT: f64 = 0.1;
const MAX_RAW_SCORE: f64 = 5.0;
const SCORE_LIMIT: f64 = 10.0;
const SMOOTHING_DEPTH: usize = 3;
const SMOOTHING_QUORUM: usize = 2;

const LTP_WEIGHT: f64 = 1.0;
const VOLUME_WEIGHT: f64 = 0.7;
const BID_WEIGHT: f64 = 0.7;
const BID_QTY_WEIGHT: f64 = 0.4;
const ASK_QTY_WEIGHT: f64 = 0.4;
const ASK_WEIGHT: f64 = 0.3;

#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TrendReading {
    pub bounds: WindowBounds,
    /// Score matching `classification`.
    pub score: f64,
    /// Smoothed classification.
    pub classification: TrendClass,
    /// Classification of this window before smoothing.
    pub raw_classification: TrendClass,
    pub bullish: f64,
    pub bearish: f64,
    pub segment_scores: SegmentScores,
    pub provisional: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrendUpdate {
    pub symbol: SmolStr,
    pub completed: Option<TrendReading>,
    pub display: Option<TrendReading>,
}

/// Rolling observations of one metric.
#[derive(Clone, Debug, Default)]
struct MetricHistory(VecDeque<f64>);

impl MetricHistory {
    fn push(&mut self, value: Option<f64>) {
        if let Some(value) = value {
            self.0.push_back(value);
            if self.0.len() > MAX_CACHE_OBSERVATIONS {
                self.0.pop_front();
            }
        }
    }

    /// `+1`/`-1` when the latest value is more than 0.1% above/below the average of the earlier
    /// ones, else `0`.
    fn direction(&self) -> f64 {
        let count = self.0.len();
        let Some(&current) = self.0.back().filter(|_| count >= 2) else {
            return 0.0;
        };
        let earlier = count - 1;
        let average = self.0.iter().take(earlier).sum::<f64>() / earlier as f64;
        if average == 0.0 {
            return 0.0;
        }

        let delta = (current - average) / average * 100.0;
        if delta > DIRECTION_THRESHOLD_PERCENT {
            1.0
        } else if delta < -DIRECTION_THRESHOLD_PERCENT {
            -1.0
        } else {
            0.0
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SegmentCache {
    representative: Option<SmolStr>,
    ltp: MetricHistory,
    volume: MetricHistory,
    bid: MetricHistory,
    ask: MetricHistory,
    bid_qty: MetricHistory,
    ask_qty: MetricHistory,
}

impl SegmentCache {
    fn observe(&mut self, contract: &ContractSnapshot) {
        if self.representative.as_ref() != Some(&contract.instrument) {
            *self = Self {
                representative: Some(contract.instrument.clone()),
                ..Self::default()
            };
        }
        self.ltp.push(contract.last_price);
        self.volume.push(contract.volume.map(|volume| volume as f64));
        self.bid.push(contract.bid);
        self.ask.push(contract.ask);
        self.bid_qty.push(contract.bid_qty.map(|qty| qty as f64));
        self.ask_qty.push(contract.ask_qty.map(|qty| qty as f64));
    }

    fn clear_observations(&mut self) {
        *self = Self {
            representative: self.representative.take(),
            ..Self::default()
        };
    }

    fn score(&self, segment: Segment) -> f64 {
        segment_score(
            segment,
            MetricDirections {
                ltp: self.ltp.direction(),
                volume: self.volume.direction(),
                bid: self.bid.direction(),
                ask: self.ask.direction(),
                bid_qty: self.bid_qty.direction(),
                ask_qty: self.ask_qty.direction(),
            },
        )
    }
}

/// Per-metric directions of a segment representative, each `-1`, `0` or `+1`.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct MetricDirections {
    pub ltp: f64,
    pub volume: f64,
    pub bid: f64,
    pub ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
}

/// Weighted sub-score of one segment.
pub fn segment_score(segment: Segment, d: MetricDirections) -> f64 {
    let mut raw = LTP_WEIGHT * d.ltp
        + VOLUME_WEIGHT * d.volume * d.ltp
        + BID_WEIGHT * d.bid
        + BID_QTY_WEIGHT * d.bid_qty
        - ASK_QTY_WEIGHT * d.ask_qty;

    // Ask only counts when it confirms the price move
    if d.ltp != 0.0 && d.ask == d.ltp {
        raw += ASK_WEIGHT * d.ask;
    }

    match segment {
        Segment::Puts => -raw,
        Segment::Futures | Segment::Calls => raw,
    }
}

fn normalise(raw: f64) -> f64 {
    (raw / MAX_RAW_SCORE * SCORE_LIMIT).clamp(-SCORE_LIMIT, SCORE_LIMIT)
}

/// Bullish and bearish scores of a set of segment sub-scores.
pub fn combine(scores: &SegmentScores) -> (f64, f64) {
    let bullish = 0.45 * scores.futures + 0.35 * scores.calls + 0.20 * scores.puts;
    let bearish = 0.45 * scores.futures + 0.20 * scores.calls + 0.35 * scores.puts;
    (normalise(bullish), normalise(bearish))
}

pub fn classify(bullish: f64, bearish: f64, thresholds: TrendThresholds) -> TrendClass {
    match (bullish >= thresholds.bullish, bearish <= thresholds.bearish) {
        (true, true) if bearish.abs() > bullish.abs() => TrendClass::Bearish,
        (true, _) => TrendClass::Bullish,
        (false, true) => TrendClass::Bearish,
        (false, false) => TrendClass::Neutral,
    }
}

fn score_for(classification: TrendClass, bullish: f64, bearish: f64) -> f64 {
    match classification {
        TrendClass::Bullish => bullish,
        TrendClass::Bearish => bearish,
        TrendClass::Neutral if bearish.abs() > bullish.abs() => bearish,
        TrendClass::Neutral => bullish,
    }
}

#[derive(Clone, Debug, Default)]
struct SymbolTrend {
    segments: FnvHashMap<Segment, SegmentCache>,
    raw_history: VecDeque<TrendClass>,
    accepted: Option<TrendClass>,
    last_completed: Option<TrendReading>,
}

impl SymbolTrend {
    fn segment_scores(&self) -> SegmentScores {
        let mut scores = SegmentScores::default();
        for segment in Segment::ALL {
            let score = self
                .segments
                .get(&segment)
                .map_or(0.0, |cache| cache.score(segment));
            scores.set(segment, score);
        }
        scores
    }

    /// Push a raw classification and return the accepted one.
    fn smooth(&mut self, raw: TrendClass) -> TrendClass {
        self.raw_history.push_back(raw);
        while self.raw_history.len() > SMOOTHING_DEPTH {
            self.raw_history.pop_front();
        }

        let accepted = match self.accepted {
            None => raw,
            Some(current) if current == raw => current,
            Some(current) => {
                let votes = self.raw_history.iter().filter(|&&class| class == raw).count();
                if votes >= SMOOTHING_QUORUM { raw } else { current }
            }
        };
        self.accepted = Some(accepted);
        accepted
    }

    fn reading(&self, bounds: WindowBounds, thresholds: TrendThresholds) -> TrendReading {
        let segment_scores = self.segment_scores();
        let (bullish, bearish) = combine(&segment_scores);
        let raw_classification = classify(bullish, bearish, thresholds);
        TrendReading {
            bounds,
            score: score_for(raw_classification, bullish, bearish),
            classification: raw_classification,
            raw_classification,
            bullish,
            bearish,
            segment_scores,
            provisional: true,
        }
    }

    fn close_window(&mut self, bounds: WindowBounds, thresholds: TrendThresholds) -> TrendReading {
        let mut reading = self.reading(bounds, thresholds);
        reading.classification = self.smooth(reading.raw_classification);
        reading.score = score_for(reading.classification, reading.bullish, reading.bearish);
        reading.provisional = false;

        self.last_completed = Some(reading);
        self.segments.values_mut().for_each(SegmentCache::clear_observations);
        reading
    }
}

#[derive(Debug)]
struct Inner {
    windows: WindowRegistry,
    thresholds: TrendThresholds,
    symbols: FnvHashMap<SmolStr, SymbolTrend>,
}

#[derive(Debug)]
pub struct SegmentTrend {
    inner: RwLock<Inner>,
    policy: ColdStartPolicy,
}

impl SegmentTrend {
    pub fn new(window_secs: i64, thresholds: TrendThresholds, policy: ColdStartPolicy) -> Self {
        Self {
            inner: RwLock::new(Inner {
                windows: WindowRegistry::new(Feature::TrendScore, window_secs),
                thresholds: thresholds.clamped(),
                symbols: FnvHashMap::default(),
            }),
            policy,
        }
    }

    pub fn window_secs(&self) -> i64 {
        self.inner.read().windows.length_secs()
    }

    /// Apply a new window length, discarding every cache, smoothing history and result.
    pub fn set_window_secs(&self, requested: i64) -> i64 {
        let mut inner = self.inner.write();
        let applied = inner.windows.reconfigure(requested);
        inner.symbols.clear();
        applied
    }

    pub fn thresholds(&self) -> TrendThresholds {
        self.inner.read().thresholds
    }

    /// Clamp and apply new thresholds. They take effect from the next classification.
    pub fn set_thresholds(&self, requested: TrendThresholds) -> TrendThresholds {
        let thresholds = requested.clamped();
        if thresholds != requested {
            tracing::info!(?requested, ?thresholds, "trend thresholds clamped");
        }
        self.inner.write().thresholds = thresholds;
        thresholds
    }

    pub fn update(&self, chain: &ChainSnapshot) -> Result<TrendUpdate, MetricError> {
        let representatives = Segment::ALL
            .into_iter()
            .filter_map(|segment| chain.representative(segment).map(|contract| (segment, contract)))
            .collect::<Vec<_>>();
        for (_, contract) in &representatives {
            validate(contract)?;
        }

        let mut inner = self.inner.write();
        let Inner {
            windows,
            thresholds,
            symbols,
        } = &mut *inner;

        let state = windows.state_mut(&chain.symbol);
        let rolled = state.check_and_advance(chain.timestamp);
        let closed = if rolled { state.completed_bounds() } else { None };
        let current = state.current_bounds();

        let trend = symbols.entry(chain.symbol.clone()).or_default();
        let completed = closed.map(|bounds| trend.close_window(bounds, *thresholds));

        for (segment, contract) in representatives {
            trend.segments.entry(segment).or_default().observe(contract);
        }

        let display = match (trend.last_completed, self.policy, current) {
            (Some(reading), _, _) => Some(reading),
            (None, ColdStartPolicy::Provisional, Some(current)) => {
                Some(trend.reading(current, *thresholds))
            }
            _ => None,
        };

        Ok(TrendUpdate {
            symbol: chain.symbol.clone(),
            completed,
            display,
        })
    }

    pub fn last_completed(&self, symbol: &str) -> Option<TrendReading> {
        self.inner
            .read()
            .symbols
            .get(symbol)
            .and_then(|trend| trend.last_completed)
    }

    pub fn bounds(&self, symbol: &str, now: DateTime<Utc>) -> WindowBounds {
        self.inner.read().windows.bounds(symbol, now)
    }
}

fn validate(contract: &ContractSnapshot) -> Result<(), MetricError> {
    let fields = [
        ("last_price", contract.last_price),
        ("bid", contract.bid),
        ("ask", contract.ask),
    ];
    for (field, value) in fields {
        if let Some(value) = value {
            ensure_finite(value, field, &contract.instrument)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn rising() -> MetricDirections {
        MetricDirections {
            ltp: 1.0,
            volume: 1.0,
            bid: 1.0,
            ask: 1.0,
            bid_qty: 1.0,
            ask_qty: -1.0,
        }
    }

    fn chain(secs: i64, futures_ltp: f64, calls_ltp: f64, puts_ltp: f64) -> ChainSnapshot {
        let mut chain = ChainSnapshot::new("NIFTY", Some(24_000.0), time(secs));
        chain
            .futures
            .push(ContractSnapshot::new("NIFTY-FUT", time(secs)).with_last_price(futures_ltp));
        chain
            .calls
            .push(ContractSnapshot::new("NIFTY24000CE", time(secs)).with_last_price(calls_ltp));
        chain
            .puts
            .push(ContractSnapshot::new("NIFTY24000PE", time(secs)).with_last_price(puts_ltp));
        chain
    }

    #[test]
    fn test_segment_score() {
        struct TestCase {
            segment: Segment,
            input: MetricDirections,
            expected: f64,
        }

        let tests = vec![
            TestCase {
                // TC0: every metric confirms a rising futures contract
                segment: Segment::Futures,
                input: rising(),
                expected: 3.5,
            },
            TestCase {
                // TC1: puts invert
                segment: Segment::Puts,
                input: rising(),
                expected: -3.5,
            },
            TestCase {
                // TC2: ask against the price move is ignored
                segment: Segment::Calls,
                input: MetricDirections {
                    ltp: 1.0,
                    ask: -1.0,
                    ..Default::default()
                },
                expected: 1.0,
            },
            TestCase {
                // TC3: rising volume amplifies a falling price
                segment: Segment::Futures,
                input: MetricDirections {
                    ltp: -1.0,
                    volume: 1.0,
                    ..Default::default()
                },
                expected: -1.7,
            },
            TestCase {
                // TC4: flat price, only quantities move
                segment: Segment::Futures,
                input: MetricDirections {
                    bid_qty: 1.0,
                    ask_qty: 1.0,
                    ..Default::default()
                },
                expected: 0.0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = segment_score(test.segment, test.input);
            assert!((actual - test.expected).abs() < 1e-9, "TC{} failed", index);
        }
    }

    #[test]
    fn test_classify() {
        struct TestCase {
            bullish: f64,
            bearish: f64,
            expected: TrendClass,
        }

        let thresholds = TrendThresholds::default();
        let tests = vec![
            TestCase {
                // TC0: nothing crossed
                bullish: 2.0,
                bearish: -2.0,
                expected: TrendClass::Neutral,
            },
            TestCase {
                // TC1: bullish crossed
                bullish: 4.0,
                bearish: 1.0,
                expected: TrendClass::Bullish,
            },
            TestCase {
                // TC2: bearish crossed
                bullish: -4.0,
                bearish: -5.0,
                expected: TrendClass::Bearish,
            },
            TestCase {
                // TC3: threshold is inclusive
                bullish: 3.0,
                bearish: 0.0,
                expected: TrendClass::Bullish,
            },
            TestCase {
                // TC4: both crossed, bearish is larger
                bullish: 4.0,
                bearish: -5.0,
                expected: TrendClass::Bearish,
            },
            TestCase {
                // TC5: both crossed, bullish is larger
                bullish: 5.0,
                bearish: -4.0,
                expected: TrendClass::Bullish,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = classify(test.bullish, test.bearish, thresholds);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_score_for_classification() {
        struct TestCase {
            classification: TrendClass,
            bullish: f64,
            bearish: f64,
            expected: f64,
        }

        let tests = vec![
            TestCase {
                // TC0: bullish reports the bullish score
                classification: TrendClass::Bullish,
                bullish: 4.0,
                bearish: -5.0,
                expected: 4.0,
            },
            TestCase {
                // TC1: bearish reports the bearish score
                classification: TrendClass::Bearish,
                bullish: 5.0,
                bearish: -4.0,
                expected: -4.0,
            },
            TestCase {
                // TC2: neutral reports the larger magnitude, here bearish
                classification: TrendClass::Neutral,
                bullish: 1.0,
                bearish: -2.0,
                expected: -2.0,
            },
            TestCase {
                // TC3: neutral reports the larger magnitude, here bullish
                classification: TrendClass::Neutral,
                bullish: 2.5,
                bearish: 0.5,
                expected: 2.5,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = score_for(test.classification, test.bullish, test.bearish);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_combine_is_normalised() {
        let scores = SegmentScores {
            futures: 3.5,
            calls: 3.5,
            puts: 3.5,
        };
        let (bullish, bearish) = combine(&scores);
        assert!((bullish - 7.0).abs() < 1e-9);
        assert!((bearish - 7.0).abs() < 1e-9);

        let (bullish, _) = combine(&SegmentScores::default());
        assert_eq!(bullish, 0.0);
    }

    #[test]
    fn test_metric_direction_against_earlier_average() {
        let mut history = MetricHistory::default();
        assert_eq!(history.direction(), 0.0);

        history.push(Some(100.0));
        assert_eq!(history.direction(), 0.0);

        history.push(Some(100.05));
        assert_eq!(history.direction(), 0.0);

        history.push(Some(100.5));
        assert_eq!(history.direction(), 1.0);

        history.push(Some(99.0));
        assert_eq!(history.direction(), -1.0);
    }

    #[test]
    fn test_smoothing_rejects_single_flip() {
        let mut trend = SymbolTrend::default();
        assert_eq!(trend.smooth(TrendClass::Bullish), TrendClass::Bullish);
        assert_eq!(trend.smooth(TrendClass::Bearish), TrendClass::Bullish);
        assert_eq!(trend.smooth(TrendClass::Bearish), TrendClass::Bearish);
        // [Bearish, Bearish, Neutral]: Neutral holds one vote
        assert_eq!(trend.smooth(TrendClass::Neutral), TrendClass::Bearish);
    }

    #[test]
    fn test_rising_chain_is_bullish() {
        let calc = SegmentTrend::new(10, TrendThresholds::default(), ColdStartPolicy::Strict);

        // Calls and futures rise while puts fall within [100,110)
        calc.update(&chain(100, 24_100.0, 120.0, 80.0)).unwrap();
        let update = calc.update(&chain(105, 24_200.0, 130.0, 70.0)).unwrap();
        assert!(update.display.is_none());

        let reading = calc.update(&chain(110, 24_200.0, 130.0, 70.0)).unwrap().completed.unwrap();
        assert_eq!(reading.segment_scores.futures, 1.0);
        assert_eq!(reading.segment_scores.calls, 1.0);
        assert_eq!(reading.segment_scores.puts, 1.0);
        // 1.0 raw on every segment normalises to 2.0, below the default threshold
        assert_eq!(reading.classification, TrendClass::Neutral);
        assert!((reading.bullish - 2.0).abs() < 1e-9);

        calc.set_thresholds(TrendThresholds {
            bullish: 1.5,
            bearish: -1.5,
        });
        calc.update(&chain(115, 24_400.0, 140.0, 60.0)).unwrap();
        let reading = calc.update(&chain(120, 24_400.0, 140.0, 60.0)).unwrap().completed.unwrap();
        assert_eq!(reading.raw_classification, TrendClass::Bullish);
        // Neutral was accepted first, a single Bullish flip is held back
        assert_eq!(reading.classification, TrendClass::Neutral);
    }

    #[test]
    fn test_window_with_single_observation_is_neutral() {
        let calc = SegmentTrend::new(10, TrendThresholds::default(), ColdStartPolicy::Provisional);
        calc.update(&chain(100, 24_100.0, 120.0, 80.0)).unwrap();

        let update = calc.update(&chain(110, 24_500.0, 150.0, 50.0)).unwrap();
        let reading = update.completed.unwrap();
        assert_eq!(reading.segment_scores, SegmentScores::default());
        assert_eq!(reading.classification, TrendClass::Neutral);
    }

    #[test]
    fn test_representative_change_clears_segment_cache() {
        let mut cache = SegmentCache::default();
        let first = ContractSnapshot::new("NIFTY24000CE", time(100)).with_last_price(100.0);
        let second = ContractSnapshot::new("NIFTY24100CE", time(101)).with_last_price(50.0);

        cache.observe(&first);
        cache.observe(&first);
        cache.observe(&second);
        assert_eq!(cache.ltp.0.len(), 1);
        assert_eq!(cache.representative.as_deref(), Some("NIFTY24100CE"));
        assert_eq!(cache.score(Segment::Calls), 0.0);
    }

    #[test]
    fn test_non_finite_representative_is_rejected() {
        let calc = SegmentTrend::new(10, TrendThresholds::default(), ColdStartPolicy::Strict);
        assert!(calc.update(&chain(100, f64::INFINITY, 120.0, 80.0)).is_err());
        assert_eq!(calc.last_completed("NIFTY"), None);
    }

    #[test]
    fn test_thresholds_are_clamped() {
        let calc = SegmentTrend::new(10, TrendThresholds::default(), ColdStartPolicy::Strict);
        let applied = calc.set_thresholds(TrendThresholds {
            bullish: 25.0,
            bearish: 4.0,
        });
        assert_eq!(applied.bullish, 10.0);
        assert_eq!(applied.bearish, -0.5);
        assert_eq!(calc.thresholds(), applied);
    }
}
