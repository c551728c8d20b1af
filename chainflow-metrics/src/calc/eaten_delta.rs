//! Liquidity consumption ("eaten delta").
//!
//! A decrease in displayed resting quantity between two polls is read as consumption:
//! `ask_eaten = max(0, prev_ask - ask)` and `bid_eaten = max(0, prev_bid - bid)`. Order
//! cancellation and requoting produce the same signal, so the value is an approximation of
//! aggressive flow rather than a measurement of it.
//!
//! Per-tick deltas accumulate into the instrument's current window. At rollover the closed
//! window is summed into an immutable [`EatenWindow`], which stays the displayed value for the
//! whole of the next window.

use crate::{
    config::ColdStartPolicy,
    error::MetricError,
    feature::Feature,
    snapshot::ContractSnapshot,
    window::{WindowBounds, WindowRegistry},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Frozen totals of one completed window.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EatenWindow {
    pub bounds: WindowBounds,
    pub bid_eaten: i64,
    pub ask_eaten: i64,
    /// `ask_eaten - bid_eaten`: positive when offers were lifted more than bids were hit.
    pub eaten_delta: i64,
    pub events: usize,
}

/// Value shown on the enriched snapshot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EatenReading {
    pub bid_eaten: i64,
    pub ask_eaten: i64,
    pub eaten_delta: i64,
    /// True when the value is the running total of a window that has not closed yet.
    pub provisional: bool,
}

impl From<&EatenWindow> for EatenReading {
    fn from(window: &EatenWindow) -> Self {
        Self {
            bid_eaten: window.bid_eaten,
            ask_eaten: window.ask_eaten,
            eaten_delta: window.eaten_delta,
            provisional: false,
        }
    }
}

/// Outcome of feeding one snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EatenUpdate {
    pub instrument: SmolStr,
    /// Window closed by this snapshot, to be published.
    pub completed: Option<EatenWindow>,
    pub display: Option<EatenReading>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct ConsumptionEvent {
    time: DateTime<Utc>,
    bid_eaten: i64,
    ask_eaten: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Quote {
    bid_qty: i64,
    ask_qty: i64,
}

#[derive(Clone, Debug, Default)]
struct InstrumentFlow {
    previous: Option<Quote>,
    events: Vec<ConsumptionEvent>,
    last_completed: Option<EatenWindow>,
}

impl InstrumentFlow {
    fn close_window(&mut self, bounds: WindowBounds) -> EatenWindow {
        let (bid_eaten, ask_eaten, events) = self
            .events
            .iter()
            .filter(|event| bounds.contains(event.time))
            .fold((0i64, 0i64, 0usize), |(bid, ask, count), event| {
                (bid + event.bid_eaten, ask + event.ask_eaten, count + 1)
            });

        let window = EatenWindow {
            bounds,
            bid_eaten,
            ask_eaten,
            eaten_delta: ask_eaten - bid_eaten,
            events,
        };
        self.last_completed = Some(window);
        self.events.clear();
        window
    }

    fn running(&self) -> EatenReading {
        let (bid_eaten, ask_eaten) = self
            .events
            .iter()
            .fold((0i64, 0i64), |(bid, ask), event| (bid + event.bid_eaten, ask + event.ask_eaten));
        EatenReading {
            bid_eaten,
            ask_eaten,
            eaten_delta: ask_eaten - bid_eaten,
            provisional: true,
        }
    }

    fn display(&self, policy: ColdStartPolicy) -> Option<EatenReading> {
        match (&self.last_completed, policy) {
            (Some(window), _) => Some(EatenReading::from(window)),
            (None, ColdStartPolicy::Provisional) if self.previous.is_some() => Some(self.running()),
            (None, _) => None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    windows: WindowRegistry,
    flows: FnvHashMap<SmolStr, InstrumentFlow>,
}

#[derive(Debug)]
pub struct LiquidityConsumption {
    inner: RwLock<Inner>,
    policy: ColdStartPolicy,
}

impl LiquidityConsumption {
    pub fn new(window_secs: i64, policy: ColdStartPolicy) -> Self {
        Self {
            inner: RwLock::new(Inner {
                windows: WindowRegistry::new(Feature::EatenDelta, window_secs),
                flows: FnvHashMap::default(),
            }),
            policy,
        }
    }

    pub fn window_secs(&self) -> i64 {
        self.inner.read().windows.length_secs()
    }

    /// Apply a new window length. Accumulators and completed values of every instrument are
    /// discarded; tick baselines are kept so the next poll still yields a delta.
    pub fn set_window_secs(&self, requested: i64) -> i64 {
        let mut inner = self.inner.write();
        let applied = inner.windows.reconfigure(requested);
        for flow in inner.flows.values_mut() {
            flow.events.clear();
            flow.last_completed = None;
        }
        applied
    }

    /// Feed one contract snapshot, timestamped by the poll that produced it.
    pub fn update(&self, contract: &ContractSnapshot) -> Result<EatenUpdate, MetricError> {
        let instrument = &contract.instrument;
        let quote = match (contract.bid_qty, contract.ask_qty) {
            (Some(bid_qty), Some(ask_qty)) if bid_qty >= 0 && ask_qty >= 0 => Some(Quote { bid_qty, ask_qty }),
            (Some(_), Some(_)) => {
                return Err(MetricError::InvalidInput(format!(
                    "negative resting quantity for {instrument}"
                )));
            }
            _ => None,
        };

        let mut inner = self.inner.write();
        let Inner { windows, flows } = &mut *inner;

        let state = windows.state_mut(instrument);
        let rolled = state.check_and_advance(contract.timestamp);
        let closed = if rolled { state.completed_bounds() } else { None };
        // Late ticks are counted in the open window
        let event_time = state
            .current_start()
            .map_or(contract.timestamp, |start| contract.timestamp.max(start));

        let flow = flows.entry(instrument.clone()).or_default();

        // Close before appending: the tick that crosses the boundary belongs to the new window
        let completed = closed.map(|bounds| flow.close_window(bounds));

        if let Some(quote) = quote {
            if let Some(previous) = flow.previous {
                flow.events.push(ConsumptionEvent {
                    time: event_time,
                    bid_eaten: (previous.bid_qty - quote.bid_qty).max(0),
                    ask_eaten: (previous.ask_qty - quote.ask_qty).max(0),
                });
            }
            flow.previous = Some(quote);
        }

        Ok(EatenUpdate {
            instrument: instrument.clone(),
            completed,
            display: flow.display(self.policy),
        })
    }

    /// Last completed window of an instrument.
    pub fn last_completed(&self, instrument: &str) -> Option<EatenWindow> {
        self.inner
            .read()
            .flows
            .get(instrument)
            .and_then(|flow| flow.last_completed)
    }

    /// Displayed value of an instrument without feeding a snapshot.
    pub fn display(&self, instrument: &str) -> Option<EatenReading> {
        self.inner
            .read()
            .flows
            .get(instrument)
            .and_then(|flow| flow.display(self.policy))
    }
}
