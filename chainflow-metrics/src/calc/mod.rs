//! Metric calculators.
//!
//! Each calculator owns its per-key state behind a `parking_lot::RwLock`, so API readers can
//! query it while the poll writer updates it and a window reconfiguration is applied under the
//! same lock as normal updates. Calculators are synchronous and perform no I/O.

pub mod eaten_delta;
pub mod ltp_movement;
pub mod spot_trend;
pub mod trend_score;

pub use eaten_delta::{EatenReading, EatenUpdate, EatenWindow, LiquidityConsumption};
pub use ltp_movement::{MovementSignal, MovementUpdate, PriceMovement};
pub use spot_trend::{SpotTrend, SpotTrendReading, SpotUpdate};
pub use trend_score::{SegmentTrend, TrendReading, TrendUpdate};

/// Percentage change from `from` to `to`; `None` when `from` is zero or the result is not
/// finite.
pub(crate) fn percent_change(from: f64, to: f64) -> Option<f64> {
    if from == 0.0 {
        return None;
    }
    let pct = (to - from) / from * 100.0;
    pct.is_finite().then_some(pct)
}
