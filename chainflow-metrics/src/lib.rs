/// Chainflow Metrics - windowed analytics over derivatives chain snapshots
///
/// A polling ingestion layer hands the engine one [`ChainSnapshot`] per cycle. The engine:
/// - aligns every feature to wall-clock windows (`floor(epoch / W) * W`)
/// - enriches the snapshot in place with per-contract and chain-level metrics
/// - publishes completed windows to a versioned [`ResultStore`] with compare-and-publish
///
/// Features:
/// - eaten delta: consumed resting bid/ask quantity per instrument
/// - LTP movement: directional tick patterns per instrument
/// - trend score: weighted futures/calls/puts classification per chain
/// - spot trend: net movement of the underlying per chain
pub mod calc;
pub mod config;
pub mod engine;
pub mod error;
pub mod feature;
pub mod publish;
pub mod snapshot;
pub mod store;
pub mod window;

pub use config::{ColdStartPolicy, EngineConfig, TrendThresholds};
pub use engine::{CycleReport, MetricsEngine};
pub use error::MetricError;
pub use feature::Feature;
pub use publish::{MetricPublisher, PublishReport};
pub use snapshot::{
    ChainSnapshot, ContractSnapshot, Direction, Intensity, Segment, SegmentScores, TrendClass,
};
pub use store::{MetricResult, MetricStatus, ResultStore, StoreConfig};
pub use window::{WindowBounds, WindowState, normalize, window_start};
