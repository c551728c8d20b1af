//! Publishers bridge calculators to the enriched snapshot and the [`ResultStore`].
//!
//! Each publisher feeds one calculator, writes the displayed value onto the chain in place and
//! commits newly completed windows with compare-and-publish. Failures never escape a cycle: a
//! failing contract keeps its previous completed value and a lost race or store error skips
//! the publish with a warning.

mod eaten_delta;
mod ltp_movement;
mod spot_trend;
mod trend_score;

pub use eaten_delta::EatenDeltaPublisher;
pub use ltp_movement::LtpMovementPublisher;
pub use spot_trend::SpotTrendPublisher;
pub use trend_score::TrendScorePublisher;

use crate::{
    error::MetricError,
    feature::Feature,
    snapshot::ChainSnapshot,
    store::{MetricResult, ResultStore},
};
use tracing::warn;

/// Defines how a feature enriches a [`ChainSnapshot`] and publishes its results.
pub trait MetricPublisher: Send + Sync {
    fn feature(&self) -> Feature;

    /// Process one poll of `chain`.
    ///
    /// An `Err` means the chain-level calculation was rejected; the chain still carries the
    /// previous completed value for this feature.
    fn publish(&self, chain: &mut ChainSnapshot) -> Result<PublishReport, MetricError>;
}

/// What a publisher wrote during one cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishReport {
    pub published: Vec<MetricResult>,
    /// Contracts or publishes skipped because of an error.
    pub skipped: usize,
}

impl PublishReport {
    /// Commit a completed-window result against the currently stored version.
    pub(crate) fn commit_final(&mut self, store: &ResultStore, result: MetricResult) {
        let expected = store.get_version(&result.symbol, result.feature);
        let (symbol, feature) = (result.symbol.clone(), result.feature);

        match store.publish_final(result, expected) {
            Ok(published) => self.published.push(published),
            Err(error) if error.is_conflict() => {
                warn!(%symbol, %feature, %error, "lost compare-and-publish race, keeping stored result");
                self.skipped += 1;
            }
            Err(error) => {
                warn!(%symbol, %feature, %error, "failed to publish final result");
                self.skipped += 1;
            }
        }
    }

    pub(crate) fn commit_partial(&mut self, store: &ResultStore, result: MetricResult) {
        let (symbol, feature) = (result.symbol.clone(), result.feature);

        match store.publish_partial(result) {
            Ok(published) => self.published.push(published),
            Err(error) => {
                warn!(%symbol, %feature, %error, "failed to publish partial result");
                self.skipped += 1;
            }
        }
    }

    pub(crate) fn skip(&mut self, feature: Feature, instrument: &str, error: &MetricError) {
        warn!(%feature, instrument, %error, "calculation failed, keeping previous value");
        self.skipped += 1;
    }
}
