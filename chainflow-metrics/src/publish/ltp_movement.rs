use super::{MetricPublisher, PublishReport};
use crate::{
    calc::{MovementSignal, PriceMovement},
    error::MetricError,
    feature::Feature,
    snapshot::{ChainSnapshot, ContractSnapshot},
    store::{MetricExtras, MetricResult, ResultStore},
    window::WindowBounds,
};
use std::sync::Arc;

/// Publishes LTP movement signals as partial results whenever an instrument's signal changes.
///
/// Movement is event-driven rather than windowed, so it never advances the version counter.
#[derive(Debug)]
pub struct LtpMovementPublisher {
    calc: PriceMovement,
    store: Arc<ResultStore>,
}

impl LtpMovementPublisher {
    pub fn new(cache_size: usize, window_secs: i64, store: Arc<ResultStore>) -> Self {
        Self {
            calc: PriceMovement::new(cache_size, window_secs),
            store,
        }
    }

    pub fn calculator(&self) -> &PriceMovement {
        &self.calc
    }
}

fn apply(contract: &mut ContractSnapshot, signal: Option<MovementSignal>) {
    contract.movement_direction = signal.map(|signal| signal.direction);
    contract.movement_confidence = signal.map(|signal| signal.confidence);
    contract.movement_intensity = signal.map(|signal| signal.intensity);
}

impl MetricPublisher for LtpMovementPublisher {
    fn feature(&self) -> Feature {
        Feature::LtpMovement
    }

    fn publish(&self, chain: &mut ChainSnapshot) -> Result<PublishReport, MetricError> {
        let mut report = PublishReport::default();
        let computed_at = chain.timestamp;

        for contract in chain.contracts_mut() {
            match self.calc.update(contract) {
                Ok(update) => {
                    if let (true, Some(signal)) = (update.changed, update.signal) {
                        let result = MetricResult::live(
                            update.instrument,
                            Feature::LtpMovement,
                            Some(signal.confidence),
                            computed_at,
                        )
                        .with_extras(MetricExtras {
                            direction: Some(signal.direction),
                            confidence: Some(signal.confidence),
                            intensity: Some(signal.intensity),
                            percent: Some(signal.last_change_percent),
                            ..Default::default()
                        });
                        report.commit_partial(&self.store, result);
                    }
                    apply(contract, update.signal);
                }
                Err(error) => {
                    report.skip(Feature::LtpMovement, &contract.instrument, &error);
                    let previous = self.calc.signal(&contract.instrument);
                    apply(contract, previous);
                }
            }
        }

        chain.windows.insert(
            Feature::LtpMovement,
            WindowBounds::aligned(computed_at, self.calc.window_secs()),
        );
        Ok(report)
    }
}
