use super::{MetricPublisher, PublishReport};
use crate::{
    calc::{EatenReading, LiquidityConsumption},
    config::ColdStartPolicy,
    error::MetricError,
    feature::Feature,
    snapshot::{ChainSnapshot, ContractSnapshot},
    store::{MetricExtras, MetricResult, ResultStore},
    window::WindowBounds,
};
use std::sync::Arc;

/// Publishes per-instrument liquidity consumption, keyed by instrument id.
#[derive(Debug)]
pub struct EatenDeltaPublisher {
    calc: LiquidityConsumption,
    store: Arc<ResultStore>,
}

impl EatenDeltaPublisher {
    pub fn new(window_secs: i64, policy: ColdStartPolicy, store: Arc<ResultStore>) -> Self {
        Self {
            calc: LiquidityConsumption::new(window_secs, policy),
            store,
        }
    }

    pub fn calculator(&self) -> &LiquidityConsumption {
        &self.calc
    }
}

fn apply(contract: &mut ContractSnapshot, reading: Option<EatenReading>) {
    contract.eaten_delta = reading.map(|reading| reading.eaten_delta);
    contract.bid_eaten = reading.map(|reading| reading.bid_eaten);
    contract.ask_eaten = reading.map(|reading| reading.ask_eaten);
}

impl MetricPublisher for EatenDeltaPublisher {
    fn feature(&self) -> Feature {
        Feature::EatenDelta
    }

    fn publish(&self, chain: &mut ChainSnapshot) -> Result<PublishReport, MetricError> {
        let mut report = PublishReport::default();
        let computed_at = chain.timestamp;

        for contract in chain.contracts_mut() {
            match self.calc.update(contract) {
                Ok(update) => {
                    if let Some(window) = update.completed {
                        let result = MetricResult::windowed(
                            update.instrument,
                            Feature::EatenDelta,
                            window.bounds,
                            Some(window.eaten_delta as f64),
                            computed_at,
                        )
                        .with_extras(MetricExtras {
                            bid_eaten: Some(window.bid_eaten),
                            ask_eaten: Some(window.ask_eaten),
                            ..Default::default()
                        });
                        report.commit_final(&self.store, result);
                    }
                    apply(contract, update.display);
                }
                Err(error) => {
                    report.skip(Feature::EatenDelta, &contract.instrument, &error);
                    let previous = self.calc.display(&contract.instrument);
                    apply(contract, previous);
                }
            }
        }

        chain.windows.insert(
            Feature::EatenDelta,
            WindowBounds::aligned(computed_at, self.calc.window_secs()),
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MetricStatus, StoreConfig};
    use chrono::{DateTime, Utc};

    fn time(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn chain(secs: i64, bid_qty: i64, ask_qty: i64) -> ChainSnapshot {
        let mut chain = ChainSnapshot::new("NIFTY", Some(24_000.0), time(secs));
        chain.calls.push(
            ContractSnapshot::new("NIFTY24000CE", time(secs)).with_quote(120.0, bid_qty, 120.5, ask_qty),
        );
        chain
    }

    #[test]
    fn test_publishes_completed_window_per_instrument() {
        let store = Arc::new(ResultStore::in_memory(StoreConfig::default()));
        let publisher = EatenDeltaPublisher::new(5, ColdStartPolicy::Strict, store.clone());

        let mut first = chain(100, 500, 500);
        publisher.publish(&mut first).unwrap();
        assert_eq!(first.calls[0].eaten_delta, None);
        assert_eq!(first.windows[&Feature::EatenDelta].start, time(100));

        publisher.publish(&mut chain(102, 450, 300)).unwrap();
        assert!(store.get_latest("NIFTY24000CE", Feature::EatenDelta).is_missing());

        let mut rolled = chain(105, 450, 300);
        let report = publisher.publish(&mut rolled).unwrap();
        assert_eq!(report.published.len(), 1);
        assert_eq!(rolled.calls[0].eaten_delta, Some(150));
        assert_eq!(rolled.calls[0].bid_eaten, Some(50));
        assert_eq!(rolled.calls[0].ask_eaten, Some(200));

        let stored = store.get_latest("NIFTY24000CE", Feature::EatenDelta);
        assert_eq!(stored.status, MetricStatus::Final);
        assert_eq!(stored.value, Some(150.0));
        assert_eq!(stored.version, 1);
        assert_eq!(stored.extras.ask_eaten, Some(200));
    }

    #[test]
    fn test_failing_contract_keeps_previous_value() {
        let store = Arc::new(ResultStore::in_memory(StoreConfig::default()));
        let publisher = EatenDeltaPublisher::new(5, ColdStartPolicy::Strict, store);

        publisher.publish(&mut chain(100, 500, 500)).unwrap();
        publisher.publish(&mut chain(101, 400, 500)).unwrap();
        publisher.publish(&mut chain(105, 400, 500)).unwrap();

        let mut broken = chain(106, -1, 500);
        let report = publisher.publish(&mut broken).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(broken.calls[0].bid_eaten, Some(100));
        assert_eq!(broken.calls[0].eaten_delta, Some(-100));
    }
}
