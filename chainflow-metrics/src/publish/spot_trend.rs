use super::{MetricPublisher, PublishReport};
use crate::{
    calc::{SpotTrend, SpotTrendReading},
    config::ColdStartPolicy,
    error::MetricError,
    feature::Feature,
    snapshot::ChainSnapshot,
    store::{MetricExtras, MetricResult, ResultStore},
};
use std::sync::Arc;

#[derive(Debug)]
pub struct SpotTrendPublisher {
    calc: SpotTrend,
    store: Arc<ResultStore>,
}

impl SpotTrendPublisher {
    pub fn new(window_secs: i64, policy: ColdStartPolicy, store: Arc<ResultStore>) -> Self {
        Self {
            calc: SpotTrend::new(window_secs, policy),
            store,
        }
    }

    pub fn calculator(&self) -> &SpotTrend {
        &self.calc
    }
}

fn apply(chain: &mut ChainSnapshot, reading: Option<SpotTrendReading>) {
    chain.spot_trend_percent = reading.map(|reading| reading.percent);
    chain.spot_trend_direction = reading.map(|reading| reading.direction);
}

impl MetricPublisher for SpotTrendPublisher {
    fn feature(&self) -> Feature {
        Feature::SpotTrend
    }

    fn publish(&self, chain: &mut ChainSnapshot) -> Result<PublishReport, MetricError> {
        let mut report = PublishReport::default();
        let outcome = self.calc.update(&chain.symbol, chain.spot_price, chain.timestamp);
        chain.windows.insert(
            Feature::SpotTrend,
            self.calc.bounds(&chain.symbol, chain.timestamp),
        );

        let update = match outcome {
            Ok(update) => update,
            Err(error) => {
                let previous = self.calc.last_completed(&chain.symbol);
                apply(chain, previous);
                return Err(error);
            }
        };

        if let Some(reading) = update.completed {
            let result = MetricResult::windowed(
                update.symbol,
                Feature::SpotTrend,
                reading.bounds,
                Some(reading.percent),
                chain.timestamp,
            )
            .with_extras(MetricExtras {
                direction: Some(reading.direction),
                percent: Some(reading.percent),
                ..Default::default()
            });
            report.commit_final(&self.store, result);
        }

        apply(chain, update.display);
        Ok(report)
    }
}
