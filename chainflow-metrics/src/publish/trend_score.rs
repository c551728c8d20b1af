use super::{MetricPublisher, PublishReport};
use crate::{
    calc::{SegmentTrend, TrendReading},
    config::{ColdStartPolicy, TrendThresholds},
    error::MetricError,
    feature::Feature,
    snapshot::ChainSnapshot,
    store::{MetricExtras, MetricResult, ResultStore},
};
use std::sync::Arc;

#[derive(Debug)]
pub struct TrendScorePublisher {
    calc: SegmentTrend,
    store: Arc<ResultStore>,
}

impl TrendScorePublisher {
    pub fn new(
        window_secs: i64,
        thresholds: TrendThresholds,
        policy: ColdStartPolicy,
        store: Arc<ResultStore>,
    ) -> Self {
        Self {
            calc: SegmentTrend::new(window_secs, thresholds, policy),
            store,
        }
    }

    pub fn calculator(&self) -> &SegmentTrend {
        &self.calc
    }
}

fn apply(chain: &mut ChainSnapshot, reading: Option<TrendReading>) {
    chain.trend_score = reading.map(|reading| reading.score);
    chain.trend_classification = reading.map(|reading| reading.classification);
    chain.segment_scores = reading.map(|reading| reading.segment_scores);
}

impl MetricPublisher for TrendScorePublisher {
    fn feature(&self) -> Feature {
        Feature::TrendScore
    }

    fn publish(&self, chain: &mut ChainSnapshot) -> Result<PublishReport, MetricError> {
        let mut report = PublishReport::default();
        let outcome = self.calc.update(chain);
        chain.windows.insert(
            Feature::TrendScore,
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
                Feature::TrendScore,
                reading.bounds,
                Some(reading.score),
                chain.timestamp,
            )
            .with_extras(MetricExtras {
                classification: Some(reading.classification),
                segment_scores: Some(reading.segment_scores),
                bullish_score: Some(reading.bullish),
                bearish_score: Some(reading.bearish),
                ..Default::default()
            });
            report.commit_final(&self.store, result);
        }

        apply(chain, update.display);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ContractSnapshot, TrendClass};
    use crate::store::StoreConfig;
    use chrono::{DateTime, Utc};

    fn time(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn chain(secs: i64, futures_ltp: Option<f64>) -> ChainSnapshot {
        let mut chain = ChainSnapshot::new("BANKNIFTY", Some(51_000.0), time(secs));
        let mut future = ContractSnapshot::new("BANKNIFTY-FUT", time(secs));
        future.last_price = futures_ltp;
        chain.futures.push(future);
        chain
    }

    #[test]
    fn test_missing_segments_still_commit() {
        let store = Arc::new(ResultStore::in_memory(StoreConfig::default()));
        let publisher = TrendScorePublisher::new(
            10,
            TrendThresholds::default(),
            ColdStartPolicy::Strict,
            store.clone(),
        );

        let mut first = chain(100, Some(51_000.0));
        publisher.publish(&mut first).unwrap();
        assert_eq!(first.trend_score, None);

        publisher.publish(&mut chain(105, Some(51_500.0))).unwrap();

        let mut rolled = chain(110, Some(51_500.0));
        let report = publisher.publish(&mut rolled).unwrap();
        assert_eq!(report.published.len(), 1);

        let scores = rolled.segment_scores.unwrap();
        assert_eq!(scores.futures, 1.0);
        assert_eq!(scores.calls, 0.0);
        assert_eq!(scores.puts, 0.0);
        assert_eq!(rolled.trend_classification, Some(TrendClass::Neutral));

        let stored = store.get_latest("BANKNIFTY", Feature::TrendScore);
        assert_eq!(stored.version, 1);
        assert_eq!(stored.extras.classification, Some(TrendClass::Neutral));
        assert!(stored.extras.bullish_score.is_some());
    }

    #[test]
    fn test_rejected_chain_keeps_previous_reading() {
        let store = Arc::new(ResultStore::in_memory(StoreConfig::default()));
        let publisher =
            TrendScorePublisher::new(10, TrendThresholds::default(), ColdStartPolicy::Strict, store);

        publisher.publish(&mut chain(100, Some(51_000.0))).unwrap();
        publisher.publish(&mut chain(110, Some(51_000.0))).unwrap();

        let mut broken = chain(111, Some(f64::NAN));
        assert!(publisher.publish(&mut broken).is_err());
        assert_eq!(broken.trend_classification, Some(TrendClass::Neutral));
    }
}
