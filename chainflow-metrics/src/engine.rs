use crate::{
    config::{ColdStartPolicy, EngineConfig, TrendThresholds},
    feature::Feature,
    publish::{
        EatenDeltaPublisher, LtpMovementPublisher, MetricPublisher, SpotTrendPublisher,
        TrendScorePublisher,
    },
    snapshot::ChainSnapshot,
    store::{MetricResult, ResultStore, StoreConfig},
};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::Serialize;
use smol_str::SmolStr;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info, warn};

/// Outcome of one [`MetricsEngine::process_chain`] cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Results written to the store during the cycle.
    pub published: Vec<MetricResult>,
    /// Features whose chain-level calculation was rejected.
    pub failures: BTreeMap<Feature, String>,
    /// Contracts or publishes skipped inside otherwise successful features.
    pub skipped: usize,
}

/// State container of every calculator, the result store and the latest enriched chains.
///
/// Constructed once by the host and shared behind an `Arc`. Calculators are isolated from each
/// other: a failure in one feature never prevents the others from running.
#[derive(Debug)]
pub struct MetricsEngine {
    store: Arc<ResultStore>,
    cold_start: ColdStartPolicy,
    result_ttl_secs: i64,
    eaten: EatenDeltaPublisher,
    movement: LtpMovementPublisher,
    trend: TrendScorePublisher,
    spot: SpotTrendPublisher,
    chains: RwLock<FnvHashMap<SmolStr, Arc<ChainSnapshot>>>,
}

impl MetricsEngine {
    /// Engine with an in-process result store.
    pub fn new(config: EngineConfig) -> Self {
        let store = ResultStore::in_memory(
            StoreConfig::default().with_result_ttl_secs(config.result_ttl_secs),
        );
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: EngineConfig, store: Arc<ResultStore>) -> Self {
        let config = config.normalized();
        info!(?config, "initialising metrics engine");

        Self {
            eaten: EatenDeltaPublisher::new(config.eaten_window_secs, config.cold_start, store.clone()),
            movement: LtpMovementPublisher::new(
                config.movement_cache_size,
                config.movement_window_secs,
                store.clone(),
            ),
            trend: TrendScorePublisher::new(
                config.trend_window_secs,
                config.thresholds,
                config.cold_start,
                store.clone(),
            ),
            spot: SpotTrendPublisher::new(config.spot_window_secs, config.cold_start, store.clone()),
            store,
            cold_start: config.cold_start,
            result_ttl_secs: config.result_ttl_secs,
            chains: RwLock::new(FnvHashMap::default()),
        }
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    fn publishers(&self) -> [&dyn MetricPublisher; 4] {
        [&self.eaten, &self.movement, &self.trend, &self.spot]
    }

    /// Run every calculator over one poll of `chain`, enriching it in place.
    pub fn process_chain(&self, chain: &mut ChainSnapshot) -> CycleReport {
        let mut report = CycleReport::default();

        for publisher in self.publishers() {
            match publisher.publish(chain) {
                Ok(feature_report) => {
                    report.published.extend(feature_report.published);
                    report.skipped += feature_report.skipped;
                }
                Err(error) => {
                    warn!(
                        symbol = %chain.symbol,
                        feature = %publisher.feature(),
                        %error,
                        "feature calculation rejected chain, keeping previous value"
                    );
                    report.failures.insert(publisher.feature(), error.to_string());
                }
            }
        }

        self.chains
            .write()
            .insert(chain.symbol.clone(), Arc::new(chain.clone()));

        debug!(
            symbol = %chain.symbol,
            published = report.published.len(),
            skipped = report.skipped,
            failures = report.failures.len(),
            "processed chain"
        );
        report
    }

    /// Owned variant of [`Self::process_chain`] returning the shared enriched chain.
    pub fn process(&self, mut chain: ChainSnapshot) -> (Arc<ChainSnapshot>, CycleReport) {
        let report = self.process_chain(&mut chain);
        (Arc::new(chain), report)
    }

    /// Most recent enriched chain of `symbol`.
    pub fn latest_chain(&self, symbol: &str) -> Option<Arc<ChainSnapshot>> {
        self.chains.read().get(symbol).cloned()
    }

    pub fn latest(&self, symbol: &str, features: Option<&[Feature]>) -> BTreeMap<Feature, MetricResult> {
        self.store.get_latest_all(symbol, features)
    }

    pub fn window_secs(&self, feature: Feature) -> i64 {
        match feature {
            Feature::EatenDelta => self.eaten.calculator().window_secs(),
            Feature::LtpMovement => self.movement.calculator().window_secs(),
            Feature::TrendScore => self.trend.calculator().window_secs(),
            Feature::SpotTrend => self.spot.calculator().window_secs(),
        }
    }

    /// Normalise and apply a window length, resetting that feature's state. Returns the
    /// applied length.
    pub fn set_window_secs(&self, feature: Feature, requested: i64) -> i64 {
        let applied = match feature {
            Feature::EatenDelta => self.eaten.calculator().set_window_secs(requested),
            Feature::LtpMovement => self.movement.calculator().set_window_secs(requested),
            Feature::TrendScore => self.trend.calculator().set_window_secs(requested),
            Feature::SpotTrend => self.spot.calculator().set_window_secs(requested),
        };
        info!(%feature, requested, applied, "window length reconfigured");
        applied
    }

    pub fn thresholds(&self) -> TrendThresholds {
        self.trend.calculator().thresholds()
    }

    pub fn set_thresholds(&self, thresholds: TrendThresholds) -> TrendThresholds {
        self.trend.calculator().set_thresholds(thresholds)
    }

    pub fn movement_cache_size(&self) -> usize {
        self.movement.calculator().cache_size()
    }

    pub fn set_movement_cache_size(&self, size: usize) -> usize {
        self.movement.calculator().set_cache_size(size)
    }

    /// Current runtime configuration, including administrative changes.
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            eaten_window_secs: self.window_secs(Feature::EatenDelta),
            movement_window_secs: self.window_secs(Feature::LtpMovement),
            trend_window_secs: self.window_secs(Feature::TrendScore),
            spot_window_secs: self.window_secs(Feature::SpotTrend),
            movement_cache_size: self.movement_cache_size(),
            thresholds: self.thresholds(),
            result_ttl_secs: self.result_ttl_secs,
            cold_start: self.cold_start,
        }
    }
}
