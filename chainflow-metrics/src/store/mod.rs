//! Versioned latest-result store.
//!
//! One [`MetricResult`] per (symbol, feature) plus a monotonic version counter. Final results
//! are committed with compare-and-publish on the expected version so the counter moves by
//! exactly one per committed window; partial results are plain overwrites.
//!
//! Reads go to the primary backend first, then to the optional durable backend, and return an
//! explicit [`MetricStatus::Missing`] result when neither holds anything.

mod backend;
mod result;

pub use backend::{MemoryBackend, MetricBackend, Ttl, hash_key, version_key};
pub use result::{MetricExtras, MetricResult, MetricStatus};

use crate::{error::MetricError, feature::Feature};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::{debug, warn};

/// Source of "now" for TTL bookkeeping.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Time-to-live configuration of the store.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub result_ttl_secs: i64,
    pub version_ttl_secs: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            result_ttl_secs: 300,
            version_ttl_secs: 3_600,
        }
    }
}

impl StoreConfig {
    pub fn with_result_ttl_secs(mut self, secs: i64) -> Self {
        self.result_ttl_secs = secs.max(1);
        self.version_ttl_secs = self.version_ttl_secs.max(self.result_ttl_secs);
        self
    }

    fn ttl(&self) -> Ttl {
        Ttl {
            result: ChronoDuration::seconds(self.result_ttl_secs),
            version: ChronoDuration::seconds(self.version_ttl_secs),
        }
    }
}

pub struct ResultStore {
    primary: Arc<dyn MetricBackend>,
    durable: Option<Arc<dyn MetricBackend>>,
    config: StoreConfig,
    clock: Clock,
}

impl fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStore")
            .field("primary", &self.primary.name())
            .field("durable", &self.durable.as_ref().map(|backend| backend.name()))
            .field("config", &self.config)
            .finish()
    }
}

impl ResultStore {
    pub fn new(primary: Arc<dyn MetricBackend>, config: StoreConfig) -> Self {
        Self {
            primary,
            durable: None,
            config,
            clock: Arc::new(Utc::now),
        }
    }

    /// Store backed by a single in-process [`MemoryBackend`].
    pub fn in_memory(config: StoreConfig) -> Self {
        Self::new(Arc::new(MemoryBackend::new("memory")), config)
    }

    /// Mirror every publish into `durable` and read from it when the primary is empty.
    pub fn with_durable(mut self, durable: Arc<dyn MetricBackend>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> StoreConfig {
        self.config
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Commit a completed-window result if the stored version equals `expected_version`.
    ///
    /// On success the returned result carries the new version. A lost race yields
    /// [`MetricError::VersionMismatch`] and leaves the stored value untouched.
    pub fn publish_final(
        &self,
        mut result: MetricResult,
        expected_version: u64,
    ) -> Result<MetricResult, MetricError> {
        let now = self.now();
        let ttl = self.config.ttl();

        result.status = MetricStatus::Final;
        result.version = expected_version + 1;
        let payload = serde_json::to_string(&result)?;

        self.restore_version(&result.symbol, result.feature, ttl, now)?;

        let version = self.primary.compare_and_publish(
            &result.symbol,
            result.feature,
            expected_version,
            payload.clone(),
            ttl,
            now,
        )?;
        debug_assert_eq!(version, result.version);

        if let Some(durable) = &self.durable {
            if let Err(error) =
                durable.overwrite(&result.symbol, result.feature, payload, Some(version), ttl, now)
            {
                warn!(
                    backend = durable.name(),
                    symbol = %result.symbol,
                    feature = %result.feature,
                    %error,
                    "failed to mirror final result to durable backend"
                );
            }
        }

        debug!(
            symbol = %result.symbol,
            feature = %result.feature,
            version,
            "published final result"
        );
        Ok(result)
    }

    /// Overwrite the latest result without touching the version counter.
    pub fn publish_partial(&self, mut result: MetricResult) -> Result<MetricResult, MetricError> {
        let now = self.now();
        let ttl = self.config.ttl();

        result.status = MetricStatus::Partial;
        result.version = self.get_version(&result.symbol, result.feature);
        let payload = serde_json::to_string(&result)?;

        self.primary
            .overwrite(&result.symbol, result.feature, payload.clone(), None, ttl, now)?;

        if let Some(durable) = &self.durable {
            if let Err(error) = durable.overwrite(&result.symbol, result.feature, payload, None, ttl, now) {
                warn!(
                    backend = durable.name(),
                    symbol = %result.symbol,
                    feature = %result.feature,
                    %error,
                    "failed to mirror partial result to durable backend"
                );
            }
        }
        Ok(result)
    }

    /// Latest result for (symbol, feature), or an explicit missing/pending result.
    pub fn get_latest(&self, symbol: &str, feature: Feature) -> MetricResult {
        let now = self.now();

        let found = self
            .read_field(self.primary.as_ref(), symbol, feature, now)
            .or_else(|| {
                self.durable
                    .as_ref()
                    .and_then(|durable| self.read_field(durable.as_ref(), symbol, feature, now))
            });

        found.unwrap_or_else(|| self.absent(symbol, feature, now))
    }

    /// Latest results for `features` (all features when `None`).
    pub fn get_latest_all(
        &self,
        symbol: &str,
        features: Option<&[Feature]>,
    ) -> BTreeMap<Feature, MetricResult> {
        let now = self.now();
        let wanted = features.unwrap_or(&Feature::ALL[..]);

        let primary = match self.primary.fields(symbol, now) {
            Ok(fields) => fields,
            Err(error) => {
                warn!(backend = self.primary.name(), symbol, %error, "failed to read result hash");
                BTreeMap::new()
            }
        };

        wanted
            .iter()
            .map(|&feature| {
                let result = primary
                    .get(&feature)
                    .and_then(|payload| decode(payload, symbol, feature))
                    .or_else(|| {
                        self.durable.as_ref().and_then(|durable| {
                            self.read_field(durable.as_ref(), symbol, feature, now)
                        })
                    })
                    .unwrap_or_else(|| self.absent(symbol, feature, now));
                (feature, result)
            })
            .collect()
    }

    /// Current version of (symbol, feature); 0 when nothing was ever committed.
    pub fn get_version(&self, symbol: &str, feature: Feature) -> u64 {
        let now = self.now();
        self.read_version(self.primary.as_ref(), symbol, feature, now)
            .or_else(|| {
                self.durable
                    .as_ref()
                    .and_then(|durable| self.read_version(durable.as_ref(), symbol, feature, now))
            })
            .unwrap_or(0)
    }

    /// Drop expired keys from every backend.
    pub fn sweep_expired(&self) -> usize {
        let now = self.now();
        let mut removed = self.primary.sweep(now);
        if let Some(durable) = &self.durable {
            removed += durable.sweep(now);
        }
        removed
    }

    /// Continue the durable counter when the primary has none, so a restarted process keeps
    /// the version sequence instead of starting over at 0.
    fn restore_version(
        &self,
        symbol: &str,
        feature: Feature,
        ttl: Ttl,
        now: DateTime<Utc>,
    ) -> Result<(), MetricError> {
        let Some(durable) = &self.durable else {
            return Ok(());
        };
        if self.read_version(self.primary.as_ref(), symbol, feature, now).is_some() {
            return Ok(());
        }
        if let Some(version) = self.read_version(durable.as_ref(), symbol, feature, now) {
            let seeded = self.primary.seed_version(symbol, feature, version, ttl, now)?;
            debug!(
                backend = durable.name(),
                symbol,
                %feature,
                version = seeded,
                "restored version counter from durable backend"
            );
        }
        Ok(())
    }

    fn read_field(
        &self,
        backend: &dyn MetricBackend,
        symbol: &str,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> Option<MetricResult> {
        match backend.field(symbol, feature, now) {
            Ok(Some(payload)) => decode(&payload, symbol, feature),
            Ok(None) => None,
            Err(error) => {
                warn!(backend = backend.name(), symbol, %feature, %error, "failed to read result");
                None
            }
        }
    }

    fn read_version(
        &self,
        backend: &dyn MetricBackend,
        symbol: &str,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> Option<u64> {
        match backend.version(symbol, feature, now) {
            Ok(version) => version,
            Err(error) => {
                warn!(backend = backend.name(), symbol, %feature, %error, "failed to read version");
                None
            }
        }
    }

    fn absent(&self, symbol: &str, feature: Feature, now: DateTime<Utc>) -> MetricResult {
        match self.get_version(symbol, feature) {
            0 => MetricResult::missing(symbol, feature, now),
            version => MetricResult::pending(symbol, feature, version, now),
        }
    }
}

fn decode(payload: &str, symbol: &str, feature: Feature) -> Option<MetricResult> {
    match serde_json::from_str::<MetricResult>(payload) {
        Ok(result) => Some(result),
        Err(error) => {
            warn!(symbol, %feature, %error, "discarding undecodable stored result");
            None
        }
    }
}
