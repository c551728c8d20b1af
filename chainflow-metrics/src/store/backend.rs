//! Key/value backends behind the [`ResultStore`](super::ResultStore).
//!
//! The persisted representation is hash-per-symbol plus counter-per-(symbol, feature):
//!
//! - `chainflow:metrics:{symbol}` holds one JSON-serialised `MetricResult` per feature field.
//! - `chainflow:version:{symbol}:{feature}` holds the integer version counter.
//!
//! Both keys carry a time-to-live and can be rebuilt from nothing, so a backend losing every
//! key is equivalent to a cold start.

use crate::{error::MetricError, feature::Feature};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;

pub fn hash_key(symbol: &str) -> String {
    format!("chainflow:metrics:{symbol}")
}

pub fn version_key(symbol: &str, feature: Feature) -> String {
    format!("chainflow:version:{symbol}:{feature}")
}

/// Time-to-live applied to each kind of key on write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ttl {
    pub result: ChronoDuration,
    pub version: ChronoDuration,
}

/// Storage seam for published results.
///
/// `compare_and_publish` must be atomic with respect to every other call on the same backend:
/// an in-process implementation holds a single lock, a networked one would run a server-side
/// script.
pub trait MetricBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write `payload` and bump the version to `expected + 1`, only if the stored version
    /// (absent counts as 0) equals `expected`. Returns the new version.
    fn compare_and_publish(
        &self,
        symbol: &str,
        feature: Feature,
        expected: u64,
        payload: String,
        ttl: Ttl,
        now: DateTime<Utc>,
    ) -> Result<u64, MetricError>;

    /// Unconditionally write `payload`. When `version` is provided the counter is raised to at
    /// least that value, never lowered.
    fn overwrite(
        &self,
        symbol: &str,
        feature: Feature,
        payload: String,
        version: Option<u64>,
        ttl: Ttl,
        now: DateTime<Utc>,
    ) -> Result<(), MetricError>;

    /// Set the version counter to `version` only when no live counter exists. Returns the
    /// counter value after the call.
    fn seed_version(
        &self,
        symbol: &str,
        feature: Feature,
        version: u64,
        ttl: Ttl,
        now: DateTime<Utc>,
    ) -> Result<u64, MetricError>;

    fn field(&self, symbol: &str, feature: Feature, now: DateTime<Utc>) -> Result<Option<String>, MetricError>;

    fn fields(&self, symbol: &str, now: DateTime<Utc>) -> Result<BTreeMap<Feature, String>, MetricError>;

    fn version(&self, symbol: &str, feature: Feature, now: DateTime<Utc>) -> Result<Option<u64>, MetricError>;

    /// Drop expired keys, returning how many were removed.
    fn sweep(&self, now: DateTime<Utc>) -> usize;
}

#[derive(Clone, Debug, PartialEq)]
enum StoredValue {
    Hash(BTreeMap<Feature, String>),
    Counter(u64),
}

#[derive(Clone, Debug)]
struct Expiring {
    value: StoredValue,
    expires_at: DateTime<Utc>,
}

impl Expiring {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// In-process backend with per-key TTL, guarded by one mutex.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    name: &'static str,
    keys: Mutex<FnvHashMap<String, Expiring>>,
}

impl MemoryBackend {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            keys: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Number of live keys.
    pub fn key_count(&self, now: DateTime<Utc>) -> usize {
        self.keys.lock().values().filter(|entry| entry.is_live(now)).count()
    }

    fn read_counter(keys: &FnvHashMap<String, Expiring>, key: &str, now: DateTime<Utc>) -> Option<u64> {
        match keys.get(key) {
            Some(Expiring {
                value: StoredValue::Counter(version),
                expires_at,
            }) if now < *expires_at => Some(*version),
            _ => None,
        }
    }

    fn write_field(
        keys: &mut FnvHashMap<String, Expiring>,
        symbol: &str,
        feature: Feature,
        payload: String,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let entry = keys.entry(hash_key(symbol)).or_insert_with(|| Expiring {
            value: StoredValue::Hash(BTreeMap::new()),
            expires_at,
        });

        // Expired or wrongly-typed keys are replaced, as a key/value server would after expiry
        if !entry.is_live(now) || !matches!(entry.value, StoredValue::Hash(_)) {
            entry.value = StoredValue::Hash(BTreeMap::new());
        }
        if let StoredValue::Hash(fields) = &mut entry.value {
            fields.insert(feature, payload);
        }
        entry.expires_at = expires_at;
    }

    fn write_counter(
        keys: &mut FnvHashMap<String, Expiring>,
        symbol: &str,
        feature: Feature,
        version: u64,
        expires_at: DateTime<Utc>,
    ) {
        keys.insert(
            version_key(symbol, feature),
            Expiring {
                value: StoredValue::Counter(version),
                expires_at,
            },
        );
    }
}

impl MetricBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn compare_and_publish(
        &self,
        symbol: &str,
        feature: Feature,
        expected: u64,
        payload: String,
        ttl: Ttl,
        now: DateTime<Utc>,
    ) -> Result<u64, MetricError> {
        let mut keys = self.keys.lock();

        let actual = Self::read_counter(&keys, &version_key(symbol, feature), now).unwrap_or(0);
        if actual != expected {
            return Err(MetricError::VersionMismatch {
                symbol: symbol.into(),
                feature,
                expected,
                actual,
            });
        }

        let version = expected + 1;
        Self::write_field(&mut keys, symbol, feature, payload, now + ttl.result, now);
        Self::write_counter(&mut keys, symbol, feature, version, now + ttl.version);
        Ok(version)
    }

    fn overwrite(
        &self,
        symbol: &str,
        feature: Feature,
        payload: String,
        version: Option<u64>,
        ttl: Ttl,
        now: DateTime<Utc>,
    ) -> Result<(), MetricError> {
        let mut keys = self.keys.lock();
        Self::write_field(&mut keys, symbol, feature, payload, now + ttl.result, now);

        if let Some(version) = version {
            let current = Self::read_counter(&keys, &version_key(symbol, feature), now).unwrap_or(0);
            Self::write_counter(&mut keys, symbol, feature, current.max(version), now + ttl.version);
        }
        Ok(())
    }

    fn seed_version(
        &self,
        symbol: &str,
        feature: Feature,
        version: u64,
        ttl: Ttl,
        now: DateTime<Utc>,
    ) -> Result<u64, MetricError> {
        let mut keys = self.keys.lock();
        match Self::read_counter(&keys, &version_key(symbol, feature), now) {
            Some(current) => Ok(current),
            None => {
                Self::write_counter(&mut keys, symbol, feature, version, now + ttl.version);
                Ok(version)
            }
        }
    }

    fn field(&self, symbol: &str, feature: Feature, now: DateTime<Utc>) -> Result<Option<String>, MetricError> {
        let keys = self.keys.lock();
        match keys.get(&hash_key(symbol)) {
            Some(entry) if entry.is_live(now) => match &entry.value {
                StoredValue::Hash(fields) => Ok(fields.get(&feature).cloned()),
                StoredValue::Counter(_) => Err(MetricError::Backend(format!(
                    "{}: key {} holds a counter, expected a hash",
                    self.name,
                    hash_key(symbol)
                ))),
            },
            _ => Ok(None),
        }
    }

    fn fields(&self, symbol: &str, now: DateTime<Utc>) -> Result<BTreeMap<Feature, String>, MetricError> {
        let keys = self.keys.lock();
        match keys.get(&hash_key(symbol)) {
            Some(Expiring {
                value: StoredValue::Hash(fields),
                expires_at,
            }) if now < *expires_at => Ok(fields.clone()),
            _ => Ok(BTreeMap::new()),
        }
    }

    fn version(&self, symbol: &str, feature: Feature, now: DateTime<Utc>) -> Result<Option<u64>, MetricError> {
        let keys = self.keys.lock();
        Ok(Self::read_counter(&keys, &version_key(symbol, feature), now))
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut keys = self.keys.lock();
        let before = keys.len();
        keys.retain(|_, entry| entry.is_live(now));
        before - keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn ttl(result: i64, version: i64) -> Ttl {
        Ttl {
            result: ChronoDuration::seconds(result),
            version: ChronoDuration::seconds(version),
        }
    }

    #[test]
    fn test_compare_and_publish_checks_expected_version() {
        let backend = MemoryBackend::new("test");
        let now = time(1_000);

        assert_eq!(
            backend.compare_and_publish("NIFTY", Feature::SpotTrend, 0, "a".into(), ttl(60, 60), now),
            Ok(1)
        );
        assert_eq!(
            backend.compare_and_publish("NIFTY", Feature::SpotTrend, 0, "b".into(), ttl(60, 60), now),
            Err(MetricError::VersionMismatch {
                symbol: "NIFTY".into(),
                feature: Feature::SpotTrend,
                expected: 0,
                actual: 1,
            })
        );
        assert_eq!(backend.field("NIFTY", Feature::SpotTrend, now), Ok(Some("a".to_string())));
        assert_eq!(backend.version("NIFTY", Feature::SpotTrend, now), Ok(Some(1)));
    }

    #[test]
    fn test_fields_share_one_hash_per_symbol() {
        let backend = MemoryBackend::new("test");
        let now = time(1_000);
        backend
            .compare_and_publish("NIFTY", Feature::SpotTrend, 0, "spot".into(), ttl(60, 60), now)
            .unwrap();
        backend
            .compare_and_publish("NIFTY", Feature::TrendScore, 0, "trend".into(), ttl(60, 60), now)
            .unwrap();

        let fields = backend.fields("NIFTY", now).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[&Feature::TrendScore], "trend");
        // one hash + two counters
        assert_eq!(backend.key_count(now), 3);
    }

    #[test]
    fn test_keys_expire() {
        let backend = MemoryBackend::new("test");
        backend
            .compare_and_publish("NIFTY", Feature::SpotTrend, 0, "a".into(), ttl(10, 30), time(0))
            .unwrap();

        assert_eq!(backend.field("NIFTY", Feature::SpotTrend, time(11)), Ok(None));
        assert_eq!(backend.version("NIFTY", Feature::SpotTrend, time(11)), Ok(Some(1)));
        assert_eq!(backend.version("NIFTY", Feature::SpotTrend, time(31)), Ok(None));

        assert_eq!(backend.sweep(time(11)), 1);
        assert_eq!(backend.sweep(time(31)), 1);
        assert_eq!(backend.key_count(time(31)), 0);
    }

    #[test]
    fn test_overwrite_never_lowers_version() {
        let backend = MemoryBackend::new("test");
        let now = time(0);
        backend
            .overwrite("NIFTY", Feature::EatenDelta, "x".into(), Some(5), ttl(60, 60), now)
            .unwrap();
        backend
            .overwrite("NIFTY", Feature::EatenDelta, "y".into(), Some(3), ttl(60, 60), now)
            .unwrap();
        backend
            .overwrite("NIFTY", Feature::EatenDelta, "z".into(), None, ttl(60, 60), now)
            .unwrap();

        assert_eq!(backend.version("NIFTY", Feature::EatenDelta, now), Ok(Some(5)));
        assert_eq!(backend.field("NIFTY", Feature::EatenDelta, now), Ok(Some("z".to_string())));
    }

    #[test]
    fn test_seed_version_only_fills_absent_counter() {
        let backend = MemoryBackend::new("test");
        let now = time(0);

        assert_eq!(backend.seed_version("NIFTY", Feature::SpotTrend, 4, ttl(60, 60), now), Ok(4));
        assert_eq!(backend.seed_version("NIFTY", Feature::SpotTrend, 9, ttl(60, 60), now), Ok(4));
        assert_eq!(
            backend.compare_and_publish("NIFTY", Feature::SpotTrend, 4, "a".into(), ttl(60, 60), now),
            Ok(5)
        );

        // An expired counter is replaced
        assert_eq!(
            backend.seed_version("NIFTY", Feature::SpotTrend, 2, ttl(60, 60), time(61)),
            Ok(2)
        );
    }
}
