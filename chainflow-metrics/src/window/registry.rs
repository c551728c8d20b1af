use super::{WindowBounds, WindowState, normalize};
use crate::feature::Feature;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use smol_str::SmolStr;

/// Lazily-created [`WindowState`]s of one feature, keyed by symbol or instrument id.
///
/// Owned by a calculator and mutated under the calculator's own lock, so a reconfiguration can
/// never interleave with an update.
#[derive(Clone, Debug)]
pub struct WindowRegistry {
    feature: Feature,
    length_secs: i64,
    states: FnvHashMap<SmolStr, WindowState>,
}

impl WindowRegistry {
    pub fn new(feature: Feature, requested_secs: i64) -> Self {
        Self {
            feature,
            length_secs: normalize(feature, requested_secs),
            states: FnvHashMap::default(),
        }
    }

    pub fn feature(&self) -> Feature {
        self.feature
    }

    pub fn length_secs(&self) -> i64 {
        self.length_secs
    }

    /// Normalise and apply a new window length, resetting every tracked state.
    ///
    /// Returns the applied length.
    pub fn reconfigure(&mut self, requested_secs: i64) -> i64 {
        let length_secs = normalize(self.feature, requested_secs);
        if length_secs != requested_secs {
            tracing::info!(
                feature = %self.feature,
                requested_secs,
                length_secs,
                "window length normalised to supported value"
            );
        }
        self.length_secs = length_secs;
        for state in self.states.values_mut() {
            state.reconfigure(length_secs);
        }
        length_secs
    }

    pub fn state(&self, key: &str) -> Option<&WindowState> {
        self.states.get(key)
    }

    pub fn state_mut(&mut self, key: &SmolStr) -> &mut WindowState {
        let length_secs = self.length_secs;
        self.states
            .entry(key.clone())
            .or_insert_with(|| WindowState::new(length_secs))
    }

    pub fn check_and_advance(&mut self, key: &SmolStr, now: DateTime<Utc>) -> bool {
        self.state_mut(key).check_and_advance(now)
    }

    /// Current window of `key`, or the aligned window of `now` if `key` was never observed.
    pub fn bounds(&self, key: &str, now: DateTime<Utc>) -> WindowBounds {
        self.state(key)
            .and_then(WindowState::current_bounds)
            .unwrap_or_else(|| WindowBounds::aligned(now, self.length_secs))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_registry_creates_states_lazily() {
        let mut registry = WindowRegistry::new(Feature::EatenDelta, 5);
        assert!(registry.is_empty());

        let key = SmolStr::new("NIFTY24000CE");
        assert!(registry.check_and_advance(&key, time(101)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.state("NIFTY24000CE").unwrap().length_secs(), 5);
    }

    #[test]
    fn test_registry_reconfigure_resets_all_states() {
        let mut registry = WindowRegistry::new(Feature::EatenDelta, 5);
        let a = SmolStr::new("A");
        let b = SmolStr::new("B");
        registry.check_and_advance(&a, time(101));
        registry.check_and_advance(&a, time(106));
        registry.check_and_advance(&b, time(101));

        assert_eq!(registry.reconfigure(8), 7);
        for key in ["A", "B"] {
            let state = registry.state(key).unwrap();
            assert_eq!(state.length_secs(), 7);
            assert_eq!(state.current_start(), None);
            assert!(!state.has_completed_window());
        }
    }

    #[test]
    fn test_registry_bounds_fallback() {
        let registry = WindowRegistry::new(Feature::SpotTrend, 10);
        let bounds = registry.bounds("NIFTY", time(123));
        assert_eq!(bounds.start, time(120));
        assert_eq!(bounds.end, time(130));
    }
}
