use crate::feature::Feature;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// All errors generated in `chainflow-metrics`.
///
/// None of these are fatal to the host process: publishers log them and skip the affected
/// calculation or publish.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum MetricError {
    #[error(
        "\
        VersionMismatch: publish of {feature} for {symbol} expected version {expected} \
        but the store holds {actual} \
    "
    )]
    VersionMismatch {
        symbol: SmolStr,
        feature: Feature,
        expected: u64,
        actual: u64,
    },

    #[error("non-finite value in field {field} of instrument {instrument}")]
    NonFinite {
        field: SmolStr,
        instrument: SmolStr,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to serialise MetricResult: {0}")]
    Serialise(String),

    #[error("result store backend error: {0}")]
    Backend(String),
}

impl MetricError {
    /// Determine if an error is a lost compare-and-publish race.
    ///
    /// A conflict means another writer committed the window first and the stored value is
    /// intact, so the caller should re-read the version rather than retry blindly.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_conflict(&self) -> bool {
        match self {
            MetricError::VersionMismatch { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for MetricError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialise(value.to_string())
    }
}

/// Reject NaN and infinite values before they reach a calculator.
pub(crate) fn ensure_finite(
    value: f64,
    field: &'static str,
    instrument: &SmolStr,
) -> Result<f64, MetricError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(MetricError::NonFinite {
            field: SmolStr::new_static(field),
            instrument: instrument.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_error_is_conflict() {
        struct TestCase {
            input: MetricError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: is conflict w/ MetricError::VersionMismatch
                input: MetricError::VersionMismatch {
                    symbol: SmolStr::new("NIFTY"),
                    feature: Feature::SpotTrend,
                    expected: 3,
                    actual: 4,
                },
                expected: true,
            },
            TestCase {
                // TC1: is not conflict w/ MetricError::Serialise
                input: MetricError::Serialise("key must be a string".to_string()),
                expected: false,
            },
            TestCase {
                // TC2: is not conflict w/ MetricError::NonFinite
                input: MetricError::NonFinite {
                    field: SmolStr::new("last_price"),
                    instrument: SmolStr::new("NIFTY24DEC24000CE"),
                },
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_conflict();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_ensure_finite() {
        let id = SmolStr::new("BANKNIFTY-FUT");
        assert_eq!(ensure_finite(101.5, "bid", &id), Ok(101.5));
        assert!(matches!(
            ensure_finite(f64::NAN, "bid", &id),
            Err(MetricError::NonFinite { ref field, .. }) if field == "bid"
        ));
        assert!(ensure_finite(f64::INFINITY, "ask", &id).is_err());
    }
}
