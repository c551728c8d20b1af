//! JSON text-frame protocol between clients and the server, internally tagged by `type`.

use chainflow_metrics::{
    ChainSnapshot, EngineConfig, Feature, MetricResult, MetricsEngine, TrendThresholds,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One poll of a chain, as produced by the ingestion layer.
    Chain(ChainSnapshot),
    Admin { command: AdminCommand },
    Latest {
        symbol: SmolStr,
        #[serde(default)]
        features: Option<Vec<Feature>>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminCommand {
    GetConfig,
    SetWindow { feature: Feature, secs: i64 },
    SetThresholds { bullish: f64, bearish: f64 },
    /// Signed so out-of-range requests are clamped rather than rejected.
    SetMovementCacheSize { size: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        message: String,
        timestamp: DateTime<Utc>,
    },
    ChainUpdate {
        chain: ChainSnapshot,
        published: Vec<MetricResult>,
        failures: BTreeMap<Feature, String>,
    },
    Config {
        config: EngineConfig,
    },
    Latest {
        symbol: SmolStr,
        results: BTreeMap<Feature, MetricResult>,
    },
    Error {
        message: String,
    },
}

/// Where a response to a client message is delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Every connected client.
    Broadcast(ServerMessage),
    /// Only the client that sent the message.
    Reply(ServerMessage),
}

impl ServerMessage {
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            message: "Connected to chainflow metrics feed".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Parse a text frame into a [`ClientMessage`].
pub fn parse(text: &str) -> Result<ClientMessage, ServerMessage> {
    serde_json::from_str(text).map_err(|error| ServerMessage::error(format!("invalid message: {error}")))
}

/// Apply a client message to the engine.
pub fn handle(engine: &MetricsEngine, message: ClientMessage) -> Outbound {
    match message {
        ClientMessage::Chain(chain) => {
            let (chain, report) = engine.process(chain);
            Outbound::Broadcast(ServerMessage::ChainUpdate {
                chain: (*chain).clone(),
                published: report.published,
                failures: report.failures,
            })
        }
        ClientMessage::Admin { command } => {
            match command {
                AdminCommand::GetConfig => {}
                AdminCommand::SetWindow { feature, secs } => {
                    engine.set_window_secs(feature, secs);
                }
                AdminCommand::SetThresholds { bullish, bearish } => {
                    engine.set_thresholds(TrendThresholds { bullish, bearish });
                }
                AdminCommand::SetMovementCacheSize { size } => {
                    let size = usize::try_from(size.max(0)).unwrap_or(usize::MAX);
                    engine.set_movement_cache_size(size);
                }
            }
            Outbound::Reply(ServerMessage::Config {
                config: engine.config(),
            })
        }
        ClientMessage::Latest { symbol, features } => {
            let results = engine.latest(&symbol, features.as_deref());
            Outbound::Reply(ServerMessage::Latest { symbol, results })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_messages() {
        struct TestCase {
            input: &'static str,
            expected: Result<ClientMessage, ()>,
        }

        let tests = vec![
            TestCase {
                // TC0: admin set_window
                input: r#"{"type":"admin","command":{"action":"set_window","feature":"spot_trend","secs":14}}"#,
                expected: Ok(ClientMessage::Admin {
                    command: AdminCommand::SetWindow {
                        feature: Feature::SpotTrend,
                        secs: 14,
                    },
                }),
            },
            TestCase {
                // TC1: latest without features
                input: r#"{"type":"latest","symbol":"NIFTY"}"#,
                expected: Ok(ClientMessage::Latest {
                    symbol: SmolStr::new("NIFTY"),
                    features: None,
                }),
            },
            TestCase {
                // TC2: negative cache size is accepted for clamping
                input: r#"{"type":"admin","command":{"action":"set_movement_cache_size","size":-3}}"#,
                expected: Ok(ClientMessage::Admin {
                    command: AdminCommand::SetMovementCacheSize { size: -3 },
                }),
            },
            TestCase {
                // TC3: unknown type
                input: r#"{"type":"subscribe","symbol":"NIFTY"}"#,
                expected: Err(()),
            },
            TestCase {
                // TC4: not json
                input: "ping",
                expected: Err(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = parse(test.input).map_err(|_| ());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_parse_chain_message() {
        let input = r#"{
            "type": "chain",
            "symbol": "NIFTY",
            "spot_price": 24050.5,
            "timestamp": "2024-12-02T09:15:03Z",
            "calls": [{
                "instrument": "NIFTY24DEC24000CE",
                "last_price": 112.5,
                "bid": 112.0,
                "ask": 112.5,
                "bid_qty": 750,
                "ask_qty": 900,
                "volume": 1200000,
                "open_interest": 5400000,
                "timestamp": "2024-12-02T09:15:03Z"
            }]
        }"#;

        let ClientMessage::Chain(chain) = parse(input).unwrap() else {
            panic!("expected chain message");
        };
        assert_eq!(chain.symbol, "NIFTY");
        assert_eq!(chain.calls.len(), 1);
    }

    #[test]
    fn test_handle_admin_replies_with_clamped_config() {
        let engine = MetricsEngine::new(EngineConfig::default());
        let outbound = handle(
            &engine,
            ClientMessage::Admin {
                command: AdminCommand::SetThresholds {
                    bullish: 42.0,
                    bearish: -0.1,
                },
            },
        );

        let Outbound::Reply(ServerMessage::Config { config }) = outbound else {
            panic!("expected config reply");
        };
        assert_eq!(config.thresholds.bullish, 10.0);
        assert_eq!(config.thresholds.bearish, -0.5);
    }

    #[test]
    fn test_handle_clamps_movement_cache_size() {
        struct TestCase {
            size: i64,
            expected: usize,
        }

        let tests = vec![
            TestCase {
                // TC0: negative clamps to the minimum
                size: -3,
                expected: 2,
            },
            TestCase {
                // TC1: in range is kept
                size: 7,
                expected: 7,
            },
            TestCase {
                // TC2: above range clamps to the maximum
                size: i64::MAX,
                expected: 20,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let engine = MetricsEngine::new(EngineConfig::default());
            let outbound = handle(
                &engine,
                ClientMessage::Admin {
                    command: AdminCommand::SetMovementCacheSize { size: test.size },
                },
            );
            let Outbound::Reply(ServerMessage::Config { config }) = outbound else {
                panic!("TC{} failed: expected config reply", index);
            };
            assert_eq!(config.movement_cache_size, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_handle_latest_on_cold_start_is_missing() {
        let engine = MetricsEngine::new(EngineConfig::default());
        let outbound = handle(
            &engine,
            ClientMessage::Latest {
                symbol: SmolStr::new("NIFTY"),
                features: Some(vec![Feature::TrendScore]),
            },
        );

        let Outbound::Reply(message) = outbound else {
            panic!("expected reply");
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "latest");
        assert_eq!(json["results"]["trend_score"]["status"], "missing");
        assert!(json["results"]["trend_score"]["value"].is_null());
    }
}
