//! Raw analytics rows from `system.hdb_analytics`, decoded into one variant
//! per `metric` discriminator.
//!
//! Decoding never fails: a missing numeric field reads as zero and a missing
//! dimension reads as an empty string, so one odd row cannot sink a scrape.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::summary::Quantiles;

/// An analytics row as it came off the wire.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Map<String, Value>);

impl RawRecord {
    /// Only JSON objects are records; anything else is dropped.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Numeric field; numeric strings are accepted, everything else is `None`.
    pub fn num(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Numeric field with the zero fallback applied.
    pub fn num_or_zero(&self, key: &str) -> f64 {
        self.num(key).filter(|v| !v.is_nan()).unwrap_or(0.0)
    }

    /// Field as label text. Absent and null read as empty.
    pub fn text(&self, key: &str) -> String {
        match self.0.get(key) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    pub fn quantiles(&self) -> Quantiles {
        Quantiles {
            p1: self.num_or_zero("p1"),
            p10: self.num_or_zero("p10"),
            p25: self.num_or_zero("p25"),
            median: self.num_or_zero("median"),
            p75: self.num_or_zero("p75"),
            p90: self.num_or_zero("p90"),
            p95: self.num_or_zero("p95"),
            p99: self.num_or_zero("p99"),
            mean: self.num_or_zero("mean"),
            count: self.num_or_zero("count"),
        }
    }
}

/// Which request-latency summary a record feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyMetric {
    Ttfb,
    Duration,
    Transfer,
}

impl LatencyMetric {
    pub fn name(self) -> &'static str {
        match self {
            LatencyMetric::Ttfb => "TTFB",
            LatencyMetric::Duration => "duration",
            LatencyMetric::Transfer => "transfer",
        }
    }
}

/// Per-message traffic dimensions shared by `bytes-sent` and `bytes-received`.
#[derive(Debug, Clone, PartialEq)]
pub struct Traffic {
    pub protocol: String,
    pub action: String,
    pub topic: String,
    pub messages: f64,
    pub mean_bytes: f64,
}

impl Traffic {
    pub fn bytes(&self) -> f64 {
        self.messages * self.mean_bytes
    }

    fn decode(raw: &RawRecord) -> Self {
        Self {
            protocol: raw.text("type"),
            action: raw.text("method"),
            topic: raw.text("path"),
            messages: raw.num_or_zero("count"),
            mean_bytes: raw.num_or_zero("mean"),
        }
    }
}

/// One analytics row, by discriminator.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyticsRecord {
    /// `count` is connection attempts, `total` is successful connections.
    Connection {
        protocol: String,
        action: String,
        attempts: f64,
        successes: f64,
    },
    MqttConnections { open: f64 },
    WsConnections { open: f64 },
    AclFail { topic: String, total: f64 },
    BytesSent(Traffic),
    BytesReceived(Traffic),
    /// `count` is lookups, `total` is hits.
    CacheHit { table: String, lookups: f64, hits: f64 },
    Success {
        path: String,
        method: String,
        kind: String,
        total: f64,
        successes: f64,
    },
    Latency {
        metric: LatencyMetric,
        kind: String,
        path: String,
        method: String,
        quantiles: Quantiles,
    },
    CacheResolution { table: String, quantiles: Quantiles },
    ReplicationLatency {
        origin: String,
        database: String,
        table: String,
        quantiles: Quantiles,
    },
    ResponseStatus {
        code: String,
        path: String,
        method: String,
        count: f64,
    },
    /// Anything without a built-in mapping; left for custom metric rules.
    Other(RawRecord),
}

impl From<RawRecord> for AnalyticsRecord {
    fn from(raw: RawRecord) -> Self {
        let metric = raw.text("metric");
        match metric.as_str() {
            "connection" => AnalyticsRecord::Connection {
                protocol: raw.text("path"),
                action: raw.text("method"),
                attempts: raw.num_or_zero("count"),
                successes: raw.num_or_zero("total"),
            },
            "mqtt-connections" => AnalyticsRecord::MqttConnections {
                // older servers reported the gauge under `count`
                open: raw.num("connections").or_else(|| raw.num("count")).unwrap_or(0.0),
            },
            "connections" => AnalyticsRecord::WsConnections {
                open: raw.num_or_zero("connections"),
            },
            "acl-fail" => AnalyticsRecord::AclFail {
                topic: raw.text("path"),
                total: raw.num_or_zero("total"),
            },
            "bytes-sent" => AnalyticsRecord::BytesSent(Traffic::decode(&raw)),
            "bytes-received" => AnalyticsRecord::BytesReceived(Traffic::decode(&raw)),
            "cache-hit" => AnalyticsRecord::CacheHit {
                table: raw.text("path"),
                lookups: raw.num_or_zero("count"),
                hits: raw.num_or_zero("total"),
            },
            "success" => AnalyticsRecord::Success {
                path: raw.text("path"),
                method: raw.text("method"),
                kind: raw.text("type"),
                total: raw.num_or_zero("total"),
                successes: raw.num_or_zero("count"),
            },
            "TTFB" | "duration" | "transfer" => AnalyticsRecord::Latency {
                metric: match metric.as_str() {
                    "TTFB" => LatencyMetric::Ttfb,
                    "duration" => LatencyMetric::Duration,
                    _ => LatencyMetric::Transfer,
                },
                kind: raw.text("type"),
                path: raw.text("path"),
                method: raw.text("method"),
                quantiles: raw.quantiles(),
            },
            "cache-resolution" => AnalyticsRecord::CacheResolution {
                table: raw.text("path"),
                quantiles: raw.quantiles(),
            },
            "replication-latency" => {
                let (origin, database, table) = split_replication_path(&raw.text("path"));
                AnalyticsRecord::ReplicationLatency {
                    origin,
                    database,
                    table,
                    quantiles: raw.quantiles(),
                }
            }
            other => match other.strip_prefix("response_") {
                Some(code) if !code.is_empty() => AnalyticsRecord::ResponseStatus {
                    code: code.to_string(),
                    path: raw.text("path"),
                    method: raw.text("method"),
                    count: raw.num_or_zero("count"),
                },
                _ => AnalyticsRecord::Other(raw),
            },
        }
    }
}

/// `origin.database.table`, with a trailing `-leaf` dropped from the origin.
/// Missing parts are empty; extra dots stay in the table name.
fn split_replication_path(path: &str) -> (String, String, String) {
    let mut parts = path.splitn(3, '.');
    let origin = parts.next().unwrap_or_default();
    let origin = origin.strip_suffix("-leaf").unwrap_or(origin);
    let database = parts.next().unwrap_or_default();
    let table = parts.next().unwrap_or_default();
    (origin.to_string(), database.to_string(), table.to_string())
}
