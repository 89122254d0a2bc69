use anyhow::Context;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Timing policy shared by the Manager, its Consumers, and client Connections.
#[derive(Debug, Clone)]
pub struct Config {
    /// Timeout of a consume which doesn't specify one.
    pub consume_timeout: Duration,
    /// Timeout of a flush which doesn't specify one.
    pub flush_timeout: Duration,
    /// Largest timeout a client may request. Zero-valued client timeouts also map here.
    pub max_block_timeout: Duration,
    /// Minimum interval between opportunistic offset commits of a Consumer.
    pub commit_interval: Duration,
    /// Timeout of each internal poll of a Consumer's log handle.
    pub poll_interval: Duration,
    /// Grace period for Consumers and Connections to exit during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            consume_timeout: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(5),
            max_block_timeout: Duration::from_secs(60 * 60),
            commit_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Map a client-requested timeout into an effective one.
    /// `None` selects `default`, and zero selects the maximum.
    pub fn client_timeout(&self, requested: Option<Duration>, default: Duration) -> Duration {
        let max = self.max_block_timeout.min(crate::MAX_BLOCK_TIMEOUT);

        match requested {
            None => default.min(max),
            Some(d) if d.is_zero() => max,
            Some(d) => d.min(max),
        }
    }
}

/// librdkafka configuration, as loaded from a JSON file.
///
/// Top-level scalar properties apply to both consumers and producers.
/// Optional "consumer" and "producer" objects hold client-specific overrides:
///
/// ```json
/// {
///   "bootstrap.servers": "localhost:9092",
///   "consumer": {"auto.offset.reset": "earliest"},
///   "producer": {"linger.ms": 5}
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KafkaConfig {
    pub common: BTreeMap<String, String>,
    pub consumer: BTreeMap<String, String>,
    pub producer: BTreeMap<String, String>,
}

impl KafkaConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read(path)
            .with_context(|| format!("failed to read kafka configuration {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("failed to parse kafka configuration {}", path.display()))
    }

    pub fn from_json(content: &[u8]) -> anyhow::Result<Self> {
        let Document {
            consumer,
            producer,
            common,
        } = serde_json::from_slice(content)
            .context("configuration must be a JSON object of librdkafka properties")?;

        let strings = |m: BTreeMap<String, Property>| -> BTreeMap<String, String> {
            m.into_iter().map(|(key, value)| (key, value.0)).collect()
        };

        Ok(Self {
            common: strings(common),
            consumer: strings(consumer),
            producer: strings(producer),
        })
    }

    /// Properties of a consumer client, with client-specific overrides applied.
    pub fn consumer_properties(&self) -> BTreeMap<String, String> {
        let mut out = self.common.clone();
        out.extend(self.consumer.clone());
        out
    }

    /// Properties of a producer client, with client-specific overrides applied.
    pub fn producer_properties(&self) -> BTreeMap<String, String> {
        let mut out = self.common.clone();
        out.extend(self.producer.clone());
        out
    }
}

#[derive(serde::Deserialize)]
struct Document {
    #[serde(default)]
    consumer: BTreeMap<String, Property>,
    #[serde(default)]
    producer: BTreeMap<String, Property>,
    #[serde(flatten)]
    common: BTreeMap<String, Property>,
}

// A librdkafka property value, which may be written as a JSON string, number, or boolean.
struct Property(String);

impl<'de> serde::Deserialize<'de> for Property {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = Property;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a string, number, or boolean property value")
            }
            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Property, E> {
                Ok(Property(v.to_string()))
            }
            fn visit_string<E: serde::de::Error>(self, v: String) -> Result<Property, E> {
                Ok(Property(v))
            }
            fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Property, E> {
                Ok(Property(v.to_string()))
            }
            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Property, E> {
                Ok(Property(v.to_string()))
            }
            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Property, E> {
                Ok(Property(v.to_string()))
            }
            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Property, E> {
                Ok(Property(v.to_string()))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}
