//! Per-instance options record.
//!
//! One [`Options`] value describes one logical backend instance. Values are
//! layered with [`Options::merge`] (later layers win field-by-field when the
//! field is non-zero) and completed with [`Options::fill_defaults`] before a
//! connection is built. After that the record is frozen inside the instance.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::duration;
use crate::kind::BackendKind;
use crate::target::ReplicaPolicyKind;

/// Configuration for one named backend instance.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Target addresses. Accepts a single string (comma separated) or a list.
    #[serde(alias = "address", deserialize_with = "one_or_many")]
    pub addrs: Vec<String>,
    pub username: String,
    pub password: Secret,
    /// Database, keyspace or topic depending on the backend.
    #[serde(alias = "topic")]
    pub database: String,
    /// Name announced to the server after connecting (redis `CLIENT SETNAME`).
    pub client_name: String,
    pub replica_set: String,
    /// Read replicas. Read-only operations are routed here when present.
    #[serde(deserialize_with = "one_or_many")]
    pub replicas: Vec<String>,
    pub replica_policy: Option<ReplicaPolicyKind>,
    pub tls: bool,

    pub pool_size: u32,
    pub min_idle_conns: u32,
    pub max_idle_conns: u32,
    pub max_retries: u32,

    #[serde(with = "duration")]
    pub dial_timeout: Duration,
    #[serde(with = "duration")]
    pub read_timeout: Duration,
    #[serde(with = "duration")]
    pub write_timeout: Duration,
    #[serde(with = "duration")]
    pub connect_timeout: Duration,
    #[serde(with = "duration")]
    pub idle_timeout: Duration,
    #[serde(with = "duration")]
    pub conn_max_lifetime: Duration,
    #[serde(with = "duration")]
    pub slow_threshold: Duration,

    pub disable_metric: bool,
    pub disable_trace: bool,
    pub disable_logging: bool,
    pub enable_logging_request: bool,
    pub enable_logging_response: bool,

    /// nsq only: subscribe to a topic/channel as well as publishing.
    pub consumer: Option<ConsumerOptions>,
}

/// Subscription settings for an nsq consumer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Defaults to the instance topic.
    pub topic: String,
    pub channel: String,
    /// nsqlookupd HTTP addresses. When empty the consumer connects to the
    /// instance addresses directly.
    #[serde(alias = "lookupd", deserialize_with = "one_or_many")]
    pub lookupd_addrs: Vec<String>,
    pub max_in_flight: u32,
}

impl ConsumerOptions {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            ..Self::default()
        }
    }

    pub fn merge(&mut self, layer: &ConsumerOptions) {
        pick_str(&mut self.topic, &layer.topic);
        pick_str(&mut self.channel, &layer.channel);
        if !layer.lookupd_addrs.is_empty() {
            self.lookupd_addrs = layer.lookupd_addrs.clone();
        }
        pick_u32(&mut self.max_in_flight, layer.max_in_flight);
    }
}

/// Documented per-kind defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Defaults {
    pub pool_size: u32,
    pub min_idle_conns: u32,
    pub max_idle_conns: u32,
    pub max_retries: u32,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub conn_max_lifetime: Duration,
    pub slow_threshold: Duration,
}

impl Defaults {
    pub fn for_kind(kind: BackendKind) -> Self {
        let secs = Duration::from_secs;
        let ms = Duration::from_millis;
        match kind {
            BackendKind::Mysql | BackendKind::Postgres => Self {
                pool_size: 256,
                min_idle_conns: 1,
                max_idle_conns: 16,
                max_retries: 1,
                dial_timeout: secs(5),
                read_timeout: secs(30),
                write_timeout: secs(30),
                connect_timeout: secs(5),
                idle_timeout: secs(300),
                conn_max_lifetime: secs(300),
                slow_threshold: ms(500),
            },
            BackendKind::Mongo => Self {
                pool_size: 100,
                min_idle_conns: 1,
                max_idle_conns: 16,
                max_retries: 1,
                dial_timeout: secs(10),
                read_timeout: secs(300),
                write_timeout: secs(300),
                connect_timeout: secs(10),
                idle_timeout: secs(300),
                conn_max_lifetime: secs(3600),
                slow_threshold: ms(100),
            },
            BackendKind::Redis => Self {
                pool_size: 10,
                min_idle_conns: 20,
                max_idle_conns: 10,
                max_retries: 5,
                dial_timeout: secs(5),
                read_timeout: secs(3),
                write_timeout: secs(3),
                connect_timeout: secs(5),
                idle_timeout: secs(300),
                conn_max_lifetime: secs(3600),
                slow_threshold: ms(100),
            },
            BackendKind::Nsq => Self {
                pool_size: 8,
                min_idle_conns: 1,
                max_idle_conns: 8,
                max_retries: 3,
                dial_timeout: secs(5),
                read_timeout: secs(60),
                write_timeout: secs(5),
                connect_timeout: secs(5),
                idle_timeout: secs(300),
                conn_max_lifetime: secs(3600),
                slow_threshold: ms(100),
            },
        }
    }
}

fn pick_str(current: &mut String, layer: &str) {
    if !layer.is_empty() {
        *current = layer.to_string();
    }
}

fn pick_u32(current: &mut u32, layer: u32) {
    if layer != 0 {
        *current = layer;
    }
}

fn pick_duration(current: &mut Duration, layer: Duration) {
    if !layer.is_zero() {
        *current = layer;
    }
}

fn fill_u32(current: &mut u32, default: u32) {
    if *current == 0 {
        *current = default;
    }
}

fn fill_duration(current: &mut Duration, default: Duration) {
    if current.is_zero() {
        *current = default;
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay `layer` on top of `self`.
    ///
    /// Every non-zero, non-empty field of `layer` replaces the matching field.
    /// Flags are sticky: once set by any layer they stay set.
    pub fn merge(&mut self, layer: &Options) {
        if !layer.addrs.is_empty() {
            self.addrs = layer.addrs.clone();
        }
        pick_str(&mut self.username, &layer.username);
        if !layer.password.is_empty() {
            self.password = layer.password.clone();
        }
        pick_str(&mut self.database, &layer.database);
        pick_str(&mut self.client_name, &layer.client_name);
        pick_str(&mut self.replica_set, &layer.replica_set);
        if !layer.replicas.is_empty() {
            self.replicas = layer.replicas.clone();
        }
        if layer.replica_policy.is_some() {
            self.replica_policy = layer.replica_policy;
        }
        self.tls |= layer.tls;

        pick_u32(&mut self.pool_size, layer.pool_size);
        pick_u32(&mut self.min_idle_conns, layer.min_idle_conns);
        pick_u32(&mut self.max_idle_conns, layer.max_idle_conns);
        pick_u32(&mut self.max_retries, layer.max_retries);

        pick_duration(&mut self.dial_timeout, layer.dial_timeout);
        pick_duration(&mut self.read_timeout, layer.read_timeout);
        pick_duration(&mut self.write_timeout, layer.write_timeout);
        pick_duration(&mut self.connect_timeout, layer.connect_timeout);
        pick_duration(&mut self.idle_timeout, layer.idle_timeout);
        pick_duration(&mut self.conn_max_lifetime, layer.conn_max_lifetime);
        pick_duration(&mut self.slow_threshold, layer.slow_threshold);

        self.disable_metric |= layer.disable_metric;
        self.disable_trace |= layer.disable_trace;
        self.disable_logging |= layer.disable_logging;
        self.enable_logging_request |= layer.enable_logging_request;
        self.enable_logging_response |= layer.enable_logging_response;

        match (&mut self.consumer, &layer.consumer) {
            (Some(current), Some(layer)) => current.merge(layer),
            (None, Some(layer)) => self.consumer = Some(layer.clone()),
            (_, None) => {}
        }
    }

    /// Return `self` overlaid with `layer`.
    pub fn merged(mut self, layer: &Options) -> Self {
        self.merge(layer);
        self
    }

    /// Fill every zero pool/timeout field with the documented default for `kind`.
    ///
    /// Addresses are never defaulted.
    pub fn fill_defaults(&mut self, kind: BackendKind) {
        let d = Defaults::for_kind(kind);
        fill_u32(&mut self.pool_size, d.pool_size);
        fill_u32(&mut self.min_idle_conns, d.min_idle_conns);
        fill_u32(&mut self.max_idle_conns, d.max_idle_conns);
        fill_u32(&mut self.max_retries, d.max_retries);
        fill_duration(&mut self.dial_timeout, d.dial_timeout);
        fill_duration(&mut self.read_timeout, d.read_timeout);
        fill_duration(&mut self.write_timeout, d.write_timeout);
        fill_duration(&mut self.connect_timeout, d.connect_timeout);
        fill_duration(&mut self.idle_timeout, d.idle_timeout);
        fill_duration(&mut self.conn_max_lifetime, d.conn_max_lifetime);
        fill_duration(&mut self.slow_threshold, d.slow_threshold);

        if let Some(consumer) = self.consumer.as_mut() {
            if consumer.topic.is_empty() {
                consumer.topic = self.database.clone();
            }
            fill_u32(&mut consumer.max_in_flight, 1);
        }
    }

    pub fn with_defaults(mut self, kind: BackendKind) -> Self {
        self.fill_defaults(kind);
        self
    }

    // Builder-style setters, mostly for tests and embedding callers.

    pub fn with_address(mut self, addr: impl Into<String>) -> Self {
        self.addrs = vec![addr.into()];
        self
    }

    pub fn with_addresses<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addrs = addrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = Secret::new(password);
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn with_replicas<I, S>(mut self, replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replicas = replicas.into_iter().map(Into::into).collect();
        self
    }

    pub fn disable_metric(mut self) -> Self {
        self.disable_metric = true;
        self
    }

    pub fn disable_trace(mut self) -> Self {
        self.disable_trace = true;
        self
    }

    pub fn disable_logging(mut self) -> Self {
        self.disable_logging = true;
        self
    }

    pub fn log_requests(mut self) -> Self {
        self.enable_logging_request = true;
        self
    }

    pub fn log_responses(mut self) -> Self {
        self.enable_logging_response = true;
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerOptions) -> Self {
        self.consumer = Some(consumer);
        self
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("addrs", &self.addrs)
            .field("username", &self.username)
            .field("password", &self.password)
            .field("database", &self.database)
            .field("client_name", &self.client_name)
            .field("replica_set", &self.replica_set)
            .field("replicas", &self.replicas)
            .field("replica_policy", &self.replica_policy)
            .field("tls", &self.tls)
            .field("pool_size", &self.pool_size)
            .field("min_idle_conns", &self.min_idle_conns)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("max_retries", &self.max_retries)
            .field("dial_timeout", &self.dial_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("conn_max_lifetime", &self.conn_max_lifetime)
            .field("slow_threshold", &self.slow_threshold)
            .field("disable_metric", &self.disable_metric)
            .field("disable_trace", &self.disable_trace)
            .field("disable_logging", &self.disable_logging)
            .field("enable_logging_request", &self.enable_logging_request)
            .field("enable_logging_response", &self.enable_logging_response)
            .field("consumer", &self.consumer)
            .finish()
    }
}

/// A credential that never appears in logs or serialized output.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("\"***\"")
        }
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_empty() {
            serializer.serialize_str("")
        } else {
            serializer.serialize_str("***")
        }
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Accept `"a:1"`, `"a:1,b:2"` or `["a:1", "b:2"]`.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OneOrMany;

    impl<'de> Visitor<'de> for OneOrMany {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an address string or a list of address strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<String>, E> {
            Ok(split_addrs(v))
        }

        fn visit_unit<E: de::Error>(self) -> Result<Vec<String>, E> {
            Ok(Vec::new())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<String>, A::Error> {
            let mut out = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                out.extend(split_addrs(&item));
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(OneOrMany)
}

fn split_addrs(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
