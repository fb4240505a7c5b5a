//! Connection targets.
//!
//! A [`Target`] is the fully-defaulted, validated description of what a driver
//! should connect to: endpoints, credentials, pool sizing and timeouts.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;
use crate::kind::BackendKind;
use crate::middleware::InstanceLabels;
use crate::options::{ConsumerOptions, Options, Secret};

/// One `host:port` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
    ///
    /// A URI scheme prefix (`redis://`, `mongodb://`) and any credentials or
    /// path are ignored.
    pub fn parse(raw: &str, default_port: u16) -> Result<Self, String> {
        let mut s = raw.trim();
        if let Some((_, rest)) = s.split_once("://") {
            s = rest;
        }
        if let Some((_, rest)) = s.rsplit_once('@') {
            s = rest;
        }
        if let Some(idx) = s.find(['/', '?']) {
            s = &s[..idx];
        }
        if s.is_empty() {
            return Err(format!("empty address: {raw:?}"));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 address: {raw:?}"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, raw)?,
                None if tail.is_empty() => default_port,
                None => return Err(format!("invalid address: {raw:?}")),
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                if host.is_empty() {
                    return Err(format!("missing host: {raw:?}"));
                }
                Ok(Self {
                    host: host.to_string(),
                    port: parse_port(port, raw)?,
                })
            }
            // Bare IPv6 without brackets.
            Some(_) => Ok(Self {
                host: s.to_string(),
                port: default_port,
            }),
            None => Ok(Self {
                host: s.to_string(),
                port: default_port,
            }),
        }
    }
}

fn parse_port(port: &str, raw: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .map_err(|_| format!("invalid port in address {raw:?}"))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Named replica selection strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPolicyKind {
    Random,
    RoundRobin,
}

impl ReplicaPolicyKind {
    pub fn build(self) -> Arc<dyn ReplicaPolicy> {
        match self {
            ReplicaPolicyKind::Random => Arc::new(RandomPolicy),
            ReplicaPolicyKind::RoundRobin => Arc::new(RoundRobinPolicy::default()),
        }
    }
}

/// Chooses which read replica serves a read-only operation.
pub trait ReplicaPolicy: Send + Sync + fmt::Debug {
    /// Index in `0..replicas`. Only called with `replicas > 0`.
    fn pick(&self, replicas: usize) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPolicy;

impl ReplicaPolicy for RandomPolicy {
    fn pick(&self, replicas: usize) -> usize {
        use rand::Rng;
        rand::thread_rng().gen_range(0..replicas)
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    next: AtomicUsize,
}

impl ReplicaPolicy for RoundRobinPolicy {
    fn pick(&self, replicas: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % replicas
    }
}

/// Pool sizing and recycling limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_open: u32,
    pub min_idle: u32,
    pub max_idle: u32,
    pub max_retries: u32,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub dial: Duration,
    pub read: Duration,
    pub write: Duration,
    pub connect: Duration,
}

/// Default nsqlookupd HTTP port.
pub const LOOKUPD_PORT: u16 = 4161;

/// A validated nsq subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerTarget {
    pub topic: String,
    pub channel: String,
    pub lookupd: Vec<Endpoint>,
    pub max_in_flight: u32,
}

impl ConsumerTarget {
    fn from_options(consumer: &ConsumerOptions) -> Result<Self, String> {
        if consumer.topic.is_empty() {
            return Err("consumer topic is empty".to_string());
        }
        if consumer.channel.is_empty() {
            return Err("consumer channel is empty".to_string());
        }
        let lookupd = consumer
            .lookupd_addrs
            .iter()
            .map(|a| Endpoint::parse(a, LOOKUPD_PORT))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            topic: consumer.topic.clone(),
            channel: consumer.channel.clone(),
            lookupd,
            max_in_flight: consumer.max_in_flight.max(1),
        })
    }
}

/// Everything a driver needs to open one logical instance.
#[derive(Clone, Debug)]
pub struct Target {
    pub kind: BackendKind,
    pub name: String,
    pub endpoints: Vec<Endpoint>,
    pub replicas: Vec<Endpoint>,
    pub replica_policy: Arc<dyn ReplicaPolicy>,
    pub username: String,
    pub password: Secret,
    pub database: String,
    pub client_name: String,
    pub replica_set: String,
    pub tls: bool,
    pub pool: PoolSettings,
    pub timeouts: Timeouts,
    pub consumer: Option<ConsumerTarget>,
}

impl Target {
    /// Build a target from fully-defaulted options.
    pub fn from_options(
        kind: BackendKind,
        name: &str,
        options: &Options,
    ) -> Result<Self, ConnectionError> {
        let invalid = |reason: String| ConnectionError::InvalidTarget {
            kind,
            name: name.to_string(),
            reason,
        };

        if options.addrs.is_empty() {
            return Err(invalid("no address configured".to_string()));
        }
        let endpoints = options
            .addrs
            .iter()
            .map(|a| Endpoint::parse(a, kind.default_port()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;
        let replicas = options
            .replicas
            .iter()
            .map(|a| Endpoint::parse(a, kind.default_port()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;
        if options.pool_size == 0 {
            return Err(invalid("pool_size must be positive".to_string()));
        }
        let consumer = match &options.consumer {
            Some(_) if kind != BackendKind::Nsq => {
                return Err(invalid(format!("{kind} does not support consumers")));
            }
            Some(consumer) => Some(ConsumerTarget::from_options(consumer).map_err(invalid)?),
            None => None,
        };

        Ok(Self {
            kind,
            name: name.to_string(),
            endpoints,
            replicas,
            replica_policy: options
                .replica_policy
                .unwrap_or(ReplicaPolicyKind::Random)
                .build(),
            username: options.username.clone(),
            password: options.password.clone(),
            database: options.database.clone(),
            client_name: options.client_name.clone(),
            replica_set: options.replica_set.clone(),
            tls: options.tls,
            pool: PoolSettings {
                max_open: options.pool_size,
                min_idle: options.min_idle_conns.min(options.pool_size),
                max_idle: options.max_idle_conns.min(options.pool_size),
                max_retries: options.max_retries,
                idle_timeout: options.idle_timeout,
                max_lifetime: options.conn_max_lifetime,
            },
            timeouts: Timeouts {
                dial: options.dial_timeout,
                read: options.read_timeout,
                write: options.write_timeout,
                connect: options.connect_timeout,
            },
            consumer,
        })
    }

    /// Comma separated endpoint list, used as the `addr` label.
    pub fn address_label(&self) -> String {
        self.endpoints
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn labels(&self) -> InstanceLabels {
        let (peer_host, peer_port) = self
            .endpoints
            .first()
            .map(|e| (e.host.clone(), e.port))
            .unwrap_or_default();
        InstanceLabels {
            kind: self.kind,
            name: self.name.clone(),
            address: self.address_label(),
            database: self.database.clone(),
            peer_host,
            peer_port,
        }
    }

    /// Connection URI with the password redacted, for logs.
    pub fn uri(&self) -> String {
        let hosts = self.address_label();
        let userinfo = match (self.username.is_empty(), self.password.is_empty()) {
            (true, true) => String::new(),
            (false, true) => format!("{}@", self.username),
            (_, false) => format!("{}:***@", self.username),
        };
        match self.kind {
            BackendKind::Mysql => format!("mysql://{userinfo}{hosts}/{}", self.database),
            BackendKind::Postgres => format!("postgres://{userinfo}{hosts}/{}", self.database),
            BackendKind::Mongo => {
                let mut uri = format!("mongodb://{userinfo}{hosts}/{}", self.database);
                let mut params = Vec::new();
                if !userinfo.is_empty() {
                    params.push("authSource=admin".to_string());
                }
                if !self.replica_set.is_empty() {
                    params.push(format!("replicaSet={}", self.replica_set));
                }
                if !params.is_empty() {
                    uri.push('?');
                    uri.push_str(&params.join("&"));
                }
                uri
            }
            BackendKind::Redis => {
                let scheme = if self.tls { "rediss" } else { "redis" };
                if self.database.is_empty() {
                    format!("{scheme}://{userinfo}{hosts}")
                } else {
                    format!("{scheme}://{userinfo}{hosts}/{}", self.database)
                }
            }
            BackendKind::Nsq => format!("nsq://{hosts}/{}", self.database),
        }
    }
}
