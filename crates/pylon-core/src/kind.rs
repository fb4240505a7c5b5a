//! Backend kinds and their families.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The concrete backend a component manages.
///
/// The lowercase name doubles as the configuration namespace
/// (`[redis.default]`, `[mysql.replica]`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Mysql,
    Postgres,
    Mongo,
    Redis,
    Nsq,
}

/// Category of external resource a backend belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    Relational,
    Document,
    Cache,
    Broker,
}

impl BackendKind {
    /// Every supported kind, in configuration order.
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Mysql,
        BackendKind::Postgres,
        BackendKind::Mongo,
        BackendKind::Redis,
        BackendKind::Nsq,
    ];

    /// Configuration namespace for this kind.
    pub fn namespace(&self) -> &'static str {
        match self {
            BackendKind::Mysql => "mysql",
            BackendKind::Postgres => "postgres",
            BackendKind::Mongo => "mongo",
            BackendKind::Redis => "redis",
            BackendKind::Nsq => "nsq",
        }
    }

    pub fn family(&self) -> Family {
        match self {
            BackendKind::Mysql | BackendKind::Postgres => Family::Relational,
            BackendKind::Mongo => Family::Document,
            BackendKind::Redis => Family::Cache,
            BackendKind::Nsq => Family::Broker,
        }
    }

    /// Port used when an address carries none.
    pub fn default_port(&self) -> u16 {
        match self {
            BackendKind::Mysql => 3306,
            BackendKind::Postgres => 5432,
            BackendKind::Mongo => 27017,
            BackendKind::Redis => 6379,
            BackendKind::Nsq => 4150,
        }
    }
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Relational => "relational",
            Family::Document => "document",
            Family::Cache => "cache",
            Family::Broker => "broker",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(BackendKind::Mysql),
            "postgres" | "postgresql" | "pg" => Ok(BackendKind::Postgres),
            "mongo" | "mongodb" => Ok(BackendKind::Mongo),
            "redis" => Ok(BackendKind::Redis),
            "nsq" => Ok(BackendKind::Nsq),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}
