//! Pylon core: instrumented client lifecycle management.
//!
//! A [`Component`] turns declarative configuration into named, pooled
//! backend connections ([`Instance`]s), wraps every operation on them with a
//! middleware [`Chain`] (tracing, metrics, logging), samples pool health in
//! the background and tears everything down on `stop`.
//!
//! Backend protocols live behind the [`Driver`] and [`Connection`] traits.

pub mod component;
pub mod config;
pub mod driver;
pub mod duration;
pub mod error;
pub mod factory;
pub mod instance;
pub mod kind;
pub mod lifecycle;
pub mod metrics;
pub mod middleware;
pub mod mock;
pub mod operation;
pub mod options;
pub mod registry;
pub mod stats;
pub mod target;

pub use component::{Component, ComponentBuilder, InitOptions, Phase};
pub use config::{ConfigSource, EmptySource, JsonSource, TomlSource};
pub use driver::{Connection, Driver, PoolStats};
pub use error::{
    ConfigError, ConnectionError, DriverError, Error, LookupError, OperationError, Result,
    StatSampleError,
};
pub use factory::ConnectionFactory;
pub use instance::Instance;
pub use kind::{BackendKind, Family};
pub use lifecycle::{Loader, LoaderGroup};
pub use metrics::{MetricsRecorder, MetricsSink, NoopSink, Outcome};
pub use middleware::{Chain, Handler, HandlerResult, Middleware, handler_fn};
pub use operation::{Operation, Reply};
pub use options::{ConsumerOptions, Options, Secret};
pub use registry::{DEFAULT_NAME, Registry};
pub use stats::{DEFAULT_STATS_INTERVAL, StatsPoller};
pub use target::{ConsumerTarget, Endpoint, ReplicaPolicy, ReplicaPolicyKind, Target};
