//! Pylon drivers.
//!
//! [`ClientDriver`] implements [`pylon_core::Driver`] for every backend kind
//! on top of the established client crates:
//!
//! - **mysql**, **postgres**: `sqlx` `Any` pools, one per primary and replica
//! - **redis**: `deadpool-redis` pools over `redis` multiplexed connections
//! - **mongo**: the `mongodb` client with its own connection pool
//! - **nsq**: producers and an optional consumer over the nsqd TCP protocol
//!
//! Read-only operations are routed to replica pools when replicas are
//! configured.

pub mod args;
pub mod counters;
pub mod driver;
pub mod mongo;
pub mod nsq;
pub mod redis;
pub mod retry;
pub mod routing;
pub mod sql;

pub use driver::ClientDriver;
pub use mongo::MongoConnection;
pub use nsq::NsqConnection;
pub use redis::RedisConnection;
pub use routing::Routed;
pub use sql::SqlConnection;
