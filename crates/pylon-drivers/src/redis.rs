//! Redis over `deadpool-redis` pools.
//!
//! Every operation is sent as a raw command: the operation name is the
//! command and the arguments are its arguments. Replies are mapped onto
//! [`Reply`] values; a top-level nil is [`OperationError::NotFound`] and an
//! error reply is [`OperationError::Backend`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::{Config, Hook, HookError, Pool, PoolConfig, PoolError, Runtime};
use pylon_core::{
    Connection, DriverError, Endpoint, Operation, OperationError, PoolStats, Reply,
    StatSampleError, Target,
};
use redis::{ErrorKind, RedisError};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::args;
use crate::counters::Counters;
use crate::retry;
use crate::routing::Routed;

#[derive(Debug)]
pub struct RedisConnection {
    target: Arc<Target>,
    pools: Routed<Pool>,
    counters: Counters,
    closed: AtomicBool,
}

/// Connection URL for one endpoint. The database must be a number.
pub fn url_for(target: &Target, endpoint: &Endpoint) -> Result<Url, DriverError> {
    let scheme = if target.tls { "rediss" } else { "redis" };
    let invalid = |what: &str| DriverError::Other(format!("invalid {what} for {endpoint}"));

    let mut url = Url::parse(&format!("{scheme}://{endpoint}"))
        .map_err(|e| DriverError::Other(format!("invalid address {endpoint}: {e}")))?;
    if !target.username.is_empty() {
        url.set_username(&target.username).map_err(|()| invalid("username"))?;
    }
    if !target.password.is_empty() {
        url.set_password(Some(target.password.expose()))
            .map_err(|()| invalid("password"))?;
    }
    if !target.database.is_empty() {
        let db: u32 = target
            .database
            .parse()
            .map_err(|_| {
                DriverError::Other(format!("redis database must be a number, got {:?}", target.database))
            })?;
        url.set_path(&db.to_string());
    }
    Ok(url)
}

/// Announce `name` on every new connection.
fn set_client_name(name: String) -> Hook {
    Hook::async_fn(move |conn, _| {
        let name = name.clone();
        Box::pin(async move {
            redis::cmd("CLIENT")
                .arg("SETNAME")
                .arg(&name)
                .query_async::<()>(conn)
                .await
                .map_err(HookError::Backend)
        })
    })
}

fn pool_for(target: &Target, url: &Url) -> Result<Pool, DriverError> {
    let mut pool = PoolConfig::new(target.pool.max_open as usize);
    pool.timeouts.wait = Some(target.timeouts.connect);
    pool.timeouts.create = Some(target.timeouts.dial);
    pool.timeouts.recycle = Some(target.timeouts.read);

    let mut config = Config::from_url(url.as_str());
    config.pool = Some(pool);
    let mut builder = config
        .builder()
        .map_err(|e| DriverError::Other(format!("invalid redis config: {e}")))?
        .runtime(Runtime::Tokio1);
    if !target.client_name.is_empty() {
        builder = builder.post_create(set_client_name(target.client_name.clone()));
    }
    builder
        .build()
        .map_err(|e| DriverError::Other(format!("failed to create redis pool: {e}")))
}

fn is_transport(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

pub(crate) fn operation_error(err: &RedisError, timeout: Duration) -> OperationError {
    if err.is_timeout() {
        OperationError::Timeout(timeout)
    } else if is_transport(err) {
        OperationError::Transport(err.to_string())
    } else {
        OperationError::Backend(err.to_string())
    }
}

pub(crate) fn driver_error(err: RedisError, timeout: Duration) -> DriverError {
    if err.kind() == ErrorKind::AuthenticationFailed {
        DriverError::Auth(err.to_string())
    } else if err.is_timeout() {
        DriverError::Timeout(timeout)
    } else if is_transport(&err) {
        DriverError::Other(format!("io error: {err}"))
    } else {
        DriverError::Protocol(err.to_string())
    }
}

fn pool_error(err: PoolError, target: &Target) -> DriverError {
    match err {
        PoolError::Timeout(_) => DriverError::PoolExhausted(target.timeouts.connect),
        PoolError::Backend(e) => driver_error(e, target.timeouts.dial),
        PoolError::Closed => DriverError::Closed,
        other => DriverError::Other(other.to_string()),
    }
}

/// JSON rendering of a reply value.
pub fn to_json(value: redis::Value) -> Value {
    match value {
        redis::Value::Nil => Value::Null,
        redis::Value::Int(i) => Value::from(i),
        redis::Value::BulkString(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        redis::Value::SimpleString(s) => Value::String(s),
        redis::Value::Okay => Value::String("OK".into()),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            Value::Array(items.into_iter().map(to_json).collect())
        }
        redis::Value::Map(pairs) => {
            let mut object = Map::new();
            for (k, v) in pairs {
                let key = match to_json(k) {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                object.insert(key, to_json(v));
            }
            Value::Object(object)
        }
        redis::Value::Double(f) => Value::from(f),
        redis::Value::Boolean(b) => Value::Bool(b),
        redis::Value::VerbatimString { text, .. } => Value::String(text),
        redis::Value::Attribute { data, .. } => to_json(*data),
        redis::Value::Push { data, .. } => Value::Array(data.into_iter().map(to_json).collect()),
        other => Value::String(format!("{other:?}")),
    }
}

fn reply(value: redis::Value) -> Result<Reply, OperationError> {
    match value {
        redis::Value::Nil => Err(OperationError::NotFound),
        value => Ok(to_json(value)),
    }
}

impl RedisConnection {
    pub fn open(target: &Target) -> Result<Self, DriverError> {
        let primary = target
            .endpoints
            .first()
            .ok_or_else(|| DriverError::Other("no endpoint".into()))?;
        let primary = pool_for(target, &url_for(target, primary)?)?;
        let replicas = target
            .replicas
            .iter()
            .map(|endpoint| pool_for(target, &url_for(target, endpoint)?))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            pools: Routed::new(primary, replicas, target.replica_policy.clone()),
            target: Arc::new(target.clone()),
            counters: Counters::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn pools(&self) -> &Routed<Pool> {
        &self.pools
    }

    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    async fn checkout(&self, pool: &Pool) -> Result<deadpool_redis::Connection, DriverError> {
        let before = pool.status();
        let start = Instant::now();
        let conn = pool.get().await.map_err(|e| {
            if matches!(e, PoolError::Timeout(_)) {
                self.counters.timeout();
            }
            pool_error(e, &self.target)
        })?;
        if before.available == 0 {
            self.counters.waited(start.elapsed());
        }
        if pool.status().size > before.size {
            self.counters.miss();
        } else {
            self.counters.hit();
        }
        Ok(conn)
    }

    /// One attempt: check out, send, wait at most the read timeout.
    async fn query(&self, pool: &Pool, cmd: &redis::Cmd) -> Result<redis::Value, OperationError> {
        let mut conn = self.checkout(pool).await?;
        let timeout = self.target.timeouts.read;
        match tokio::time::timeout(timeout, cmd.query_async::<redis::Value>(&mut conn)).await {
            Ok(result) => result.map_err(|e| operation_error(&e, timeout)),
            Err(_) => Err(OperationError::Timeout(timeout)),
        }
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn execute(&self, _cancel: CancellationToken, op: Operation) -> Result<Reply, OperationError> {
        self.check_open()?;
        let mut cmd = redis::cmd(&op.name);
        for arg in &op.args {
            cmd.arg(args::bytes(arg));
        }
        let cmd = &cmd;
        let pool = self.pools.route(op.read_only);
        let value = retry::with_retries(
            self.target.pool.max_retries,
            |e: &OperationError| matches!(e, OperationError::Transport(_)),
            || self.query(pool, cmd),
        )
        .await?;
        reply(value)
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.check_open()?;
        for pool in self.pools.iter() {
            let mut conn = self.checkout(pool).await?;
            let pong = redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .map_err(|e| driver_error(e, self.target.timeouts.read))?;
            if pong != "PONG" {
                return Err(DriverError::Protocol(format!("unexpected PING reply {pong:?}")));
            }
        }
        debug!(name = %self.target.name, pools = self.pools.iter().count(), "redis ping ok");
        Ok(())
    }

    fn pool_stats(&self) -> Result<PoolStats, StatSampleError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StatSampleError::Closed);
        }
        let stats = self.pools.iter().fold(PoolStats::default(), |acc, pool| {
            let status = pool.status();
            let open = status.size as u64;
            let idle = status.available as u64;
            PoolStats {
                open: acc.open + open,
                idle: acc.idle + idle,
                in_use: acc.in_use + open.saturating_sub(idle),
                ..acc
            }
        });
        Ok(self.counters.apply(stats))
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DriverError::Closed);
        }
        for pool in self.pools.iter() {
            pool.close();
        }
        debug!(name = %self.target.name, "redis pools closed");
        Ok(())
    }
}
