//! MySQL and Postgres over `sqlx` `Any` pools.
//!
//! Operations take the statement as the first argument and bind parameters
//! from the rest:
//!
//! - `query [sql, params..]`: every row, as an array of column objects
//! - `query_row [sql, params..]`: the first row, or not found
//! - `exec [sql, params..]`: `{rows_affected, last_insert_id}`
//! - `ping`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pylon_core::{
    BackendKind, Connection, DriverError, Endpoint, Operation, OperationError, PoolStats, Reply,
    StatSampleError, Target,
};
use serde_json::{Map, Value};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::pool::{PoolConnection, PoolOptions};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Connection as _, Row};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::args;
use crate::counters::Counters;
use crate::routing::Routed;

/// Server error codes for rejected credentials.
const AUTH_CODES: &[&str] = &["28P01", "28000", "1045"];

#[derive(Debug)]
pub struct SqlConnection {
    target: Arc<Target>,
    pools: Routed<AnyPool>,
    counters: Counters,
    closed: AtomicBool,
}

/// Connection URL for one endpoint, credentials included.
pub fn url_for(target: &Target, endpoint: &Endpoint) -> Result<Url, DriverError> {
    let scheme = match target.kind {
        BackendKind::Mysql => "mysql",
        BackendKind::Postgres => "postgres",
        other => return Err(DriverError::Other(format!("{other} is not a sql backend"))),
    };
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
    url.set_path(&target.database);

    {
        let mut query = url.query_pairs_mut();
        match target.kind {
            BackendKind::Postgres => {
                if target.tls {
                    query.append_pair("sslmode", "require");
                }
                if !target.client_name.is_empty() {
                    query.append_pair("application_name", &target.client_name);
                }
            }
            _ => {
                if target.tls {
                    query.append_pair("ssl-mode", "required");
                }
            }
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

/// Lazily connecting pool: nothing is dialed until the first checkout.
fn pool_for(target: &Target, url: &Url) -> Result<AnyPool, DriverError> {
    PoolOptions::<Any>::new()
        .min_connections(target.pool.min_idle)
        .max_connections(target.pool.max_open)
        .acquire_timeout(target.timeouts.connect)
        .idle_timeout(non_zero(target.pool.idle_timeout))
        .max_lifetime(non_zero(target.pool.max_lifetime))
        .connect_lazy(url.as_str())
        .map_err(|e| driver_error(e, target.timeouts.connect))
}

pub(crate) fn driver_error(err: sqlx::Error, timeout: Duration) -> DriverError {
    match err {
        sqlx::Error::PoolTimedOut => DriverError::Timeout(timeout),
        sqlx::Error::PoolClosed => DriverError::Closed,
        sqlx::Error::Io(e) => DriverError::Io(e),
        sqlx::Error::Database(e)
            if e.code().is_some_and(|code| AUTH_CODES.contains(&&*code)) =>
        {
            DriverError::Auth(e.message().to_string())
        }
        sqlx::Error::Protocol(msg) => DriverError::Protocol(msg),
        other => DriverError::Other(other.to_string()),
    }
}

pub(crate) fn operation_error(err: sqlx::Error, timeout: Duration) -> OperationError {
    match err {
        sqlx::Error::RowNotFound => OperationError::NotFound,
        sqlx::Error::PoolTimedOut => OperationError::Timeout(timeout),
        sqlx::Error::Database(e) => OperationError::Backend(e.to_string()),
        err @ (sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed) => {
            OperationError::Transport(err.to_string())
        }
        other => OperationError::Backend(other.to_string()),
    }
}

/// Bind JSON parameters positionally.
fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[Value],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

/// Decode one column by trying the types `Any` supports, widest first.
fn column_value(row: &AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(Value::Null, |b| Value::String(String::from_utf8_lossy(&b).into_owned()));
    }
    Value::Null
}

fn row_object(row: &AnyRow) -> Value {
    let mut object = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), column_value(row, index));
    }
    Value::Object(object)
}

impl SqlConnection {
    pub fn open(target: &Target) -> Result<Self, DriverError> {
        sqlx::any::install_default_drivers();

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

    pub fn pools(&self) -> &Routed<AnyPool> {
        &self.pools
    }

    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    /// Check out a connection, recording hit, miss and wait counters.
    async fn acquire(&self, pool: &AnyPool) -> Result<PoolConnection<Any>, sqlx::Error> {
        let idle = pool.num_idle();
        let size = pool.size();
        let start = Instant::now();
        let conn = pool.acquire().await.inspect_err(|e| {
            if matches!(e, sqlx::Error::PoolTimedOut) {
                self.counters.timeout();
            }
        })?;
        if idle == 0 {
            self.counters.waited(start.elapsed());
        }
        if pool.size() > size {
            self.counters.miss();
        } else {
            self.counters.hit();
        }
        Ok(conn)
    }

    async fn run(&self, pool: &AnyPool, command: &str, op: &Operation) -> Result<Reply, sqlx::Error> {
        let mut conn = self.acquire(pool).await?;
        if command == "ping" {
            conn.ping().await?;
            return Ok(Reply::String("PONG".into()));
        }

        let sql = args::string(op, 0, "statement")
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?
            .to_string();
        let query = bind_all(sqlx::query(&sql), &op.args[1..]);
        match command {
            "query" | "select" | "fetch_all" => {
                let rows = query.fetch_all(&mut *conn).await?;
                Ok(Value::Array(rows.iter().map(row_object).collect()))
            }
            "query_row" | "first" | "fetch_one" => match query.fetch_optional(&mut *conn).await? {
                Some(row) => Ok(row_object(&row)),
                None => Err(sqlx::Error::RowNotFound),
            },
            _ => {
                let done = query.execute(&mut *conn).await?;
                Ok(serde_json::json!({
                    "rows_affected": done.rows_affected(),
                    "last_insert_id": done.last_insert_id(),
                }))
            }
        }
    }
}

#[async_trait]
impl Connection for SqlConnection {
    async fn execute(&self, _cancel: CancellationToken, op: Operation) -> Result<Reply, OperationError> {
        self.check_open()?;
        let command = args::command(&op);
        if !matches!(
            command.as_str(),
            "ping" | "query" | "select" | "fetch_all" | "query_row" | "first" | "fetch_one"
                | "exec" | "execute" | "insert" | "update" | "delete"
        ) {
            return Err(OperationError::Unsupported(format!("{} on {}", op.name, self.target.kind)));
        }
        if command != "ping" && op.args.is_empty() {
            return Err(OperationError::Backend(format!("{} expects [sql, params..]", op.name)));
        }

        let pool = self.pools.route(op.read_only);
        self.run(pool, &command, &op)
            .await
            .map_err(|e| operation_error(e, self.target.timeouts.read))
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.check_open()?;
        for pool in self.pools.iter() {
            let mut conn = self
                .acquire(pool)
                .await
                .map_err(|e| driver_error(e, self.target.timeouts.connect))?;
            conn.ping()
                .await
                .map_err(|e| driver_error(e, self.target.timeouts.connect))?;
        }
        debug!(name = %self.target.name, pools = self.pools.iter().count(), "sql ping ok");
        Ok(())
    }

    fn pool_stats(&self) -> Result<PoolStats, StatSampleError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StatSampleError::Closed);
        }
        let stats = self.pools.iter().fold(PoolStats::default(), |acc, pool| {
            let open = u64::from(pool.size());
            let idle = pool.num_idle() as u64;
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
        let in_use = self
            .pools
            .iter()
            .map(|p| p.size().saturating_sub(p.num_idle() as u32))
            .sum::<u32>();
        if in_use > 0 {
            warn!(name = %self.target.name, in_use, "closing with connections still checked out");
        }
        for pool in self.pools.iter() {
            pool.close().await;
        }
        debug!(name = %self.target.name, "sql pools closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylon_core::Options;

    fn target(kind: BackendKind, options: Options) -> Target {
        let options = options.with_defaults(kind);
        Target::from_options(kind, "default", &options).unwrap()
    }

    #[test]
    fn mysql_url_carries_credentials_and_database() {
        let target = target(
            BackendKind::Mysql,
            Options::new()
                .with_address("db:3307")
                .with_credentials("app", "p@ss word")
                .with_database("orders"),
        );
        let url = url_for(&target, &target.endpoints[0]).unwrap();
        assert_eq!(url.scheme(), "mysql");
        assert_eq!(url.host_str(), Some("db"));
        assert_eq!(url.port(), Some(3307));
        assert_eq!(url.username(), "app");
        assert_eq!(url.password(), Some("p%40ss%20word"));
        assert_eq!(url.path(), "/orders");
        assert_eq!(url.query(), None);
    }

    #[test]
    fn postgres_url_carries_tls_and_application_name() {
        let mut options = Options::new().with_address("[::1]").with_database("app");
        options.tls = true;
        options.client_name = "billing".into();
        let target = target(BackendKind::Postgres, options);
        let url = url_for(&target, &target.endpoints[0]).unwrap();
        assert_eq!(url.host_str(), Some("[::1]"));
        assert_eq!(url.port(), Some(5432));
        assert_eq!(url.query(), Some("sslmode=require&application_name=billing"));
    }

    #[test]
    fn non_sql_targets_are_rejected() {
        let target = target(BackendKind::Redis, Options::new().with_address("cache"));
        assert!(url_for(&target, &target.endpoints[0]).is_err());
    }

    #[test]
    fn errors_map_onto_pylon_errors() {
        let timeout = Duration::from_secs(2);
        assert_eq!(operation_error(sqlx::Error::RowNotFound, timeout), OperationError::NotFound);
        assert_eq!(
            operation_error(sqlx::Error::PoolTimedOut, timeout),
            OperationError::Timeout(timeout)
        );
        assert!(matches!(
            operation_error(sqlx::Error::PoolClosed, timeout),
            OperationError::Transport(_)
        ));
        assert!(matches!(
            driver_error(sqlx::Error::PoolTimedOut, timeout),
            DriverError::Timeout(t) if t == timeout
        ));
        assert!(matches!(driver_error(sqlx::Error::PoolClosed, timeout), DriverError::Closed));
    }

    #[tokio::test]
    async fn open_is_lazy_and_close_is_final() {
        let target = target(
            BackendKind::Mysql,
            Options::new()
                .with_address("127.0.0.1:1")
                .with_replicas(["127.0.0.1:2"]),
        );
        let conn = SqlConnection::open(&target).unwrap();
        assert_eq!(conn.pools().replicas().len(), 1);
        assert!(conn.pool_stats().is_ok());

        let unsupported = conn
            .execute(CancellationToken::new(), Operation::new("FLUSHALL"))
            .await;
        assert!(matches!(unsupported, Err(OperationError::Unsupported(_))));

        conn.close().await.unwrap();
        assert!(matches!(conn.close().await, Err(DriverError::Closed)));
        assert!(matches!(conn.pool_stats(), Err(StatSampleError::Closed)));
    }
}
