//! Connection factory.
//!
//! Turns one [`Options`] record into a live [`Instance`]: fill defaults, build
//! the target and its middleware chain, open it through the driver, then verify
//! liveness with a ping that runs through that chain.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{Connection, Driver};
use crate::error::{ConnectionError, DriverError, OperationError};
use crate::instance::Instance;
use crate::kind::BackendKind;
use crate::metrics::{MetricsSink, NoopSink};
use crate::middleware::{Chain, Handler, InstanceLabels, Logging, Metrics, Trace, handler_fn};
use crate::operation::{Operation, Reply};
use crate::options::Options;
use crate::target::Target;

#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    kind: BackendKind,
    driver: Arc<dyn Driver>,
    sink: Arc<dyn MetricsSink>,
    extra: Chain,
}

impl ConnectionFactory {
    pub fn new(kind: BackendKind, driver: Arc<dyn Driver>) -> Self {
        Self {
            kind,
            driver,
            sink: Arc::new(NoopSink),
            extra: Chain::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Caller middleware, run inside the standard chain.
    pub fn with_middleware(mut self, chain: Chain) -> Self {
        self.extra = chain;
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Standard chain for one instance: trace, metrics, logging, then any
    /// caller middleware. Disabled layers are left out.
    pub fn chain_for(&self, labels: &Arc<InstanceLabels>, options: &Options) -> Chain {
        let mut chain = Chain::new();
        if !options.disable_trace {
            chain.push(Arc::new(Trace::new(labels.clone())));
        }
        if !options.disable_metric {
            chain.push(Arc::new(Metrics::new(labels.clone(), self.sink.clone())));
        }
        if !options.disable_logging {
            chain.push(Arc::new(Logging::new(labels.clone(), options)));
        }
        chain.extend(&self.extra);
        chain
    }

    /// Build and verify the instance called `name`.
    pub async fn build(&self, name: &str, options: Options) -> Result<Instance, ConnectionError> {
        let options = options.with_defaults(self.kind);
        let target = Target::from_options(self.kind, name, &options)?;
        let address = target.address_label();
        let uri = target.uri();

        let labels = Arc::new(target.labels());
        let chain = self.chain_for(&labels, &options);

        debug!(
            kind = %self.kind,
            name,
            %uri,
            driver = self.driver.name(),
            pool_size = target.pool.max_open,
            "opening connection"
        );

        let connection = self
            .driver
            .open(&target)
            .await
            .map_err(|source| ConnectionError::Open {
                kind: self.kind,
                name: name.to_string(),
                address: address.clone(),
                source,
            })?;

        // The liveness ping goes through the same chain as every later call.
        let failure = Arc::new(Mutex::new(None));
        let liveness = chain.then(liveness(connection.clone(), failure.clone()));
        let timeout = target.timeouts.connect;
        let ping = liveness(CancellationToken::new(), Operation::new("ping"));
        let ping_err = match tokio::time::timeout(timeout, ping).await {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => Some(ConnectionError::Ping {
                kind: self.kind,
                name: name.to_string(),
                address: address.clone(),
                source: failure
                    .lock()
                    .take()
                    .unwrap_or_else(|| DriverError::Other(err.to_string())),
            }),
            Err(_) => Some(ConnectionError::PingTimeout {
                kind: self.kind,
                name: name.to_string(),
                address: address.clone(),
                timeout,
            }),
        };
        if let Some(err) = ping_err {
            if let Err(close_err) = connection.close().await {
                warn!(kind = %self.kind, name, error = %close_err, "failed to close unverified connection");
            }
            return Err(err);
        }

        let handler = chain.then(terminal(connection.clone()));

        info!(
            kind = %self.kind,
            name,
            %uri,
            middleware = ?chain.names(),
            "connection ready"
        );

        Ok(Instance::new(
            labels,
            options,
            uri,
            connection,
            handler,
            chain.names(),
        ))
    }
}

/// Innermost handler: hand the operation to the driver, abandoning it if the
/// caller cancels first.
fn terminal(connection: Arc<dyn Connection>) -> Handler {
    handler_fn(move |cancel: CancellationToken, op: Operation| {
        let connection = connection.clone();
        async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(OperationError::Cancelled),
                result = connection.execute(cancel.clone(), op) => result,
            }
        }
    })
}

/// Startup liveness check as a handler. The driver error is kept in `failure`
/// so the factory can report it unchanged.
fn liveness(connection: Arc<dyn Connection>, failure: Arc<Mutex<Option<DriverError>>>) -> Handler {
    handler_fn(move |_, _| {
        let connection = connection.clone();
        let failure = failure.clone();
        async move {
            match connection.ping().await {
                Ok(()) => Ok(Reply::String("PONG".into())),
                Err(err) => {
                    let reported = match &err {
                        DriverError::Timeout(after) => OperationError::Timeout(*after),
                        other => OperationError::Transport(other.to_string()),
                    };
                    *failure.lock() = Some(err);
                    Err(reported)
                }
            }
        }
    })
}
