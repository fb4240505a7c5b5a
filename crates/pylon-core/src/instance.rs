//! Live, instrumented connection handles.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::driver::{Connection, PoolStats};
use crate::error::{DriverError, StatSampleError};
use crate::kind::BackendKind;
use crate::middleware::{Handler, HandlerResult, InstanceLabels};
use crate::operation::Operation;
use crate::options::Options;

/// A named connection with its middleware chain already applied.
///
/// Cloning is cheap; clones share the same underlying connection.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<Inner>,
}

struct Inner {
    labels: Arc<InstanceLabels>,
    options: Options,
    uri: String,
    connection: Arc<dyn Connection>,
    handler: Handler,
    middleware: Vec<String>,
}

impl Instance {
    pub(crate) fn new(
        labels: Arc<InstanceLabels>,
        options: Options,
        uri: String,
        connection: Arc<dyn Connection>,
        handler: Handler,
        middleware: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                labels,
                options,
                uri,
                connection,
                handler,
                middleware,
            }),
        }
    }

    /// Run `op` through the middleware chain and the driver.
    pub async fn call(&self, cancel: CancellationToken, op: Operation) -> HandlerResult {
        (self.inner.handler)(cancel, op).await
    }

    pub fn name(&self) -> &str {
        &self.inner.labels.name
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.labels.kind
    }

    /// Configured endpoints as a comma separated list.
    pub fn address(&self) -> &str {
        &self.inner.labels.address
    }

    /// The defaulted options this instance was built from.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Connection URI with credentials redacted.
    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn labels(&self) -> &InstanceLabels {
        &self.inner.labels
    }

    /// Names of the middleware wrapping this instance, outermost first.
    pub fn middleware(&self) -> &[String] {
        &self.inner.middleware
    }

    /// The raw connection, bypassing every middleware.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.inner.connection
    }

    pub async fn ping(&self) -> Result<(), DriverError> {
        self.inner.connection.ping().await
    }

    pub fn pool_stats(&self) -> Result<PoolStats, StatSampleError> {
        self.inner.connection.pool_stats()
    }

    pub(crate) async fn close(&self) -> Result<(), DriverError> {
        self.inner.connection.close().await
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn same(a: &Instance, b: &Instance) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("uri", &self.uri())
            .field("middleware", &self.middleware())
            .finish_non_exhaustive()
    }
}
