//! Handler composition.
//!
//! A [`Handler`] runs one backend operation. A [`Middleware`] turns the next
//! handler into a wrapping handler, and a [`Chain`] folds an ordered list of
//! middleware around a terminal handler so that the first entry is the
//! outermost layer:
//!
//! ```text
//! trace → metrics → logging → (custom...) → driver
//! ```

pub mod logging;
pub mod metrics;
pub mod trace;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::OperationError;
use crate::kind::BackendKind;
use crate::operation::{Operation, Reply};

pub use logging::Logging;
pub use metrics::Metrics;
pub use trace::Trace;

/// Type alias for a boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What every handler resolves to.
pub type HandlerResult = Result<Reply, OperationError>;

/// One step of an operation pipeline.
pub type Handler =
    Arc<dyn Fn(CancellationToken, Operation) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Build a [`Handler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(CancellationToken, Operation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(
        move |cancel: CancellationToken, op: Operation| -> BoxFuture<'static, HandlerResult> {
            Box::pin(f(cancel, op))
        },
    )
}

/// A cross-cutting wrapper around a handler.
///
/// Implementations must call `next` at most once per operation and must not
/// alter the operation or its result.
pub trait Middleware: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn wrap(&self, next: Handler) -> Handler;
}

/// Identity of the instance a chain was built for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceLabels {
    pub kind: BackendKind,
    pub name: String,
    /// Comma separated list of configured addresses.
    pub address: String,
    pub database: String,
    pub peer_host: String,
    pub peer_port: u16,
}

/// Ordered list of middleware, outermost first.
#[derive(Clone, Debug, Default)]
pub struct Chain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Append every entry of `other`; they run inside the existing entries.
    pub fn extend(&mut self, other: &Chain) {
        self.middleware.extend(other.middleware.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.middleware.iter().map(|m| m.name().to_string()).collect()
    }

    /// Wrap `terminal` with every middleware, last entry innermost.
    pub fn then(&self, terminal: Handler) -> Handler {
        self.middleware
            .iter()
            .rev()
            .fold(terminal, |next, middleware| middleware.wrap(next))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records "before"/"after" markers into a shared log.
    #[derive(Debug)]
    pub(crate) struct Recording {
        pub label: &'static str,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recording {
        fn name(&self) -> &str {
            self.label
        }

        fn wrap(&self, next: Handler) -> Handler {
            let label = self.label;
            let log = self.log.clone();
            handler_fn(move |cancel, op| {
                let next = next.clone();
                let log = log.clone();
                async move {
                    log.lock().push(format!("{label}:before"));
                    let out = next(cancel, op).await;
                    log.lock().push(format!("{label}:after"));
                    out
                }
            })
        }
    }

    /// Never calls the wrapped handler.
    #[derive(Debug)]
    struct ShortCircuit;

    impl Middleware for ShortCircuit {
        fn name(&self) -> &str {
            "short-circuit"
        }

        fn wrap(&self, _next: Handler) -> Handler {
            handler_fn(|_, _| async { Err(OperationError::Unsupported("blocked".into())) })
        }
    }

    fn terminal(log: Arc<Mutex<Vec<String>>>) -> Handler {
        handler_fn(move |_, op| {
            let log = log.clone();
            async move {
                log.lock().push("terminal".into());
                Ok(Reply::String(op.name))
            }
        })
    }

    #[tokio::test]
    async fn chain_runs_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new()
            .with(Recording { label: "A", log: log.clone() })
            .with(Recording { label: "B", log: log.clone() })
            .with(Recording { label: "C", log: log.clone() });

        let handler = chain.then(terminal(log.clone()));
        let reply = handler(CancellationToken::new(), Operation::new("GET")).await;

        assert_eq!(reply, Ok(Reply::String("GET".into())));
        assert_eq!(
            *log.lock(),
            vec![
                "A:before", "B:before", "C:before", "terminal", "C:after", "B:after", "A:after"
            ]
        );
        assert_eq!(chain.names(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn empty_chain_is_the_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Chain::new().then(terminal(log.clone()));
        handler(CancellationToken::new(), Operation::new("PING"))
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec!["terminal"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new()
            .with(Recording { label: "A", log: log.clone() })
            .with(ShortCircuit)
            .with(Recording { label: "C", log: log.clone() });

        let out = chain.then(terminal(log.clone()))(CancellationToken::new(), Operation::new("GET")).await;
        assert!(matches!(out, Err(OperationError::Unsupported(_))));
        assert_eq!(*log.lock(), vec!["A:before", "A:after"]);
    }

    #[test]
    fn extend_appends_inner_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut outer = Chain::new().with(Recording { label: "A", log: log.clone() });
        let inner = Chain::new().with(Recording { label: "B", log });
        outer.extend(&inner);
        assert_eq!(outer.names(), vec!["A", "B"]);
        assert_eq!(outer.len(), 2);
    }
}
