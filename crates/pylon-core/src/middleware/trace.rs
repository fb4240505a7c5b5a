//! Client spans for distributed tracing.
//!
//! Each operation runs inside a `db.client` span carrying the OpenTelemetry
//! database semantic-convention fields. The span status and the elapsed time
//! are recorded when the operation finishes.

use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;
use tracing::field::Empty;

use super::{Handler, InstanceLabels, Middleware, handler_fn};
use crate::metrics::Outcome;
use crate::operation::Operation;

#[derive(Debug, Clone)]
pub struct Trace {
    labels: Arc<InstanceLabels>,
}

impl Trace {
    pub fn new(labels: Arc<InstanceLabels>) -> Self {
        Self { labels }
    }
}

impl Middleware for Trace {
    fn name(&self) -> &str {
        "trace"
    }

    fn wrap(&self, next: Handler) -> Handler {
        let labels = self.labels.clone();
        handler_fn(move |cancel, op: Operation| {
            let next = next.clone();
            let span = tracing::info_span!(
                "db.client",
                otel.kind = "client",
                db.system = %labels.kind,
                db.name = %labels.database,
                db.operation = %op.name,
                net.peer.name = %labels.peer_host,
                net.peer.port = labels.peer_port,
                pylon.instance = %labels.name,
                otel.status_code = Empty,
                db.duration_ms = Empty,
            );
            async move {
                let start = Instant::now();
                let result = next(cancel, op).await;
                let status = match Outcome::of(&result) {
                    Outcome::Ok => "OK",
                    Outcome::Error => "ERROR",
                };
                let span = tracing::Span::current();
                span.record("otel.status_code", status);
                span.record("db.duration_ms", start.elapsed().as_secs_f64() * 1000.0);
                result
            }
            .instrument(span)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationError;
    use crate::kind::BackendKind;
    use crate::middleware::HandlerResult;
    use crate::operation::Reply;
    use parking_lot::Mutex;
    use std::io;
    use tokio_util::sync::CancellationToken;
    use tracing_subscriber::fmt::format::FmtSpan;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn labels() -> Arc<InstanceLabels> {
        Arc::new(InstanceLabels {
            kind: BackendKind::Postgres,
            name: "default".into(),
            address: "pg:5432".into(),
            database: "app".into(),
            peer_host: "pg".into(),
            peer_port: 5432,
        })
    }

    /// Run one traced call and return its result plus the closed span line.
    async fn run_traced(result: HandlerResult) -> (HandlerResult, String) {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let handler = Trace::new(labels()).wrap(handler_fn(move |_, _| {
            let result = result.clone();
            async move { result }
        }));
        let out = handler(CancellationToken::new(), Operation::new("select")).await;
        let text = String::from_utf8_lossy(&capture.0.lock()).into_owned();
        (out, text)
    }

    #[tokio::test]
    async fn span_carries_labels_duration_and_status() {
        let (result, out) = run_traced(Ok(Reply::from(2))).await;
        assert_eq!(result, Ok(Reply::from(2)));
        assert!(out.contains("db.client"), "{out}");
        assert!(out.contains("db.system=postgres"), "{out}");
        assert!(out.contains("db.name=app"), "{out}");
        assert!(out.contains("db.operation=select"), "{out}");
        assert!(out.contains("net.peer.name=pg"), "{out}");
        assert!(out.contains("net.peer.port=5432"), "{out}");
        assert!(out.contains("db.duration_ms="), "{out}");
        assert!(out.contains("otel.status_code=\"OK\""), "{out}");
    }

    #[tokio::test]
    async fn not_found_is_ok_and_backend_errors_are_error() {
        let (result, out) = run_traced(Err(OperationError::NotFound)).await;
        assert_eq!(result, Err(OperationError::NotFound));
        assert!(out.contains("otel.status_code=\"OK\""), "{out}");

        let (result, out) = run_traced(Err(OperationError::Backend("syntax error".into()))).await;
        assert_eq!(result, Err(OperationError::Backend("syntax error".into())));
        assert!(out.contains("otel.status_code=\"ERROR\""), "{out}");
        assert!(out.contains("db.duration_ms="), "{out}");
    }
}
