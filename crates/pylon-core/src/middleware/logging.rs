//! Structured operation logging.
//!
//! One event per operation. Failures log at ERROR, slow operations at WARN,
//! everything else at INFO. A not-found result is never a failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use super::{Handler, HandlerResult, InstanceLabels, Middleware, handler_fn};
use crate::operation::Operation;
use crate::options::Options;

const MAX_STRING_LEN: usize = 256;
const REDACTED: &str = "***";
const SENSITIVE_KEYS: [&str; 6] = ["password", "passwd", "secret", "token", "auth", "credential"];

/// Level an operation is logged at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Pick the log level for a finished operation.
pub fn classify(result: &HandlerResult, elapsed: Duration, slow_threshold: Duration) -> Severity {
    match result {
        Err(err) if err.is_failure() => Severity::Error,
        _ if !slow_threshold.is_zero() && elapsed > slow_threshold => Severity::Warn,
        _ => Severity::Info,
    }
}

#[derive(Debug, Clone)]
pub struct Logging {
    labels: Arc<InstanceLabels>,
    slow_threshold: Duration,
    log_request: bool,
    log_response: bool,
}

impl Logging {
    pub fn new(labels: Arc<InstanceLabels>, options: &Options) -> Self {
        Self {
            labels,
            slow_threshold: options.slow_threshold,
            log_request: options.enable_logging_request,
            log_response: options.enable_logging_response,
        }
    }

    fn emit(
        &self,
        method: &str,
        elapsed: Duration,
        statement: Option<String>,
        request: Option<String>,
        result: &HandlerResult,
    ) {
        let severity = classify(result, elapsed, self.slow_threshold);
        let response = match result {
            Ok(reply) if self.log_response => Some(sanitize(reply).to_string()),
            _ => None,
        };
        let error = result.as_ref().err().map(|e| e.to_string());
        let l = &self.labels;

        macro_rules! emit {
            ($level:ident, $msg:literal) => {
                tracing::$level!(
                    kind = %l.kind.family(),
                    component = %l.kind,
                    instance = %l.name,
                    addr = %l.address,
                    method = %method,
                    duration = ?elapsed,
                    statement = statement.as_deref(),
                    request = request.as_deref(),
                    response = response.as_deref(),
                    error = error.as_deref(),
                    $msg
                )
            };
        }

        match severity {
            Severity::Error => emit!(error, "backend operation failed"),
            Severity::Warn => emit!(warn, "slow backend operation"),
            Severity::Info => emit!(info, "backend operation"),
        }
    }
}

impl Middleware for Logging {
    fn name(&self) -> &str {
        "logging"
    }

    fn wrap(&self, next: Handler) -> Handler {
        let this = self.clone();
        handler_fn(move |cancel, op: Operation| {
            let next = next.clone();
            let this = this.clone();
            async move {
                let method = op.name.clone();
                let (statement, request) = if this.log_request {
                    (Some(sanitized_statement(&op)), Some(render_request(&op)))
                } else {
                    (None, None)
                };
                let start = Instant::now();
                let result = next(cancel, op).await;
                this.emit(&method, start.elapsed(), statement, request, &result);
                result
            }
        })
    }
}

/// Render request arguments as `{"args_0": .., "args_1": ..}` with secrets masked.
pub fn render_request(op: &Operation) -> String {
    let masked = is_auth_command(&op.name);
    let fields: Map<String, Value> = op
        .args
        .iter()
        .enumerate()
        .map(|(i, arg)| {
            let value = if masked {
                Value::String(REDACTED.to_string())
            } else {
                sanitize(arg)
            };
            (format!("args_{i}"), value)
        })
        .collect();
    Value::Object(fields).to_string()
}

/// Statement text with credentials removed and long values truncated.
pub fn sanitized_statement(op: &Operation) -> String {
    if is_auth_command(&op.name) {
        return format!("{} {REDACTED}", op.name);
    }
    truncate(&op.statement())
}

/// Copy of `value` with sensitive object keys masked and long strings cut.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, v)| {
                    let v = if is_sensitive_key(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        sanitize(v)
                    };
                    (key.clone(), v)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

fn is_auth_command(name: &str) -> bool {
    name.eq_ignore_ascii_case("AUTH") || name.eq_ignore_ascii_case("HELLO")
}

fn truncate(s: &str) -> String {
    match s.char_indices().nth(MAX_STRING_LEN) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}
