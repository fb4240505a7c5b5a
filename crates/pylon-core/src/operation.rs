//! The unit of work that flows through a middleware chain.

use serde_json::Value;

/// Result payload of an operation.
pub type Reply = Value;

/// One backend operation: a command name plus its arguments.
///
/// For redis this is a command (`GET`, `HSET`, ...); for relational backends
/// the statement text is the first argument; for nsq the name is `PUB`.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: String,
    pub args: Vec<Value>,
    /// Eligible for routing to a read replica.
    pub read_only: bool,
}

impl Operation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            read_only: false,
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Statement text for logging: the name followed by scalar arguments.
    pub fn statement(&self) -> String {
        let mut out = self.name.clone();
        for arg in &self.args {
            out.push(' ');
            match arg {
                Value::String(s) => out.push_str(s),
                Value::Null => out.push_str("nil"),
                Value::Bool(_) | Value::Number(_) => out.push_str(&arg.to_string()),
                Value::Array(_) | Value::Object(_) => out.push('?'),
            }
        }
        out
    }
}
