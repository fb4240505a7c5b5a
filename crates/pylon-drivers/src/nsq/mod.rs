//! nsq over the nsqd TCP protocol.
//!
//! Publishing goes through one producer per configured nsqd, picked round
//! robin with failover to the next one on transport errors. A target with a
//! `consumer` block also subscribes on open.
//!
//! | operation | arguments | reply |
//! |---|---|---|
//! | `PUB` | topic?, body | `"OK"` |
//! | `MPUB` | topic?, [bodies] | `"OK"` |
//! | `DPUB` | topic?, defer ms, body | `"OK"` |
//! | `RECV` | | `{id, body, attempts, timestamp}` or not found |
//! | `FIN`, `TOUCH` | message id | `"OK"` |
//! | `REQ` | message id, timeout ms? | `"OK"` |
//! | `PING` | | `"PONG"` |
//!
//! Without a topic argument the target's database names the topic.

pub mod codec;
pub mod consumer;
pub mod lookup;
pub mod producer;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use pylon_core::{
    Connection, DriverError, Endpoint, Operation, OperationError, PoolStats, Reply,
    StatSampleError, Target,
};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::args;
use crate::counters::Counters;
use crate::retry;

use codec::{Command, Frame, MAGIC_V2, MessageId, NsqCodec, OK, valid_name};
use consumer::Consumer;
use producer::Producer;

pub type Link = Framed<TcpStream, NsqCodec>;

/// Dial, send the magic and identify. Returns once nsqd accepted `IDENTIFY`.
pub async fn dial(endpoint: &Endpoint, target: &Target) -> Result<Link, DriverError> {
    let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    let mut stream = tokio::time::timeout(target.timeouts.dial, connect)
        .await
        .map_err(|_| DriverError::Timeout(target.timeouts.dial))??;
    stream.set_nodelay(true)?;
    stream.write_all(MAGIC_V2).await?;

    let mut link = Framed::new(stream, NsqCodec);
    let client_id = if target.client_name.is_empty() {
        target.name.as_str()
    } else {
        target.client_name.as_str()
    };
    let identify = json!({
        "client_id": client_id,
        "user_agent": concat!("pylon/", env!("CARGO_PKG_VERSION")),
        "feature_negotiation": false,
    });
    match round_trip(&mut link, Command::Identify(Bytes::from(identify.to_string())), target.timeouts.read).await? {
        Frame::Response(data) if data.as_ref() == OK => {
            debug!(%endpoint, "nsqd identified");
            Ok(link)
        }
        Frame::Error(data) => Err(DriverError::Protocol(String::from_utf8_lossy(&data).into_owned())),
        other => Err(DriverError::Protocol(format!("unexpected IDENTIFY reply {other:?}"))),
    }
}

/// Send a command and read its reply, answering heartbeats on the way.
pub async fn round_trip(link: &mut Link, command: Command, wait: Duration) -> Result<Frame, DriverError> {
    link.send(command).await?;
    loop {
        let frame = match tokio::time::timeout(wait, link.next()).await {
            Err(_) => return Err(DriverError::Timeout(wait)),
            Ok(None) => {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            Ok(Some(frame)) => frame?,
        };
        match frame {
            frame if frame.is_heartbeat() => link.send(Command::Nop).await?,
            Frame::Message(_) => return Err(DriverError::Protocol("unexpected message frame".into())),
            frame => return Ok(frame),
        }
    }
}

fn parse_id(op: &Operation) -> Result<MessageId, OperationError> {
    let raw = args::string(op, 0, "message id")?;
    raw.as_bytes()
        .try_into()
        .map_err(|_| OperationError::Backend(format!("invalid message id {raw:?}")))
}

fn number(op: &Operation, index: usize, what: &str) -> Result<u64, OperationError> {
    match args::value(op, index) {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| OperationError::Backend(format!("{}: {what} must be a positive integer", op.name))),
        Value::String(s) => s
            .parse()
            .map_err(|_| OperationError::Backend(format!("{}: {what} must be a positive integer", op.name))),
        _ => Err(OperationError::Backend(format!("{}: {what} must be a positive integer", op.name))),
    }
}

/// Split `[topic, rest..]` or `[rest..]` using the configured topic.
pub fn topic_and_args<'a>(
    target: &'a Target,
    op: &'a Operation,
    rest: usize,
) -> Result<(&'a str, &'a [Value]), OperationError> {
    let (topic, tail) = match op.args.as_slice() {
        [Value::String(topic), tail @ ..] if tail.len() == rest => (topic.as_str(), tail),
        tail if tail.len() == rest => (target.database.as_str(), tail),
        _ => {
            return Err(OperationError::Backend(format!(
                "{} expects {rest} argument(s) after an optional topic",
                op.name
            )));
        }
    };
    if !valid_name(topic) {
        return Err(OperationError::Backend(format!("invalid topic {topic:?}")));
    }
    Ok((topic, tail))
}

/// Build the publish command for `PUB`, `MPUB` or `DPUB`.
pub fn publish_command(target: &Target, op: &Operation, command: &str) -> Result<Command, OperationError> {
    match command {
        "pub" => {
            let (topic, rest) = topic_and_args(target, op, 1)?;
            Ok(Command::Pub {
                topic: topic.to_string(),
                body: Bytes::from(args::bytes(&rest[0])),
            })
        }
        "mpub" => {
            let (topic, rest) = topic_and_args(target, op, 1)?;
            let bodies = match &rest[0] {
                Value::Array(items) if !items.is_empty() => {
                    items.iter().map(|item| Bytes::from(args::bytes(item))).collect()
                }
                _ => {
                    return Err(OperationError::Backend(
                        "MPUB expects a non-empty array of bodies".into(),
                    ));
                }
            };
            Ok(Command::Mpub {
                topic: topic.to_string(),
                bodies,
            })
        }
        _ => {
            let (topic, rest) = topic_and_args(target, op, 2)?;
            let defer_ms = match &rest[0] {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            }
            .ok_or_else(|| OperationError::Backend("DPUB defer must be milliseconds".into()))?;
            Ok(Command::Dpub {
                topic: topic.to_string(),
                defer_ms,
                body: Bytes::from(args::bytes(&rest[1])),
            })
        }
    }
}

#[derive(Debug)]
pub struct NsqConnection {
    target: Arc<Target>,
    producers: Vec<Producer>,
    next: AtomicUsize,
    consumer: Option<Consumer>,
    counters: Counters,
    closed: AtomicBool,
}

impl NsqConnection {
    /// Producers connect lazily; the consumer, when configured, subscribes
    /// before this returns.
    pub async fn open(target: &Target) -> Result<Self, DriverError> {
        let target = Arc::new(target.clone());
        let producers = target
            .endpoints
            .iter()
            .chain(&target.replicas)
            .map(|endpoint| Producer::new(endpoint.clone(), target.clone()))
            .collect();
        let consumer = match &target.consumer {
            Some(settings) => Some(Consumer::start(target.clone(), settings.clone()).await?),
            None => None,
        };
        Ok(Self {
            target,
            producers,
            next: AtomicUsize::new(0),
            consumer,
            counters: Counters::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn consumer(&self) -> Option<&Consumer> {
        self.consumer.as_ref()
    }

    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    fn subscribed(&self, op: &Operation) -> Result<&Consumer, OperationError> {
        self.consumer
            .as_ref()
            .ok_or_else(|| OperationError::Unsupported(format!("{} without a consumer", op.name)))
    }

    /// Try every producer once, starting at the next in turn.
    async fn publish_once(&self, command: &Command) -> Result<Reply, OperationError> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last = DriverError::Other("no nsqd configured".into());
        for offset in 0..self.producers.len() {
            let producer = &self.producers[(start + offset) % self.producers.len()];
            match producer.send(command.clone()).await {
                Ok(Frame::Response(data)) => {
                    self.counters.hit();
                    return Ok(Reply::String(String::from_utf8_lossy(&data).into_owned()));
                }
                Ok(Frame::Error(data)) => {
                    return Err(OperationError::Backend(String::from_utf8_lossy(&data).into_owned()));
                }
                Ok(Frame::Message(_)) => {
                    return Err(OperationError::Transport("unexpected message frame".into()));
                }
                Err(err) => {
                    self.counters.miss();
                    if matches!(err, DriverError::Timeout(_)) {
                        self.counters.timeout();
                    }
                    debug!(endpoint = %producer.endpoint(), error = %err, "nsqd publish failed");
                    last = err;
                }
            }
        }
        Err(last.into())
    }

    async fn publish(&self, command: Command) -> Result<Reply, OperationError> {
        let command = &command;
        retry::with_retries(
            self.target.pool.max_retries,
            |e: &OperationError| matches!(e, OperationError::Transport(_)),
            || self.publish_once(command),
        )
        .await
    }
}

#[async_trait]
impl Connection for NsqConnection {
    async fn execute(&self, _cancel: CancellationToken, op: Operation) -> Result<Reply, OperationError> {
        self.check_open()?;
        let command = args::command(&op);
        match command.as_str() {
            "ping" => {
                self.ping().await?;
                Ok(Reply::String("PONG".into()))
            }
            "pub" | "mpub" | "dpub" => {
                let publish = publish_command(&self.target, &op, &command)?;
                self.publish(publish).await
            }
            "recv" => {
                let message = self.subscribed(&op)?.recv(self.target.timeouts.read).await?;
                Ok(json!({
                    "id": message.id_str(),
                    "body": String::from_utf8_lossy(&message.body),
                    "attempts": message.attempts,
                    "timestamp": message.timestamp,
                }))
            }
            "fin" | "req" | "touch" => {
                let consumer = self.subscribed(&op)?;
                let id = parse_id(&op)?;
                let ack = match command.as_str() {
                    "fin" => Command::Fin(id),
                    "touch" => Command::Touch(id),
                    _ => Command::Req {
                        id,
                        timeout_ms: number(&op, 1, "requeue timeout")?,
                    },
                };
                consumer.acknowledge(ack)?;
                Ok(Reply::String("OK".into()))
            }
            _ => Err(OperationError::Unsupported(format!("{} on nsq", op.name))),
        }
    }

    /// Every producer connected, which means nsqd answered `IDENTIFY`.
    async fn ping(&self) -> Result<(), DriverError> {
        self.check_open()?;
        for producer in &self.producers {
            producer.ping().await?;
        }
        Ok(())
    }

    fn pool_stats(&self) -> Result<PoolStats, StatSampleError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StatSampleError::Closed);
        }
        let mut stats = self.producers.iter().fold(PoolStats::default(), |acc, producer| {
            let stats = producer.stats();
            PoolStats {
                open: acc.open + stats.open,
                idle: acc.idle + stats.idle,
                in_use: acc.in_use + stats.in_use,
                ..acc
            }
        });
        if let Some(consumer) = &self.consumer {
            stats.open += consumer.connections() as u64;
            stats.in_use += consumer.in_flight() as u64;
        }
        Ok(self.counters.apply(stats))
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DriverError::Closed);
        }
        if let Some(consumer) = &self.consumer {
            consumer.stop().await;
        }
        for producer in &self.producers {
            producer.close().await;
        }
        debug!(name = %self.target.name, "nsq connections closed");
        Ok(())
    }
}
