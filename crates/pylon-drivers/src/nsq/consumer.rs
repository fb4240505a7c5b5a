//! Subscriptions: one nsqd connection per producer of the topic, discovered
//! through nsqlookupd or taken from the configured addresses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pylon_core::{ConsumerTarget, DriverError, Endpoint, OperationError, Target};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{CLOSE_WAIT, Command, Frame, Message, MessageId};
use super::{Link, dial, lookup, round_trip};

const LOOKUPD_POLL: Duration = Duration::from_secs(60);

/// A received message and the connection that must acknowledge it.
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    pub reply_to: mpsc::UnboundedSender<Command>,
}

#[derive(Debug)]
struct Shared {
    target: Arc<Target>,
    settings: ConsumerTarget,
    deliveries: mpsc::Sender<Delivery>,
    links: parking_lot::Mutex<HashMap<Endpoint, mpsc::UnboundedSender<Command>>>,
    tasks: parking_lot::Mutex<JoinSet<()>>,
    http: reqwest::Client,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct Consumer {
    shared: Arc<Shared>,
    inbox: AsyncMutex<mpsc::Receiver<Delivery>>,
    in_flight: parking_lot::Mutex<HashMap<MessageId, mpsc::UnboundedSender<Command>>>,
}

impl Shared {
    async fn subscribe(self: &Arc<Self>, endpoint: Endpoint) -> Result<(), DriverError> {
        if self.links.lock().contains_key(&endpoint) {
            return Ok(());
        }
        let mut link = dial(&endpoint, &self.target).await?;
        let sub = Command::Sub {
            topic: self.settings.topic.clone(),
            channel: self.settings.channel.clone(),
        };
        match round_trip(&mut link, sub, self.target.timeouts.read).await? {
            Frame::Error(data) => {
                return Err(DriverError::Protocol(String::from_utf8_lossy(&data).into_owned()));
            }
            _ => link.send(Command::Rdy(self.settings.max_in_flight)).await?,
        }

        let (commands, inbox) = mpsc::unbounded_channel();
        self.links.lock().insert(endpoint.clone(), commands.clone());
        let shared = self.clone();
        self.tasks
            .lock()
            .spawn(async move { shared.pump(endpoint, link, commands, inbox).await });
        Ok(())
    }

    /// Move frames between one nsqd and the consumer until cancelled or
    /// disconnected.
    async fn pump(
        self: Arc<Self>,
        endpoint: Endpoint,
        mut link: Link,
        reply_to: mpsc::UnboundedSender<Command>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        info!(%endpoint, topic = %self.settings.topic, channel = %self.settings.channel, "nsq subscribed");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let closing = tokio::time::timeout(self.target.timeouts.write, link.send(Command::Cls));
                    if !matches!(closing.await, Ok(Ok(()))) {
                        debug!(%endpoint, "nsqd did not take CLS");
                    }
                    break;
                }
                Some(command) = commands.recv() => {
                    if let Err(err) = link.send(command).await {
                        warn!(%endpoint, error = %err, "nsqd write failed");
                        break;
                    }
                }
                frame = link.next() => match frame {
                    Some(Ok(frame)) if frame.is_heartbeat() => {
                        if link.send(Command::Nop).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Frame::Message(message))) => {
                        let delivery = Delivery { message, reply_to: reply_to.clone() };
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            sent = self.deliveries.send(delivery) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Frame::Response(data))) if data.as_ref() == CLOSE_WAIT => break,
                    Some(Ok(Frame::Response(_))) => {}
                    Some(Ok(Frame::Error(data))) => {
                        warn!(%endpoint, error = %String::from_utf8_lossy(&data), "nsqd error frame");
                    }
                    Some(Err(err)) => {
                        warn!(%endpoint, error = %err, "nsqd read failed");
                        break;
                    }
                    None => break,
                },
            }
        }
        self.links.lock().remove(&endpoint);
        debug!(%endpoint, "nsq subscription ended");
    }

    /// Subscribe to every producer lookupd knows for the topic.
    async fn discover(self: &Arc<Self>) {
        for lookupd in &self.settings.lookupd {
            let found = match lookup::producers(&self.http, lookupd, &self.settings.topic).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(%lookupd, error = %err, "nsqlookupd query failed");
                    continue;
                }
            };
            for endpoint in found {
                if let Err(err) = self.subscribe(endpoint.clone()).await {
                    warn!(%endpoint, error = %err, "nsqd subscribe failed");
                }
            }
        }
    }
}

impl Consumer {
    /// Subscribe and start delivering.
    ///
    /// Without lookupd addresses the target's own endpoints are subscribed
    /// directly and any failure is returned. With lookupd, discovery failures
    /// are logged and retried on the next poll.
    pub async fn start(target: Arc<Target>, settings: ConsumerTarget) -> Result<Self, DriverError> {
        let (deliveries, inbox) = mpsc::channel(settings.max_in_flight.max(1) as usize);
        let shared = Arc::new(Shared {
            http: lookup::http_client(target.timeouts.read)?,
            target,
            settings,
            deliveries,
            links: parking_lot::Mutex::new(HashMap::new()),
            tasks: parking_lot::Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
        });
        let consumer = Self {
            shared: shared.clone(),
            inbox: AsyncMutex::new(inbox),
            in_flight: parking_lot::Mutex::new(HashMap::new()),
        };

        if shared.settings.lookupd.is_empty() {
            for endpoint in &shared.target.endpoints {
                if let Err(err) = shared.subscribe(endpoint.clone()).await {
                    consumer.stop().await;
                    return Err(err);
                }
            }
            return Ok(consumer);
        }

        shared.discover().await;
        let poller = shared.clone();
        shared.tasks.lock().spawn(async move {
            let mut ticker = tokio::time::interval(LOOKUPD_POLL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = poller.cancel.cancelled() => break,
                    _ = ticker.tick() => poller.discover().await,
                }
            }
        });
        Ok(consumer)
    }

    pub fn settings(&self) -> &ConsumerTarget {
        &self.shared.settings
    }

    /// Next message, or not found when none arrives within `wait`.
    pub async fn recv(&self, wait: Duration) -> Result<Message, OperationError> {
        let mut inbox = self.inbox.lock().await;
        match tokio::time::timeout(wait, inbox.recv()).await {
            Ok(Some(delivery)) => {
                self.in_flight
                    .lock()
                    .insert(delivery.message.id, delivery.reply_to);
                Ok(delivery.message)
            }
            Ok(None) => Err(OperationError::Transport("consumer stopped".into())),
            Err(_) => Err(OperationError::NotFound),
        }
    }

    /// Send an acknowledgement for an in-flight message. `FIN` and `REQ`
    /// release it; `TOUCH` keeps it.
    pub fn acknowledge(&self, command: Command) -> Result<(), OperationError> {
        let (id, release) = match &command {
            Command::Fin(id) | Command::Req { id, .. } => (*id, true),
            Command::Touch(id) => (*id, false),
            other => {
                return Err(OperationError::Unsupported(format!("{other:?} is not an acknowledgement")));
            }
        };
        let reply_to = {
            let mut in_flight = self.in_flight.lock();
            if release {
                in_flight.remove(&id)
            } else {
                in_flight.get(&id).cloned()
            }
        };
        let Some(reply_to) = reply_to else {
            return Err(OperationError::NotFound);
        };
        reply_to
            .send(command)
            .map_err(|_| OperationError::Transport("nsqd connection closed".into()))
    }

    pub fn connections(&self) -> usize {
        self.shared.links.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Send `CLS` on every connection and wait for the pumps to finish.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let mut tasks = std::mem::take(&mut *self.shared.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "nsq consumer task failed");
            }
        }
        self.in_flight.lock().clear();
        debug!(topic = %self.shared.settings.topic, "nsq consumer stopped");
    }
}
