use std::sync::Arc;

use futures_util::SinkExt;
use pylon_core::{DriverError, Endpoint, PoolStats, Target};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::codec::{Command, Frame};
use super::{Link, dial, round_trip};

/// One nsqd connection for publishing, dialed on first use and redialed
/// after a transport failure.
#[derive(Debug)]
pub struct Producer {
    endpoint: Endpoint,
    target: Arc<Target>,
    link: Mutex<Option<Link>>,
}

fn is_transport(err: &DriverError) -> bool {
    matches!(err, DriverError::Io(_) | DriverError::Protocol(_) | DriverError::Timeout(_))
}

impl Producer {
    pub fn new(endpoint: Endpoint, target: Arc<Target>) -> Self {
        Self {
            endpoint,
            target,
            link: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one publish command and wait for `OK` or an error frame.
    pub async fn send(&self, command: Command) -> Result<Frame, DriverError> {
        let mut guard = self.link.lock().await;
        if guard.is_none() {
            *guard = Some(dial(&self.endpoint, &self.target).await?);
        }
        let Some(link) = guard.as_mut() else {
            return Err(DriverError::Closed);
        };
        let result = round_trip(link, command, self.target.timeouts.read).await;
        if let Err(err) = &result {
            if is_transport(err) {
                warn!(endpoint = %self.endpoint, error = %err, "dropping nsqd connection");
                *guard = None;
            }
        }
        result
    }

    /// Connected and writable. A fresh dial already waited for the
    /// `IDENTIFY` response.
    pub async fn ping(&self) -> Result<(), DriverError> {
        let mut guard = self.link.lock().await;
        match guard.as_mut() {
            None => {
                *guard = Some(dial(&self.endpoint, &self.target).await?);
                Ok(())
            }
            Some(link) => {
                let sent = tokio::time::timeout(self.target.timeouts.write, link.send(Command::Nop))
                    .await
                    .unwrap_or(Err(DriverError::Timeout(self.target.timeouts.write)));
                if sent.is_err() {
                    *guard = None;
                }
                sent
            }
        }
    }

    pub async fn close(&self) {
        if let Some(mut link) = self.link.lock().await.take() {
            if let Err(err) = link.close().await {
                debug!(endpoint = %self.endpoint, error = %err, "nsqd close");
            }
        }
    }

    /// One open connection, in use while a publish holds it.
    pub fn stats(&self) -> PoolStats {
        match self.link.try_lock() {
            Ok(guard) if guard.is_some() => PoolStats {
                open: 1,
                idle: 1,
                ..PoolStats::default()
            },
            Ok(_) => PoolStats::default(),
            Err(_) => PoolStats {
                open: 1,
                in_use: 1,
                ..PoolStats::default()
            },
        }
    }
}
