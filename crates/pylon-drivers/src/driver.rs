use std::sync::Arc;

use async_trait::async_trait;
use pylon_core::{BackendKind, Connection, Driver, DriverError, Target};
use tracing::info;

use crate::mongo::MongoConnection;
use crate::nsq::NsqConnection;
use crate::redis::RedisConnection;
use crate::sql::SqlConnection;

/// [`Driver`] for every backend kind.
///
/// SQL and redis pools connect lazily; the startup ping is what proves the
/// server is there. The mongo client starts monitoring on open and nsq
/// consumers subscribe on open.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientDriver;

impl ClientDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for ClientDriver {
    fn name(&self) -> &str {
        "client"
    }

    async fn open(&self, target: &Target) -> Result<Arc<dyn Connection>, DriverError> {
        let connection: Arc<dyn Connection> = match target.kind {
            BackendKind::Mysql | BackendKind::Postgres => Arc::new(SqlConnection::open(target)?),
            BackendKind::Redis => Arc::new(RedisConnection::open(target)?),
            BackendKind::Mongo => Arc::new(MongoConnection::open(target).await?),
            BackendKind::Nsq => {
                if target.tls {
                    return Err(DriverError::Other("nsq: tls is not supported".into()));
                }
                Arc::new(NsqConnection::open(target).await?)
            }
        };

        info!(
            kind = %target.kind,
            name = %target.name,
            uri = %target.uri(),
            replicas = target.replicas.len(),
            consumer = target.consumer.is_some(),
            "connection opened"
        );
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylon_core::Options;

    #[tokio::test]
    async fn nsq_over_tls_is_rejected() {
        let mut options = Options::new().with_address("nsqd").with_defaults(BackendKind::Nsq);
        options.tls = true;
        let target = Target::from_options(BackendKind::Nsq, "default", &options).unwrap();
        let err = ClientDriver::new().open(&target).await.err().unwrap();
        assert!(matches!(err, DriverError::Other(_)));
    }

    #[tokio::test]
    async fn lazy_backends_open_without_a_server() {
        let options = Options::new().with_address("127.0.0.1:1").with_defaults(BackendKind::Redis);
        let target = Target::from_options(BackendKind::Redis, "default", &options).unwrap();
        let conn = ClientDriver::new().open(&target).await.unwrap();
        assert!(conn.ping().await.is_err());
        conn.close().await.unwrap();
    }
}
