//! MongoDB over the `mongodb` client.
//!
//! The client keeps its own pool and server monitoring; replicas are added
//! to the seed list. Collection operations take the collection name as the
//! first argument and JSON (extended JSON accepted) for documents:
//!
//! | operation | arguments | reply |
//! |---|---|---|
//! | `find` | collection, filter?, options? | documents |
//! | `find_one` | collection, filter? | document or not found |
//! | `insert_one` | collection, document | `{inserted_id}` |
//! | `insert_many` | collection, [documents] | `{inserted_ids}` |
//! | `update_one`, `update_many` | collection, filter, update | `{matched_count, modified_count, upserted_id}` |
//! | `replace_one` | collection, filter, replacement | as update |
//! | `delete_one`, `delete_many` | collection, filter | `{deleted_count}` |
//! | `find_one_and_update`, `find_one_and_replace`, `find_one_and_delete` | collection, filter, update? | document or not found |
//! | `count_documents` | collection, filter? | count |
//! | `estimated_document_count` | collection | count |
//! | `distinct` | collection, field, filter? | values |
//! | `aggregate` | collection, [stages] | documents |
//! | `drop` | collection | `"OK"` |
//! | `run_command` | command | reply document |
//! | `ping` | | `"PONG"` |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::event::EventHandler;
use mongodb::event::cmap::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason};
use mongodb::options::{ClientOptions, Credential, FindOptions, UpdateModifications};
use mongodb::{Client, Collection};
use pylon_core::{
    Connection, DriverError, Operation, OperationError, PoolStats, Reply, StatSampleError, Target,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::args;

const AUTH_SOURCE: &str = "admin";

/// Pool counters fed by the driver's connection monitoring events.
#[derive(Debug, Default)]
pub struct PoolEvents {
    open: AtomicU64,
    in_use: AtomicU64,
    checked_out: AtomicU64,
    created: AtomicU64,
    timeouts: AtomicU64,
    checkout_waits: AtomicU64,
    idle_closed: AtomicU64,
    stale_closed: AtomicU64,
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
}

impl PoolEvents {
    pub fn observe(&self, event: &CmapEvent) {
        match event {
            CmapEvent::ConnectionCreated(_) => {
                self.open.fetch_add(1, Ordering::Relaxed);
                self.created.fetch_add(1, Ordering::Relaxed);
            }
            CmapEvent::ConnectionClosed(closed) => {
                decrement(&self.open);
                match closed.reason {
                    ConnectionClosedReason::Idle => {
                        self.idle_closed.fetch_add(1, Ordering::Relaxed);
                    }
                    ConnectionClosedReason::Stale => {
                        self.stale_closed.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
            CmapEvent::ConnectionCheckoutStarted(_) => {
                if self.in_use.load(Ordering::Relaxed) >= self.open.load(Ordering::Relaxed) {
                    self.checkout_waits.fetch_add(1, Ordering::Relaxed);
                }
            }
            CmapEvent::ConnectionCheckedOut(_) => {
                self.in_use.fetch_add(1, Ordering::Relaxed);
                self.checked_out.fetch_add(1, Ordering::Relaxed);
            }
            CmapEvent::ConnectionCheckedIn(_) => decrement(&self.in_use),
            CmapEvent::ConnectionCheckoutFailed(failed) => {
                if matches!(failed.reason, ConnectionCheckoutFailedReason::Timeout) {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {}
        }
    }

    pub fn stats(&self) -> PoolStats {
        let open = self.open.load(Ordering::Relaxed);
        let in_use = self.in_use.load(Ordering::Relaxed).min(open);
        let created = self.created.load(Ordering::Relaxed);
        PoolStats {
            open,
            idle: open - in_use,
            in_use,
            wait_count: self.checkout_waits.load(Ordering::Relaxed),
            max_idle_closed: self.idle_closed.load(Ordering::Relaxed),
            max_lifetime_closed: self.stale_closed.load(Ordering::Relaxed),
            hits: self.checked_out.load(Ordering::Relaxed).saturating_sub(created),
            misses: created,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            ..PoolStats::default()
        }
    }
}

#[derive(Debug)]
pub struct MongoConnection {
    target: Arc<Target>,
    client: Client,
    database: String,
    events: Arc<PoolEvents>,
    closed: AtomicBool,
}

/// Seed-list URI without credentials; those go into [`Credential`].
pub fn client_uri(target: &Target) -> String {
    let hosts = target
        .endpoints
        .iter()
        .chain(&target.replicas)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let mut params = Vec::new();
    if !target.replica_set.is_empty() {
        params.push(format!("replicaSet={}", target.replica_set));
    }
    if target.tls {
        params.push("tls=true".to_string());
    }
    if !target.client_name.is_empty() {
        params.push(format!("appName={}", target.client_name));
    }
    if params.is_empty() {
        format!("mongodb://{hosts}/")
    } else {
        format!("mongodb://{hosts}/?{}", params.join("&"))
    }
}

fn credential(target: &Target) -> Option<Credential> {
    if target.username.is_empty() {
        return None;
    }
    let mut credential = Credential::default();
    credential.username = Some(target.username.clone());
    credential.password = Some(target.password.expose().to_string());
    credential.source = Some(AUTH_SOURCE.to_string());
    Some(credential)
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

pub(crate) fn driver_error(err: &MongoError) -> DriverError {
    match err.kind.as_ref() {
        ErrorKind::Authentication { message, .. } => DriverError::Auth(message.clone()),
        ErrorKind::Io(e) => DriverError::Io(std::io::Error::new(e.kind(), e.to_string())),
        _ => DriverError::Other(err.to_string()),
    }
}

pub(crate) fn operation_error(err: &MongoError) -> OperationError {
    match err.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. } | ErrorKind::ServerSelection { .. } => {
            OperationError::Transport(err.to_string())
        }
        _ => OperationError::Backend(err.to_string()),
    }
}

/// JSON object (extended JSON accepted) into a document.
pub fn to_document(value: &Value, what: &str) -> Result<Document, OperationError> {
    match value {
        Value::Null => Ok(Document::new()),
        Value::Object(_) => match Bson::try_from(value.clone()) {
            Ok(Bson::Document(document)) => Ok(document),
            Ok(_) => Err(OperationError::Backend(format!("{what} must be an object"))),
            Err(e) => Err(OperationError::Backend(format!("invalid {what}: {e}"))),
        },
        _ => Err(OperationError::Backend(format!("{what} must be an object"))),
    }
}

fn to_documents(value: &Value, what: &str) -> Result<Vec<Document>, OperationError> {
    match value {
        Value::Array(items) => items.iter().map(|item| to_document(item, what)).collect(),
        _ => Err(OperationError::Backend(format!("{what} must be an array of objects"))),
    }
}

fn update(value: &Value) -> Result<UpdateModifications, OperationError> {
    match value {
        Value::Array(_) => Ok(to_documents(value, "update pipeline")?.into()),
        _ => Ok(to_document(value, "update")?.into()),
    }
}

/// Relaxed extended JSON for a reply document.
pub fn from_document(document: Document) -> Value {
    Bson::Document(document).into_relaxed_extjson()
}

fn find_options(value: &Value) -> FindOptions {
    let mut options = FindOptions::default();
    options.limit = value.get("limit").and_then(Value::as_i64);
    options.skip = value.get("skip").and_then(Value::as_u64);
    options.sort = value.get("sort").and_then(|v| to_document(v, "sort").ok());
    options.projection = value.get("projection").and_then(|v| to_document(v, "projection").ok());
    options
}

impl MongoConnection {
    pub async fn open(target: &Target) -> Result<Self, DriverError> {
        let mut options = ClientOptions::parse(client_uri(target))
            .await
            .map_err(|e| driver_error(&e))?;
        options.credential = credential(target);
        options.max_pool_size = Some(target.pool.max_open);
        options.min_pool_size = Some(target.pool.min_idle);
        options.max_idle_time = non_zero(target.pool.idle_timeout);
        options.connect_timeout = Some(target.timeouts.dial);
        options.server_selection_timeout = Some(target.timeouts.connect);

        let events = Arc::new(PoolEvents::default());
        let sink = events.clone();
        options.cmap_event_handler = Some(EventHandler::callback(move |event: CmapEvent| sink.observe(&event)));

        let client = Client::with_options(options).map_err(|e| driver_error(&e))?;
        Ok(Self {
            database: if target.database.is_empty() {
                "test".to_string()
            } else {
                target.database.clone()
            },
            target: Arc::new(target.clone()),
            client,
            events,
            closed: AtomicBool::new(false),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn collection(&self, op: &Operation) -> Result<Collection<Document>, OperationError> {
        let name = args::string(op, 0, "collection name")?;
        Ok(self.client.database(&self.database).collection::<Document>(name))
    }

    async fn run(&self, command: &str, op: &Operation) -> Result<Reply, MongoOutcome> {
        match command {
            "ping" => {
                self.client.database(AUTH_SOURCE).run_command(doc! {"ping": 1}).await?;
                Ok(Reply::String("PONG".into()))
            }
            "run_command" | "command" => {
                let command = to_document(args::value(op, 0), "command")?;
                let reply = self.client.database(&self.database).run_command(command).await?;
                Ok(from_document(reply))
            }
            "find" => {
                let filter = to_document(args::value(op, 1), "filter")?;
                let cursor = self
                    .collection(op)?
                    .find(filter)
                    .with_options(find_options(args::value(op, 2)))
                    .await?;
                let documents: Vec<Document> = cursor.try_collect().await?;
                Ok(Value::Array(documents.into_iter().map(from_document).collect()))
            }
            "find_one" => {
                let filter = to_document(args::value(op, 1), "filter")?;
                match self.collection(op)?.find_one(filter).await? {
                    Some(document) => Ok(from_document(document)),
                    None => Err(OperationError::NotFound.into()),
                }
            }
            "find_one_and_update" | "find_one_and_replace" | "find_one_and_delete" => {
                let collection = self.collection(op)?;
                let filter = to_document(args::value(op, 1), "filter")?;
                let found = match command {
                    "find_one_and_update" => {
                        collection.find_one_and_update(filter, update(args::value(op, 2))?).await?
                    }
                    "find_one_and_replace" => {
                        let replacement = to_document(args::value(op, 2), "replacement")?;
                        collection.find_one_and_replace(filter, replacement).await?
                    }
                    _ => collection.find_one_and_delete(filter).await?,
                };
                found
                    .map(from_document)
                    .ok_or(MongoOutcome::Operation(OperationError::NotFound))
            }
            "insert_one" => {
                let document = to_document(args::value(op, 1), "document")?;
                let result = self.collection(op)?.insert_one(document).await?;
                Ok(json!({"inserted_id": result.inserted_id.into_relaxed_extjson()}))
            }
            "insert_many" => {
                let documents = to_documents(args::value(op, 1), "documents")?;
                let result = self.collection(op)?.insert_many(documents).await?;
                let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
                ids.sort_by_key(|(index, _)| *index);
                let ids: Vec<Value> = ids.into_iter().map(|(_, id)| id.into_relaxed_extjson()).collect();
                Ok(json!({"inserted_ids": ids}))
            }
            "update_one" | "update_many" | "replace_one" => {
                let collection = self.collection(op)?;
                let filter = to_document(args::value(op, 1), "filter")?;
                let result = match command {
                    "update_one" => collection.update_one(filter, update(args::value(op, 2))?).await?,
                    "update_many" => collection.update_many(filter, update(args::value(op, 2))?).await?,
                    _ => {
                        let replacement = to_document(args::value(op, 2), "replacement")?;
                        collection.replace_one(filter, replacement).await?
                    }
                };
                Ok(json!({
                    "matched_count": result.matched_count,
                    "modified_count": result.modified_count,
                    "upserted_id": result.upserted_id.map(Bson::into_relaxed_extjson),
                }))
            }
            "delete_one" | "delete_many" => {
                let collection = self.collection(op)?;
                let filter = to_document(args::value(op, 1), "filter")?;
                let result = if command == "delete_one" {
                    collection.delete_one(filter).await?
                } else {
                    collection.delete_many(filter).await?
                };
                Ok(json!({"deleted_count": result.deleted_count}))
            }
            "count_documents" | "count" => {
                let filter = to_document(args::value(op, 1), "filter")?;
                Ok(Value::from(self.collection(op)?.count_documents(filter).await?))
            }
            "estimated_document_count" => {
                Ok(Value::from(self.collection(op)?.estimated_document_count().await?))
            }
            "distinct" => {
                let field = args::string(op, 1, "field name")?;
                let filter = to_document(args::value(op, 2), "filter")?;
                let values = self.collection(op)?.distinct(field, filter).await?;
                Ok(Value::Array(values.into_iter().map(Bson::into_relaxed_extjson).collect()))
            }
            "aggregate" => {
                let pipeline = to_documents(args::value(op, 1), "pipeline")?;
                let cursor = self.collection(op)?.aggregate(pipeline).await?;
                let documents: Vec<Document> = cursor.try_collect().await?;
                Ok(Value::Array(documents.into_iter().map(from_document).collect()))
            }
            "drop" => {
                self.collection(op)?.drop().await?;
                Ok(Reply::String("OK".into()))
            }
            _ => Err(OperationError::Unsupported(format!("{} on mongo", op.name)).into()),
        }
    }
}

/// Either a client error or an argument error raised before the call.
enum MongoOutcome {
    Client(MongoError),
    Operation(OperationError),
}

impl From<MongoError> for MongoOutcome {
    fn from(err: MongoError) -> Self {
        MongoOutcome::Client(err)
    }
}

impl From<OperationError> for MongoOutcome {
    fn from(err: OperationError) -> Self {
        MongoOutcome::Operation(err)
    }
}

#[async_trait]
impl Connection for MongoConnection {
    async fn execute(&self, _cancel: CancellationToken, op: Operation) -> Result<Reply, OperationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed.into());
        }
        let command = args::command(&op);
        self.run(&command, &op).await.map_err(|outcome| match outcome {
            MongoOutcome::Client(err) => operation_error(&err),
            MongoOutcome::Operation(err) => err,
        })
    }

    /// Server round-trip: `{ping: 1}` against the admin database.
    async fn ping(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        self.client
            .database(AUTH_SOURCE)
            .run_command(doc! {"ping": 1})
            .await
            .map_err(|e| driver_error(&e))?;
        debug!(name = %self.target.name, "mongo ping ok");
        Ok(())
    }

    fn pool_stats(&self) -> Result<PoolStats, StatSampleError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StatSampleError::Closed);
        }
        Ok(self.events.stats())
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DriverError::Closed);
        }
        self.client.clone().shutdown().immediate(true).await;
        debug!(name = %self.target.name, "mongo client shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylon_core::{BackendKind, Options};

    fn target(options: Options) -> Target {
        let options = options.with_defaults(BackendKind::Mongo);
        Target::from_options(BackendKind::Mongo, "default", &options).unwrap()
    }

    #[test]
    fn uri_lists_primary_and_replicas_without_credentials() {
        let mut options = Options::new()
            .with_address("m1:27018")
            .with_replicas(["m2"])
            .with_credentials("root", "hunter2");
        options.replica_set = "rs0".into();
        options.client_name = "billing".into();
        let target = target(options);
        assert_eq!(
            client_uri(&target),
            "mongodb://m1:27018,m2:27017/?replicaSet=rs0&appName=billing"
        );
        let credential = credential(&target).unwrap();
        assert_eq!(credential.username.as_deref(), Some("root"));
        assert_eq!(credential.source.as_deref(), Some("admin"));
    }

    #[test]
    fn anonymous_targets_have_no_credential() {
        let target = target(Options::new().with_address("m1"));
        assert!(credential(&target).is_none());
        assert_eq!(client_uri(&target), "mongodb://m1:27017/");
    }

    #[test]
    fn documents_convert_both_ways() {
        let document = to_document(&json!({"name": "ada", "age": 36, "tags": ["x"]}), "document").unwrap();
        assert_eq!(document.get_str("name").unwrap(), "ada");
        assert_eq!(from_document(document), json!({"name": "ada", "age": 36, "tags": ["x"]}));

        assert_eq!(to_document(&Value::Null, "filter").unwrap(), Document::new());
        assert!(matches!(to_document(&json!([1]), "filter"), Err(OperationError::Backend(_))));
        assert!(to_documents(&json!([{"$match": {}}]), "pipeline").is_ok());
        assert!(to_documents(&json!({"$match": {}}), "pipeline").is_err());
    }

    #[test]
    fn find_options_are_read_from_json() {
        let options = find_options(&json!({"limit": 5, "skip": 10, "sort": {"age": -1}}));
        assert_eq!(options.limit, Some(5));
        assert_eq!(options.skip, Some(10));
        assert_eq!(options.sort, Some(doc! {"age": -1}));
        assert!(options.projection.is_none());
    }

    #[test]
    fn pool_events_track_checkouts() {
        let events = PoolEvents::default();
        events.open.store(2, Ordering::Relaxed);
        events.created.store(2, Ordering::Relaxed);
        events.in_use.store(1, Ordering::Relaxed);
        events.checked_out.store(5, Ordering::Relaxed);
        let stats = events.stats();
        assert_eq!(stats.open, 2);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 3);
    }
}
