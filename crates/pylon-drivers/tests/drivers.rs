//! End-to-end tests against in-process fake servers.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pylon_core::{
    BackendKind, Component, Error, InitOptions, JsonSource, MetricsRecorder, Operation,
    OperationError, Outcome, StatsPoller,
};
use pylon_drivers::ClientDriver;
use serde_json::json;
use tokio_util::sync::CancellationToken;

// ── Fake servers ─────────────────────────────────────────────────────

fn spawn_server<F>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
    let addr = listener.local_addr().expect("local addr");
    let handler = Arc::new(handler);
    std::thread::spawn(move || {
        while let Ok((stream, _)) = listener.accept() {
            let handler = handler.clone();
            std::thread::spawn(move || handler(stream));
        }
    });
    addr
}

/// Accepts connections and never writes a byte.
fn silent_server() -> SocketAddr {
    spawn_server(|mut stream| {
        let mut sink = [0u8; 256];
        while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
    })
}

fn read_command(reader: &mut impl BufRead) -> Option<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut buf = vec![0u8; len + 2];
        reader.read_exact(&mut buf).ok()?;
        buf.truncate(len);
        parts.push(String::from_utf8(buf).ok()?);
    }
    Some(parts)
}

fn bulk(value: &str) -> String {
    format!("${}\r\n{value}\r\n", value.len())
}

/// Minimal redis: AUTH, PING, SELECT, CLIENT, UNWATCH, SET, GET, DEL.
fn fake_redis(password: &'static str) -> SocketAddr {
    let store: Arc<Mutex<HashMap<String, String>>> = Arc::default();
    spawn_server(move |stream| {
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let mut writer = stream;
        let mut authed = password.is_empty();
        while let Some(cmd) = read_command(&mut reader) {
            let name = cmd[0].to_ascii_uppercase();
            let reply = match name.as_str() {
                "AUTH" if cmd.last().map(String::as_str) == Some(password) => {
                    authed = true;
                    "+OK\r\n".to_string()
                }
                "AUTH" => "-WRONGPASS invalid username-password pair\r\n".to_string(),
                "CLIENT" => "+OK\r\n".to_string(),
                _ if !authed => "-NOAUTH Authentication required.\r\n".to_string(),
                "PING" => match cmd.get(1) {
                    Some(echo) => bulk(echo),
                    None => "+PONG\r\n".to_string(),
                },
                "SELECT" | "UNWATCH" => "+OK\r\n".to_string(),
                "SET" => {
                    store.lock().insert(cmd[1].clone(), cmd[2].clone());
                    "+OK\r\n".to_string()
                }
                "GET" => match store.lock().get(&cmd[1]) {
                    Some(v) => bulk(v),
                    None => "$-1\r\n".to_string(),
                },
                "DEL" => {
                    let removed = cmd[1..].iter().filter(|k| store.lock().remove(*k).is_some()).count();
                    format!(":{removed}\r\n")
                }
                other => format!("-ERR unknown command '{other}'\r\n"),
            };
            if writer.write_all(reply.as_bytes()).is_err() {
                break;
            }
        }
    })
}

#[derive(Default)]
struct NsqdState {
    published: Vec<(String, String)>,
    subscribed: Vec<(String, String)>,
    finished: Vec<String>,
    queued: Vec<Vec<u8>>,
}

fn nsq_frame(frame_type: u32, data: &[u8]) -> Vec<u8> {
    let mut frame = ((data.len() + 4) as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&frame_type.to_be_bytes());
    frame.extend_from_slice(data);
    frame
}

fn nsq_message(id: &[u8; 16], body: &[u8]) -> Vec<u8> {
    let mut data = 1_700_000_000_000_000_000i64.to_be_bytes().to_vec();
    data.extend_from_slice(&1u16.to_be_bytes());
    data.extend_from_slice(id);
    data.extend_from_slice(body);
    nsq_frame(2, &data)
}

fn read_sized(reader: &mut impl Read) -> Option<Vec<u8>> {
    let mut size = [0u8; 4];
    reader.read_exact(&mut size).ok()?;
    let mut body = vec![0u8; u32::from_be_bytes(size) as usize];
    reader.read_exact(&mut body).ok()?;
    Some(body)
}

/// nsqd speaking enough V2 for IDENTIFY, PUB, SUB, RDY, FIN, NOP and CLS.
/// `RDY` hands out every queued message.
fn fake_nsqd(state: Arc<Mutex<NsqdState>>) -> SocketAddr {
    spawn_server(move |stream| {
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let mut writer = stream;
        let mut magic = [0u8; 4];
        if reader.read_exact(&mut magic).is_err() || &magic != b"  V2" {
            return;
        }
        let ok = nsq_frame(0, b"OK");
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            let reply = match parts.as_slice() {
                ["IDENTIFY"] => match read_sized(&mut reader) {
                    Some(_) => ok.clone(),
                    None => break,
                },
                ["PUB", topic] => match read_sized(&mut reader) {
                    Some(body) => {
                        state
                            .lock()
                            .published
                            .push((topic.to_string(), String::from_utf8_lossy(&body).into_owned()));
                        ok.clone()
                    }
                    None => break,
                },
                ["SUB", topic, channel] => {
                    state.lock().subscribed.push((topic.to_string(), channel.to_string()));
                    ok.clone()
                }
                ["RDY", _] => std::mem::take(&mut state.lock().queued).concat(),
                ["FIN", id] => {
                    state.lock().finished.push(id.to_string());
                    Vec::new()
                }
                ["NOP"] => Vec::new(),
                ["CLS"] => nsq_frame(0, b"CLOSE_WAIT"),
                _ => nsq_frame(1, b"E_INVALID"),
            };
            if !reply.is_empty() && writer.write_all(&reply).is_err() {
                break;
            }
        }
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn component(kind: BackendKind, config: serde_json::Value, recorder: &Arc<MetricsRecorder>) -> Component {
    init_tracing();
    Component::builder(kind, Arc::new(ClientDriver::new()))
        .source(JsonSource::new(config))
        .metrics(recorder.clone())
        .build()
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn redis_commands_round_trip_through_the_chain() {
    let addr = fake_redis("hunter2");
    let recorder = Arc::new(MetricsRecorder::new());
    let redis = component(
        BackendKind::Redis,
        json!({"redis": {"default": {
            "address": addr.to_string(),
            "password": "hunter2",
            "database": "1",
            "pool_size": 2,
        }}}),
        &recorder,
    );
    let token = CancellationToken::new();
    redis.init(InitOptions::new()).await.unwrap();
    redis.start(token.clone()).await.unwrap();

    let instance = redis.instance(None).unwrap();
    let set = instance
        .call(token.clone(), Operation::new("SET").arg("user:1").arg("ada"))
        .await;
    assert_eq!(set, Ok(json!("OK")));

    let get = instance
        .call(token.clone(), Operation::new("GET").arg("user:1").read_only())
        .await;
    assert_eq!(get, Ok(json!("ada")));

    let missing = instance
        .call(token.clone(), Operation::new("GET").arg("user:2"))
        .await;
    assert_eq!(missing, Err(OperationError::NotFound));

    let unknown = instance.call(token.clone(), Operation::new("FLY")).await;
    assert!(matches!(unknown, Err(OperationError::Backend(_))));

    assert_eq!(recorder.request_count("default", "GET", Outcome::Ok), 2);
    assert_eq!(recorder.request_count("default", "FLY", Outcome::Error), 1);

    StatsPoller::new(redis.registry().clone(), recorder.clone(), Duration::from_secs(30)).sample_once();
    assert!(recorder.gauge("default", "open").unwrap_or_default() >= 1.0);
    assert!(recorder.gauge("default", "hits").unwrap_or_default() >= 1.0);

    redis.stop(token).await.unwrap();
    assert!(redis.instance(None).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_password_fails_init() {
    let addr = fake_redis("hunter2");
    let redis = component(
        BackendKind::Redis,
        json!({"redis": {"default": {
            "address": addr.to_string(),
            "password": "guess",
            "pool_size": 1,
        }}}),
        &Arc::new(MetricsRecorder::new()),
    );

    let err = redis.init(InitOptions::new()).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err}");
    assert!(redis.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_server_fails_init() {
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let redis = component(
        BackendKind::Redis,
        json!({"redis": {"default": {
            "address": addr.to_string(),
            "pool_size": 1,
            "max_retries": 1,
            "dial_timeout": "200ms",
        }}}),
        &Arc::new(MetricsRecorder::new()),
    );

    let err = redis.init(InitOptions::new()).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn mysql_that_never_greets_fails_init() {
    let addr = silent_server();
    let mysql = component(
        BackendKind::Mysql,
        json!({"mysql": {"default": {
            "address": addr.to_string(),
            "pool_size": 2,
            "connect_timeout": "2s",
        }}}),
        &Arc::new(MetricsRecorder::new()),
    );

    let err = mysql.init(InitOptions::new()).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err}");
    assert!(mysql.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn mongo_that_never_answers_hello_fails_init() {
    let addr = silent_server();
    let mongo = component(
        BackendKind::Mongo,
        json!({"mongo": {"default": {
            "address": addr.to_string(),
            "database": "app",
            "connect_timeout": "2s",
        }}}),
        &Arc::new(MetricsRecorder::new()),
    );

    let err = mongo.init(InitOptions::new()).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err}");
    assert!(mongo.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn nsq_publishes_to_the_configured_topic() {
    let state = Arc::new(Mutex::new(NsqdState::default()));
    let addr = fake_nsqd(state.clone());
    let recorder = Arc::new(MetricsRecorder::new());
    let nsq = component(
        BackendKind::Nsq,
        json!({"nsq": {"default": {"address": addr.to_string(), "topic": "orders"}}}),
        &recorder,
    );
    let token = CancellationToken::new();
    nsq.init(InitOptions::new()).await.unwrap();

    let instance = nsq.instance(None).unwrap();
    let out = instance
        .call(token.clone(), Operation::new("PUB").arg(json!({"id": 7})))
        .await;
    assert_eq!(out, Ok(json!("OK")));
    let out = instance
        .call(token.clone(), Operation::new("PUB").arg("audit").arg("login"))
        .await;
    assert_eq!(out, Ok(json!("OK")));
    assert_eq!(
        state.lock().published,
        vec![
            ("orders".to_string(), r#"{"id":7}"#.to_string()),
            ("audit".to_string(), "login".to_string()),
        ]
    );
    assert_eq!(recorder.request_count("default", "PUB", Outcome::Ok), 2);

    let recv = instance.call(token.clone(), Operation::new("RECV")).await;
    assert!(matches!(recv, Err(OperationError::Unsupported(_))));

    nsq.stop(token).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn nsq_consumer_receives_and_finishes() {
    let state = Arc::new(Mutex::new(NsqdState::default()));
    state
        .lock()
        .queued
        .push(nsq_message(b"0123456789abcdef", br#"{"order":42}"#));
    let addr = fake_nsqd(state.clone());
    let nsq = component(
        BackendKind::Nsq,
        json!({"nsq": {"default": {
            "address": addr.to_string(),
            "topic": "orders",
            "consumer": {"channel": "billing", "max_in_flight": 4},
        }}}),
        &Arc::new(MetricsRecorder::new()),
    );
    let token = CancellationToken::new();
    nsq.init(InitOptions::new()).await.unwrap();
    assert_eq!(
        state.lock().subscribed,
        vec![("orders".to_string(), "billing".to_string())]
    );

    let instance = nsq.instance(None).unwrap();
    let message = instance.call(token.clone(), Operation::new("RECV")).await.unwrap();
    assert_eq!(message["id"], json!("0123456789abcdef"));
    assert_eq!(message["body"], json!(r#"{"order":42}"#));
    assert_eq!(message["attempts"], json!(1));

    let fin = instance
        .call(token.clone(), Operation::new("FIN").arg("0123456789abcdef"))
        .await;
    assert_eq!(fin, Ok(json!("OK")));
    let again = instance
        .call(token.clone(), Operation::new("FIN").arg("0123456789abcdef"))
        .await;
    assert_eq!(again, Err(OperationError::NotFound));

    for _ in 0..50 {
        if !state.lock().finished.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.lock().finished, vec!["0123456789abcdef".to_string()]);

    nsq.stop(token).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn nsq_consumer_without_a_channel_is_rejected() {
    let state = Arc::new(Mutex::new(NsqdState::default()));
    let addr = fake_nsqd(state.clone());
    let nsq = component(
        BackendKind::Nsq,
        json!({"nsq": {"default": {
            "address": addr.to_string(),
            "topic": "orders",
            "consumer": {"lookupd": "127.0.0.1:4161"},
        }}}),
        &Arc::new(MetricsRecorder::new()),
    );

    let err = nsq.init(InitOptions::new()).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err}");
    assert!(state.lock().subscribed.is_empty());
}
