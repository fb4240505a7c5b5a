use std::sync::Arc;
use std::time::Duration;

use pylon_core::mock::MockDriver;
use pylon_core::{
    BackendKind, Component, Error, InitOptions, Instance, JsonSource, LoaderGroup,
    MetricsRecorder, Operation, OperationError, Options, Outcome, Phase, Reply, TomlSource,
};
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
[redis.default]
address = "cache-1:6379"

[redis.replica]
address = "cache-2:6379"
disable_metric = true

[mysql.default]
address = "db:3306"
database = "orders"
"#;

fn redis(driver: &Arc<MockDriver>, recorder: &Arc<MetricsRecorder>) -> Component {
    Component::builder(BackendKind::Redis, driver.clone())
        .source(TomlSource::parse(CONFIG).unwrap())
        .metrics(recorder.clone())
        .build()
}

#[tokio::test]
async fn every_configured_name_resolves_to_a_stable_instance() {
    let driver = Arc::new(MockDriver::new());
    let component = redis(&driver, &Arc::new(MetricsRecorder::new()));
    component.init(InitOptions::new()).await.unwrap();

    for name in ["default", "replica"] {
        let a = component.instance(Some(name)).unwrap();
        let b = component.instance(Some(name)).unwrap();
        assert!(Instance::same(&a, &b));
        assert_eq!(a.name(), name);
    }
    let none = component.instance(None).unwrap();
    let default = component.instance(Some("default")).unwrap();
    assert!(Instance::same(&none, &default));
    assert_eq!(driver.open_count(), 2);
}

#[tokio::test]
async fn unknown_name_is_an_error() {
    let driver = Arc::new(MockDriver::new());
    let component = redis(&driver, &Arc::new(MetricsRecorder::new()));
    component.init(InitOptions::new()).await.unwrap();

    let err = component.instance(Some("sessions")).unwrap_err();
    assert_eq!(err.to_string(), "redis: instance not found, name: sessions");
}

#[tokio::test]
async fn empty_configuration_is_a_no_op() {
    let driver = Arc::new(MockDriver::new());
    let component = Component::builder(BackendKind::Nsq, driver.clone())
        .source(TomlSource::parse(CONFIG).unwrap())
        .build();
    let token = CancellationToken::new();

    component.init(InitOptions::new()).await.unwrap();
    component.start(token.clone()).await.unwrap();
    component.stop(token).await.unwrap();

    assert_eq!(driver.open_count(), 0);
    assert!(component.instance(None).is_err());
}

#[tokio::test]
async fn init_twice_keeps_the_first_instances() {
    let driver = Arc::new(MockDriver::new());
    let component = redis(&driver, &Arc::new(MetricsRecorder::new()));
    component.init(InitOptions::new()).await.unwrap();
    let first = component.instance(None).unwrap();

    component.init(InitOptions::new()).await.unwrap();
    assert!(Instance::same(&first, &component.instance(None).unwrap()));
    assert_eq!(driver.open_count(), 2);
}

#[tokio::test]
async fn failing_backend_aborts_init_and_closes_built_instances() {
    let driver = Arc::new(MockDriver::new());
    driver.fail_ping("replica");
    let component = redis(&driver, &Arc::new(MetricsRecorder::new()));

    let err = component.init(InitOptions::new()).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(component.phase().await, Phase::Uninitialized);
    assert!(component.registry().is_empty());
    for conn in driver.connections() {
        assert!(conn.is_closed(), "{} left open", conn.name());
    }

    // A later init with the fault cleared rebuilds from scratch.
    let driver = Arc::new(MockDriver::new());
    let component = redis(&driver, &Arc::new(MetricsRecorder::new()));
    component.init(InitOptions::new()).await.unwrap();
    assert_eq!(component.registry().len(), 2);
}

#[tokio::test]
async fn only_instances_with_metrics_enabled_produce_samples() {
    let driver = Arc::new(MockDriver::new());
    let recorder = Arc::new(MetricsRecorder::new());
    let component = redis(&driver, &recorder);
    component.init(InitOptions::new()).await.unwrap();

    let token = CancellationToken::new();
    for name in ["default", "replica"] {
        component
            .instance(Some(name))
            .unwrap()
            .call(token.clone(), Operation::new("GET").arg("user:1"))
            .await
            .unwrap();
    }
    pylon_core::StatsPoller::new(
        component.registry().clone(),
        recorder.clone(),
        Duration::from_secs(30),
    )
    .sample_once();

    assert_eq!(recorder.request_count("default", "GET", Outcome::Ok), 1);
    assert!(recorder.gauge("default", "open").is_some());
    assert!(!recorder.has_samples_for("replica"));
    assert!(recorder.render_prometheus().contains("name=\"default\""));
    assert!(!recorder.render_prometheus().contains("name=\"replica\""));
}

#[tokio::test]
async fn not_found_is_passed_through_and_counted_as_ok() {
    let driver = Arc::new(MockDriver::new());
    driver.reply("GET", Err(OperationError::NotFound));
    let recorder = Arc::new(MetricsRecorder::new());
    let component = redis(&driver, &recorder);
    component.init(InitOptions::new()).await.unwrap();

    let out = component
        .instance(None)
        .unwrap()
        .call(CancellationToken::new(), Operation::new("GET").arg("missing"))
        .await;
    assert_eq!(out, Err(OperationError::NotFound));
    assert_eq!(recorder.request_count("default", "GET", Outcome::Ok), 1);
    assert_eq!(recorder.request_count("default", "GET", Outcome::Error), 0);
}

#[tokio::test]
async fn arguments_and_results_reach_the_driver_unchanged() {
    let driver = Arc::new(MockDriver::new());
    driver.reply("HGET", Ok(Reply::String("42".into())));
    let component = redis(&driver, &Arc::new(MetricsRecorder::new()));
    component.init(InitOptions::new()).await.unwrap();

    let op = Operation::new("HGET").arg("user:1").arg("age").read_only();
    let out = component
        .instance(None)
        .unwrap()
        .call(CancellationToken::new(), op.clone())
        .await;
    assert_eq!(out, Ok(Reply::String("42".into())));
    assert_eq!(driver.connection("default").unwrap().executed(), vec![op]);
}

#[tokio::test]
async fn stop_closes_everything_even_when_a_close_fails() {
    let driver = Arc::new(MockDriver::new());
    driver.fail_close("default");
    let component = redis(&driver, &Arc::new(MetricsRecorder::new()));
    let token = CancellationToken::new();

    component.init(InitOptions::new()).await.unwrap();
    component.start(token.clone()).await.unwrap();
    component.stop(token.clone()).await.unwrap();

    assert!(driver.connections().iter().all(|c| c.is_closed()));
    assert!(component.registry().is_empty());
    assert!(component.instance(None).is_err());

    // Stop twice is a no-op.
    component.stop(token).await.unwrap();
    assert_eq!(component.phase().await, Phase::Stopped);
}

#[tokio::test]
async fn init_after_stop_rebuilds() {
    let driver = Arc::new(MockDriver::new());
    let component = redis(&driver, &Arc::new(MetricsRecorder::new()));
    let token = CancellationToken::new();

    component.init(InitOptions::new()).await.unwrap();
    let before = component.instance(None).unwrap();
    component.stop(token).await.unwrap();

    component.init(InitOptions::new()).await.unwrap();
    let after = component.instance(None).unwrap();
    assert!(!Instance::same(&before, &after));
    assert_eq!(driver.open_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn poller_stops_sampling_after_stop() {
    let driver = Arc::new(MockDriver::new());
    let recorder = Arc::new(MetricsRecorder::new());
    let component = Component::builder(BackendKind::Redis, driver.clone())
        .source(TomlSource::parse(CONFIG).unwrap())
        .metrics(recorder.clone())
        .stats_interval(Duration::from_secs(5))
        .build();
    let token = CancellationToken::new();

    component.init(InitOptions::new()).await.unwrap();
    component.start(token.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(recorder.gauge("default", "open").is_some());

    component.stop(token).await.unwrap();
    recorder.clear();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!recorder.has_samples_for("default"));
}

#[tokio::test]
async fn parent_cancellation_stops_the_poller() {
    let driver = Arc::new(MockDriver::new());
    let component = redis(&driver, &Arc::new(MetricsRecorder::new()));
    let parent = CancellationToken::new();

    component.init(InitOptions::new()).await.unwrap();
    component.start(parent.clone()).await.unwrap();
    parent.cancel();

    // The poller already exited; stop still completes and closes everything.
    tokio::time::timeout(Duration::from_secs(1), component.stop(CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();
    assert!(driver.connections().iter().all(|c| c.is_closed()));
}

#[tokio::test]
async fn loader_group_drives_several_components() {
    let driver = Arc::new(MockDriver::new());
    let source = Arc::new(JsonSource::new(serde_json::json!({
        "mysql": {"default": {"address": "db:3306"}},
        "redis": {"default": {"address": "cache:6379"}},
    })));
    let mysql = Arc::new(
        Component::builder(BackendKind::Mysql, driver.clone())
            .source_arc(source.clone())
            .build(),
    );
    let redis = Arc::new(
        Component::builder(BackendKind::Redis, driver.clone())
            .source_arc(source)
            .build(),
    );
    let group = LoaderGroup::new().add(mysql.clone()).add(redis.clone());
    let token = CancellationToken::new();

    group.init(InitOptions::new()).await.unwrap();
    group.start(token.clone()).await.unwrap();
    assert!(mysql.is_open() && redis.is_open());
    assert_eq!(mysql.instance(None).unwrap().options().pool_size, 256);
    assert_eq!(redis.instance(None).unwrap().options().pool_size, 10);

    group.stop(token).await.unwrap();
    assert!(!mysql.is_open() && !redis.is_open());
    assert_eq!(group.names(), vec!["mysql", "redis"]);
}

#[tokio::test]
async fn init_options_layer_over_the_source() {
    let driver = Arc::new(MockDriver::new());
    let component = redis(&driver, &Arc::new(MetricsRecorder::new()));
    component
        .init(InitOptions::new().with_instance("default", Options::new().with_pool_size(3)))
        .await
        .unwrap();

    let options = component.instance(None).unwrap().options().clone();
    assert_eq!(options.pool_size, 3);
    assert_eq!(options.addrs, vec!["cache-1:6379"]);
}
