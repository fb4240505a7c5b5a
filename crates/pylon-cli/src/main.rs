//! pylon: operate on the backends described by a config file.
//!
//! # Usage
//!
//! ```text
//! pylon check --config pylon.toml
//! pylon call  --config pylon.toml --kind redis GET user:1
//! pylon watch --config pylon.toml --interval 10s
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use pylon_core::duration::{format_duration, parse_duration};
use pylon_core::{
    BackendKind, Component, Driver, InitOptions, LoaderGroup, MetricsRecorder, Operation,
    TomlSource,
};
use pylon_drivers::ClientDriver;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pylon", about = "Instrumented backend client manager")]
struct Cli {
    /// Log as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect every configured instance, ping it and disconnect.
    Check {
        #[arg(long, short)]
        config: PathBuf,

        /// Only these backend kinds. Defaults to every section in the file.
        #[arg(long = "kind")]
        kinds: Vec<BackendKind>,
    },

    /// Run one operation and print the reply as JSON.
    Call {
        #[arg(long, short)]
        config: PathBuf,

        #[arg(long)]
        kind: BackendKind,

        /// Instance name.
        #[arg(long, default_value = "default")]
        name: String,

        /// Allow routing to a replica.
        #[arg(long)]
        read_only: bool,

        /// Give up after this long.
        #[arg(long, default_value = "10s", value_parser = parse_interval)]
        timeout: Duration,

        command: String,

        /// Arguments. Valid JSON is sent as JSON, anything else as a string.
        args: Vec<String>,
    },

    /// Keep every instance open and sample pool stats until interrupted,
    /// then print the collected metrics in Prometheus text format.
    Watch {
        #[arg(long, short)]
        config: PathBuf,

        #[arg(long = "kind")]
        kinds: Vec<BackendKind>,

        /// Pool stats sampling interval.
        #[arg(long, default_value = "10s", value_parser = parse_interval)]
        interval: Duration,
    },
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    parse_duration(s)
        .filter(|d| !d.is_zero())
        .ok_or_else(|| format!("invalid duration: {s}"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pylon=debug,pylon_core=debug,pylon_drivers=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Check { config, kinds } => run_check(&config, &kinds).await,
        Command::Call {
            config,
            kind,
            name,
            read_only,
            timeout,
            command,
            args,
        } => {
            let mut op = Operation::new(command).args(args.iter().map(String::as_str).map(parse_arg));
            if read_only {
                op = op.read_only();
            }
            run_call(&config, kind, &name, op, timeout).await
        }
        Command::Watch {
            config,
            kinds,
            interval,
        } => run_watch(&config, &kinds, interval).await,
    }
}

fn parse_arg(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Array(_) | Value::Object(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

// ── Assembly ─────────────────────────────────────────────────────────

struct Stack {
    group: LoaderGroup,
    components: Vec<Arc<Component>>,
    recorder: Arc<MetricsRecorder>,
}

/// One component per requested kind, all reading the same file.
fn assemble(config: &Path, kinds: &[BackendKind], interval: Duration) -> anyhow::Result<Stack> {
    let source = Arc::new(
        TomlSource::from_file(config)
            .with_context(|| format!("loading {}", config.display()))?,
    );

    let kinds: Vec<BackendKind> = if kinds.is_empty() {
        BackendKind::ALL
            .into_iter()
            .filter(|k| source.namespaces().any(|ns| ns == k.namespace()))
            .collect()
    } else {
        kinds.to_vec()
    };
    if kinds.is_empty() {
        bail!("{}: no backend sections found", config.display());
    }

    let driver: Arc<dyn Driver> = Arc::new(ClientDriver::new());
    let recorder = Arc::new(MetricsRecorder::new());
    let mut group = LoaderGroup::new();
    let mut components = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let component = Arc::new(
            Component::builder(kind, driver.clone())
                .source_arc(source.clone())
                .metrics(recorder.clone())
                .stats_interval(interval)
                .build(),
        );
        group.push(component.clone());
        components.push(component);
    }

    Ok(Stack {
        group,
        components,
        recorder,
    })
}

// ── Commands ─────────────────────────────────────────────────────────

async fn run_check(config: &Path, kinds: &[BackendKind]) -> anyhow::Result<()> {
    let stack = assemble(config, kinds, pylon_core::DEFAULT_STATS_INTERVAL)?;
    stack.group.init(InitOptions::new()).await?;

    let mut failed = 0;
    for component in &stack.components {
        for instance in component.registry().snapshot() {
            match instance.ping().await {
                Ok(()) => println!("ok    {:<8} {:<12} {}", instance.kind().namespace(), instance.name(), instance.uri()),
                Err(e) => {
                    failed += 1;
                    println!("FAIL  {:<8} {:<12} {} ({e})", instance.kind().namespace(), instance.name(), instance.uri());
                }
            }
        }
    }

    stack.group.stop(CancellationToken::new()).await?;
    if failed > 0 {
        bail!("{failed} instance(s) failed");
    }
    Ok(())
}

async fn run_call(
    config: &Path,
    kind: BackendKind,
    name: &str,
    op: Operation,
    timeout: Duration,
) -> anyhow::Result<()> {
    let stack = assemble(config, &[kind], pylon_core::DEFAULT_STATS_INTERVAL)?;
    stack.group.init(InitOptions::new()).await?;

    let outcome = call_instance(&stack, name, op, timeout).await;
    stack.group.stop(CancellationToken::new()).await?;

    match outcome? {
        Some(reply) => println!("{}", serde_json::to_string_pretty(&reply)?),
        None => println!("null"),
    }
    Ok(())
}

/// `None` when the backend reported no matching record.
async fn call_instance(
    stack: &Stack,
    name: &str,
    op: Operation,
    timeout: Duration,
) -> anyhow::Result<Option<Value>> {
    let component = stack
        .components
        .first()
        .context("no component configured")?;
    let instance = component.instance(Some(name))?;

    let cancel = CancellationToken::new();
    let deadline = cancel.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        deadline.cancel();
    });
    let result = instance.call(cancel, op).await;
    timer.abort();

    match result {
        Ok(reply) => Ok(Some(reply)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn run_watch(config: &Path, kinds: &[BackendKind], interval: Duration) -> anyhow::Result<()> {
    let stack = assemble(config, kinds, interval)?;
    let shutdown = CancellationToken::new();

    stack.group.init(InitOptions::new()).await?;
    stack.group.start(shutdown.clone()).await?;
    info!(
        loaders = ?stack.group.names(),
        interval = %format_duration(interval),
        "watching; press ctrl-c to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutdown signal received");
    shutdown.cancel();

    let stop = CancellationToken::new();
    let stop_timer = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        stop_timer.cancel();
    });
    stack.group.stop(stop).await?;

    print!("{}", stack.recorder.render_prometheus());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_call_arguments() {
        let cli = Cli::try_parse_from([
            "pylon", "call", "-c", "pylon.toml", "--kind", "redis", "--read-only", "HGET", "user:1",
            "age",
        ])
        .unwrap();
        match cli.command {
            Command::Call {
                kind,
                name,
                read_only,
                command,
                args,
                ..
            } => {
                assert_eq!(kind, BackendKind::Redis);
                assert_eq!(name, "default");
                assert!(read_only);
                assert_eq!(command, "HGET");
                assert_eq!(args, vec!["user:1", "age"]);
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn rejects_zero_interval() {
        assert!(parse_interval("0s").is_err());
        assert_eq!(parse_interval("250ms"), Ok(Duration::from_millis(250)));
    }

    #[test]
    fn json_arguments_keep_their_type() {
        assert_eq!(parse_arg("42"), serde_json::json!(42));
        assert_eq!(parse_arg("[1,2]"), serde_json::json!([1, 2]));
        assert_eq!(parse_arg("user:1"), serde_json::json!("user:1"));
        assert_eq!(parse_arg("\"quoted\""), serde_json::json!("\"quoted\""));
    }

    #[test]
    fn assemble_picks_up_every_section() {
        let dir = std::env::temp_dir().join(format!("pylon-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pylon.toml");
        std::fs::write(
            &path,
            "[redis.default]\naddress = \"cache:6379\"\n\n[mysql.default]\naddress = \"db:3306\"\n",
        )
        .unwrap();

        let stack = assemble(&path, &[], Duration::from_secs(5)).unwrap();
        assert_eq!(stack.group.names(), vec!["mysql", "redis"]);

        let missing = assemble(&dir.join("missing.toml"), &[], Duration::from_secs(5));
        assert!(missing.is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
