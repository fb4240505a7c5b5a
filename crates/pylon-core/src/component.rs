//! Lifecycle manager for one backend kind.
//!
//! ```text
//! Uninitialized ──init──▶ Initialized ──start──▶ Started
//!       ▲                      │                    │
//!       └──────── init ─── Stopped ◀─────stop───────┘
//! ```
//!
//! `init` builds every configured instance sequentially and fails fast,
//! closing whatever it already built. `start` launches the stats poller.
//! `stop` cancels the poller, closes every instance and clears the registry.
//! Out-of-order calls are no-ops.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigSource, EmptySource, decode_section};
use crate::driver::Driver;
use crate::error::{ConfigError, LookupError, Result};
use crate::factory::ConnectionFactory;
use crate::instance::Instance;
use crate::kind::BackendKind;
use crate::lifecycle::Loader;
use crate::metrics::{MetricsSink, NoopSink};
use crate::middleware::Chain;
use crate::options::Options;
use crate::registry::Registry;
use crate::stats::{DEFAULT_STATS_INTERVAL, StatsPoller};

/// Extra configuration supplied at `init` time.
///
/// Layered above the component's own source and below its overrides.
#[derive(Clone, Debug, Default)]
pub struct InitOptions {
    config: Option<Arc<dyn ConfigSource>>,
    instances: BTreeMap<String, Options>,
}

impl InitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this component's namespace from `source` as well.
    pub fn with_config(mut self, source: impl ConfigSource + 'static) -> Self {
        self.config = Some(Arc::new(source));
        self
    }

    pub fn with_config_arc(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config = Some(source);
        self
    }

    /// Configure (or layer over) the instance called `name` directly.
    pub fn with_instance(mut self, name: impl Into<String>, options: Options) -> Self {
        self.instances.insert(name.into(), options);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
}

#[derive(Debug)]
struct PollerTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    poller: Option<PollerTask>,
}

pub struct ComponentBuilder {
    kind: BackendKind,
    driver: Arc<dyn Driver>,
    source: Arc<dyn ConfigSource>,
    base: Options,
    overrides: Options,
    middleware: Chain,
    sink: Arc<dyn MetricsSink>,
    stats_interval: Duration,
}

impl ComponentBuilder {
    /// Configuration read at `init`, under this kind's namespace.
    pub fn source(mut self, source: impl ConfigSource + 'static) -> Self {
        self.source = Arc::new(source);
        self
    }

    pub fn source_arc(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.source = source;
        self
    }

    /// Lowest-precedence layer applied to every instance.
    pub fn defaults(mut self, base: Options) -> Self {
        self.base = base;
        self
    }

    /// Highest-precedence layer applied to every instance.
    pub fn override_with(mut self, overrides: Options) -> Self {
        self.overrides = overrides;
        self
    }

    /// Caller middleware appended inside the standard chain.
    pub fn middleware(mut self, chain: Chain) -> Self {
        self.middleware = chain;
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn build(self) -> Component {
        Component {
            kind: self.kind,
            factory: ConnectionFactory::new(self.kind, self.driver)
                .with_sink(self.sink.clone())
                .with_middleware(self.middleware),
            source: self.source,
            base: self.base,
            overrides: self.overrides,
            sink: self.sink,
            stats_interval: self.stats_interval,
            registry: Arc::new(Registry::new(self.kind)),
            state: Mutex::new(State {
                phase: Phase::Uninitialized,
                poller: None,
            }),
            open: AtomicBool::new(false),
        }
    }
}

/// Owns every named instance of one backend kind.
pub struct Component {
    kind: BackendKind,
    factory: ConnectionFactory,
    source: Arc<dyn ConfigSource>,
    base: Options,
    overrides: Options,
    sink: Arc<dyn MetricsSink>,
    stats_interval: Duration,
    registry: Arc<Registry>,
    state: Mutex<State>,
    open: AtomicBool,
}

impl Component {
    pub fn builder(kind: BackendKind, driver: Arc<dyn Driver>) -> ComponentBuilder {
        ComponentBuilder {
            kind,
            driver,
            source: Arc::new(EmptySource),
            base: Options::default(),
            overrides: Options::default(),
            middleware: Chain::new(),
            sink: Arc::new(NoopSink),
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn namespace(&self) -> &'static str {
        self.kind.namespace()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    /// Look up an instance; `None` selects `"default"`.
    pub fn instance(&self, name: Option<&str>) -> Result<Instance, LookupError> {
        self.registry.lookup(name)
    }

    /// Merge every layer into one options record per instance name.
    fn resolve(&self, opts: &InitOptions) -> Result<BTreeMap<String, Options>, ConfigError> {
        let namespace = self.namespace();
        let from_source = decode_section(self.source.as_ref(), namespace)?;
        let from_init = match &opts.config {
            Some(source) => decode_section(source.as_ref(), namespace)?,
            None => BTreeMap::new(),
        };

        let names: BTreeSet<&String> = from_source
            .keys()
            .chain(from_init.keys())
            .chain(opts.instances.keys())
            .collect();

        Ok(names
            .into_iter()
            .map(|name| {
                let mut options = self.base.clone();
                for layer in [
                    from_source.get(name),
                    from_init.get(name),
                    opts.instances.get(name),
                    Some(&self.overrides),
                ]
                .into_iter()
                .flatten()
                {
                    options.merge(layer);
                }
                (name.clone(), options)
            })
            .collect())
    }

    pub async fn init(&self, opts: InitOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(state.phase, Phase::Initialized | Phase::Started) {
            debug!(kind = %self.kind, "already initialized");
            return Ok(());
        }

        let configs = self.resolve(&opts)?;
        if configs.is_empty() {
            info!(kind = %self.kind, "no instances configured");
            state.phase = Phase::Initialized;
            return Ok(());
        }

        for (name, options) in configs {
            let built = self.factory.build(&name, options).await;
            let registered: Result<()> = built
                .map_err(Into::into)
                .and_then(|instance| self.registry.register(instance));
            if let Err(e) = registered {
                error!(kind = %self.kind, %name, error = %e, "init failed, closing built instances");
                self.close_all().await;
                return Err(e);
            }
        }

        info!(kind = %self.kind, instances = ?self.registry.names(), "initialized");
        state.phase = Phase::Initialized;
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.phase {
            Phase::Initialized => {}
            Phase::Started => return Ok(()),
            Phase::Uninitialized | Phase::Stopped => {
                debug!(kind = %self.kind, "start before init ignored");
                return Ok(());
            }
        }

        if !self.registry.is_empty() {
            let token = cancel.child_token();
            let handle = StatsPoller::new(self.registry.clone(), self.sink.clone(), self.stats_interval)
                .spawn(token.clone());
            state.poller = Some(PollerTask { token, handle });
        }
        state.phase = Phase::Started;
        info!(kind = %self.kind, "started");
        Ok(())
    }

    /// Stop the poller and close every instance.
    ///
    /// Waiting for the poller is bounded by `cancel`; close failures are
    /// logged and do not stop the remaining closes.
    pub async fn stop(&self, cancel: CancellationToken) -> Result<()> {
        let mut state = self.state.lock().await;
        if !matches!(state.phase, Phase::Initialized | Phase::Started) {
            debug!(kind = %self.kind, "stop ignored, not running");
            return Ok(());
        }

        if let Some(PollerTask { token, mut handle }) = state.poller.take() {
            token.cancel();
            tokio::select! {
                joined = &mut handle => {
                    if let Err(e) = joined {
                        warn!(kind = %self.kind, error = %e, "stats poller ended abnormally");
                    }
                }
                _ = cancel.cancelled() => {
                    warn!(kind = %self.kind, "stop deadline reached, aborting stats poller");
                    handle.abort();
                }
            }
        }

        self.close_all().await;
        state.phase = Phase::Stopped;
        self.open.store(false, Ordering::SeqCst);
        info!(kind = %self.kind, "stopped");
        Ok(())
    }

    async fn close_all(&self) {
        for instance in self.registry.drain() {
            match instance.close().await {
                Ok(()) => debug!(kind = %self.kind, name = instance.name(), "instance closed"),
                Err(e) => warn!(
                    kind = %self.kind,
                    name = instance.name(),
                    error = %e,
                    "failed to close instance"
                ),
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("kind", &self.kind)
            .field("instances", &self.registry.names())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Loader for Component {
    async fn init(&self, opts: InitOptions) -> Result<()> {
        Component::init(self, opts).await
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        Component::start(self, cancel).await
    }

    async fn stop(&self, cancel: CancellationToken) -> Result<()> {
        Component::stop(self, cancel).await
    }

    fn is_open(&self) -> bool {
        Component::is_open(self)
    }
}
