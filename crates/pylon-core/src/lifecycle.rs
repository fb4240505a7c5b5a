//! Driving several components as one unit.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::component::InitOptions;
use crate::error::{Error, Result};

/// Anything with an init/start/stop lifecycle. `Display` names it in logs.
#[async_trait]
pub trait Loader: Send + Sync + fmt::Display {
    async fn init(&self, opts: InitOptions) -> Result<()>;

    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    async fn stop(&self, cancel: CancellationToken) -> Result<()>;

    /// Whether the loader currently holds live resources.
    fn is_open(&self) -> bool;
}

/// Ordered set of loaders.
///
/// Init and start run in registration order and stop at the first failure.
/// Stop runs in reverse order, visits every loader and returns the first error.
#[derive(Default, Clone)]
pub struct LoaderGroup {
    loaders: Vec<Arc<dyn Loader>>,
}

impl LoaderGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn push(&mut self, loader: Arc<dyn Loader>) {
        self.loaders.push(loader);
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.loaders.iter().map(|l| l.to_string()).collect()
    }

    pub async fn init(&self, opts: InitOptions) -> Result<()> {
        for loader in &self.loaders {
            loader.init(opts.clone()).await?;
            info!(loader = %loader, "loader initialized");
        }
        Ok(())
    }

    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        for loader in &self.loaders {
            loader.start(cancel.clone()).await?;
        }
        Ok(())
    }

    pub async fn stop(&self, cancel: CancellationToken) -> Result<()> {
        let mut first: Option<Error> = None;
        for loader in self.loaders.iter().rev() {
            if let Err(e) = loader.stop(cancel.clone()).await {
                warn!(loader = %loader, error = %e, "loader failed to stop");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for LoaderGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderGroup")
            .field("loaders", &self.names())
            .finish()
    }
}
