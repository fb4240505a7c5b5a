//! Primary and replica selection.

use std::fmt;
use std::sync::Arc;

use pylon_core::ReplicaPolicy;

/// One client per primary and per read replica.
pub struct Routed<T> {
    primary: T,
    replicas: Vec<T>,
    policy: Arc<dyn ReplicaPolicy>,
}

impl<T> Routed<T> {
    pub fn new(primary: T, replicas: Vec<T>, policy: Arc<dyn ReplicaPolicy>) -> Self {
        Self {
            primary,
            replicas,
            policy,
        }
    }

    pub fn primary(&self) -> &T {
        &self.primary
    }

    pub fn replicas(&self) -> &[T] {
        &self.replicas
    }

    /// Read-only operations go to a replica when any are configured.
    pub fn route(&self, read_only: bool) -> &T {
        if read_only && !self.replicas.is_empty() {
            let index = self.policy.pick(self.replicas.len());
            if let Some(replica) = self.replicas.get(index) {
                return replica;
            }
        }
        &self.primary
    }

    /// Primary first, then replicas.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        std::iter::once(&self.primary).chain(&self.replicas)
    }
}

impl<T> fmt::Debug for Routed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routed")
            .field("replicas", &self.replicas.len())
            .field("policy", &self.policy)
            .finish()
    }
}
