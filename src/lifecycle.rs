//! Reference-counted shared resources with scoped leases.
//!
//! [`Shared`] owns a lazily constructed resource whose lifetime is tied to
//! the number of outstanding [`Lease`]s rather than to any single owner.
//! The first `acquire` builds the resource, the last release tears it down.
//! Count mutations are serialized behind one async mutex, so construction
//! and teardown never interleave.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::InfraError;

/// Construction and teardown hooks for a [`Shared`] resource.
#[async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    /// The resource handed out to lease holders.
    type Resource: Send + Sync + 'static;

    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Builds the resource on the 0 → 1 transition.
    ///
    /// # Errors
    ///
    /// Any error aborts the acquire; the reference count is left unchanged.
    async fn open(&self) -> Result<Self::Resource, InfraError>;

    /// Tears the resource down on the 1 → 0 transition.
    async fn close(&self, resource: Arc<Self::Resource>);
}

struct State<R> {
    references: usize,
    resource: Option<Arc<R>>,
}

/// A resource shared by every holder of a [`Lease`].
///
/// Invariant: `resource` is `Some` exactly when `references > 0`.
pub struct Shared<L: Lifecycle> {
    lifecycle: L,
    state: Mutex<State<L::Resource>>,
}

impl<L: Lifecycle> fmt::Debug for Shared<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("name", &self.lifecycle.name())
            .finish_non_exhaustive()
    }
}

impl<L: Lifecycle> Shared<L> {
    /// Wraps `lifecycle` in a new, closed shared resource.
    #[must_use]
    pub fn new(lifecycle: L) -> Arc<Self> {
        Arc::new(Self {
            lifecycle,
            state: Mutex::new(State {
                references: 0,
                resource: None,
            }),
        })
    }

    /// Returns the lifecycle hooks.
    #[must_use]
    pub fn lifecycle(&self) -> &L {
        &self.lifecycle
    }

    /// Takes a reference, constructing the resource if none exists yet.
    ///
    /// # Errors
    ///
    /// Propagates the error from [`Lifecycle::open`] on the 0 → 1
    /// transition.
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease<L>, InfraError> {
        let mut state = self.state.lock().await;
        let resource = match &state.resource {
            Some(existing) => Arc::clone(existing),
            None => {
                let name = self.lifecycle.name();
                tracing::info!(resource = name, "opening shared resource");
                let opened = Arc::new(self.lifecycle.open().await.inspect_err(|e| {
                    tracing::error!(resource = name, error = %e, "shared resource failed to open");
                })?);
                state.resource = Some(Arc::clone(&opened));
                opened
            }
        };
        state.references = state.references.saturating_add(1);
        tracing::debug!(
            resource = self.lifecycle.name(),
            references = state.references,
            "lease acquired"
        );
        Ok(Lease {
            shared: Arc::clone(self),
            resource: Some(resource),
        })
    }

    /// Returns the current number of outstanding leases.
    pub async fn reference_count(&self) -> usize {
        self.state.lock().await.references
    }

    /// Returns `true` while at least one lease is outstanding.
    pub async fn is_open(&self) -> bool {
        self.state.lock().await.resource.is_some()
    }

    /// Returns the live resource without taking a reference.
    pub async fn current(&self) -> Option<Arc<L::Resource>> {
        self.state.lock().await.resource.as_ref().map(Arc::clone)
    }

    async fn release_one(&self) {
        let mut state = self.state.lock().await;
        let name = self.lifecycle.name();
        match state.references {
            0 => {
                tracing::warn!(resource = name, "release without matching acquire ignored");
            }
            1 => {
                state.references = 0;
                if let Some(resource) = state.resource.take() {
                    tracing::info!(resource = name, "closing shared resource");
                    self.lifecycle.close(resource).await;
                }
            }
            n => {
                state.references = n - 1;
                tracing::debug!(resource = name, references = n - 1, "lease released");
            }
        }
    }
}

/// Scoped reference to a [`Shared`] resource.
///
/// Call [`Lease::release`] to give the reference back and wait for any
/// teardown it triggers. A lease dropped without `release` schedules the
/// release on the current Tokio runtime, so every exit path gives the
/// reference back exactly once.
pub struct Lease<L: Lifecycle> {
    shared: Arc<Shared<L>>,
    resource: Option<Arc<L::Resource>>,
}

impl<L: Lifecycle> fmt::Debug for Lease<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("name", &self.shared.lifecycle.name())
            .field("released", &self.resource.is_none())
            .finish()
    }
}

impl<L: Lifecycle> Lease<L> {
    /// Returns a shared handle to the leased resource.
    ///
    /// The handle stays valid memory-wise after the lease is released but
    /// the resource may be closed by then.
    #[must_use]
    pub fn resource(&self) -> Option<Arc<L::Resource>> {
        self.resource.as_ref().map(Arc::clone)
    }

    /// Gives the reference back, awaiting teardown on the last release.
    pub async fn release(mut self) {
        if let Some(resource) = self.resource.take() {
            drop(resource);
            self.shared.release_one().await;
        }
    }
}

impl<L: Lifecycle> Deref for Lease<L> {
    type Target = L::Resource;

    fn deref(&self) -> &Self::Target {
        match &self.resource {
            Some(resource) => resource,
            // `resource` is only taken inside `release(self)` and `drop`,
            // neither of which leaves the lease reachable.
            None => unreachable!("lease used after release"),
        }
    }
}

impl<L: Lifecycle> Drop for Lease<L> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        drop(resource);
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { shared.release_one().await });
            }
            Err(_) => {
                tracing::warn!(
                    resource = shared.lifecycle.name(),
                    "lease dropped outside a runtime; reference leaked"
                );
            }
        }
    }
}
