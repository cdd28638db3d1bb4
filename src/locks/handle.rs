// Consumer-facing lock façade
//
// Folder objects talk to a `LockHandle`, which resolves the currently
// elected coordinator on every call. Whether that coordinator is the local
// engine hub or a proxy to another process is invisible here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::engine::ResourceId;

/// Callbacks the coordinator invokes on its consumer.
pub trait FolderEvents: Send + Sync {
    /// A subscribed folder was modified by some other client.
    fn on_folder_changed(&self, resource: &ResourceId, mtime: f64);
    /// Someone is waiting on a folder this consumer holds interruptibly.
    fn on_flush_requested(&self, resource: &ResourceId);
}

/// The logical lock operations, implemented by the local `EngineHub` and by
/// the network `RemoteProxy`. All operations are keyed by the caller's
/// opaque correlation token.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Route future flush/change notifications for `token` to `handler`.
    fn register_handler(&self, token: &str, handler: Arc<dyn FolderEvents>);
    fn unregister_handler(&self, token: &str);

    async fn subscribe(&self, resource: &ResourceId, token: &str) -> Result<()>;
    async fn unsubscribe(&self, resource: &ResourceId, token: &str) -> Result<()>;
    /// Resolves once the lock is granted. There is no timeout at this layer;
    /// callers that need one wrap the future themselves.
    async fn lock(&self, resource: &ResourceId, token: &str) -> Result<()>;
    async fn partial_lock(&self, resource: &ResourceId, token: &str) -> Result<bool>;
    async fn unlock(&self, resource: &ResourceId, token: &str, mtime: Option<f64>) -> Result<()>;
}

/// Hands out the currently selected coordinator and keeps handler
/// registrations alive across a coordinator swap (re-election).
pub trait CoordinatorProvider: Send + Sync {
    fn coordinator(&self) -> Arc<dyn LockCoordinator>;
    fn register_handler(&self, token: &str, handler: Arc<dyn FolderEvents>);
    fn unregister_handler(&self, token: &str);
}

/// Trivial provider for a fixed coordinator (tests, single-role setups).
pub struct StaticCoordinator(pub Arc<dyn LockCoordinator>);

impl CoordinatorProvider for StaticCoordinator {
    fn coordinator(&self) -> Arc<dyn LockCoordinator> {
        self.0.clone()
    }

    fn register_handler(&self, token: &str, handler: Arc<dyn FolderEvents>) {
        self.0.register_handler(token, handler);
    }

    fn unregister_handler(&self, token: &str) {
        self.0.unregister_handler(token);
    }
}

// Correlation tokens are process-locally unique; a plain counter is enough
// since the coordinator never interprets them.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Per-folder lock interface. One handle per consumer object; the handle
/// owns a fresh correlation token for its whole lifetime.
pub struct LockHandle {
    provider: Arc<dyn CoordinatorProvider>,
    resource: ResourceId,
    token: String,
}

impl LockHandle {
    pub fn new(
        provider: Arc<dyn CoordinatorProvider>,
        resource: ResourceId,
        handler: Arc<dyn FolderEvents>,
    ) -> Self {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed).to_string();
        provider.register_handler(&token, handler);
        Self { provider, resource, token }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn subscribe(&self) -> Result<()> {
        self.provider.coordinator().subscribe(&self.resource, &self.token).await
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.provider.coordinator().unsubscribe(&self.resource, &self.token).await
    }

    /// Acquire the lock, waiting for the grant. With `interruptible` the
    /// grant is immediately downgraded so waiters can ask this holder to
    /// flush instead of queueing silently.
    pub async fn lock(&self, interruptible: bool) -> Result<()> {
        let coordinator = self.provider.coordinator();
        coordinator.lock(&self.resource, &self.token).await?;
        if interruptible {
            coordinator.partial_lock(&self.resource, &self.token).await?;
        }
        Ok(())
    }

    pub async fn partial_lock(&self) -> Result<bool> {
        self.provider.coordinator().partial_lock(&self.resource, &self.token).await
    }

    pub async fn unlock(&self, mtime: Option<f64>) -> Result<()> {
        self.provider.coordinator().unlock(&self.resource, &self.token, mtime).await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.provider.unregister_handler(&self.token);
    }
}
