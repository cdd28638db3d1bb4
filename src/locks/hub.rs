// Engine hub: the single serialization point around the lock queue engine
//
// Every mutation, local or decoded from a server connection, goes through
// the hub's mutex, which gives the engine the one logical thread of
// execution it requires. Signals produced by the engine are routed here:
// grants wake local waiters or are encoded onto the owning connection,
// flush/change notifications go to registered consumer handlers.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::engine::{ClientRef, Event, LockQueueEngine, PeerId, ResourceId, Signal};
use super::handle::{FolderEvents, LockCoordinator};
use crate::proto::{self, ClientCommand, ServerEvent};

type PendingKey = (ResourceId, String);

struct HubState {
    engine: LockQueueEngine,
    /// Local callers awaiting a grant, FIFO per (resource, token).
    pending: HashMap<PendingKey, VecDeque<oneshot::Sender<()>>>,
    /// Consumer callbacks by correlation token.
    handlers: HashMap<String, Arc<dyn FolderEvents>>,
    /// Outbound line writers by connection id.
    conns: HashMap<u64, mpsc::UnboundedSender<String>>,
}

/// Handler invocations deferred until after the state lock is released, so
/// a callback may call straight back into the hub.
enum Callback {
    FolderChanged(Arc<dyn FolderEvents>, ResourceId, f64),
    FlushRequested(Arc<dyn FolderEvents>, ResourceId),
}

impl Callback {
    fn run(self) {
        match self {
            Callback::FolderChanged(handler, resource, mtime) => {
                handler.on_folder_changed(&resource, mtime);
            }
            Callback::FlushRequested(handler, resource) => {
                handler.on_flush_requested(&resource);
            }
        }
    }
}

/// Shared, explicitly owned lock coordination state for one storage root.
/// Serves local callers directly and remote ones via `CoordinatorServer`.
pub struct EngineHub {
    state: Mutex<HubState>,
}

impl EngineHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                engine: LockQueueEngine::new(),
                pending: HashMap::new(),
                handlers: HashMap::new(),
                conns: HashMap::new(),
            }),
        })
    }

    /// Register the outbound writer of a freshly accepted connection.
    pub fn attach_connection(&self, conn: u64, tx: mpsc::UnboundedSender<String>) {
        self.state.lock().conns.insert(conn, tx);
    }

    /// Tear down a connection: abandon its writer, clear every lock its
    /// clients still hold or await, and prune its subscriptions.
    pub fn drop_connection(&self, conn: u64) {
        let callbacks = {
            let mut state = self.state.lock();
            state.conns.remove(&conn);
            let clients = state.engine.connection_clients(conn);
            if !clients.is_empty() {
                info!("conn {conn} gone, clearing locks of {} client(s)", clients.len());
            }
            let mut signals = Vec::new();
            for client in clients {
                signals.extend(state.engine.clear_locks(&client));
            }
            state.engine.drop_connection_subscriptions(conn);
            Self::route(&mut state, signals)
        };
        for callback in callbacks {
            callback.run();
        }
    }

    /// Apply a decoded wire command on behalf of connection `conn`.
    pub fn apply_remote(&self, conn: u64, cmd: ClientCommand) {
        let callbacks = {
            let mut state = self.state.lock();
            let signals = match cmd {
                ClientCommand::Subscribe { resource, token } => {
                    state.engine.subscribe(&resource, &ClientRef::remote(conn, token));
                    Vec::new()
                }
                ClientCommand::Unsubscribe { resource, token } => {
                    state.engine.unsubscribe(&resource, &ClientRef::remote(conn, token));
                    Vec::new()
                }
                ClientCommand::Lock { resource, token } => {
                    state.engine.lock(&resource, &ClientRef::remote(conn, token))
                }
                ClientCommand::PartialLock { resource, token } => {
                    // Fire-and-forget on the wire: the bool stays server-side.
                    state.engine.partial_lock(&resource, &ClientRef::remote(conn, token)).1
                }
                ClientCommand::Unlock { resource, mtime, token } => {
                    state.engine.unlock(&resource, &ClientRef::remote(conn, token), mtime).1
                }
            };
            Self::route(&mut state, signals)
        };
        for callback in callbacks {
            callback.run();
        }
    }

    /// Deliver engine signals: remote ones are encoded onto their
    /// connection, local grants fulfill the oldest pending waiter, local
    /// notifications become deferred handler callbacks.
    fn route(state: &mut HubState, signals: Vec<Signal>) -> Vec<Callback> {
        let mut callbacks = Vec::new();
        for signal in signals {
            match signal.client.peer {
                PeerId::Conn(conn) => {
                    let event = match signal.event {
                        Event::Granted => ServerEvent::Granted {
                            resource: signal.resource,
                            token: signal.client.token,
                        },
                        Event::FlushRequested => ServerEvent::FlushRequested {
                            resource: signal.resource,
                            token: signal.client.token,
                        },
                        Event::FolderChanged { mtime } => ServerEvent::FolderChanged {
                            resource: signal.resource,
                            mtime,
                            token: signal.client.token,
                        },
                    };
                    match state.conns.get(&conn) {
                        Some(tx) => {
                            let _ = tx.send(proto::encode_event(&event));
                        }
                        None => debug!("dropping signal for vanished conn {conn}"),
                    }
                }
                PeerId::Local => match signal.event {
                    Event::Granted => {
                        let key = (signal.resource.clone(), signal.client.token.clone());
                        let waiter = state.pending.get_mut(&key).and_then(VecDeque::pop_front);
                        match waiter {
                            Some(tx) => {
                                if state.pending.get(&key).is_some_and(VecDeque::is_empty) {
                                    state.pending.remove(&key);
                                }
                                let _ = tx.send(());
                            }
                            None => warn!(
                                "grant for {} on {} has no local waiter",
                                signal.client, signal.resource
                            ),
                        }
                    }
                    Event::FlushRequested => {
                        if let Some(handler) = state.handlers.get(&signal.client.token) {
                            callbacks.push(Callback::FlushRequested(
                                handler.clone(),
                                signal.resource,
                            ));
                        }
                    }
                    Event::FolderChanged { mtime } => {
                        if let Some(handler) = state.handlers.get(&signal.client.token) {
                            callbacks.push(Callback::FolderChanged(
                                handler.clone(),
                                signal.resource,
                                mtime,
                            ));
                        }
                    }
                },
            }
        }
        callbacks
    }
}

#[async_trait]
impl LockCoordinator for EngineHub {
    fn register_handler(&self, token: &str, handler: Arc<dyn FolderEvents>) {
        self.state.lock().handlers.insert(token.to_string(), handler);
    }

    fn unregister_handler(&self, token: &str) {
        self.state.lock().handlers.remove(token);
    }

    async fn subscribe(&self, resource: &ResourceId, token: &str) -> Result<()> {
        self.state.lock().engine.subscribe(resource, &ClientRef::local(token));
        Ok(())
    }

    async fn unsubscribe(&self, resource: &ResourceId, token: &str) -> Result<()> {
        self.state.lock().engine.unsubscribe(resource, &ClientRef::local(token));
        Ok(())
    }

    async fn lock(&self, resource: &ResourceId, token: &str) -> Result<()> {
        let client = ClientRef::local(token);
        let (waiter, callbacks) = {
            let mut state = self.state.lock();
            let mut signals = state.engine.lock(resource, &client);
            // A synchronous grant to the caller is consumed right here; any
            // other signal (e.g. a flush request to the holder) is routed.
            let granted = signals
                .iter()
                .position(|s| s.client == client && s.event == Event::Granted);
            let waiter = match granted {
                Some(i) => {
                    signals.remove(i);
                    None
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    state
                        .pending
                        .entry((resource.clone(), token.to_string()))
                        .or_default()
                        .push_back(tx);
                    Some(rx)
                }
            };
            (waiter, Self::route(&mut state, signals))
        };
        for callback in callbacks {
            callback.run();
        }
        if let Some(rx) = waiter {
            rx.await.map_err(|_| anyhow!("lock coordinator shut down"))?;
        }
        Ok(())
    }

    async fn partial_lock(&self, resource: &ResourceId, token: &str) -> Result<bool> {
        let (ok, callbacks) = {
            let mut state = self.state.lock();
            let (ok, signals) = state.engine.partial_lock(resource, &ClientRef::local(token));
            (ok, Self::route(&mut state, signals))
        };
        for callback in callbacks {
            callback.run();
        }
        Ok(ok)
    }

    async fn unlock(&self, resource: &ResourceId, token: &str, mtime: Option<f64>) -> Result<()> {
        let callbacks = {
            let mut state = self.state.lock();
            let (_, signals) = state.engine.unlock(resource, &ClientRef::local(token), mtime);
            Self::route(&mut state, signals)
        };
        for callback in callbacks {
            callback.run();
        }
        Ok(())
    }
}
