// Remote proxy: lock coordination delegated over one TCP connection
//
// Implements the same logical operations as the local hub but encodes them
// as wire lines. Only `lock` expects a reply; grants are matched to callers
// strictly FIFO per (resource, token), because a caller may have several
// lock requests in flight for the same key. Flush and change notifications
// are unsolicited and dispatched to handlers by token.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::locks::engine::ResourceId;
use crate::locks::handle::{FolderEvents, LockCoordinator};
use crate::proto::{self, ClientCommand, ServerEvent};

type PendingKey = (ResourceId, String);

#[derive(Default)]
struct ProxyState {
    /// Unresolved lock requests, oldest first per key.
    pending: HashMap<PendingKey, VecDeque<oneshot::Sender<()>>>,
    handlers: HashMap<String, Arc<dyn FolderEvents>>,
    /// Dropped to close the connection; `None` after `close()`.
    outbound: Option<mpsc::UnboundedSender<String>>,
}

/// Client end of a coordinator connection. Makes no reconnection attempts:
/// when the connection dies, `closed()` resolves and the election controller
/// decides what happens next. Lock requests pending at that moment are
/// abandoned, never fulfilled.
pub struct RemoteProxy {
    state: Mutex<ProxyState>,
    closed_rx: watch::Receiver<bool>,
}

impl RemoteProxy {
    /// Connect and complete the magic-line handshake, then spawn the reader
    /// and writer tasks for the connection's lifetime.
    pub async fn connect(addr: &str) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to lock coordinator at {addr}"))?;
        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let greeting = lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("coordinator at {addr} closed before handshake"))?;
        proto::check_magic(&greeting)?;
        info!("connected to lock coordinator at {addr}");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let proxy = Arc::new(Self {
            state: Mutex::new(ProxyState {
                outbound: Some(out_tx),
                ..ProxyState::default()
            }),
            closed_rx,
        });

        tokio::spawn(write_loop(write_half, out_rx));

        let reader_proxy = proxy.clone();
        tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => reader_proxy.dispatch(&line),
                    Ok(None) => {
                        debug!("coordinator connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!("coordinator connection read error: {e}");
                        break;
                    }
                }
            }
            reader_proxy.state.lock().outbound = None;
            let _ = closed_tx.send(true);
        });

        Ok(proxy)
    }

    /// Resolves when the connection is gone (server side or `close()`).
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Drop our end of the connection. Pending lock requests are abandoned.
    pub fn close(&self) {
        self.state.lock().outbound = None;
    }

    fn send(&self, cmd: &ClientCommand) -> Result<()> {
        let state = self.state.lock();
        let tx = state
            .outbound
            .as_ref()
            .ok_or_else(|| anyhow!("lock coordinator connection is closed"))?;
        tx.send(proto::encode_command(cmd))
            .map_err(|_| anyhow!("lock coordinator connection is closed"))
    }

    fn dispatch(&self, line: &str) {
        let event = match proto::decode_event(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("ignoring malformed coordinator line: {e}");
                return;
            }
        };
        match event {
            ServerEvent::Granted { resource, token } => {
                let mut state = self.state.lock();
                let key = (resource, token);
                let waiter = state.pending.get_mut(&key).and_then(VecDeque::pop_front);
                match waiter {
                    Some(tx) => {
                        if state.pending.get(&key).is_some_and(VecDeque::is_empty) {
                            state.pending.remove(&key);
                        }
                        let _ = tx.send(());
                    }
                    None => warn!("grant for {}:{} has no pending request", key.0, key.1),
                }
            }
            ServerEvent::FlushRequested { resource, token } => {
                let handler = self.state.lock().handlers.get(&token).cloned();
                match handler {
                    Some(handler) => handler.on_flush_requested(&resource),
                    None => debug!("flush request for unknown token {token}"),
                }
            }
            ServerEvent::FolderChanged { resource, mtime, token } => {
                let handler = self.state.lock().handlers.get(&token).cloned();
                match handler {
                    Some(handler) => handler.on_folder_changed(&resource, mtime),
                    None => debug!("change notification for unknown token {token}"),
                }
            }
        }
    }
}

async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = half.write_all(line.as_bytes()).await {
            debug!("coordinator write failed: {e}");
            break;
        }
    }
    // Receiver drained or sender dropped: shut the socket down so the
    // server observes EOF and clears our locks.
    let _ = half.shutdown().await;
}

#[async_trait]
impl LockCoordinator for RemoteProxy {
    fn register_handler(&self, token: &str, handler: Arc<dyn FolderEvents>) {
        self.state.lock().handlers.insert(token.to_string(), handler);
    }

    fn unregister_handler(&self, token: &str) {
        self.state.lock().handlers.remove(token);
    }

    async fn subscribe(&self, resource: &ResourceId, token: &str) -> Result<()> {
        self.send(&ClientCommand::Subscribe {
            resource: resource.clone(),
            token: token.to_string(),
        })
    }

    async fn unsubscribe(&self, resource: &ResourceId, token: &str) -> Result<()> {
        self.send(&ClientCommand::Unsubscribe {
            resource: resource.clone(),
            token: token.to_string(),
        })
    }

    async fn lock(&self, resource: &ResourceId, token: &str) -> Result<()> {
        // Register before sending so a grant racing the send cannot be lost.
        let (tx, rx) = oneshot::channel();
        let key = (resource.clone(), token.to_string());
        self.state
            .lock()
            .pending
            .entry(key.clone())
            .or_default()
            .push_back(tx);

        let sent = self.send(&ClientCommand::Lock {
            resource: resource.clone(),
            token: token.to_string(),
        });
        if let Err(e) = sent {
            let mut state = self.state.lock();
            if let Some(queue) = state.pending.get_mut(&key) {
                queue.pop_back();
                if queue.is_empty() {
                    state.pending.remove(&key);
                }
            }
            return Err(e);
        }

        rx.await
            .map_err(|_| anyhow!("lock coordinator went away while waiting for a grant"))
    }

    async fn partial_lock(&self, resource: &ResourceId, token: &str) -> Result<bool> {
        // Fire-and-forget: the server never replies to a partial lock.
        self.send(&ClientCommand::PartialLock {
            resource: resource.clone(),
            token: token.to_string(),
        })?;
        Ok(true)
    }

    async fn unlock(&self, resource: &ResourceId, token: &str, mtime: Option<f64>) -> Result<()> {
        self.send(&ClientCommand::Unlock {
            resource: resource.clone(),
            mtime,
            token: token.to_string(),
        })
    }
}
