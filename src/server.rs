// Coordinator server: the network face of the engine hub
//
// One long-lived connection per remote process. Each accepted connection
// gets an id, a writer task draining the hub's outbound lines, and a reader
// loop feeding decoded commands into the hub. Connection teardown clears
// every lock the connection's clients held.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::locks::hub::EngineHub;
use crate::proto::{self, PROTOCOL_MAGIC};

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

/// TCP server exposing an `EngineHub` to other processes.
pub struct CoordinatorServer {
    listener: TcpListener,
    hub: Arc<EngineHub>,
}

impl CoordinatorServer {
    /// Bind to the first free port in `base_port..base_port + window`.
    /// A `base_port` of 0 asks the OS for an ephemeral port.
    pub async fn bind(
        hub: Arc<EngineHub>,
        host: &str,
        base_port: u16,
        window: u16,
    ) -> Result<Self> {
        for port in base_port..base_port.saturating_add(window.max(1)) {
            match TcpListener::bind((host, port)).await {
                Ok(listener) => {
                    info!("lock coordinator listening on {}", listener.local_addr()?);
                    return Ok(Self { listener, hub });
                }
                Err(e) => debug!("port {port} unavailable: {e}"),
            }
        }
        bail!("no free coordinator port on {host} in window {base_port}+{window}");
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("reading coordinator listener address")
    }

    /// Run the accept loop until the task is dropped or aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer)) => {
                        let conn = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
                        debug!("lock client {peer} connected as conn {conn}");
                        tokio::spawn(serve_connection(self.hub.clone(), conn, stream));
                    }
                    Err(e) => {
                        warn!("coordinator accept failed: {e}");
                        break;
                    }
                }
            }
        })
    }
}

async fn serve_connection(hub: Arc<EngineHub>, conn: u64, stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();

    if write_half
        .write_all(format!("{PROTOCOL_MAGIC}\n").as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    hub.attach_connection(conn, tx);

    let writer = tokio::spawn(async move {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match proto::decode_command(&line) {
                Ok(cmd) => hub.apply_remote(conn, cmd),
                Err(e) => {
                    warn!("conn {conn}: closing after malformed line: {e}");
                    break;
                }
            },
            Ok(None) => {
                debug!("conn {conn} disconnected");
                break;
            }
            Err(e) => {
                warn!("conn {conn} read error: {e}");
                break;
            }
        }
    }

    hub.drop_connection(conn);
    writer.abort();
}
