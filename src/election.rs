// Coordinator election for a shared storage root
//
// Exactly one process per root coordinates folder locks. Ownership is
// claimed through a marker file at the root: `exclusive <pid>` for a
// process that coordinates only itself, `tcp <host> <port>` for one that
// serves other processes. Stale records (dead pid, unreachable address) are
// detected and overwritten; every failure path degrades to some usable
// mode rather than aborting.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::client::RemoteProxy;
use crate::locks::handle::{CoordinatorProvider, FolderEvents, LockCoordinator};
use crate::locks::hub::EngineHub;
use crate::server::CoordinatorServer;

/// Name of the election record inside the storage root.
pub const MARKER_FILE: &str = "coordinator";

/// First port tried when offering the coordinator over the network.
pub const DEFAULT_BASE_PORT: u16 = 50007;
/// How many consecutive ports are tried before giving up on network mode.
pub const DEFAULT_PORT_WINDOW: u16 = 10;

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_PAUSE: Duration = Duration::from_millis(250);
/// Bound on claim restarts so a pathological marker race degrades instead
/// of spinning.
const CLAIM_ROUNDS: u32 = 8;

/// The persisted election record. Mutated only by the process that
/// currently believes itself the owner, and only during a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerRecord {
    Exclusive { pid: u32 },
    Network { host: String, port: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum MarkerError {
    #[error("unrecognized marker record {0:?}")]
    Unrecognized(String),
    #[error("malformed marker record {0:?}")]
    Malformed(String),
}

impl MarkerRecord {
    pub fn parse(line: &str) -> Result<Self, MarkerError> {
        let line = line.trim();
        let mut fields = line.split_whitespace();
        let record = match fields.next() {
            Some("exclusive") => {
                let pid = fields
                    .next()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| MarkerError::Malformed(line.to_string()))?;
                MarkerRecord::Exclusive { pid }
            }
            Some("tcp") => {
                let host = fields
                    .next()
                    .ok_or_else(|| MarkerError::Malformed(line.to_string()))?
                    .to_string();
                let port = fields
                    .next()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| MarkerError::Malformed(line.to_string()))?;
                MarkerRecord::Network { host, port }
            }
            _ => return Err(MarkerError::Unrecognized(line.to_string())),
        };
        if fields.next().is_some() {
            return Err(MarkerError::Malformed(line.to_string()));
        }
        Ok(record)
    }
}

impl fmt::Display for MarkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerRecord::Exclusive { pid } => write!(f, "exclusive {pid}"),
            MarkerRecord::Network { host, port } => write!(f, "tcp {host} {port}"),
        }
    }
}

/// How a process offers (or does not offer) coordination for a root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Address to serve the coordinator on; `None` claims exclusive mode.
    pub host: Option<String>,
    pub base_port: u16,
    pub port_window: u16,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            base_port: DEFAULT_BASE_PORT,
            port_window: DEFAULT_PORT_WINDOW,
        }
    }
}

impl ElectionConfig {
    pub fn exclusive() -> Self {
        Self::default()
    }

    pub fn network(host: impl Into<String>) -> Self {
        Self { host: Some(host.into()), ..Self::default() }
    }
}

/// Where this process ended up after the claim settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Sole participant, recorded as `exclusive <pid>`.
    ExclusiveOwner,
    /// Runs the engine and serves it over TCP.
    NetworkOwner(SocketAddr),
    /// Delegates every operation to the recorded owner.
    RemoteClient(String),
    /// Another live process owns the root exclusively, or coordination
    /// failed entirely: best-effort process-local locking only.
    LocalFallback,
}

struct Elected {
    role: Role,
    coordinator: Arc<dyn LockCoordinator>,
}

enum Claim {
    Owner { role: Role, coordinator: Arc<dyn LockCoordinator> },
    Client { addr: String, proxy: Arc<RemoteProxy> },
    Fallback,
    Retry,
}

/// Decides, per storage root, whether this process runs the lock engine
/// itself or delegates to another process, and re-runs the decision when a
/// remote coordinator disappears. Handler registrations survive the swap.
pub struct ElectionController {
    root: PathBuf,
    config: ElectionConfig,
    elected: RwLock<Elected>,
    handlers: Mutex<HashMap<String, Arc<dyn FolderEvents>>>,
}

impl ElectionController {
    /// Run the claim for `root` and return a controller holding the elected
    /// coordinator.
    pub async fn start(root: impl Into<PathBuf>, config: ElectionConfig) -> Result<Arc<Self>> {
        let controller = Arc::new(Self {
            root: root.into(),
            config,
            elected: RwLock::new(Elected {
                role: Role::LocalFallback,
                coordinator: EngineHub::new(),
            }),
            handlers: Mutex::new(HashMap::new()),
        });
        controller.clone().claim().await?;
        Ok(controller)
    }

    pub fn role(&self) -> Role {
        self.elected.read().role.clone()
    }

    fn marker_path(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    async fn claim(self: Arc<Self>) -> Result<()> {
        for round in 0..CLAIM_ROUNDS {
            if round > 0 {
                debug!("claim round {round} for {}", self.root.display());
            }
            match self.claim_once().await? {
                Claim::Owner { role, coordinator } => {
                    self.install(role, coordinator, None);
                    return Ok(());
                }
                Claim::Client { addr, proxy } => {
                    self.install(Role::RemoteClient(addr), proxy.clone(), Some(proxy));
                    return Ok(());
                }
                Claim::Fallback => {
                    self.install(Role::LocalFallback, EngineHub::new(), None);
                    return Ok(());
                }
                Claim::Retry => {}
            }
        }
        warn!(
            "coordinator claim for {} kept racing after {CLAIM_ROUNDS} rounds; \
             running without cross-process coordination",
            self.root.display()
        );
        self.install(Role::LocalFallback, EngineHub::new(), None);
        Ok(())
    }

    /// One pass of the claim algorithm. `Retry` means the marker was found
    /// stale and removed, so the next pass claims afresh.
    async fn claim_once(&self) -> Result<Claim> {
        if let Some(host) = self.config.host.clone() {
            let hub = EngineHub::new();
            match CoordinatorServer::bind(
                hub.clone(),
                &host,
                self.config.base_port,
                self.config.port_window,
            )
            .await
            {
                Ok(server) => {
                    let addr = server.local_addr()?;
                    let record = MarkerRecord::Network { host, port: addr.port() };
                    if self.try_create_marker(&record).await? {
                        server.spawn();
                        info!("elected network lock coordinator on {addr}");
                        return Ok(Claim::Owner {
                            role: Role::NetworkOwner(addr),
                            coordinator: hub,
                        });
                    }
                    // Someone else holds a record: free the port, then
                    // decide whether that record is live.
                    drop(server);
                }
                Err(e) => {
                    warn!("{e}; falling back to exclusive coordination");
                    let record = MarkerRecord::Exclusive { pid: std::process::id() };
                    if self.try_create_marker(&record).await? {
                        return Ok(Claim::Owner {
                            role: Role::ExclusiveOwner,
                            coordinator: EngineHub::new(),
                        });
                    }
                }
            }
        } else {
            let record = MarkerRecord::Exclusive { pid: std::process::id() };
            if self.try_create_marker(&record).await? {
                info!("claimed exclusive lock coordination for {}", self.root.display());
                return Ok(Claim::Owner {
                    role: Role::ExclusiveOwner,
                    coordinator: EngineHub::new(),
                });
            }
        }
        self.resolve_existing().await
    }

    /// Branch on a marker record some other process created.
    async fn resolve_existing(&self) -> Result<Claim> {
        let path = self.marker_path();
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            // Owner vanished between our create attempt and this read.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Claim::Retry),
            Err(e) => {
                return Err(e).with_context(|| format!("reading marker {}", path.display()))
            }
        };

        match MarkerRecord::parse(&text) {
            Err(e) => {
                warn!("treating unreadable coordinator marker as stale: {e}");
                self.remove_marker().await?;
                Ok(Claim::Retry)
            }
            Ok(MarkerRecord::Exclusive { pid }) => {
                if pid == std::process::id() {
                    // A record naming our own pid while we are still
                    // claiming is a leftover, not a live owner.
                    debug!("marker names our own pid {pid}; reclaiming");
                    self.remove_marker().await?;
                    return Ok(Claim::Retry);
                }
                match pid_alive(pid) {
                    Some(false) => {
                        info!("exclusive coordinator pid {pid} is dead; taking over");
                        self.remove_marker().await?;
                        Ok(Claim::Retry)
                    }
                    Some(true) => {
                        warn!(
                            "{} is exclusively coordinated by live pid {pid}; \
                             running without cross-process coordination",
                            self.root.display()
                        );
                        Ok(Claim::Fallback)
                    }
                    None => {
                        warn!("cannot probe pid {pid} on this platform; assuming it is alive");
                        Ok(Claim::Fallback)
                    }
                }
            }
            Ok(MarkerRecord::Network { host, port }) => {
                let addr = format!("{host}:{port}");
                for attempt in 1..=CONNECT_ATTEMPTS {
                    match RemoteProxy::connect(&addr).await {
                        Ok(proxy) => return Ok(Claim::Client { addr, proxy }),
                        Err(e) => {
                            debug!(
                                "coordinator connect {attempt}/{CONNECT_ATTEMPTS} \
                                 to {addr} failed: {e}"
                            );
                            if attempt < CONNECT_ATTEMPTS {
                                tokio::time::sleep(CONNECT_PAUSE).await;
                            }
                        }
                    }
                }
                warn!("recorded coordinator {addr} is unreachable; claiming ownership");
                self.remove_marker().await?;
                Ok(Claim::Retry)
            }
        }
    }

    fn install(
        self: &Arc<Self>,
        role: Role,
        coordinator: Arc<dyn LockCoordinator>,
        proxy: Option<Arc<RemoteProxy>>,
    ) {
        for (token, handler) in self.handlers.lock().iter() {
            coordinator.register_handler(token, handler.clone());
        }
        info!("lock coordination for {}: {:?}", self.root.display(), role);
        *self.elected.write() = Elected { role, coordinator };

        // A remote client watches its connection and re-runs the whole
        // claim when it drops; this process may become the new owner.
        if let Some(proxy) = proxy {
            let controller = self.clone();
            tokio::spawn(async move {
                proxy.closed().await;
                warn!(
                    "lock coordinator connection lost; re-running election for {}",
                    controller.root.display()
                );
                if let Err(e) = controller.clone().claim().await {
                    error!("re-election failed: {e}; running without coordination");
                    controller.install(Role::LocalFallback, EngineHub::new(), None);
                }
            });
        }
    }

    /// Atomically create the marker; `false` means a record already exists.
    async fn try_create_marker(&self, record: &MarkerRecord) -> Result<bool> {
        let path = self.marker_path();
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                file.write_all(format!("{record}\n").as_bytes()).await?;
                file.flush().await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("creating marker {}", path.display()))
            }
        }
    }

    async fn remove_marker(&self) -> Result<()> {
        match tokio::fs::remove_file(self.marker_path()).await {
            Ok(()) => Ok(()),
            // A racing claimant got there first; the retry will sort it out.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("removing stale coordinator marker"),
        }
    }
}

impl CoordinatorProvider for ElectionController {
    fn coordinator(&self) -> Arc<dyn LockCoordinator> {
        self.elected.read().coordinator.clone()
    }

    fn register_handler(&self, token: &str, handler: Arc<dyn FolderEvents>) {
        self.handlers.lock().insert(token.to_string(), handler.clone());
        self.coordinator().register_handler(token, handler);
    }

    fn unregister_handler(&self, token: &str) {
        self.handlers.lock().remove(token);
        self.coordinator().unregister_handler(token);
    }
}

/// Non-destructive liveness probe. `None` means the platform offers no safe
/// probe and the caller should assume the process is alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> Option<bool> {
    #[cfg(target_os = "linux")]
    {
        if std::path::Path::new("/proc").is_dir() {
            return Some(std::path::Path::new(&format!("/proc/{pid}")).exists());
        }
    }
    // Signal 0 performs permission checks only; it never delivers anything.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return Some(true);
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(code) if code == libc::ESRCH => Some(false),
        Some(code) if code == libc::EPERM => Some(true),
        _ => None,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> Option<bool> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_round_trip() {
        for record in [
            MarkerRecord::Exclusive { pid: 4242 },
            MarkerRecord::Network { host: "10.0.0.7".to_string(), port: 50013 },
        ] {
            assert_eq!(MarkerRecord::parse(&record.to_string()).unwrap(), record);
        }
        assert_eq!(MarkerRecord::Exclusive { pid: 1 }.to_string(), "exclusive 1");
        assert_eq!(
            MarkerRecord::Network { host: "a".to_string(), port: 2 }.to_string(),
            "tcp a 2"
        );
    }

    #[test]
    fn test_marker_rejects_garbage() {
        assert!(matches!(MarkerRecord::parse(""), Err(MarkerError::Unrecognized(_))));
        assert!(matches!(MarkerRecord::parse("udp h 1"), Err(MarkerError::Unrecognized(_))));
        assert!(matches!(MarkerRecord::parse("exclusive"), Err(MarkerError::Malformed(_))));
        assert!(matches!(
            MarkerRecord::parse("exclusive twelve"),
            Err(MarkerError::Malformed(_))
        ));
        assert!(matches!(
            MarkerRecord::parse("tcp host 80 extra"),
            Err(MarkerError::Malformed(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_pid_probe() {
        assert_eq!(pid_alive(std::process::id()), Some(true));
        // Way beyond any real pid space.
        assert_eq!(pid_alive(999_999_999), Some(false));
    }

    #[tokio::test]
    async fn test_fresh_root_becomes_exclusive_owner() {
        let root = TempDir::new().unwrap();
        let controller = ElectionController::start(root.path(), ElectionConfig::exclusive())
            .await
            .unwrap();
        assert_eq!(controller.role(), Role::ExclusiveOwner);

        let text = std::fs::read_to_string(root.path().join(MARKER_FILE)).unwrap();
        assert_eq!(
            MarkerRecord::parse(&text).unwrap(),
            MarkerRecord::Exclusive { pid: std::process::id() }
        );
    }

    #[tokio::test]
    async fn test_dead_exclusive_owner_is_replaced() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join(MARKER_FILE), "exclusive 999999999\n").unwrap();

        let controller = ElectionController::start(root.path(), ElectionConfig::exclusive())
            .await
            .unwrap();
        assert_eq!(controller.role(), Role::ExclusiveOwner);

        let text = std::fs::read_to_string(root.path().join(MARKER_FILE)).unwrap();
        assert_eq!(
            MarkerRecord::parse(&text).unwrap(),
            MarkerRecord::Exclusive { pid: std::process::id() }
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_live_exclusive_owner_forces_local_fallback() {
        let root = TempDir::new().unwrap();
        // pid 1 is always alive.
        std::fs::write(root.path().join(MARKER_FILE), "exclusive 1\n").unwrap();

        let controller = ElectionController::start(root.path(), ElectionConfig::exclusive())
            .await
            .unwrap();
        assert_eq!(controller.role(), Role::LocalFallback);
    }

    #[tokio::test]
    async fn test_garbage_marker_treated_as_stale() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join(MARKER_FILE), "!!! nonsense !!!\n").unwrap();

        let controller = ElectionController::start(root.path(), ElectionConfig::exclusive())
            .await
            .unwrap();
        assert_eq!(controller.role(), Role::ExclusiveOwner);
    }

    #[tokio::test]
    async fn test_unreachable_network_owner_is_replaced() {
        let root = TempDir::new().unwrap();
        // A port nothing listens on; connect attempts must all fail fast.
        std::fs::write(root.path().join(MARKER_FILE), "tcp 127.0.0.1 1\n").unwrap();

        let controller = ElectionController::start(root.path(), ElectionConfig::exclusive())
            .await
            .unwrap();
        assert_eq!(controller.role(), Role::ExclusiveOwner);
    }
}
