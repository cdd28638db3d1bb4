// rootlock: distributed exclusive locking of folders across cooperating
// processes that share one storage root.
//
// One process per root is elected coordinator through a marker file; it
// runs the FIFO lock queue engine, optionally served over TCP with a
// one-line-per-message protocol. Every other process delegates through a
// remote proxy. Consumers see a single `LockHandle` interface either way.

pub mod client;
pub mod election;
pub mod locks;
pub mod proto;
pub mod server;

pub use client::RemoteProxy;
pub use election::{
    ElectionConfig, ElectionController, MarkerRecord, Role, DEFAULT_BASE_PORT, MARKER_FILE,
};
pub use locks::{
    ClientRef, CoordinatorProvider, EngineHub, Event, FolderEvents, LockCoordinator, LockHandle,
    LockQueueEngine, LockState, PeerId, ResourceId, Signal, StaticCoordinator,
};
pub use proto::PROTOCOL_MAGIC;
pub use server::CoordinatorServer;
