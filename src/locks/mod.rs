// Folder lock subsystem: the queue engine, its serialization hub, and the
// consumer-facing handle.

pub mod engine;
pub mod handle;
pub mod hub;

pub use engine::{ClientRef, Event, LockQueueEngine, LockState, PeerId, ResourceId, Signal};
pub use handle::{CoordinatorProvider, FolderEvents, LockCoordinator, LockHandle, StaticCoordinator};
pub use hub::EngineHub;
