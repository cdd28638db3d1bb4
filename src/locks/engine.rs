// FIFO lock queue engine - the scheduling core of the folder lock coordinator
//
// The engine is deliberately pure: it owns the per-folder queues and
// subscriber sets, and every operation returns the signals the caller must
// deliver (grant, flush request, change notification). It never touches a
// socket or blocks; waiting for a grant is the caller's problem.

use log::{debug, error, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Fixed width of a folder resource identifier (identity hash + folder id,
/// concatenated without a separator).
pub const RESOURCE_ID_LEN: usize = 86;

/// Opaque identifier of a lockable folder. Always exactly 86 ASCII
/// characters; never decomposed by the lock subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

#[derive(Debug, thiserror::Error)]
#[error("resource id must be {RESOURCE_ID_LEN} printable ascii characters, got {0:?}")]
pub struct InvalidResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidResourceId> {
        let id = id.into();
        let ok = id.len() == RESOURCE_ID_LEN
            && id.bytes().all(|b| b.is_ascii() && !b.is_ascii_control());
        if ok {
            Ok(Self(id))
        } else {
            Err(InvalidResourceId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a lock client lives: in this process, or behind a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerId {
    Local,
    Conn(u64),
}

/// Correlation identity of a lock requester. The token is chosen by the
/// requester and never interpreted here, only stored and echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientRef {
    pub peer: PeerId,
    pub token: String,
}

impl ClientRef {
    pub fn local(token: impl Into<String>) -> Self {
        Self { peer: PeerId::Local, token: token.into() }
    }

    pub fn remote(conn: u64, token: impl Into<String>) -> Self {
        Self { peer: PeerId::Conn(conn), token: token.into() }
    }
}

impl fmt::Display for ClientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            PeerId::Local => write!(f, "local:{}", self.token),
            PeerId::Conn(id) => write!(f, "conn{}:{}", id, self.token),
        }
    }
}

/// State of one queue entry. At most the head entry is ever granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Exclusive, non-interruptible ownership.
    Locked,
    /// The holder volunteered to be preempted: the next `lock` arrival
    /// triggers a flush request instead of silently queueing.
    Interruptible,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    state: LockState,
    client: ClientRef,
}

/// An asynchronous notification the engine wants delivered to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The client now holds the lock.
    Granted,
    /// Someone is waiting; please finish up and unlock.
    FlushRequested,
    /// A subscribed folder was modified at `mtime`.
    FolderChanged { mtime: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub client: ClientRef,
    pub resource: ResourceId,
    pub event: Event,
}

impl Signal {
    fn new(client: &ClientRef, resource: &ResourceId, event: Event) -> Self {
        Self { client: client.clone(), resource: resource.clone(), event }
    }
}

/// FIFO lock scheduler for folder resources.
///
/// Not internally synchronized: the owner must serialize calls (see
/// `EngineHub`). Every operation is non-blocking and returns the signals to
/// deliver; misuse (unlock by a non-holder, etc.) is logged and reported as
/// a `false` return without any state change.
#[derive(Debug, Default)]
pub struct LockQueueEngine {
    queues: HashMap<ResourceId, VecDeque<QueueEntry>>,
    subscribers: HashMap<ResourceId, HashSet<ClientRef>>,
    /// Resources in whose queue each client has at least one entry, so that
    /// `clear_locks` never scans every queue.
    by_client: HashMap<ClientRef, HashSet<ResourceId>>,
}

impl LockQueueEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently register `client` for change notifications on `resource`.
    pub fn subscribe(&mut self, resource: &ResourceId, client: &ClientRef) {
        self.subscribers
            .entry(resource.clone())
            .or_default()
            .insert(client.clone());
    }

    /// Remove a subscription. Unsubscribing without a subscription is not an
    /// error, just noise worth a debug line.
    pub fn unsubscribe(&mut self, resource: &ResourceId, client: &ClientRef) {
        let removed = self
            .subscribers
            .get_mut(resource)
            .is_some_and(|set| set.remove(client));
        if !removed {
            debug!("{client} unsubscribed from {resource} without a subscription");
        }
        if self.subscribers.get(resource).is_some_and(HashSet::is_empty) {
            self.subscribers.remove(resource);
        }
    }

    /// Request exclusive ownership of `resource`.
    ///
    /// Grants immediately if the queue is empty, or if the head is this very
    /// client in the `Interruptible` state (self re-acquisition keeps the
    /// head position). Otherwise the client queues at the tail and, if the
    /// current holder is interruptible, that holder is asked to flush.
    pub fn lock(&mut self, resource: &ResourceId, client: &ClientRef) -> Vec<Signal> {
        let queue = self.queues.entry(resource.clone()).or_default();
        let mut signals = Vec::new();
        let head = queue.front().map(|e| (e.state, e.client.clone()));
        match head {
            None => {
                queue.push_back(QueueEntry { state: LockState::Locked, client: client.clone() });
                signals.push(Signal::new(client, resource, Event::Granted));
            }
            Some((LockState::Interruptible, ref holder)) if holder == client => {
                // Self re-acquisition before anyone else queued: promote in
                // place, keeping the head position.
                if let Some(entry) = queue.front_mut() {
                    entry.state = LockState::Locked;
                }
                debug!("{client} re-acquired interruptible lock on {resource}");
                signals.push(Signal::new(client, resource, Event::Granted));
            }
            Some((state, holder)) => {
                queue.push_back(QueueEntry { state: LockState::Locked, client: client.clone() });
                if state == LockState::Interruptible {
                    signals.push(Signal::new(&holder, resource, Event::FlushRequested));
                }
            }
        }
        self.by_client
            .entry(client.clone())
            .or_default()
            .insert(resource.clone());
        signals
    }

    /// The current holder voluntarily downgrades its grant to preemptible.
    ///
    /// If the very next waiter is the same client, the two entries coalesce:
    /// the head is popped and the lock re-granted without a round trip.
    pub fn partial_lock(
        &mut self,
        resource: &ResourceId,
        client: &ClientRef,
    ) -> (bool, Vec<Signal>) {
        let Some(queue) = self.queues.get_mut(resource) else {
            error!("{client} partial-locked {resource} which has no queue");
            return (false, Vec::new());
        };
        if queue.front().map(|e| &e.client) != Some(client) {
            error!("{client} partial-locked {resource} without holding it");
            return (false, Vec::new());
        }
        match queue.get(1).map(|e| e.client.clone()) {
            Some(next) if next == *client => {
                // The holder already queued its next lock: pop and re-grant
                // directly instead of bouncing through the interruptible state.
                queue.pop_front();
                (true, vec![Signal::new(client, resource, Event::Granted)])
            }
            _ => {
                if let Some(entry) = queue.front_mut() {
                    entry.state = LockState::Interruptible;
                }
                (true, Vec::new())
            }
        }
    }

    /// Release the head grant. `mtime` of `None` means the holder modified
    /// nothing; otherwise every subscriber except the holder is notified.
    pub fn unlock(
        &mut self,
        resource: &ResourceId,
        client: &ClientRef,
        mtime: Option<f64>,
    ) -> (bool, Vec<Signal>) {
        let Some(queue) = self.queues.get_mut(resource) else {
            error!("{client} unlocked {resource} which has no queue");
            return (false, Vec::new());
        };
        let Some(head) = queue.front() else {
            error!("{client} unlocked {resource} whose queue is empty");
            return (false, Vec::new());
        };
        if head.client != *client {
            error!("{client} unlocked {resource} held by {}", head.client);
            return (false, Vec::new());
        }
        if head.state == LockState::Locked && mtime.is_some() {
            warn!("{client} modified {resource} without the partial-lock step");
        }

        let mut signals = Vec::new();
        if let Some(mtime) = mtime {
            for subscriber in self.subscribers.get(resource).into_iter().flatten() {
                if subscriber != client {
                    signals.push(Signal::new(subscriber, resource, Event::FolderChanged { mtime }));
                }
            }
        }

        queue.pop_front();
        if let Some(next) = queue.front() {
            signals.push(Signal::new(&next.client, resource, Event::Granted));
        }
        let gone = !queue.iter().any(|e| e.client == *client);
        let empty = queue.is_empty();
        if gone {
            self.forget(client, resource);
        }
        if empty {
            self.queues.remove(resource);
        }
        (true, signals)
    }

    /// Remove every queue entry belonging to `client`, anywhere. Used when a
    /// client disconnects or shuts down. Queues whose granted head belonged
    /// to `client` grant their new head.
    pub fn clear_locks(&mut self, client: &ClientRef) -> Vec<Signal> {
        let mut signals = Vec::new();
        let Some(resources) = self.by_client.remove(client) else {
            return signals;
        };
        debug!("clearing {} queue(s) held by {client}", resources.len());
        for resource in resources {
            let Some(queue) = self.queues.get_mut(&resource) else {
                continue;
            };
            let was_head = queue.front().is_some_and(|e| e.client == *client);
            queue.retain(|e| e.client != *client);
            if was_head {
                if let Some(next) = queue.front() {
                    signals.push(Signal::new(&next.client, &resource, Event::Granted));
                }
            }
            if queue.is_empty() {
                self.queues.remove(&resource);
            }
        }
        signals
    }

    /// All clients of a server connection that still have queue entries.
    pub fn connection_clients(&self, conn: u64) -> Vec<ClientRef> {
        self.by_client
            .keys()
            .filter(|c| c.peer == PeerId::Conn(conn))
            .cloned()
            .collect()
    }

    /// Opportunistically drop the subscriptions of a dead connection so
    /// nobody keeps encoding notifications for it.
    pub fn drop_connection_subscriptions(&mut self, conn: u64) {
        for set in self.subscribers.values_mut() {
            set.retain(|c| c.peer != PeerId::Conn(conn));
        }
        self.subscribers.retain(|_, set| !set.is_empty());
    }

    fn forget(&mut self, client: &ClientRef, resource: &ResourceId) {
        if let Some(set) = self.by_client.get_mut(client) {
            set.remove(resource);
            if set.is_empty() {
                self.by_client.remove(client);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(tag: &str) -> ResourceId {
        let mut id = String::from(tag);
        while id.len() < RESOURCE_ID_LEN {
            id.push('0');
        }
        ResourceId::new(id).unwrap()
    }

    fn granted(signals: &[Signal]) -> Vec<ClientRef> {
        signals
            .iter()
            .filter(|s| s.event == Event::Granted)
            .map(|s| s.client.clone())
            .collect()
    }

    #[test]
    fn test_resource_id_validation() {
        assert!(ResourceId::new("short").is_err());
        assert!(ResourceId::new("a".repeat(RESOURCE_ID_LEN)).is_ok());
        assert!(ResourceId::new("\n".repeat(RESOURCE_ID_LEN)).is_err());
    }

    #[test]
    fn test_fifo_grant_order() {
        let mut engine = LockQueueEngine::new();
        let res = rid("r1");
        let a = ClientRef::local("a");
        let b = ClientRef::local("b");
        let c = ClientRef::local("c");

        assert_eq!(granted(&engine.lock(&res, &a)), vec![a.clone()]);
        assert!(granted(&engine.lock(&res, &b)).is_empty());
        assert!(granted(&engine.lock(&res, &c)).is_empty());

        let (ok, signals) = engine.unlock(&res, &a, None);
        assert!(ok);
        assert_eq!(granted(&signals), vec![b.clone()]);

        let (ok, signals) = engine.unlock(&res, &b, None);
        assert!(ok);
        assert_eq!(granted(&signals), vec![c.clone()]);

        let (ok, signals) = engine.unlock(&res, &c, None);
        assert!(ok);
        assert!(signals.is_empty());
    }

    #[test]
    fn test_self_reacquire_keeps_head_position() {
        let mut engine = LockQueueEngine::new();
        let res = rid("r1");
        let a = ClientRef::local("a");
        let b = ClientRef::local("b");

        engine.lock(&res, &a);
        engine.lock(&res, &b);
        let (ok, signals) = engine.partial_lock(&res, &a);
        assert!(ok);
        assert!(signals.is_empty());

        // A re-locks before B advances: promoted in place, B not granted.
        let signals = engine.lock(&res, &a);
        assert_eq!(granted(&signals), vec![a.clone()]);

        // A releasing now hands over to B as usual.
        let (_, signals) = engine.unlock(&res, &a, None);
        assert_eq!(granted(&signals), vec![b]);
    }

    #[test]
    fn test_partial_lock_coalesces_own_waiter() {
        let mut engine = LockQueueEngine::new();
        let res = rid("r1");
        let a = ClientRef::local("a");

        engine.lock(&res, &a);
        engine.lock(&res, &a); // queued behind itself
        let (ok, signals) = engine.partial_lock(&res, &a);
        assert!(ok);
        assert_eq!(granted(&signals), vec![a.clone()]);

        // Only one entry left now.
        let (ok, signals) = engine.unlock(&res, &a, None);
        assert!(ok);
        assert!(signals.is_empty());
        let (ok, _) = engine.unlock(&res, &a, None);
        assert!(!ok);
    }

    #[test]
    fn test_flush_requested_on_contended_interruptible_lock() {
        let mut engine = LockQueueEngine::new();
        let res = rid("r1");
        let a = ClientRef::local("a");
        let b = ClientRef::local("b");

        engine.lock(&res, &a);
        // No waiter yet: nothing is sent at partial-lock time.
        let (ok, signals) = engine.partial_lock(&res, &a);
        assert!(ok);
        assert!(signals.is_empty());

        // B arrives while A is interruptible: A is asked to flush at once.
        let signals = engine.lock(&res, &b);
        assert_eq!(
            signals,
            vec![Signal::new(&a, &res, Event::FlushRequested)]
        );

        let (_, signals) = engine.unlock(&res, &a, Some(1.5));
        assert_eq!(granted(&signals), vec![b]);
    }

    #[test]
    fn test_partial_lock_with_foreign_waiter_is_silent() {
        let mut engine = LockQueueEngine::new();
        let res = rid("r1");
        let a = ClientRef::local("a");
        let b = ClientRef::local("b");

        engine.lock(&res, &a);
        engine.lock(&res, &b);
        let (ok, signals) = engine.partial_lock(&res, &a);
        assert!(ok);
        assert!(signals.is_empty());
    }

    #[test]
    fn test_unlock_by_non_holder_changes_nothing() {
        let mut engine = LockQueueEngine::new();
        let r1 = rid("r1");
        let r2 = rid("r2");
        let a = ClientRef::local("a");
        let b = ClientRef::local("b");

        engine.lock(&r1, &a);
        engine.lock(&r2, &b);

        let (ok, signals) = engine.unlock(&r1, &b, None);
        assert!(!ok);
        assert!(signals.is_empty());
        let (ok, _) = engine.unlock(&r2, &a, Some(3.0));
        assert!(!ok);

        // Both queues intact: the real holders can still release.
        assert!(engine.unlock(&r1, &a, None).0);
        assert!(engine.unlock(&r2, &b, None).0);
    }

    #[test]
    fn test_partial_lock_by_non_holder_fails() {
        let mut engine = LockQueueEngine::new();
        let res = rid("r1");
        let a = ClientRef::local("a");
        let b = ClientRef::local("b");

        let (ok, _) = engine.partial_lock(&res, &a);
        assert!(!ok);

        engine.lock(&res, &a);
        engine.lock(&res, &b);
        let (ok, _) = engine.partial_lock(&res, &b);
        assert!(!ok);
    }

    #[test]
    fn test_change_notification_skips_the_unlocker() {
        let mut engine = LockQueueEngine::new();
        let res = rid("r1");
        let a = ClientRef::local("a");
        let b = ClientRef::local("b");
        let c = ClientRef::local("c");

        engine.subscribe(&res, &a);
        engine.subscribe(&res, &b);
        engine.subscribe(&res, &c);
        engine.unsubscribe(&res, &c);
        engine.unsubscribe(&res, &c); // absent: logged no-op

        engine.lock(&res, &a);
        let (ok, signals) = engine.unlock(&res, &a, Some(42.25));
        assert!(ok);
        assert_eq!(
            signals,
            vec![Signal::new(&b, &res, Event::FolderChanged { mtime: 42.25 })]
        );
    }

    #[test]
    fn test_clear_locks_regrants_across_resources() {
        let mut engine = LockQueueEngine::new();
        let r1 = rid("r1");
        let r2 = rid("r2");
        let c = ClientRef::remote(7, "c");
        let d = ClientRef::local("d");

        engine.lock(&r1, &c); // head of r1
        engine.lock(&r1, &d);
        engine.lock(&r2, &d); // head of r2
        engine.lock(&r2, &c); // queued on r2

        let signals = engine.clear_locks(&c);
        assert_eq!(granted(&signals), vec![d.clone()]);
        assert_eq!(signals[0].resource, r1);

        // r2 unaffected beyond removing C's queued entry.
        let (ok, signals) = engine.unlock(&r2, &d, None);
        assert!(ok);
        assert!(signals.is_empty());

        // Clearing again is a harmless no-op.
        assert!(engine.clear_locks(&c).is_empty());
    }

    #[test]
    fn test_connection_bookkeeping() {
        let mut engine = LockQueueEngine::new();
        let res = rid("r1");
        let c1 = ClientRef::remote(3, "x");
        let c2 = ClientRef::remote(3, "y");
        let other = ClientRef::remote(4, "z");

        engine.lock(&res, &c1);
        engine.lock(&res, &c2);
        engine.lock(&res, &other);
        engine.subscribe(&res, &c1);

        let mut clients = engine.connection_clients(3);
        clients.sort_by(|a, b| a.token.cmp(&b.token));
        assert_eq!(clients, vec![c1.clone(), c2.clone()]);

        for client in clients {
            engine.clear_locks(&client);
        }
        engine.drop_connection_subscriptions(3);

        // The surviving connection's client is now the holder.
        let (ok, _) = engine.unlock(&res, &other, None);
        assert!(ok);
    }
}
