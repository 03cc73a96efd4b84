//! The shared-origin broadcast bus tabs coordinate over
//!
//! Browsers give same-origin execution contexts a broadcast channel; some
//! embeddings only have a persistent shared store with change
//! notifications. Both are modeled behind [`SessionBus`] so the
//! coordination logic never touches a host API directly and can be
//! exercised entirely in-process.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use aliri_braid::braid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use wicket::credential::SessionId;
use wicket_clock::{DurationSecs, UnixTime};

/// The identifier of a single open tab
#[braid(serde, ref_doc = "A borrowed reference to a [`TabId`]")]
pub struct TabId;

impl TabId {
    /// Generates a fresh, unordered tab identifier
    pub fn random() -> Self {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let raw: u64 = rng.gen();
        Self::new(format!("{raw:016x}"))
    }
}

/// A replicated change to the shared session state
///
/// Changes are applied locally first and broadcast after, so a tab never
/// reports a change as done elsewhere before confirming it at home.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StateChange {
    /// The countdown was paused
    Paused,
    /// The countdown was resumed
    Resumed,
    /// An authoritative remaining-seconds value to reconcile against
    Remaining(DurationSecs),
    /// The session was extended; the carried value is authoritative
    Extended(DurationSecs),
    /// The session was completed or explicitly ended
    Completed,
}

/// A message exchanged between tabs for one logical session
///
/// Every message names its origin tab so receivers can discard their own
/// broadcasts, and the session it belongs to so unrelated sessions sharing
/// a bus do not interfere.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BusMessage {
    /// A tab bids to become coordinator
    ClaimCoordinator {
        /// The session being coordinated
        session_id: SessionId,
        /// The bidding tab
        from: TabId,
    },
    /// The current coordinator asserting liveness
    CoordinatorHeartbeat {
        /// The session being coordinated
        session_id: SessionId,
        /// The coordinating tab
        from: TabId,
    },
    /// A coordinator relinquishing its duties (tab closing)
    CoordinatorReleased {
        /// The session being coordinated
        session_id: SessionId,
        /// The departing tab
        from: TabId,
    },
    /// A state change to replicate into every tab
    StateCorrection {
        /// The session the change belongs to
        session_id: SessionId,
        /// The originating tab
        from: TabId,
        /// The change to apply
        change: StateChange,
    },
    /// A non-coordinator tab asking the coordinator to extend the session
    ExtendRequest {
        /// The session to extend
        session_id: SessionId,
        /// The requesting tab
        from: TabId,
        /// Minutes of extension requested
        additional_minutes: u64,
    },
    /// A non-coordinator tab asking the coordinator to complete the session
    CompleteRequest {
        /// The session to complete
        session_id: SessionId,
        /// The requesting tab
        from: TabId,
        /// Minutes of actual usage to report, when the host tracks it
        actual_usage_minutes: Option<u64>,
    },
}

impl BusMessage {
    /// The tab that published the message
    pub fn from(&self) -> &TabIdRef {
        match self {
            Self::ClaimCoordinator { from, .. }
            | Self::CoordinatorHeartbeat { from, .. }
            | Self::CoordinatorReleased { from, .. }
            | Self::StateCorrection { from, .. }
            | Self::ExtendRequest { from, .. }
            | Self::CompleteRequest { from, .. } => from,
        }
    }

    /// The session the message belongs to
    pub fn session_id(&self) -> &wicket::credential::SessionIdRef {
        match self {
            Self::ClaimCoordinator { session_id, .. }
            | Self::CoordinatorHeartbeat { session_id, .. }
            | Self::CoordinatorReleased { session_id, .. }
            | Self::StateCorrection { session_id, .. }
            | Self::ExtendRequest { session_id, .. }
            | Self::CompleteRequest { session_id, .. } => session_id,
        }
    }
}

/// The bus could not accept a publication
#[derive(Debug, Error)]
pub enum BusError {
    /// The underlying channel or store is gone
    ///
    /// Losing the bus is non-fatal to a tab: it degrades to an
    /// independent countdown and periodically retries joining.
    #[error("broadcast bus unavailable")]
    Unavailable,
}

/// A same-origin broadcast bus
///
/// Publications are delivered to every other subscribed context. Delivery
/// to the publisher's own subscription may occur and is filtered by
/// origin tab instead.
pub trait SessionBus: Send + Sync + 'static {
    /// Publishes a message to all subscribed contexts
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is no longer available.
    fn publish(&self, msg: BusMessage) -> Result<(), BusError>;

    /// Opens a new subscription to the bus
    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;
}

impl<B: SessionBus + ?Sized> SessionBus for Arc<B> {
    fn publish(&self, msg: BusMessage) -> Result<(), BusError> {
        B::publish(self, msg)
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        B::subscribe(self)
    }
}

/// An in-process broadcast bus
///
/// Stands in for the browser broadcast channel when every "tab" lives in
/// the same process, and is the bus used throughout the engine's tests.
#[derive(Clone, Debug)]
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    /// Creates a bus retaining up to `capacity` undelivered messages per
    /// subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl SessionBus for MemoryBus {
    fn publish(&self, msg: BusMessage) -> Result<(), BusError> {
        // A send with no subscribers is not a failure; there is simply
        // no one to tell.
        let _ = self.tx.send(msg);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

/// A timestamped entry in a shared store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// The serialized payload
    pub value: String,
    /// When the entry was written, so readers can discard stale state
    pub written_at: UnixTime,
}

/// A persistent, eventually-consistent shared store with change events
///
/// Models a `localStorage`-like facility for contexts without a broadcast
/// channel: writes are append/overwrite-only and every write carries a
/// timestamp.
pub trait SharedStore: Send + Sync + 'static {
    /// Writes (or overwrites) an entry
    fn put(&self, key: &str, entry: StoredEntry);

    /// Reads an entry
    fn get(&self, key: &str) -> Option<StoredEntry>;

    /// Subscribes to the keys of changed entries
    fn changes(&self) -> broadcast::Receiver<String>;
}

/// An in-memory [`SharedStore`]
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
    changed: broadcast::Sender<String>,
}

impl MemoryStore {
    /// Creates an empty store
    pub fn new() -> Self {
        let (changed, _) = broadcast::channel(64);
        Self {
            entries: Mutex::new(HashMap::new()),
            changed,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore for MemoryStore {
    fn put(&self, key: &str, entry: StoredEntry) {
        self.entries
            .lock()
            .expect("store lock")
            .insert(key.to_owned(), entry);
        let _ = self.changed.send(key.to_owned());
    }

    fn get(&self, key: &str) -> Option<StoredEntry> {
        self.entries.lock().expect("store lock").get(key).cloned()
    }

    fn changes(&self) -> broadcast::Receiver<String> {
        self.changed.subscribe()
    }
}

const STORE_KEY_PREFIX: &str = "wicket.bus.";

/// A [`SessionBus`] built on a [`SharedStore`]
///
/// The fallback path for contexts without a broadcast channel: each
/// publication is written under a per-session key and re-read on the
/// store's change event. Entries older than the subscriber's join time
/// are discarded as stale.
pub struct StoreBus<S> {
    store: Arc<S>,
    fanout: broadcast::Sender<BusMessage>,
    _listener: tokio::task::JoinHandle<()>,
}

impl<S: SharedStore> StoreBus<S> {
    /// Wraps a shared store, spawning the change listener
    pub fn new(store: Arc<S>, joined_at: UnixTime) -> Self {
        let (fanout, _) = broadcast::channel(64);
        let listener = tokio::spawn(listen(Arc::clone(&store), fanout.clone(), joined_at));
        Self {
            store,
            fanout,
            _listener: listener,
        }
    }
}

impl<S> std::fmt::Debug for StoreBus<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StoreBus").finish_non_exhaustive()
    }
}

impl<S> Drop for StoreBus<S> {
    fn drop(&mut self) {
        self._listener.abort();
    }
}

async fn listen<S: SharedStore>(
    store: Arc<S>,
    fanout: broadcast::Sender<BusMessage>,
    joined_at: UnixTime,
) {
    let mut changes = store.changes();
    loop {
        let key = match changes.recv().await {
            Ok(key) => key,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "store change stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if !key.starts_with(STORE_KEY_PREFIX) {
            continue;
        }

        let Some(entry) = store.get(&key) else {
            continue;
        };
        if entry.written_at < joined_at {
            tracing::trace!(%key, "discarding stale store entry");
            continue;
        }

        match serde_json::from_str::<BusMessage>(&entry.value) {
            Ok(msg) => {
                let _ = fanout.send(msg);
            }
            Err(error) => {
                tracing::warn!(%key, %error, "unintelligible store entry ignored");
            }
        }
    }
}

impl<S: SharedStore> SessionBus for StoreBus<S> {
    fn publish(&self, msg: BusMessage) -> Result<(), BusError> {
        let key = format!("{STORE_KEY_PREFIX}{}", msg.session_id());
        let value = serde_json::to_string(&msg).map_err(|_| BusError::Unavailable)?;
        self.store.put(
            &key,
            StoredEntry {
                value,
                written_at: UnixTime::from(std::time::SystemTime::now()),
            },
        );
        // Change events do not echo back through our own fanout listener
        // fast enough to matter, but same-context delivery is filtered by
        // origin tab anyway.
        let _ = self.fanout.send(msg);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.fanout.subscribe()
    }
}
