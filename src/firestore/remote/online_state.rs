use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;

use crate::firestore::error::FirestoreError;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::platform::runtime;

/// Connectivity state the remote store reports to query listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// No verdict yet; a watch stream connection is still being attempted.
    Unknown,
    Online,
    Offline,
}

/// Watch stream failures tolerated before reporting `Offline` without
/// waiting for the connect timeout below.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long a watch stream connection attempt gets before the tracker gives
/// up waiting and reports `Offline` on its own.
const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

struct TrackerState {
    online_state: OnlineState,
    watch_stream_failures: u32,
}

/// Debounces the raw watch stream open/close/error events into the
/// `OnlineState` observers actually care about, so a single dropped
/// connection doesn't flash the UI between online and offline.
pub struct OnlineStateTracker {
    state: Mutex<TrackerState>,
    syncer: Arc<dyn RemoteSyncer>,
    generation: AtomicU64,
}

impl OnlineStateTracker {
    pub fn new(syncer: Arc<dyn RemoteSyncer>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState {
                online_state: OnlineState::Unknown,
                watch_stream_failures: 0,
            }),
            syncer,
            generation: AtomicU64::new(0),
        })
    }

    pub async fn current(&self) -> OnlineState {
        self.state.lock().await.online_state
    }

    /// Called when a new watch stream connection attempt begins. Arms a
    /// timer that flips the state to `Offline` if the stream doesn't open
    /// (and start producing data) before it elapses.
    pub async fn handle_watch_stream_start(self: &Arc<Self>) {
        let already_online = {
            let mut state = self.state.lock().await;
            state.watch_stream_failures = 0;
            state.online_state == OnlineState::Online
        };
        if already_online {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        runtime::spawn_detached(async move {
            runtime::sleep(ONLINE_STATE_TIMEOUT).await;
            if this.generation.load(Ordering::SeqCst) == generation {
                this.transition(OnlineState::Offline).await;
            }
        });
    }

    /// Called for every watch stream failure while connecting or running.
    pub async fn handle_watch_stream_failure(self: &Arc<Self>, _error: &FirestoreError) {
        let should_go_offline = {
            let mut state = self.state.lock().await;
            state.watch_stream_failures += 1;
            state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES
        };
        if should_go_offline {
            self.transition(OnlineState::Offline).await;
        }
    }

    /// Called once the watch stream is confirmed healthy (handshake done,
    /// or a first watch change was received).
    pub async fn set_online(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.transition(OnlineState::Online).await;
    }

    /// Forces the state to `Offline`, e.g. when the caller disables network
    /// usage outright. Invalidates any pending connect-timeout timer.
    pub async fn set_offline(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock().await;
            state.watch_stream_failures = 0;
        }
        self.transition(OnlineState::Offline).await;
    }

    /// Forces the state back to `Unknown`, e.g. on shutdown, so listeners
    /// don't see a spurious `Offline` before the connection is torn down.
    pub async fn set_unknown(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock().await;
            state.watch_stream_failures = 0;
        }
        self.transition(OnlineState::Unknown).await;
    }

    async fn transition(self: &Arc<Self>, new_state: OnlineState) {
        let changed = {
            let mut state = self.state.lock().await;
            if new_state == OnlineState::Online {
                state.watch_stream_failures = 0;
            }
            let changed = state.online_state != new_state;
            state.online_state = new_state;
            changed
        };
        if changed {
            self.syncer.handle_online_state_change(new_state);
        }
    }
}
