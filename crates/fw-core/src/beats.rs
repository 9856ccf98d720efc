//! Shared tail sessions keyed by process uid.
//!
//! Every uid has at most one follower no matter how many viewers watch it.
//! Viewers keep a session alive by beating; sessions nobody beats for
//! longer than the expiry are torn down by a sweeper task that only runs
//! while sessions exist.

use crate::{
    events::ServerEvent,
    render::{error_line_html, tail_lines_html},
    tail::{TailEvent, TailHandle, TailSource},
    viewers::{ViewerHandle, ViewerId},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::Instant,
};
use tracing::{debug, info, warn};

pub const HEARTBEAT_EXPIRY: Duration = Duration::from_millis(4000);
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(4000);
const TAIL_EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatOutcome {
    /// A new session was created and its follower started.
    Spawned,
    /// The viewer joined (or re-beat) an existing session.
    Joined,
    /// The follower could not start; viewers got an error line.
    StartFailed,
    /// The session went away while the follower was starting.
    Abandoned,
}

enum SessionState {
    Pending,
    Active(Box<dyn TailHandle>),
    Failed,
}

struct Session {
    generation: u64,
    last_beat: Instant,
    viewers: HashMap<ViewerId, ViewerHandle>,
    state: SessionState,
}

impl Session {
    fn teardown(self, uid: &str, reason: &'static str) {
        if let SessionState::Active(handle) = self.state {
            handle.terminate();
        }
        info!(event = "beat_destroyed", uid, reason);
    }
}

#[derive(Default)]
struct BeatState {
    sessions: HashMap<String, Session>,
    /// Held across `TailSource::start` so starts for one uid never overlap,
    /// even when a session is recreated while an older start is pending.
    start_locks: HashMap<String, Arc<Mutex<()>>>,
    next_generation: u64,
    sweeper_running: bool,
}

struct BeatInner {
    source: Arc<dyn TailSource>,
    expiry: Duration,
    sweep_interval: Duration,
    state: Mutex<BeatState>,
}

#[derive(Clone)]
pub struct BeatRegistry {
    inner: Arc<BeatInner>,
}

impl BeatRegistry {
    pub fn new(source: Arc<dyn TailSource>) -> Self {
        Self::with_timings(source, HEARTBEAT_EXPIRY, SWEEP_INTERVAL)
    }

    pub fn with_timings(
        source: Arc<dyn TailSource>,
        expiry: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BeatInner {
                source,
                expiry,
                sweep_interval,
                state: Mutex::new(BeatState::default()),
            }),
        }
    }

    /// Subscribes `viewer` to `uid` or refreshes its heartbeat. Only the
    /// call that creates the session starts a follower; the state lock is
    /// not held while it starts.
    pub async fn subscribe(&self, uid: &str, viewer: ViewerHandle) -> BeatOutcome {
        let (generation, start_lock) = {
            let mut state = self.inner.state.lock().await;
            if let Some(session) = state.sessions.get_mut(uid) {
                session.viewers.entry(viewer.id()).or_insert_with(|| viewer.clone());
                session.last_beat = Instant::now();
                return BeatOutcome::Joined;
            }

            state.next_generation += 1;
            let generation = state.next_generation;
            let mut viewers = HashMap::new();
            viewers.insert(viewer.id(), viewer.clone());
            state.sessions.insert(
                uid.to_string(),
                Session {
                    generation,
                    last_beat: Instant::now(),
                    viewers,
                    state: SessionState::Pending,
                },
            );
            if !state.sweeper_running {
                state.sweeper_running = true;
                tokio::spawn(sweep_loop(self.inner.clone()));
            }
            let start_lock = state
                .start_locks
                .entry(uid.to_string())
                .or_default()
                .clone();
            (generation, start_lock)
        };
        info!(event = "beat_created", uid, viewer = viewer.id());

        let _starting = start_lock.lock().await;
        let started = if self.inner.is_current(uid, generation).await {
            let (tx, rx) = mpsc::channel(TAIL_EVENT_QUEUE);
            Some((self.inner.source.start(uid, tx).await, rx))
        } else {
            None
        };

        let mut state = self.inner.state.lock().await;
        // Only the map and this call still hold the lock: nobody waits on it.
        if Arc::strong_count(&start_lock) == 2 {
            state.start_locks.remove(uid);
        }
        let Some((started, rx)) = started else {
            drop(state);
            debug!(event = "beat_start_skipped", uid);
            return BeatOutcome::Abandoned;
        };
        let current = state
            .sessions
            .get(uid)
            .is_some_and(|session| session.generation == generation);
        match started {
            Ok(handle) if current => {
                if let Some(session) = state.sessions.get_mut(uid) {
                    session.state = SessionState::Active(handle);
                }
                drop(state);
                tokio::spawn(fan_out(self.inner.clone(), uid.to_string(), generation, rx));
                BeatOutcome::Spawned
            }
            Ok(handle) => {
                handle.terminate();
                drop(state);
                debug!(event = "beat_start_abandoned", uid);
                BeatOutcome::Abandoned
            }
            Err(err) => {
                let targets = if current {
                    state
                        .sessions
                        .remove(uid)
                        .map(|session| session.viewers.into_values().collect::<Vec<_>>())
                        .unwrap_or_default()
                } else {
                    vec![viewer]
                };
                drop(state);
                warn!(event = "beat_start_failed", uid, error = %err);
                let line = error_line_html(&err.to_string());
                for target in targets {
                    target.send(ServerEvent::tail(uid, line.clone()));
                }
                BeatOutcome::StartFailed
            }
        }
    }

    /// Removes the viewer; the session is torn down at once when it was the
    /// last one. Returns whether the session was destroyed.
    pub async fn unsubscribe(&self, uid: &str, viewer_id: ViewerId) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().await;
            let Some(session) = state.sessions.get_mut(uid) else {
                return false;
            };
            session.viewers.remove(&viewer_id);
            if session.viewers.is_empty() {
                state.sessions.remove(uid)
            } else {
                None
            }
        };
        match removed {
            Some(session) => {
                session.teardown(uid, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Detaches a disconnected viewer from every session.
    pub async fn drop_viewer(&self, viewer_id: ViewerId) -> usize {
        let removed = {
            let mut state = self.inner.state.lock().await;
            let mut emptied = Vec::new();
            for (uid, session) in state.sessions.iter_mut() {
                if session.viewers.remove(&viewer_id).is_some() && session.viewers.is_empty() {
                    emptied.push(uid.clone());
                }
            }
            emptied
                .into_iter()
                .filter_map(|uid| state.sessions.remove(&uid).map(|session| (uid, session)))
                .collect::<Vec<_>>()
        };
        let count = removed.len();
        for (uid, session) in removed {
            session.teardown(&uid, "viewer_disconnected");
        }
        count
    }

    /// Expires sessions whose last beat is older than the expiry.
    pub async fn sweep_once(&self) -> Vec<String> {
        self.inner.sweep(Instant::now()).await.0
    }

    pub async fn shutdown(&self) {
        let sessions = {
            let mut state = self.inner.state.lock().await;
            state.sessions.drain().collect::<Vec<_>>()
        };
        for (uid, session) in sessions {
            session.teardown(&uid, "shutdown");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner.state.lock().await.sessions.len()
    }

    pub async fn viewer_count(&self, uid: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .get(uid)
            .map_or(0, |session| session.viewers.len())
    }

    pub async fn is_following(&self, uid: &str) -> bool {
        matches!(
            self.inner.state.lock().await.sessions.get(uid),
            Some(Session {
                state: SessionState::Active(_),
                ..
            })
        )
    }

    pub async fn sweeper_running(&self) -> bool {
        self.inner.state.lock().await.sweeper_running
    }
}

impl BeatInner {
    async fn is_current(&self, uid: &str, generation: u64) -> bool {
        self.state
            .lock()
            .await
            .sessions
            .get(uid)
            .is_some_and(|session| session.generation == generation)
    }

    /// Returns the expired uids and whether the sweeper should keep going.
    async fn sweep(&self, now: Instant) -> (Vec<String>, bool) {
        let (expired, keep_running) = {
            let mut state = self.state.lock().await;
            let stale = state
                .sessions
                .iter()
                .filter(|(_, session)| now.saturating_duration_since(session.last_beat) > self.expiry)
                .map(|(uid, _)| uid.clone())
                .collect::<Vec<_>>();
            let expired = stale
                .into_iter()
                .filter_map(|uid| state.sessions.remove(&uid).map(|session| (uid, session)))
                .collect::<Vec<_>>();
            let keep_running = !state.sessions.is_empty();
            (expired, keep_running)
        };
        let uids = expired.iter().map(|(uid, _)| uid.clone()).collect();
        for (uid, session) in expired {
            session.teardown(&uid, "expired");
        }
        (uids, keep_running)
    }
}

async fn sweep_loop(inner: Arc<BeatInner>) {
    debug!(event = "beat_sweeper_started");
    loop {
        tokio::time::sleep(inner.sweep_interval).await;
        let (_, keep_running) = inner.sweep(Instant::now()).await;
        if keep_running {
            continue;
        }
        let mut state = inner.state.lock().await;
        // A subscribe may have slipped in after the sweep released the lock.
        if state.sessions.is_empty() {
            state.sweeper_running = false;
            break;
        }
    }
    debug!(event = "beat_sweeper_stopped");
}

async fn fan_out(
    inner: Arc<BeatInner>,
    uid: String,
    generation: u64,
    mut events: mpsc::Receiver<TailEvent>,
) {
    while let Some(event) = events.recv().await {
        let viewers = {
            let mut state = inner.state.lock().await;
            let Some(session) = state
                .sessions
                .get_mut(&uid)
                .filter(|session| session.generation == generation)
            else {
                break;
            };
            if matches!(event, TailEvent::Failed(_)) {
                if let SessionState::Active(handle) =
                    std::mem::replace(&mut session.state, SessionState::Failed)
                {
                    handle.terminate();
                }
            }
            session.viewers.values().cloned().collect::<Vec<_>>()
        };

        let msg = match &event {
            TailEvent::Lines(lines) => tail_lines_html(lines),
            TailEvent::Failed(message) => {
                warn!(event = "beat_tail_failed", uid = %uid, message = %message);
                error_line_html(message)
            }
        };
        for viewer in viewers {
            if !viewer.send(ServerEvent::tail(uid.as_str(), msg.as_str())) {
                debug!(event = "beat_viewer_send_failed", uid = %uid, viewer = viewer.id());
            }
        }
    }
    debug!(event = "beat_fan_out_finished", uid = %uid);
}
