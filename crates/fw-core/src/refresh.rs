use crate::{
    config::{ConfigStore, ForeverPaths},
    events::ServerEvent,
    registry::{ProcessDescriptor, ProcessRegistry},
    stat::{SystemSnapshot, SystemSource},
    viewers::ViewerHub,
};
use notify::{RecursiveMode, Watcher};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

pub const REFRESH_DEBOUNCE: Duration = Duration::from_millis(500);
pub const SEED_DELAY: Duration = Duration::from_millis(1000);
pub const UNAVAILABLE_MESSAGE: &str = "The socket directory does not exist, it is due to locate forever root failed, try to set it by `fw-hub config set forever [ROOT]`";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTimings {
    pub debounce: Duration,
    pub seed_delay: Duration,
}

impl Default for RefreshTimings {
    fn default() -> Self {
        Self {
            debounce: REFRESH_DEBOUNCE,
            seed_delay: SEED_DELAY,
        }
    }
}

/// What viewers see in the process table: a listing, or a status line when
/// no listing is possible.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcsSnapshot {
    Procs(Vec<ProcessDescriptor>),
    Info(String),
}

impl ProcsSnapshot {
    pub fn to_event(&self) -> ServerEvent {
        match self {
            ProcsSnapshot::Procs(procs) => ServerEvent::Procs(procs.clone()),
            ProcsSnapshot::Info(message) => ServerEvent::Info(message.clone()),
        }
    }
}

pub struct RefreshCoordinator {
    registry: ProcessRegistry,
    viewers: Arc<ViewerHub>,
    system: Arc<dyn SystemSource>,
    config: ConfigStore,
    fallback_root: PathBuf,
    timings: RefreshTimings,
    shutdown: watch::Receiver<bool>,
    last_procs: RwLock<Option<ProcsSnapshot>>,
    last_stat: RwLock<Option<SystemSnapshot>>,
    sampling: AtomicBool,
}

impl RefreshCoordinator {
    pub fn new(
        registry: ProcessRegistry,
        viewers: Arc<ViewerHub>,
        system: Arc<dyn SystemSource>,
        config: ConfigStore,
        fallback_root: PathBuf,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            viewers,
            system,
            config,
            fallback_root,
            timings: RefreshTimings::default(),
            shutdown,
            last_procs: RwLock::new(None),
            last_stat: RwLock::new(None),
            sampling: AtomicBool::new(false),
        }
    }

    pub fn with_timings(mut self, timings: RefreshTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn paths(&self) -> ForeverPaths {
        self.config.forever_paths(&self.fallback_root)
    }

    pub async fn last_procs(&self) -> Option<ProcsSnapshot> {
        self.last_procs.read().await.clone()
    }

    pub async fn last_stat(&self) -> Option<SystemSnapshot> {
        self.last_stat.read().await.clone()
    }

    pub fn sampling_running(&self) -> bool {
        self.sampling.load(Ordering::SeqCst)
    }

    /// Lists the socket directory and broadcasts the result. A failed
    /// listing is broadcast as an info line and does not replace the last
    /// good snapshot.
    pub async fn refresh_once(&self) -> ProcsSnapshot {
        let sock_dir = self.paths().sock_dir();
        let snapshot = match self.registry.list(&sock_dir, true).await {
            Ok(procs) => {
                debug!(event = "refresh_listed", count = procs.len());
                let snapshot = ProcsSnapshot::Procs(procs);
                *self.last_procs.write().await = Some(snapshot.clone());
                snapshot
            }
            Err(err) => {
                warn!(event = "refresh_list_failed", error = %err);
                ProcsSnapshot::Info(format!("Error: {err}"))
            }
        };
        self.viewers.broadcast(snapshot.to_event()).await;
        snapshot
    }

    async fn mark_unavailable(&self) {
        let snapshot = ProcsSnapshot::Info(UNAVAILABLE_MESSAGE.to_string());
        *self.last_procs.write().await = Some(snapshot.clone());
        self.viewers.broadcast(snapshot.to_event()).await;
    }

    /// Starts watching the pid directory. When the registry root is missing
    /// the unavailable message is published once and nothing is watched.
    pub async fn start_watch(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let paths = self.paths();
        if !paths.is_available() {
            warn!(event = "refresh_root_missing", root = %paths.root().display());
            self.mark_unavailable().await;
            return None;
        }

        let pids_dir = paths.pids_dir();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
        let watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = event_tx.send(());
            }
        }) {
            Ok(mut watcher) => match watcher.watch(&pids_dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    info!(event = "refresh_watching", dir = %pids_dir.display());
                    Some(watcher)
                }
                Err(err) => {
                    error!(event = "refresh_watch_failed", dir = %pids_dir.display(), error = %err);
                    None
                }
            },
            Err(err) => {
                error!(event = "refresh_watch_failed", dir = %pids_dir.display(), error = %err);
                None
            }
        };

        let coordinator = self.clone();
        Some(tokio::spawn(async move {
            let _watcher = watcher;
            coordinator.debounce_loop(event_rx).await;
        }))
    }

    async fn debounce_loop(&self, mut events: mpsc::UnboundedReceiver<()>) {
        let mut shutdown = self.shutdown.clone();
        let seed = tokio::time::sleep(self.timings.seed_delay);
        tokio::pin!(seed);
        let mut seeded = false;
        let mut pending = false;
        let mut events_open = true;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv(), if events_open => {
                    match event {
                        Some(()) => pending = true,
                        None => events_open = false,
                    }
                }
                _ = &mut seed, if !seeded => {
                    seeded = true;
                    self.refresh_once().await;
                }
                _ = tokio::time::sleep(self.timings.debounce), if pending => {
                    pending = false;
                    debug!(event = "refresh_debounced");
                    self.refresh_once().await;
                }
            }
        }
        debug!(event = "refresh_watch_stopped");
    }

    /// Starts the sampling loop unless it is already running.
    pub fn ensure_sampling(self: &Arc<Self>) -> bool {
        if self.sampling.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!(event = "sampling_started");
        tokio::spawn(self.clone().sampling_loop());
        true
    }

    pub async fn sample_once(&self) -> Option<SystemSnapshot> {
        match self.system.sample().await {
            Ok(snapshot) => {
                *self.last_stat.write().await = Some(snapshot.clone());
                self.viewers
                    .broadcast(ServerEvent::SystemStat(snapshot.clone()))
                    .await;
                Some(snapshot)
            }
            Err(err) => {
                error!(event = "sampling_failed", error = %err);
                None
            }
        }
    }

    async fn sampling_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            self.sample_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.refresh_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.sampling.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
            if self.viewers.count().await > 0 {
                continue;
            }
            self.sampling.store(false, Ordering::SeqCst);
            // A viewer may have connected after the count; if nobody else
            // restarted the loop, keep this one.
            if self.viewers.count().await == 0 || self.sampling.swap(true, Ordering::SeqCst) {
                break;
            }
        }
        debug!(event = "sampling_stopped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        registry::MemoryProbe,
        rpc::ControlClient,
        stat::{MemoryTotals, StatError},
        viewers::ViewerHandle,
    };
    use chrono::Utc;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;

    struct NoMemory;

    impl MemoryProbe for NoMemory {
        fn resident_bytes(&self, _pid: u32) -> Option<u64> {
            None
        }
    }

    #[derive(Default)]
    struct CountingSystem {
        samples: AtomicUsize,
    }

    impl SystemSource for CountingSystem {
        fn sample(&self) -> BoxFuture<'_, Result<SystemSnapshot, StatError>> {
            let n = self.samples.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Ok(SystemSnapshot {
                    hostname: "host".into(),
                    platform: "linux".into(),
                    arch: "x86_64".into(),
                    release: "6.0".into(),
                    cpus: Vec::new(),
                    uptime: n as u64,
                    memory: MemoryTotals::new(1, 2),
                    cpu: 12.5,
                    sampled_at: Utc::now(),
                })
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        viewers: Arc<ViewerHub>,
        system: Arc<CountingSystem>,
        coordinator: Arc<RefreshCoordinator>,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture(create_dirs: bool, timings: RefreshTimings) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        if create_dirs {
            std::fs::create_dir_all(root.join("sock")).expect("sock");
            std::fs::create_dir_all(root.join("pids")).expect("pids");
        }
        let config = ConfigStore::open(&root);
        config.set("refresh", 40u64).expect("config");
        let viewers = Arc::new(ViewerHub::new(64));
        let system = Arc::new(CountingSystem::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = ProcessRegistry::new(
            ControlClient::new(Duration::from_millis(200)),
            Arc::new(NoMemory),
        );
        let coordinator = Arc::new(
            RefreshCoordinator::new(
                registry,
                viewers.clone(),
                system.clone(),
                config,
                root.clone(),
                shutdown_rx,
            )
            .with_timings(timings),
        );
        Fixture {
            _dir: dir,
            root,
            viewers,
            system,
            coordinator,
            _shutdown: shutdown_tx,
        }
    }

    async fn connect(hub: &ViewerHub) -> (ViewerHandle, mpsc::Receiver<ServerEvent>) {
        let (handle, rx) = hub.channel();
        hub.register(handle.clone()).await;
        (handle, rx)
    }

    fn drain_procs(rx: &mut mpsc::Receiver<ServerEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ServerEvent::Procs(_)) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_of_events_triggers_one_refresh() {
        let fx = fixture(
            true,
            RefreshTimings {
                debounce: Duration::from_millis(100),
                seed_delay: Duration::from_secs(60),
            },
        );
        let (_viewer, mut rx) = connect(&fx.viewers).await;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let coordinator = fx.coordinator.clone();
        let task = tokio::spawn(async move { coordinator.debounce_loop(event_rx).await });

        for _ in 0..5 {
            event_tx.send(()).expect("event");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(drain_procs(&mut rx), 1);

        event_tx.send(()).expect("event");
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(drain_procs(&mut rx), 1);
        assert_eq!(
            fx.coordinator.last_procs().await,
            Some(ProcsSnapshot::Procs(Vec::new()))
        );
        task.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seed_listing_runs_after_delay() {
        let fx = fixture(
            true,
            RefreshTimings {
                debounce: Duration::from_millis(50),
                seed_delay: Duration::from_millis(50),
            },
        );
        let (_viewer, mut rx) = connect(&fx.viewers).await;
        let task = fx.coordinator.start_watch().await.expect("watching");
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("seed");
        assert_eq!(event, Some(ServerEvent::Procs(Vec::new())));

        std::fs::write(fx.root.join("pids").join("app.pid"), "123").expect("pid");
        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("refresh");
        assert_eq!(event, Some(ServerEvent::Procs(Vec::new())));
        task.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_root_publishes_unavailable_once() {
        let fx = fixture(false, RefreshTimings::default());
        let (_viewer, mut rx) = connect(&fx.viewers).await;
        assert!(fx.coordinator.start_watch().await.is_none());
        assert_eq!(
            rx.try_recv().ok(),
            Some(ServerEvent::Info(UNAVAILABLE_MESSAGE.to_string()))
        );
        assert_eq!(
            fx.coordinator.last_procs().await,
            Some(ProcsSnapshot::Info(UNAVAILABLE_MESSAGE.to_string()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listing_error_is_broadcast_as_info() {
        let fx = fixture(false, RefreshTimings::default());
        let (_viewer, mut rx) = connect(&fx.viewers).await;
        let snapshot = fx.coordinator.refresh_once().await;
        match snapshot {
            ProcsSnapshot::Info(message) => assert!(message.starts_with("Error: ")),
            other => panic!("unexpected snapshot: {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Info(_))));
        assert!(fx.coordinator.last_procs().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sampling_stops_after_last_viewer_leaves() {
        let fx = fixture(true, RefreshTimings::default());
        let (viewer, mut rx) = connect(&fx.viewers).await;

        assert!(fx.coordinator.ensure_sampling());
        assert!(!fx.coordinator.ensure_sampling());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fx.system.samples.load(Ordering::SeqCst) >= 2);
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::SystemStat(_))));
        assert!(fx.coordinator.last_stat().await.is_some());

        fx.viewers.unregister(viewer.id()).await;
        for _ in 0..50 {
            if !fx.coordinator.sampling_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!fx.coordinator.sampling_running());
        let settled = fx.system.samples.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fx.system.samples.load(Ordering::SeqCst), settled);
    }
}
