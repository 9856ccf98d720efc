use crate::{
    beats::{BeatOutcome, BeatRegistry, HEARTBEAT_EXPIRY, SWEEP_INTERVAL},
    config::{ConfigError, ConfigStore, ForeverPaths},
    events::{ActionPayload, ServerEvent, ViewerRequest},
    refresh::{RefreshCoordinator, RefreshTimings, UNAVAILABLE_MESSAGE},
    registry::{MemoryProbe, ProcessRegistry},
    render::error_line_html,
    rpc::{ControlClient, DEFAULT_REPLY_TIMEOUT},
    stat::{SysinfoMemoryProbe, SysinfoSystemSource, SystemSource},
    tail::{LogTailSpawner, RegistryTailSource, TailSource},
    viewers::{ViewerHandle, ViewerHub, ViewerId, DEFAULT_VIEWER_QUEUE},
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};

pub const MANIPULATION_DISABLED: &str = "Process manipulation is disabled";

/// Collaborators and timings; anything left `None` gets the production
/// implementation.
pub struct DashboardOptions {
    pub reply_timeout: Duration,
    pub viewer_queue: usize,
    pub heartbeat_expiry: Duration,
    pub sweep_interval: Duration,
    pub refresh_timings: RefreshTimings,
    pub memory: Option<Arc<dyn MemoryProbe>>,
    pub system: Option<Arc<dyn SystemSource>>,
    pub tail_source: Option<Arc<dyn TailSource>>,
}

impl Default for DashboardOptions {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            viewer_queue: DEFAULT_VIEWER_QUEUE,
            heartbeat_expiry: HEARTBEAT_EXPIRY,
            sweep_interval: SWEEP_INTERVAL,
            refresh_timings: RefreshTimings::default(),
            memory: None,
            system: None,
            tail_source: None,
        }
    }
}

pub struct Dashboard {
    root: PathBuf,
    config: ConfigStore,
    registry: ProcessRegistry,
    viewers: Arc<ViewerHub>,
    beats: BeatRegistry,
    refresh: Arc<RefreshCoordinator>,
    shutdown: watch::Sender<bool>,
}

impl Dashboard {
    /// Wires every component around the registry root. The config store
    /// lives in `root` and is seeded with defaults.
    pub fn build(root: PathBuf, options: DashboardOptions) -> Result<Arc<Self>, ConfigError> {
        let config = ConfigStore::open(&root);
        config.seed(&root)?;

        let memory = options
            .memory
            .unwrap_or_else(|| Arc::new(SysinfoMemoryProbe::default()));
        let registry = ProcessRegistry::new(ControlClient::new(options.reply_timeout), memory);
        let viewers = Arc::new(ViewerHub::new(options.viewer_queue));
        let tail_source = options.tail_source.unwrap_or_else(|| {
            Arc::new(RegistryTailSource::new(
                registry.clone(),
                config.clone(),
                root.clone(),
                LogTailSpawner::default(),
            ))
        });
        let beats = BeatRegistry::with_timings(
            tail_source,
            options.heartbeat_expiry,
            options.sweep_interval,
        );
        let system = options
            .system
            .unwrap_or_else(|| Arc::new(SysinfoSystemSource::default()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let refresh = Arc::new(
            RefreshCoordinator::new(
                registry.clone(),
                viewers.clone(),
                system,
                config.clone(),
                root.clone(),
                shutdown_rx,
            )
            .with_timings(options.refresh_timings),
        );

        Ok(Arc::new(Self {
            root,
            config,
            registry,
            viewers,
            beats,
            refresh,
            shutdown,
        }))
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn viewers(&self) -> &Arc<ViewerHub> {
        &self.viewers
    }

    pub fn beats(&self) -> &BeatRegistry {
        &self.beats
    }

    pub fn refresh(&self) -> &Arc<RefreshCoordinator> {
        &self.refresh
    }

    pub fn paths(&self) -> ForeverPaths {
        self.config.forever_paths(&self.root)
    }

    pub async fn spawn_watch(&self) -> Option<JoinHandle<()>> {
        self.refresh.start_watch().await
    }

    /// Registers a viewer, replays the latest state to it and makes sure
    /// system sampling is running.
    pub async fn connect(&self, viewer: ViewerHandle) {
        let total = self.viewers.register(viewer.clone()).await;
        info!(event = "viewer_connected", viewer = viewer.id(), total);
        if let Some(snapshot) = self.refresh.last_procs().await {
            viewer.send(snapshot.to_event());
        }
        if let Some(stat) = self.refresh.last_stat().await {
            viewer.send(ServerEvent::SystemStat(stat));
        }
        self.refresh.ensure_sampling();
    }

    pub async fn disconnect(&self, viewer_id: ViewerId) {
        let remaining = self.viewers.unregister(viewer_id).await;
        let dropped = self.beats.drop_viewer(viewer_id).await;
        info!(
            event = "viewer_disconnected",
            viewer = viewer_id,
            remaining,
            sessions_closed = dropped
        );
    }

    pub async fn handle(&self, viewer: &ViewerHandle, request: ViewerRequest) {
        match request {
            ViewerRequest::TailBeat { uid } => {
                self.tail_beat(viewer, &uid).await;
            }
            ViewerRequest::TailDestroy { uid } => {
                self.beats.unsubscribe(&uid, viewer.id()).await;
            }
            ViewerRequest::Action { action, uid } => {
                self.action(viewer, &action, &uid).await;
            }
        }
    }

    pub async fn tail_beat(&self, viewer: &ViewerHandle, uid: &str) -> BeatOutcome {
        if !self.paths().sock_dir().is_dir() {
            viewer.send(ServerEvent::tail(uid, error_line_html(UNAVAILABLE_MESSAGE)));
        }
        self.beats.subscribe(uid, viewer.clone()).await
    }

    /// Runs a control action. Failures are echoed to the requesting viewer;
    /// success is left to the next refresh to show.
    pub async fn action(&self, viewer: &ViewerHandle, action: &str, uid: &str) -> bool {
        let result = if self.config.manipulation_enabled() {
            let sock_dir = self.paths().sock_dir();
            self.registry
                .action(&sock_dir, action, uid)
                .await
                .map_err(|err| err.to_string())
        } else {
            Err(MANIPULATION_DISABLED.to_string())
        };
        match result {
            Ok(_) => {
                info!(event = "dashboard_action", action, uid);
                true
            }
            Err(message) => {
                error!(event = "dashboard_action_failed", action, uid, error = %message);
                viewer.send(ServerEvent::Action(ActionPayload {
                    uid: uid.to_string(),
                    message,
                }));
                false
            }
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.beats.shutdown().await;
        info!(event = "dashboard_shutdown");
    }
}
