#![cfg(unix)]

mod common;

use common::spawn_process_daemon;
use futures_util::future::BoxFuture;
use fw_core::{
    beats::{BeatOutcome, BeatRegistry},
    config::ConfigStore,
    events::ServerEvent,
    registry::{MemoryProbe, ProcessRegistry},
    rpc::ControlClient,
    tail::{LogTailSpawner, RegistryTailSource, TailError, TailEvent, TailHandle, TailSource},
    viewers::ViewerHub,
};
use serde_json::json;
use std::{
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;

struct NoMemory;

impl MemoryProbe for NoMemory {
    fn resident_bytes(&self, _pid: u32) -> Option<u64> {
        None
    }
}

/// Counts how many followers the real source starts.
struct SpawnCounter {
    inner: RegistryTailSource,
    spawns: AtomicUsize,
}

impl TailSource for SpawnCounter {
    fn start<'a>(
        &'a self,
        uid: &'a str,
        events: mpsc::Sender<TailEvent>,
    ) -> BoxFuture<'a, Result<Box<dyn TailHandle>, TailError>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.inner.start(uid, events)
    }
}

async fn collect_spans(rx: &mut mpsc::Receiver<ServerEvent>, want: usize) -> String {
    let mut html = String::new();
    while html.matches("<span>").count() < want {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ServerEvent::Tail(payload))) => {
                assert_eq!(payload.uid, "42");
                html.push_str(&payload.msg);
            }
            other => panic!("expected tail event, got {other:?}"),
        }
    }
    html
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_viewer_joins_the_running_tail() {
    let root = tempfile::tempdir().expect("tempdir");
    let sock_dir = root.path().join("sock");
    std::fs::create_dir_all(&sock_dir).expect("sock dir");
    let log = root.path().join("app.log");
    std::fs::write(&log, "boot\n\nlistening on 8080\n   \nready\n").expect("log");
    let _daemon = spawn_process_daemon(
        &sock_dir.join("app.1400000000000abc.sock"),
        json!({"uid": 42, "pid": 4242, "logFile": log}),
    );

    let registry = ProcessRegistry::new(
        ControlClient::new(Duration::from_secs(1)),
        Arc::new(NoMemory),
    );
    let source = Arc::new(SpawnCounter {
        inner: RegistryTailSource::new(
            registry,
            ConfigStore::open(root.path()),
            root.path().to_path_buf(),
            LogTailSpawner::default(),
        ),
        spawns: AtomicUsize::new(0),
    });
    let beats = BeatRegistry::new(source.clone());
    let hub = ViewerHub::new(32);
    let (viewer_a, mut rx_a) = hub.channel();
    let (viewer_b, mut rx_b) = hub.channel();

    assert_eq!(beats.subscribe("42", viewer_a.clone()).await, BeatOutcome::Spawned);
    let backlog = collect_spans(&mut rx_a, 3).await;
    assert_eq!(
        backlog,
        "<span>boot</span><span>listening&nbsp;on 8080</span><span>ready</span>"
    );

    assert_eq!(beats.subscribe("42", viewer_b.clone()).await, BeatOutcome::Joined);
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log)
            .expect("open log");
        writeln!(file, "request served").expect("append");
    }
    assert_eq!(collect_spans(&mut rx_a, 1).await, "<span>request&nbsp;served</span>");
    assert_eq!(collect_spans(&mut rx_b, 1).await, "<span>request&nbsp;served</span>");
    assert_eq!(source.spawns.load(Ordering::SeqCst), 1);

    assert!(!beats.unsubscribe("42", viewer_a.id()).await);
    assert!(beats.unsubscribe("42", viewer_b.id()).await);
    assert_eq!(beats.session_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_uid_reports_an_error_line() {
    let root = tempfile::tempdir().expect("tempdir");
    let sock_dir = root.path().join("sock");
    std::fs::create_dir_all(&sock_dir).expect("sock dir");
    let _daemon = spawn_process_daemon(
        &sock_dir.join("app.1400000000000abc.sock"),
        json!({"uid": "other", "pid": 1, "logFile": "/nonexistent.log"}),
    );
    let registry = ProcessRegistry::new(
        ControlClient::new(Duration::from_secs(1)),
        Arc::new(NoMemory),
    );
    let beats = BeatRegistry::new(Arc::new(RegistryTailSource::new(
        registry,
        ConfigStore::open(root.path()),
        root.path().to_path_buf(),
        LogTailSpawner::default(),
    )));
    let hub = ViewerHub::default();
    let (viewer, mut rx) = hub.channel();

    assert_eq!(beats.subscribe("42", viewer).await, BeatOutcome::StartFailed);
    match rx.recv().await {
        Some(ServerEvent::Tail(payload)) => assert_eq!(
            payload.msg,
            "<span style=\"color: #ff0000\">Error: Cannot find forever process by UID: 42</span>"
        ),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(beats.session_count().await, 0);
}
