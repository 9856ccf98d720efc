#![cfg(unix)]

mod common;

use common::{make_stale_socket, spawn_process_daemon};
use fw_core::{
    registry::{MemoryProbe, ProcessRegistry},
    rpc::ControlClient,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

struct StaticMemory;

impl MemoryProbe for StaticMemory {
    fn resident_bytes(&self, pid: u32) -> Option<u64> {
        Some(u64::from(pid) * 1024)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_live_sockets_and_one_stale_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let newer = dir.path().join("api.1400000000002xyz.sock");
    let stale = dir.path().join("old.1400000000001abc.sock");
    let older = dir.path().join("worker.1400000000000def.sock");

    let _newer = spawn_process_daemon(
        &newer,
        json!({"uid": "api", "pid": 2, "logFile": "/var/log/api.log"}),
    );
    let _older = spawn_process_daemon(
        &older,
        json!({"uid": "worker", "pid": 1, "logFile": "/var/log/worker.log"}),
    );
    make_stale_socket(&stale);

    let registry = ProcessRegistry::new(
        ControlClient::new(Duration::from_secs(1)),
        Arc::new(StaticMemory),
    );
    let procs = registry.list(dir.path(), true).await.expect("list");

    let uids = procs.iter().map(|p| p.uid.as_str()).collect::<Vec<_>>();
    assert_eq!(uids, vec!["worker", "api"]);
    assert_eq!(procs[0].socket, older);
    assert_eq!(procs[1].memory.as_deref(), Some("2048"));
    assert!(!stale.exists(), "refused socket file should be deleted");
    assert!(newer.exists() && older.exists());

    // A second listing sees the same survivors and nothing left to clean.
    let again = registry.list(dir.path(), false).await.expect("relist");
    assert_eq!(again.len(), 2);
    assert!(again.iter().all(|p| p.memory.is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_action_reaches_the_matching_daemon() {
    let dir = tempfile::tempdir().expect("tempdir");
    let _daemon = spawn_process_daemon(
        &dir.path().join("app.1400000000000abc.sock"),
        json!({"uid": 7, "pid": 70}),
    );
    let registry = ProcessRegistry::new(
        ControlClient::new(Duration::from_secs(1)),
        Arc::new(StaticMemory),
    );
    registry
        .action(dir.path(), "stop", "7")
        .await
        .expect("stop acknowledged");
}
