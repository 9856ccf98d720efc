#![allow(dead_code)]

use serde_json::{json, Value};
use std::{path::Path, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixListener,
    task::JoinHandle,
};

/// Fake forever daemon: answers `data` with `descriptor` and any action
/// with `<action>, "ok"`.
pub fn spawn_process_daemon(path: &Path, descriptor: Value) -> JoinHandle<()> {
    let listener = UnixListener::bind(path).expect("bind fake daemon");
    let descriptor = Arc::new(descriptor);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let descriptor = descriptor.clone();
            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut reader = BufReader::new(reader);
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                let request: Vec<Value> = serde_json::from_str(line.trim()).expect("request");
                let tag = request[0].as_str().unwrap_or_default().to_string();
                let reply = if tag == "data" {
                    json!(["data", *descriptor])
                } else {
                    json!([tag, "ok", {}])
                };
                let mut bytes = serde_json::to_vec(&reply).expect("reply");
                bytes.push(b'\n');
                let _ = writer.write_all(&bytes).await;
                let _ = writer.flush().await;
            });
        }
    })
}

pub fn make_stale_socket(path: &Path) {
    let listener = std::os::unix::net::UnixListener::bind(path).expect("bind stale");
    drop(listener);
}
