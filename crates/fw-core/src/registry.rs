use crate::rpc::{is_benign_action_error, ControlClient, ControlReply, ControlRequest, RpcError};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SOCKET_SUFFIX: &str = ".sock";
pub const MEMORY_SENTINEL: &str = "0";
const LIST_CONCURRENCY: usize = 8;
const TICK_SUFFIX_CHARS: usize = 3;

/// Snapshot of one supervised process as reported by its daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDescriptor {
    #[serde(deserialize_with = "deserialize_uid")]
    pub uid: String,
    pub pid: u32,
    #[serde(default)]
    pub socket: PathBuf,
    #[serde(default, rename = "logFile", skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

pub(crate) fn deserialize_uid<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for uid")),
    }
}

/// Resident memory lookup used to enrich listings.
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self, pid: u32) -> Option<u64>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read socket directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No forever processes running")]
    NoProcesses,
    #[error("Cannot find forever process by UID: {uid}")]
    NotFound { uid: String },
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("{message}")]
    ActionRejected { action: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub name: String,
    pub path: PathBuf,
    pub tick: Option<u64>,
}

impl SocketEntry {
    fn new(dir: &Path, name: String) -> Self {
        Self {
            tick: socket_tick(&name),
            path: dir.join(&name),
            name,
        }
    }
}

/// Creation timestamp embedded in a control socket name:
/// `worker.1388452215735ihp.sock` → `1388452215735`.
pub fn socket_tick(name: &str) -> Option<u64> {
    let first = name.find('.')?;
    let last = name.rfind('.')?;
    if last <= first {
        return None;
    }
    let inner = &name[first + 1..last];
    let (cut, _) = inner.char_indices().rev().nth(TICK_SUFFIX_CHARS - 1)?;
    inner[..cut].parse::<u64>().ok()
}

/// Orders sockets by embedded timestamp; names without one go last in
/// lexical order.
pub fn sort_socket_entries(entries: &mut [SocketEntry]) {
    entries.sort_by(|a, b| {
        (a.tick.is_none(), a.tick, &a.name).cmp(&(b.tick.is_none(), b.tick, &b.name))
    });
}

pub async fn scan_socket_dir(dir: &Path) -> Result<Vec<SocketEntry>, RegistryError> {
    let read_dir_error = |source| RegistryError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut reader = tokio::fs::read_dir(dir).await.map_err(read_dir_error)?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await.map_err(read_dir_error)? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(SOCKET_SUFFIX) {
            entries.push(SocketEntry::new(dir, name));
        }
    }
    sort_socket_entries(&mut entries);
    Ok(entries)
}

#[derive(Clone)]
pub struct ProcessRegistry {
    client: ControlClient,
    memory: Arc<dyn MemoryProbe>,
}

impl ProcessRegistry {
    pub fn new(client: ControlClient, memory: Arc<dyn MemoryProbe>) -> Self {
        Self { client, memory }
    }

    pub fn client(&self) -> &ControlClient {
        &self.client
    }

    /// Queries every control socket in `dir`. Output order follows the
    /// socket timestamps regardless of which peer answers first; peers that
    /// fail are left out and refused sockets are deleted.
    pub async fn list(
        &self,
        dir: &Path,
        enrich: bool,
    ) -> Result<Vec<ProcessDescriptor>, RegistryError> {
        let entries = scan_socket_dir(dir).await?;
        let results = stream::iter(entries)
            .map(|entry| self.query_entry(entry, enrich))
            .buffered(LIST_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
        Ok(results.into_iter().flatten().collect())
    }

    pub async fn find_by_uid(
        &self,
        dir: &Path,
        uid: &str,
    ) -> Result<ProcessDescriptor, RegistryError> {
        let procs = self.list(dir, false).await?;
        if procs.is_empty() {
            return Err(RegistryError::NoProcesses);
        }
        procs
            .into_iter()
            .find(|proc| proc.uid == uid)
            .ok_or_else(|| RegistryError::NotFound {
                uid: uid.to_string(),
            })
    }

    pub async fn action(
        &self,
        dir: &Path,
        action: &str,
        uid: &str,
    ) -> Result<Value, RegistryError> {
        let descriptor = self.find_by_uid(dir, uid).await?;
        self.action_on(&descriptor, action).await
    }

    pub async fn action_on(
        &self,
        descriptor: &ProcessDescriptor,
        action: &str,
    ) -> Result<Value, RegistryError> {
        let reply = self
            .client
            .request(&descriptor.socket, &ControlRequest::action(action))
            .await?;
        match reply {
            ControlReply::ActionOk { payload, .. } => {
                info!(event = "registry_action_ok", action, uid = %descriptor.uid);
                Ok(payload)
            }
            ControlReply::ActionError {
                message: Some(message),
                ..
            } if !is_benign_action_error(&message) => Err(RegistryError::ActionRejected {
                action: action.to_string(),
                message,
            }),
            ControlReply::ActionError { payload, .. } => {
                debug!(event = "registry_action_benign_error", action, uid = %descriptor.uid);
                Ok(payload)
            }
            ControlReply::Data(payload) => Ok(payload),
        }
    }

    async fn query_entry(&self, entry: SocketEntry, enrich: bool) -> Option<ProcessDescriptor> {
        let payload = match self.client.query(&entry.path).await {
            Ok(payload) => payload,
            Err(err) if err.is_conn_refused() => {
                match tokio::fs::remove_file(&entry.path).await {
                    Ok(()) => {
                        info!(event = "registry_stale_socket", socket = %entry.path.display());
                    }
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(remove_err) => {
                        warn!(
                            event = "registry_stale_socket_remove_failed",
                            socket = %entry.path.display(),
                            error = %remove_err
                        );
                    }
                }
                return None;
            }
            Err(err) => {
                warn!(event = "registry_query_failed", socket = %entry.path.display(), error = %err);
                return None;
            }
        };

        let mut descriptor: ProcessDescriptor = match serde_json::from_value(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "registry_descriptor_invalid", socket = %entry.path.display(), error = %err);
                return None;
            }
        };
        descriptor.socket = entry.path;
        if enrich {
            descriptor.memory = Some(self.memory_usage(descriptor.pid).await);
        }
        Some(descriptor)
    }

    async fn memory_usage(&self, pid: u32) -> String {
        let probe = self.memory.clone();
        match tokio::task::spawn_blocking(move || probe.resident_bytes(pid)).await {
            Ok(Some(bytes)) => bytes.to_string(),
            Ok(None) => MEMORY_SENTINEL.to_string(),
            Err(err) => {
                warn!(event = "registry_memory_probe_failed", pid, error = %err);
                MEMORY_SENTINEL.to_string()
            }
        }
    }
}
