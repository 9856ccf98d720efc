use crate::{
    config::ConfigStore,
    registry::{ProcessRegistry, RegistryError},
};
use futures_util::future::BoxFuture;
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::{mpsc, watch},
};
use tracing::{debug, info, warn};

pub const TAIL_PROGRAM: &str = "tail";
pub const TAIL_BACKLOG_LINES: u32 = 10;
const READ_CHUNK_BYTES: usize = 8 * 1024;
const MAX_PARTIAL_LINE_BYTES: usize = 64 * 1024;
pub const UNEXPECTED_EXIT: &str = "Log tail exited unexpectedly.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEvent {
    Lines(Vec<String>),
    /// The follower wrote to stderr or exited on its own; it has already
    /// been terminated.
    Failed(String),
}

#[derive(Debug, Error)]
pub enum TailError {
    #[error("Logs can not work on this platform.")]
    UnsupportedPlatform,
    #[error("Log file \"{}\" does not exist.", .path.display())]
    LogFileMissing { path: PathBuf },
    #[error("Process {uid} does not report a log file.")]
    MissingLogFile { uid: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to spawn tail: {source}")]
    Spawn {
        #[source]
        source: io::Error,
    },
}

pub trait TailHandle: Send + Sync {
    /// Asks the follower to exit. Calls after the first are no-ops.
    fn terminate(&self);

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Starts a follower for a process uid and streams its output to `events`.
pub trait TailSource: Send + Sync {
    fn start<'a>(
        &'a self,
        uid: &'a str,
        events: mpsc::Sender<TailEvent>,
    ) -> BoxFuture<'a, Result<Box<dyn TailHandle>, TailError>>;
}

/// Splits raw output into lines, carrying a trailing partial line across
/// reads. Whitespace-only lines are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.partial);
                push_line(&mut lines, &raw);
                continue;
            }
            self.partial.push(byte);
            if self.partial.len() >= MAX_PARTIAL_LINE_BYTES {
                let raw = std::mem::take(&mut self.partial);
                push_line(&mut lines, &raw);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Vec<String> {
        let raw = std::mem::take(&mut self.partial);
        let mut lines = Vec::new();
        push_line(&mut lines, &raw);
        lines
    }
}

fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches('\r');
    if !text.trim().is_empty() {
        lines.push(text.to_string());
    }
}

/// A running `tail -f`. Dropping it terminates the child.
///
/// Only the task that owns the child signals it, and it does so before
/// reaping, so a terminate request can never reach a recycled pid.
#[derive(Debug)]
pub struct TailProcess {
    stop: watch::Sender<bool>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl TailProcess {
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

impl TailHandle for TailProcess {
    fn terminate(&self) {
        if !self.stop.send_replace(true) {
            debug!(event = "tail_terminate_requested", pid = ?self.pid);
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for TailProcess {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

#[cfg(unix)]
fn signal_child(child: &Child) {
    // `id()` is `None` once the child has been reaped.
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(
            event = "tail_sigterm_failed",
            pid,
            error = %io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_child(_child: &Child) {}

#[derive(Debug, Clone)]
pub struct LogTailSpawner {
    program: OsString,
    backlog: u32,
}

impl Default for LogTailSpawner {
    fn default() -> Self {
        Self::with_program(TAIL_PROGRAM)
    }
}

impl LogTailSpawner {
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            backlog: TAIL_BACKLOG_LINES,
        }
    }

    pub fn backlog(mut self, lines: u32) -> Self {
        self.backlog = lines;
        self
    }

    #[cfg(not(unix))]
    pub fn spawn(
        &self,
        _log_file: &Path,
        _events: mpsc::Sender<TailEvent>,
    ) -> Result<TailProcess, TailError> {
        Err(TailError::UnsupportedPlatform)
    }

    /// Follows `log_file` starting `backlog` lines back. Batches of
    /// non-blank lines go to `events` until the child exits or the
    /// receiver is dropped.
    #[cfg(unix)]
    pub fn spawn(
        &self,
        log_file: &Path,
        events: mpsc::Sender<TailEvent>,
    ) -> Result<TailProcess, TailError> {
        if !log_file.exists() {
            return Err(TailError::LogFileMissing {
                path: log_file.to_path_buf(),
            });
        }
        let mut child = Command::new(&self.program)
            .arg("-f")
            .arg("-n")
            .arg(self.backlog.to_string())
            .arg(log_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TailError::Spawn { source })?;

        let pid = child.id();
        let (stop, stop_rx) = watch::channel(false);
        let exited = Arc::new(AtomicBool::new(false));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(pump_output(
            child,
            stdout,
            stderr,
            events,
            stop_rx,
            exited.clone(),
        ));
        Ok(TailProcess { stop, exited, pid })
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader.as_mut() {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

fn first_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or(UNEXPECTED_EXIT)
        .to_string()
}

/// Streams stdout batches until both pipes close, a stop is requested or
/// stderr produces output. Stderr is always drained before the follower is
/// judged, so an error printed right before exit is never lost.
async fn pump_output<O, E>(
    mut child: Child,
    mut stdout: Option<O>,
    mut stderr: Option<E>,
    events: mpsc::Sender<TailEvent>,
    mut stop: watch::Receiver<bool>,
    exited: Arc<AtomicBool>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut out_buf = vec![0u8; READ_CHUNK_BYTES];
    let mut err_buf = vec![0u8; READ_CHUNK_BYTES];
    let mut stopping = *stop.borrow();
    let mut failure = None;

    while !stopping && failure.is_none() && (stdout.is_some() || stderr.is_some()) {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                // Every handle is gone once the sender closes.
                stopping = changed.is_err() || *stop.borrow();
            }
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                Ok(n) if n > 0 => failure = Some(first_line(&err_buf[..n])),
                _ => stderr = None,
            },
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => {
                let lines = match read {
                    Ok(0) | Err(_) => {
                        stdout = None;
                        splitter.finish()
                    }
                    Ok(n) => splitter.push(&out_buf[..n]),
                };
                if !lines.is_empty() && events.send(TailEvent::Lines(lines)).await.is_err() {
                    stopping = true;
                }
            }
        }
    }
    if !stopping && failure.is_none() {
        failure = Some(UNEXPECTED_EXIT.to_string());
    }

    signal_child(&child);
    if let Some(message) = failure {
        warn!(event = "tail_failed", pid = ?child.id(), message = %message);
        let _ = events.send(TailEvent::Failed(message)).await;
    }
    match child.wait().await {
        Ok(status) => debug!(event = "tail_exited", status = %status),
        Err(err) => warn!(event = "tail_wait_failed", error = %err),
    }
    exited.store(true, Ordering::SeqCst);
}

/// Resolves a uid through the registry and follows its log file.
#[derive(Clone)]
pub struct RegistryTailSource {
    registry: ProcessRegistry,
    config: ConfigStore,
    fallback_root: PathBuf,
    spawner: LogTailSpawner,
}

impl RegistryTailSource {
    pub fn new(
        registry: ProcessRegistry,
        config: ConfigStore,
        fallback_root: PathBuf,
        spawner: LogTailSpawner,
    ) -> Self {
        Self {
            registry,
            config,
            fallback_root,
            spawner,
        }
    }
}

impl TailSource for RegistryTailSource {
    fn start<'a>(
        &'a self,
        uid: &'a str,
        events: mpsc::Sender<TailEvent>,
    ) -> BoxFuture<'a, Result<Box<dyn TailHandle>, TailError>> {
        Box::pin(async move {
            if !cfg!(unix) {
                return Err(TailError::UnsupportedPlatform);
            }
            let sock_dir = self.config.forever_paths(&self.fallback_root).sock_dir();
            let descriptor = self.registry.find_by_uid(&sock_dir, uid).await?;
            let log_file = descriptor.log_file.ok_or_else(|| TailError::MissingLogFile {
                uid: uid.to_string(),
            })?;
            let process = self.spawner.spawn(&log_file, events)?;
            info!(
                event = "tail_spawned",
                uid,
                pid = ?process.pid(),
                log_file = %log_file.display()
            );
            Ok(Box::new(process) as Box<dyn TailHandle>)
        })
    }
}
