use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
#[cfg(unix)]
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
};
#[cfg(unix)]
use tracing::{debug, warn};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DATA_TAG: &str = "data";

/// Daemon error text that means the target is already down; stop-like
/// actions treat it as success.
pub const BENIGN_ACTION_ERROR: &str = "is not running";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Data,
    Action(String),
}

impl ControlRequest {
    pub fn action(name: impl Into<String>) -> Self {
        Self::Action(name.into())
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Data => DATA_TAG,
            Self::Action(name) => name.as_str(),
        }
    }

    /// The daemon treats the last array element as the payload, so requests
    /// carry an explicit `null` slot after the tag.
    pub fn to_frame(&self) -> Value {
        Value::Array(vec![Value::String(self.tag().to_string()), Value::Null])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlReply {
    Data(Value),
    ActionOk {
        action: String,
        payload: Value,
    },
    ActionError {
        action: String,
        message: Option<String>,
        payload: Value,
    },
}

impl ControlReply {
    /// Interprets one decoded `[tag..., payload]` frame. Returns `None` for
    /// frames that are not replies this client understands.
    pub fn from_frame(frame: &[Value]) -> Option<Self> {
        let (payload, tags) = frame.split_last()?;
        let tags = tags.iter().map(Value::as_str).collect::<Option<Vec<_>>>()?;
        match tags.as_slice() {
            [DATA_TAG] => Some(Self::Data(payload.clone())),
            [action, "ok"] => Some(Self::ActionOk {
                action: action.to_string(),
                payload: payload.clone(),
            }),
            [action, "error"] => Some(Self::ActionError {
                action: action.to_string(),
                message: error_message(payload),
                payload: payload.clone(),
            }),
            _ => None,
        }
    }

    pub fn to_frame(&self) -> Value {
        let (parts, payload) = match self {
            Self::Data(payload) => (vec![DATA_TAG.to_string()], payload),
            Self::ActionOk { action, payload } => {
                (vec![action.clone(), "ok".to_string()], payload)
            }
            Self::ActionError {
                action, payload, ..
            } => (vec![action.clone(), "error".to_string()], payload),
        };
        let mut frame = parts.into_iter().map(Value::String).collect::<Vec<_>>();
        frame.push(payload.clone());
        Value::Array(frame)
    }

    pub fn answers(&self, request: &ControlRequest) -> bool {
        match (self, request) {
            (Self::Data(_), ControlRequest::Data) => true,
            (Self::ActionOk { action, .. }, ControlRequest::Action(name))
            | (Self::ActionError { action, .. }, ControlRequest::Action(name)) => action == name,
            _ => false,
        }
    }
}

fn error_message(payload: &Value) -> Option<String> {
    match payload {
        Value::String(message) => Some(message.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

pub fn is_benign_action_error(message: &str) -> bool {
    message.contains(BENIGN_ACTION_ERROR)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection refused by {}", .path.display())]
    ConnRefused { path: PathBuf },
    #[error("connect to {} failed: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no `{tag}` reply within {}ms", .timeout.as_millis())]
    Timeout { tag: String, timeout: Duration },
    #[error("connection closed before `{tag}` reply")]
    Closed { tag: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("control sockets are not supported on this platform")]
    Unsupported,
}

impl RpcError {
    /// A refused connection means nobody is listening behind the socket
    /// file any more.
    pub fn is_conn_refused(&self) -> bool {
        matches!(self, Self::ConnRefused { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ControlClient {
    reply_timeout: Duration,
    max_frame_bytes: usize,
}

impl Default for ControlClient {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_TIMEOUT)
    }
}

impl ControlClient {
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            reply_timeout,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Fetches the full descriptor payload of the process behind `endpoint`.
    pub async fn query(&self, endpoint: &Path) -> Result<Value, RpcError> {
        match self.request(endpoint, &ControlRequest::Data).await? {
            ControlReply::Data(payload) => Ok(payload),
            _ => Err(RpcError::Closed {
                tag: DATA_TAG.to_string(),
            }),
        }
    }

    /// Opens a connection, sends one command, waits for its single terminal
    /// reply and closes the connection again.
    #[cfg(unix)]
    pub async fn request(
        &self,
        endpoint: &Path,
        request: &ControlRequest,
    ) -> Result<ControlReply, RpcError> {
        let exchange = async {
            let stream = UnixStream::connect(endpoint)
                .await
                .map_err(|err| classify_connect_error(endpoint, err))?;
            let (reader_half, mut writer_half) = stream.into_split();
            let frame = encode_frame(&request.to_frame(), self.max_frame_bytes)?;
            writer_half.write_all(&frame).await?;
            writer_half.flush().await?;
            let mut reader = BufReader::new(reader_half);
            read_matching_reply(&mut reader, request, self.max_frame_bytes).await
        };

        match tokio::time::timeout(self.reply_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                tag: request.tag().to_string(),
                timeout: self.reply_timeout,
            }),
        }
    }

    #[cfg(not(unix))]
    pub async fn request(
        &self,
        _endpoint: &Path,
        _request: &ControlRequest,
    ) -> Result<ControlReply, RpcError> {
        Err(RpcError::Unsupported)
    }
}

#[cfg(unix)]
fn classify_connect_error(endpoint: &Path, err: io::Error) -> RpcError {
    if err.kind() == io::ErrorKind::ConnectionRefused {
        RpcError::ConnRefused {
            path: endpoint.to_path_buf(),
        }
    } else {
        RpcError::Connect {
            path: endpoint.to_path_buf(),
            source: err,
        }
    }
}

#[cfg(unix)]
async fn read_matching_reply<R>(
    reader: &mut R,
    request: &ControlRequest,
    max_frame_bytes: usize,
) -> Result<ControlReply, RpcError>
where
    R: AsyncBufRead + Unpin,
{
    // Room for the frame plus its `\r\n` terminator.
    let line_limit = max_frame_bytes as u64 + 2;
    loop {
        let mut line = Vec::new();
        let n = (&mut *reader)
            .take(line_limit)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Err(RpcError::Closed {
                tag: request.tag().to_string(),
            });
        }
        if !line.ends_with(b"\n") && line.len() > max_frame_bytes {
            warn!(event = "rpc_frame_oversized", tag = request.tag(), bytes = line.len());
            return Err(FrameError::OversizedFrame {
                size: line.len(),
                max: max_frame_bytes,
            }
            .into());
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        let frame = match decode_frame::<Vec<Value>>(&line, max_frame_bytes) {
            Ok(value) => value,
            Err(err @ FrameError::OversizedFrame { .. }) => return Err(err.into()),
            Err(err) => {
                warn!(event = "rpc_decode_error", tag = request.tag(), error = %err);
                continue;
            }
        };
        match ControlReply::from_frame(&frame) {
            Some(reply) if reply.answers(request) => return Ok(reply),
            _ => {
                debug!(event = "rpc_unrelated_frame", tag = request.tag());
            }
        }
    }
}
