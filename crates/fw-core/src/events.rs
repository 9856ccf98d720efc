use crate::{registry::ProcessDescriptor, stat::SystemSnapshot};
use serde::{Deserialize, Serialize};

/// Outbound dashboard event, serialized as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Procs(Vec<ProcessDescriptor>),
    Info(String),
    SystemStat(SystemSnapshot),
    Tail(TailPayload),
    Action(ActionPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Procs(_) => "procs",
            ServerEvent::Info(_) => "info",
            ServerEvent::SystemStat(_) => "system_stat",
            ServerEvent::Tail(_) => "tail",
            ServerEvent::Action(_) => "action",
        }
    }

    pub fn tail(uid: impl Into<String>, msg: impl Into<String>) -> Self {
        ServerEvent::Tail(TailPayload {
            uid: uid.into(),
            msg: msg.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailPayload {
    pub uid: String,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub uid: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ViewerRequest {
    TailBeat {
        #[serde(deserialize_with = "crate::registry::deserialize_uid")]
        uid: String,
    },
    TailDestroy {
        #[serde(deserialize_with = "crate::registry::deserialize_uid")]
        uid: String,
    },
    Action {
        action: String,
        #[serde(deserialize_with = "crate::registry::deserialize_uid")]
        uid: String,
    },
}
