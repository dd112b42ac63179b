//! Wire protocol (spec.md §6.1): JSON frames with a mandatory `type` and
//! optional `session_id`. Tagged with `#[serde(tag = "type", rename_all =
//! "snake_case")]`, the pattern already used by the teacher's
//! `PtyRunState` — generalized here to the full closed set of client- and
//! server-originated message types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::pty::SessionKind;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpawnOptions {
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub container_shell: Option<String>,
    #[serde(default)]
    pub container_user: Option<String>,
    #[serde(default)]
    pub container_cwd: Option<String>,
    /// "exec" (default) or "attach".
    #[serde(default)]
    pub attach_mode: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_true")]
    pub allow_join: bool,
    #[serde(default = "default_true")]
    pub enable_history: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionFilter {
    #[serde(default)]
    pub kind: Option<SessionKind>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub accepting: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JoinOptions {
    pub session_id: String,
    #[serde(default)]
    pub request_history: bool,
    #[serde(default)]
    pub history_limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub client_count: usize,
    pub accepting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub history_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: ContainerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    Paused,
    Exited,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub docker_enabled: bool,
    pub allowed_shells: Vec<String>,
    pub default_shell: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_container_shell: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_auth: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

/// Reason a session was closed (spec.md §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    OrphanTimeout,
    OwnerClosed,
    ProcessExit,
    Error,
    IdleTimeout,
    Cleanup,
}

/// Client -> server messages. Anything that doesn't parse into one of
/// these variants is rejected outright (spec.md §4.5 step 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    Spawn {
        #[serde(default)]
        options: SpawnOptions,
    },
    Data {
        session_id: String,
        data: String,
    },
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    Close {
        session_id: String,
    },
    ListContainers,
    ListSessions {
        #[serde(default)]
        filter: Option<SessionFilter>,
    },
    Join {
        options: JoinOptions,
    },
    Leave {
        session_id: String,
    },
}

/// Server -> client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ServerInfo {
        info: ServerInfo,
    },
    AuthResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<UserInfo>,
    },
    PermissionDenied {
        operation: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission: Option<String>,
        error: String,
    },
    Spawned {
        session_id: String,
        shell: String,
        cwd: String,
        cols: u16,
        rows: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        container: Option<String>,
    },
    Data {
        session_id: String,
        data: String,
    },
    Exit {
        session_id: String,
        exit_code: i32,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: String,
    },
    ContainerList {
        containers: Vec<ContainerInfo>,
    },
    SessionList {
        sessions: Vec<SessionInfo>,
    },
    Joined {
        session_id: String,
        session: SessionInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        history: Option<String>,
    },
    Left {
        session_id: String,
    },
    ClientJoined {
        session_id: String,
        client_count: usize,
    },
    ClientLeft {
        session_id: String,
        client_count: usize,
    },
    SessionClosed {
        session_id: String,
        reason: CloseReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_message_type_fails_to_parse() {
        let raw = r#"{"type":"not_a_real_message"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn data_message_round_trips() {
        let raw = r#"{"type":"data","session_id":"term-1-abc","data":"echo hi\n"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Data { session_id, data } => {
                assert_eq!(session_id, "term-1-abc");
                assert_eq!(data, "echo hi\n");
            }
            _ => panic!("expected Data"),
        }
    }

    #[test]
    fn spawn_options_default_allow_join_and_history() {
        let raw = r#"{"type":"spawn","options":{}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Spawn { options } => {
                assert!(options.allow_join);
                assert!(options.enable_history);
            }
            _ => panic!("expected Spawn"),
        }
    }

    #[test]
    fn session_closed_serializes_snake_case_reason() {
        let msg = ServerMessage::SessionClosed {
            session_id: "term-1".into(),
            reason: CloseReason::OrphanTimeout,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"reason\":\"orphan_timeout\""));
    }
}
