//! Connection Handler (C5, spec.md §4.5): one instance per connected
//! client. Owns the client's outbound transport, authentication state,
//! and the inbound message routing table. Dispatch goes through the
//! Permission Gate for every message except `auth`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};

use gateway_core::config::ServerConfig;
use gateway_core::container;
use gateway_core::error::GatewayError;
use gateway_core::permission::{
    AuthCredentials, ConnectionMetadata, Operation, PermissionPolicy, UserContext,
};
use gateway_core::protocol::{ClientMessage, ServerInfo, ServerMessage, SpawnOptions, UserInfo};
use gateway_core::pty::{self, PtySpawnSpec, SpawnProfile};
use gateway_core::session::{new_client_id, CloseOutcome, CreateSpec, SessionManager};
use gateway_core::transport::{ChannelTransport, Transport};

#[derive(Clone)]
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
    pub config: Arc<ServerConfig>,
    pub policy: Arc<dyn PermissionPolicy>,
}

/// Drives one client's connection end-to-end: auth, receive loop, and
/// cleanup on transport close (spec.md §4.5 steps 1-6).
pub async fn handle_connection(socket: WebSocket, meta: ConnectionMetadata, state: AppState) {
    let client_id = new_client_id();
    let (transport, mut outbound_rx) = ChannelTransport::new();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let forward_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize outbound frame"),
            }
        }
    });

    let mut user = state.policy.authenticate_connection(&meta).await;
    let mut auth_pending = false;
    if user.is_none() {
        if state.config.require_auth {
            auth_pending = true;
        } else {
            user = state.policy.anonymous_context().or_else(|| {
                state.config.allow_anonymous.then(|| UserContext {
                    user_id: client_id.clone(),
                    display_name: None,
                    permissions: Vec::new(),
                    metadata: None,
                })
            });
        }
    }

    let _ = transport.send(server_info_frame(&state, user.as_ref()));

    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else { continue };
        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
        let message = match parsed {
            Ok(m) => m,
            Err(e) => {
                let _ = transport.send(ServerMessage::Error { session_id: None, error: e.to_string() });
                continue;
            }
        };

        if let ClientMessage::Auth { token, headers, data } = message {
            let creds = AuthCredentials { token, headers, data };
            match state.policy.authenticate_credentials(&creds).await {
                Ok(authenticated) => {
                    user = Some(authenticated.clone());
                    auth_pending = false;
                    let _ = transport.send(ServerMessage::AuthResponse {
                        success: true,
                        error: None,
                        user: Some(to_user_info(&authenticated)),
                    });
                    let _ = transport.send(server_info_frame(&state, user.as_ref()));
                }
                Err(e) => {
                    let _ = transport.send(ServerMessage::AuthResponse {
                        success: false,
                        error: Some(e),
                        user: None,
                    });
                }
            }
            continue;
        }

        if auth_pending {
            let _ = transport.send(ServerMessage::PermissionDenied {
                operation: operation_name(&message),
                permission: None,
                error: "authentication required".to_string(),
            });
            continue;
        }

        let Some(current_user) = user.clone() else {
            let _ = transport.send(ServerMessage::PermissionDenied {
                operation: operation_name(&message),
                permission: None,
                error: "no identity established for this connection".to_string(),
            });
            continue;
        };

        let (op, resource) = classify(&message);
        let decision = state.policy.check(&current_user, op, resource.as_deref()).await;
        if let gateway_core::permission::Decision::Deny { reason } = decision {
            let _ = transport.send(ServerMessage::PermissionDenied {
                operation: op.as_str().to_string(),
                permission: Some(op.as_str().to_string()),
                error: reason,
            });
            continue;
        }

        dispatch(message, &client_id, &transport, &state).await;
    }

    transport.close();
    state.session_manager.remove_client_everywhere(&client_id).await;
    if let Some(u) = &user {
        state.policy.on_disconnect(u).await;
    }
    forward_task.abort();
    info!(%client_id, "connection closed");
}

fn to_user_info(user: &UserContext) -> UserInfo {
    UserInfo {
        user_id: user.user_id.clone(),
        username: user.display_name.clone(),
        permissions: user.permissions.clone(),
        metadata: user.metadata.as_deref().and_then(|m| serde_json::from_str(m).ok()),
    }
}

fn server_info_frame(state: &AppState, user: Option<&UserContext>) -> ServerMessage {
    ServerMessage::ServerInfo {
        info: ServerInfo {
            docker_enabled: state.config.allow_container_exec,
            allowed_shells: state.config.allowed_shells.clone(),
            default_shell: state.config.default_shell.clone(),
            default_container_shell: state.config.default_container_shell.clone(),
            auth_enabled: Some(state.policy.auth_enabled()),
            require_auth: Some(state.config.require_auth),
            user: user.map(to_user_info),
        },
    }
}

fn operation_name(message: &ClientMessage) -> String {
    match message {
        ClientMessage::Auth { .. } => "auth",
        ClientMessage::Spawn { .. } => Operation::SpawnSession.as_str(),
        ClientMessage::Data { .. } => Operation::WriteSession.as_str(),
        ClientMessage::Resize { .. } => Operation::ResizeSession.as_str(),
        ClientMessage::Close { .. } => Operation::CloseSession.as_str(),
        ClientMessage::ListContainers => Operation::ListContainers.as_str(),
        ClientMessage::ListSessions { .. } => Operation::ListSessions.as_str(),
        ClientMessage::Join { .. } => Operation::JoinSession.as_str(),
        ClientMessage::Leave { .. } => Operation::LeaveSession.as_str(),
    }
    .to_string()
}

fn classify(message: &ClientMessage) -> (Operation, Option<String>) {
    match message {
        ClientMessage::Auth { .. } => unreachable!("auth is handled before classification"),
        ClientMessage::Spawn { .. } => (Operation::SpawnSession, None),
        ClientMessage::Data { session_id, .. } => (Operation::WriteSession, Some(session_id.clone())),
        ClientMessage::Resize { session_id, .. } => (Operation::ResizeSession, Some(session_id.clone())),
        ClientMessage::Close { session_id } => (Operation::CloseSession, Some(session_id.clone())),
        ClientMessage::ListContainers => (Operation::ListContainers, None),
        ClientMessage::ListSessions { .. } => (Operation::ListSessions, None),
        ClientMessage::Join { options } => (Operation::JoinSession, Some(options.session_id.clone())),
        ClientMessage::Leave { session_id } => (Operation::LeaveSession, Some(session_id.clone())),
    }
}

async fn dispatch(
    message: ClientMessage,
    client_id: &str,
    transport: &Arc<ChannelTransport>,
    state: &AppState,
) {
    match message {
        ClientMessage::Auth { .. } => unreachable!("auth is handled before dispatch"),
        ClientMessage::Spawn { options } => handle_spawn(options, client_id, transport, state).await,
        ClientMessage::Data { session_id, data } => {
            if let Err(e) = state.session_manager.write(&session_id, client_id, data.as_bytes()).await {
                let _ = transport.send(ServerMessage::Error { session_id: Some(session_id), error: e.to_string() });
            }
        }
        ClientMessage::Resize { session_id, cols, rows } => {
            if let Err(e) = state.session_manager.resize(&session_id, cols, rows).await {
                let _ = transport.send(ServerMessage::Error { session_id: Some(session_id), error: e.to_string() });
            }
        }
        ClientMessage::Close { session_id } => {
            match state.session_manager.close(&session_id, client_id).await {
                Ok(CloseOutcome::ClientRemoved) => {
                    let _ = transport.send(ServerMessage::Left { session_id });
                }
                Ok(CloseOutcome::SessionClosed) => {}
                Err(e) => {
                    let _ = transport.send(ServerMessage::Error { session_id: Some(session_id), error: e.to_string() });
                }
            }
        }
        ClientMessage::ListContainers => match container::list_containers(&state.config).await {
            Ok(containers) => {
                let _ = transport.send(ServerMessage::ContainerList { containers });
            }
            Err(e) => {
                let _ = transport.send(ServerMessage::Error { session_id: None, error: e.to_string() });
            }
        },
        ClientMessage::ListSessions { filter } => {
            let sessions = state.session_manager.list(filter).await;
            let _ = transport.send(ServerMessage::SessionList { sessions });
        }
        ClientMessage::Join { options } => handle_join(options, client_id, transport, state).await,
        ClientMessage::Leave { session_id } => {
            state.session_manager.remove_client(&session_id, client_id).await;
            let _ = transport.send(ServerMessage::Left { session_id });
        }
    }
}

async fn handle_spawn(
    options: SpawnOptions,
    client_id: &str,
    transport: &Arc<ChannelTransport>,
    state: &AppState,
) {
    if state.session_manager.owned_session_count(client_id) >= state.config.max_sessions_per_client {
        let err = GatewayError::PerClientLimitReached(state.config.max_sessions_per_client);
        let _ = transport.send(ServerMessage::Error { session_id: None, error: err.to_string() });
        return;
    }

    let (profile, shell, cwd) = match build_profile(&options, &state.config) {
        Ok(v) => v,
        Err(e) => {
            let _ = transport.send(ServerMessage::Error { session_id: None, error: e.to_string() });
            return;
        }
    };

    let cols = options.cols.unwrap_or(80);
    let rows = options.rows.unwrap_or(24);
    let container = profile.container_id().map(str::to_string);
    let kind = profile.kind();

    let spawn_cwd = matches!(profile, SpawnProfile::Local { .. }).then(|| PathBuf::from(&cwd));
    let spawned = match pty::spawn(PtySpawnSpec {
        profile,
        cwd: spawn_cwd,
        env: options.env.clone(),
        cols,
        rows,
    }) {
        Ok(s) => s,
        Err(e) => {
            let _ = transport.send(ServerMessage::Error { session_id: None, error: e.to_string() });
            return;
        }
    };

    let result = state
        .session_manager
        .create(CreateSpec {
            id: None,
            kind,
            pty: spawned.handle,
            data_rx: spawned.data_rx,
            exit_rx: spawned.exit_rx,
            shell: shell.clone(),
            cwd: cwd.clone(),
            cols,
            rows,
            owner: client_id.to_string(),
            owner_transport: transport.clone(),
            container: container.clone(),
            label: options.label.clone(),
            allow_join: options.allow_join,
            enable_history: options.enable_history,
        })
        .await;

    match result {
        Ok(info) => {
            let _ = transport.send(ServerMessage::Spawned {
                session_id: info.session_id,
                shell,
                cwd,
                cols,
                rows,
                container,
            });
        }
        Err(e) => {
            let _ = transport.send(ServerMessage::Error { session_id: None, error: e.to_string() });
        }
    }
}

/// Resolves spawn options against the server configuration into a PTY
/// spawn profile, validating shell/path/container allowlists along the
/// way (spec.md §6.2).
fn build_profile(
    options: &SpawnOptions,
    config: &ServerConfig,
) -> Result<(SpawnProfile, String, String), GatewayError> {
    if let Some(container) = &options.container {
        if !config.allow_container_exec {
            return Err(GatewayError::ContainerExecDisabled);
        }
        if !config.container_allowed(container) {
            return Err(GatewayError::ContainerNotAllowed(container.clone()));
        }
        let shell = options
            .container_shell
            .clone()
            .or_else(|| config.default_container_shell.clone())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let cwd = options.container_cwd.clone().unwrap_or_default();
        let profile = if options.attach_mode.as_deref() == Some("attach") {
            SpawnProfile::ContainerAttach {
                runtime: config.container_runtime_path.clone(),
                container: container.clone(),
            }
        } else {
            SpawnProfile::ContainerExec {
                runtime: config.container_runtime_path.clone(),
                container: container.clone(),
                shell: shell.clone(),
                user: options.container_user.clone(),
                container_cwd: options.container_cwd.clone(),
            }
        };
        return Ok((profile, shell, cwd));
    }

    let shell = options.shell.clone().unwrap_or_else(|| config.default_shell.clone());
    if !config.shell_allowed(&shell) {
        return Err(GatewayError::ShellNotAllowed(shell));
    }
    let cwd = options.cwd.clone().unwrap_or_else(|| config.default_cwd.clone());
    if !config.path_allowed(&cwd) {
        return Err(GatewayError::PathNotAllowed(cwd));
    }
    Ok((SpawnProfile::Local { shell: shell.clone() }, shell, cwd))
}

async fn handle_join(
    options: gateway_core::protocol::JoinOptions,
    client_id: &str,
    transport: &Arc<ChannelTransport>,
    state: &AppState,
) {
    let session_id = options.session_id.clone();
    let result = state
        .session_manager
        .add_client(
            &session_id,
            client_id.to_string(),
            transport.clone(),
            options.request_history,
            options.history_limit,
        )
        .await;

    // The snapshot is taken by `add_client` in the same roster-mutation
    // critical section the PTY actor uses for append-then-broadcast, so it
    // is exactly the prefix up to this join and every later `data` frame is
    // the strict, non-overlapping suffix (spec.md §4.3.2, §5).
    let (info, history_bytes) = match result {
        Ok(v) => v,
        Err(e) => {
            let _ = transport.send(ServerMessage::Error { session_id: Some(session_id), error: e.to_string() });
            return;
        }
    };
    let history = history_bytes.map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

    // Provoke a prompt refresh for the joining client (spec.md §4.5 routing table).
    let _ = state.session_manager.write(&session_id, client_id, b"\n").await;

    let _ = transport.send(ServerMessage::Joined { session_id, session: info, history });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn container_spawn_requires_allow_container_exec() {
        let config = ServerConfig { allow_container_exec: false, ..Default::default() };
        let options = SpawnOptions { container: Some("web-1".into()), ..Default::default() };
        let err = build_profile(&options, &config).unwrap_err();
        assert!(matches!(err, GatewayError::ContainerExecDisabled));
    }

    #[test]
    fn container_spawn_checks_allowlist() {
        let config = ServerConfig {
            allow_container_exec: true,
            allowed_container_patterns: vec!["^web-".to_string()],
            ..Default::default()
        };
        let options = SpawnOptions { container: Some("db-1".into()), ..Default::default() };
        let err = build_profile(&options, &config).unwrap_err();
        assert!(matches!(err, GatewayError::ContainerNotAllowed(_)));
    }

    #[test]
    fn local_spawn_rejects_disallowed_shell() {
        let config = ServerConfig { allowed_shells: vec!["/bin/bash".into()], ..Default::default() };
        let options = SpawnOptions { shell: Some("/bin/zsh".into()), ..Default::default() };
        let err = build_profile(&options, &config).unwrap_err();
        assert!(matches!(err, GatewayError::ShellNotAllowed(_)));
    }

    #[test]
    fn local_spawn_defaults_fill_in_when_omitted() {
        let config = ServerConfig::default();
        let options = SpawnOptions::default();
        let (profile, shell, cwd) = build_profile(&options, &config).unwrap();
        assert!(matches!(profile, SpawnProfile::Local { .. }));
        assert_eq!(shell, config.default_shell);
        assert_eq!(cwd, config.default_cwd);
        let _ = HashMap::<String, String>::new();
    }
}
