//! Session Manager (C3): the core state machine. Owns the set of live
//! sessions, their client rosters, history buffers, orphan timers, and
//! fan-out (spec.md §4.3).
//!
//! Generalizes the teacher's single-subscriber `DashMap<SessionId,
//! SessionContext>` registry (`broadcast::Sender<Bytes>` fan-out, one
//! implicit "client" per session) into an explicit multi-client roster,
//! because this spec needs "broadcast to roster members other than the
//! joiner" and a `client -> sessions` index that a bare broadcast channel
//! cannot express. The per-session actor (one tokio task owning the PTY
//! read loop, roster mutation, history append, and fan-out) follows the
//! design note in spec.md §9: no lock is ever held across a transport
//! write or PTY I/O call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{GatewayError, Result};
use crate::pty::{PtyHandle, SessionKind};
use crate::protocol::{CloseReason, SessionFilter, SessionInfo, ServerMessage};
use crate::transport::Transport;

pub type ClientId = String;

pub fn new_client_id() -> ClientId {
    uuid::Uuid::new_v4().to_string()
}

pub fn unix_millis_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Canonical session id: `term-<unix-millis>-<random>` (spec.md §6.1).
pub fn new_session_id() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("term-{}-{:08x}", unix_millis_now(), suffix)
}

struct ClientRecord {
    transport: Arc<dyn Transport>,
    #[allow(dead_code)]
    joined_at: u64,
    last_activity: u64,
}

struct SessionState {
    cols: u16,
    rows: u16,
    accepting: bool,
    history_enabled: bool,
    history: crate::history::HistoryBuffer,
    roster: HashMap<ClientId, ClientRecord>,
    orphaned_at: Option<u64>,
    last_activity: u64,
    /// Bumped every time the session transitions into or out of the
    /// orphaned state. An orphan timer fired with a stale generation is a
    /// no-op — this is how "cancel the orphan timer" is realized without
    /// needing to hold a `JoinHandle` under the same lock the timer task
    /// itself needs to re-acquire on fire.
    orphan_generation: u64,
}

pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub shell: String,
    pub cwd: String,
    pub owner: ClientId,
    pub label: Option<String>,
    pub container: Option<String>,
    pub created_at: u64,
    pty: PtyHandle,
    state: Mutex<SessionState>,
}

impl Session {
    async fn snapshot_info(&self) -> SessionInfo {
        let state = self.state.lock().await;
        SessionInfo {
            session_id: self.id.clone(),
            kind: self.kind,
            shell: self.shell.clone(),
            cwd: self.cwd.clone(),
            cols: state.cols,
            rows: state.rows,
            created_at: self.created_at,
            container: self.container.clone(),
            client_count: state.roster.len(),
            accepting: state.accepting,
            owner_id: Some(self.owner.clone()),
            label: self.label.clone(),
            history_enabled: state.history_enabled,
        }
    }
}

/// Inputs to `SessionManager::create` (spec.md §4.3). The PTY is already
/// started — the caller (the Connection Handler) spawns it via the PTY
/// Adapter first, per the routing table in spec.md §4.5.
pub struct CreateSpec {
    pub id: Option<String>,
    pub kind: SessionKind,
    pub pty: PtyHandle,
    pub data_rx: mpsc::Receiver<Vec<u8>>,
    pub exit_rx: oneshot::Receiver<i32>,
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub owner: ClientId,
    pub owner_transport: Arc<dyn Transport>,
    pub container: Option<String>,
    pub label: Option<String>,
    pub allow_join: bool,
    pub enable_history: bool,
}

/// What happened as a result of `close()` (spec.md §4.3: a non-owner
/// `close` is reinterpreted as `remove_client` and never tears the
/// session down).
pub enum CloseOutcome {
    ClientRemoved,
    SessionClosed,
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    client_sessions: DashMap<ClientId, std::collections::HashSet<String>>,
    config: Arc<ServerConfig>,
}

impl SessionManager {
    pub fn new(config: Arc<ServerConfig>) -> Arc<Self> {
        Arc::new(Self { sessions: DashMap::new(), client_sessions: DashMap::new(), config })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions currently attributing ownership to `client_id` — used by
    /// the Connection Handler to enforce `max_sessions_per_client` at
    /// spawn time (spec.md §4.5).
    pub fn owned_session_count(&self, client_id: &str) -> usize {
        self.sessions.iter().filter(|e| e.value().owner == client_id).count()
    }

    pub async fn create(self: &Arc<Self>, spec: CreateSpec) -> Result<SessionInfo> {
        if self.sessions.len() >= self.config.max_sessions_total {
            return Err(GatewayError::CapacityExhausted);
        }

        let id = spec.id.unwrap_or_else(new_session_id);
        let now = unix_millis_now();
        let mut roster = HashMap::new();
        roster.insert(
            spec.owner.clone(),
            ClientRecord { transport: spec.owner_transport, joined_at: now, last_activity: now },
        );

        let history_enabled = spec.enable_history && self.config.history_enabled;
        let session = Arc::new(Session {
            id: id.clone(),
            kind: spec.kind,
            shell: spec.shell,
            cwd: spec.cwd,
            owner: spec.owner.clone(),
            label: spec.label,
            container: spec.container,
            created_at: now,
            pty: spec.pty,
            state: Mutex::new(SessionState {
                cols: spec.cols,
                rows: spec.rows,
                accepting: spec.allow_join,
                history_enabled,
                history: crate::history::HistoryBuffer::new(self.config.history_size),
                roster,
                orphaned_at: None,
                last_activity: now,
                orphan_generation: 0,
            }),
        });

        self.sessions.insert(id.clone(), session.clone());
        self.client_sessions.entry(spec.owner.clone()).or_default().insert(id.clone());

        info!(session_id = %id, owner = %spec.owner, kind = ?session.kind, "session created");
        self.spawn_session_actor(session.clone(), spec.data_rx, spec.exit_rx);

        Ok(session.snapshot_info().await)
    }

    /// The per-session actor: owns the PTY's two event streams for the
    /// lifetime of the session. Fan-out ordering (spec.md §4.3.2) is
    /// guaranteed because this is the only task that ever appends to the
    /// history buffer or broadcasts `data` frames for this session.
    fn spawn_session_actor(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut data_rx: mpsc::Receiver<Vec<u8>>,
        mut exit_rx: oneshot::Receiver<i32>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    exit_code = &mut exit_rx => {
                        let code = exit_code.unwrap_or(-1);
                        manager.handle_pty_exit(&session, code).await;
                        break;
                    }
                    chunk = data_rx.recv() => {
                        match chunk {
                            Some(bytes) => manager.handle_pty_data(&session, bytes).await,
                            None => {
                                manager.handle_pty_exit(&session, -1).await;
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn handle_pty_data(&self, session: &Arc<Session>, bytes: Vec<u8>) {
        let transports: Vec<Arc<dyn Transport>> = {
            let mut state = session.state.lock().await;
            state.last_activity = unix_millis_now();
            if state.history_enabled {
                state.history.append(&bytes);
            }
            state.roster.values().map(|c| c.transport.clone()).collect()
        };
        let data = String::from_utf8_lossy(&bytes).into_owned();
        let frame = ServerMessage::Data { session_id: session.id.clone(), data };
        for transport in transports {
            let _ = transport.send(frame.clone());
        }
    }

    async fn handle_pty_exit(&self, session: &Arc<Session>, exit_code: i32) {
        let transports: Vec<Arc<dyn Transport>> = {
            let state = session.state.lock().await;
            state.roster.values().map(|c| c.transport.clone()).collect()
        };
        for transport in &transports {
            let _ = transport.send(ServerMessage::Exit { session_id: session.id.clone(), exit_code });
        }
        self.teardown(session, CloseReason::ProcessExit, true).await;
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        let session = self.sessions.get(session_id)?.clone();
        Some(session.snapshot_info().await)
    }

    pub async fn list(&self, filter: Option<SessionFilter>) -> Vec<SessionInfo> {
        let ids: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for session in ids {
            let info = session.snapshot_info().await;
            if let Some(f) = &filter {
                if let Some(kind) = f.kind {
                    if info.kind != kind {
                        continue;
                    }
                }
                if let Some(container) = &f.container {
                    if info.container.as_deref() != Some(container.as_str()) {
                        continue;
                    }
                }
                if let Some(accepting) = f.accepting {
                    if info.accepting != accepting {
                        continue;
                    }
                }
            }
            out.push(info);
        }
        out
    }

    /// Returns `Ok((SessionInfo, history))` on success (spec.md describes
    /// the return as a bool; the Connection Handler needs the session
    /// snapshot too, so the richer `SessionInfo` is returned and its mere
    /// presence is the success signal).
    ///
    /// The history snapshot — when `request_history` is set and the
    /// session has history enabled — is taken in the *same* `state` lock
    /// acquisition that inserts the client into the roster, not a
    /// subsequent one. This is load-bearing for the no-gap/no-overlap
    /// replay property (spec.md §4.3.2, §5): `handle_pty_data` is the only
    /// other place that touches history or fans out `data`, and it holds
    /// the same lock for its append-then-broadcast critical section, so
    /// a chunk can never be both captured in this snapshot and also
    /// broadcast live to this client, nor missed by both.
    pub async fn add_client(
        &self,
        session_id: &str,
        client_id: ClientId,
        transport: Arc<dyn Transport>,
        request_history: bool,
        history_limit: Option<usize>,
    ) -> Result<(SessionInfo, Option<Vec<u8>>)> {
        let session =
            self.sessions.get(session_id).map(|e| e.value().clone()).ok_or_else(|| {
                GatewayError::SessionNotFound(session_id.to_string())
            })?;

        let history = {
            let mut state = session.state.lock().await;
            if !state.accepting {
                return Err(GatewayError::PermissionDenied("session is not accepting joins".into()));
            }
            if state.roster.len() >= self.config.max_clients_per_session {
                return Err(GatewayError::RosterFull(session_id.to_string()));
            }
            let now = unix_millis_now();
            state.roster.insert(
                client_id.clone(),
                ClientRecord { transport, joined_at: now, last_activity: now },
            );
            state.last_activity = now;
            if state.orphaned_at.is_some() {
                state.orphaned_at = None;
                state.orphan_generation += 1;
            }

            let history = (request_history && state.history_enabled)
                .then(|| state.history.snapshot(history_limit));

            let count = state.roster.len();
            let others: Vec<Arc<dyn Transport>> = state
                .roster
                .iter()
                .filter(|(id, _)| **id != client_id)
                .map(|(_, c)| c.transport.clone())
                .collect();
            drop(state);
            let frame = ServerMessage::ClientJoined { session_id: session_id.to_string(), client_count: count };
            for t in others {
                let _ = t.send(frame.clone());
            }
            history
        };

        self.client_sessions.entry(client_id).or_default().insert(session_id.to_string());
        Ok((session.snapshot_info().await, history))
    }

    /// No-op if `client_id` is not a roster member (spec.md §4.3).
    pub async fn remove_client(self: &Arc<Self>, session_id: &str, client_id: &str) {
        let Some(session) = self.sessions.get(session_id).map(|e| e.value().clone()) else {
            return;
        };

        let went_orphan = {
            let mut state = session.state.lock().await;
            if state.roster.remove(client_id).is_none() {
                return;
            }
            let count = state.roster.len();
            let remaining: Vec<Arc<dyn Transport>> =
                state.roster.values().map(|c| c.transport.clone()).collect();

            let went_orphan = if state.roster.is_empty() {
                state.orphaned_at = Some(unix_millis_now());
                state.orphan_generation += 1;
                Some(state.orphan_generation)
            } else {
                None
            };
            drop(state);

            let frame = ServerMessage::ClientLeft { session_id: session_id.to_string(), client_count: count };
            for t in remaining {
                let _ = t.send(frame.clone());
            }
            went_orphan
        };

        if let Some(generation) = went_orphan {
            self.arm_orphan_timer(session, generation);
        }

        if let Some(mut set) = self.client_sessions.get_mut(client_id) {
            set.remove(session_id);
        }
    }

    /// Convenience for transport closure: leave every session the client
    /// was attached to.
    pub async fn remove_client_everywhere(self: &Arc<Self>, client_id: &str) {
        let Some(sessions) = self.client_sessions.remove(client_id).map(|(_, v)| v) else {
            return;
        };
        for session_id in sessions {
            self.remove_client(&session_id, client_id).await;
        }
    }

    fn arm_orphan_timer(self: &Arc<Self>, session: Arc<Session>, generation: u64) {
        let manager = self.clone();
        let timeout = self.config.orphan_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.fire_orphan_timeout(&session, generation).await;
        });
    }

    async fn fire_orphan_timeout(&self, session: &Arc<Session>, expected_generation: u64) {
        let still_orphaned = {
            let state = session.state.lock().await;
            state.orphaned_at.is_some() && state.orphan_generation == expected_generation
        };
        if !still_orphaned {
            return;
        }
        warn!(session_id = %session.id, "orphan timeout, closing session");
        self.teardown(session, CloseReason::OrphanTimeout, true).await;
    }

    pub async fn write(&self, session_id: &str, client_id: &str, bytes: &[u8]) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;

        {
            let mut state = session.state.lock().await;
            let now = unix_millis_now();
            match state.roster.get_mut(client_id) {
                Some(client) => client.last_activity = now,
                None => return Err(GatewayError::NotInRoster(session_id.to_string())),
            }
            state.last_activity = now;
        }
        session.pty.write(bytes)
    }

    /// Last-writer-wins (spec.md §9 open question): any roster member may
    /// resize: there is no per-client viewport at this layer.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;
        {
            let mut state = session.state.lock().await;
            state.cols = cols;
            state.rows = rows;
        }
        session.pty.resize(cols, rows)
    }

    pub async fn close(
        self: &Arc<Self>,
        session_id: &str,
        requester_client_id: &str,
    ) -> Result<CloseOutcome> {
        let session = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;

        if session.owner != requester_client_id {
            self.remove_client(session_id, requester_client_id).await;
            return Ok(CloseOutcome::ClientRemoved);
        }

        self.teardown(&session, CloseReason::OwnerClosed, true).await;
        Ok(CloseOutcome::SessionClosed)
    }

    pub async fn snapshot_history(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<u8>> {
        let session = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;
        let state = session.state.lock().await;
        Ok(state.history.snapshot(limit))
    }

    /// Tear down a session: broadcast `session_closed` (unless already
    /// done, e.g. by a caller that sent `exit` first), kill the PTY,
    /// clear every index referencing this session.
    async fn teardown(&self, session: &Arc<Session>, reason: CloseReason, broadcast: bool) {
        let (client_ids, transports) = {
            let state = session.state.lock().await;
            let client_ids: Vec<ClientId> = state.roster.keys().cloned().collect();
            let transports: Vec<Arc<dyn Transport>> =
                state.roster.values().map(|c| c.transport.clone()).collect();
            (client_ids, transports)
        };

        if broadcast {
            let frame = ServerMessage::SessionClosed { session_id: session.id.clone(), reason };
            for t in &transports {
                let _ = t.send(frame.clone());
            }
        }

        if let Err(e) = session.pty.kill() {
            warn!(session_id = %session.id, error = %e, "failed to kill pty during teardown");
        }

        for client_id in client_ids {
            if let Some(mut set) = self.client_sessions.get_mut(&client_id) {
                set.remove(&session.id);
            }
        }
        self.sessions.remove(&session.id);
        info!(session_id = %session.id, ?reason, "session closed");
    }

    /// Spawn the idle-reaping sweeper (spec.md §4.3.3): ticks once per
    /// `interval`, closing any session whose `last_activity` is older
    /// than the configured idle timeout. `idle_timeout == 0` disables
    /// reaping entirely.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let Some(idle_timeout) = manager.config.idle_timeout() else {
                return;
            };
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sessions: Vec<Arc<Session>> =
                    manager.sessions.iter().map(|e| e.value().clone()).collect();
                for session in sessions {
                    let idle_for = {
                        let state = session.state.lock().await;
                        unix_millis_now().saturating_sub(state.last_activity)
                    };
                    if idle_for >= idle_timeout.as_millis() as u64 {
                        let transports: Vec<Arc<dyn Transport>> = {
                            let state = session.state.lock().await;
                            state.roster.values().map(|c| c.transport.clone()).collect()
                        };
                        for t in &transports {
                            let _ = t.send(ServerMessage::Exit {
                                session_id: session.id.clone(),
                                exit_code: -1,
                            });
                        }
                        manager.teardown(&session, CloseReason::IdleTimeout, true).await;
                    }
                }
            }
        })
    }

    /// Server shutdown (spec.md §4.6): kill every PTY, cancel every
    /// timer implicitly (orphan timers no-op once the session is gone),
    /// broadcast `session_closed{cleanup}` best-effort.
    pub async fn cleanup(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in sessions {
            self.teardown(&session, CloseReason::Cleanup, true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::{PtySpawnSpec, SpawnProfile};
    use crate::transport::ChannelTransport;
    use std::collections::HashMap as StdHashMap;

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            max_sessions_total: 2,
            max_clients_per_session: 2,
            orphan_timeout_ms: 50,
            idle_timeout_ms: 0,
            ..Default::default()
        })
    }

    fn spawn_sh() -> crate::pty::PtySpawnResult {
        crate::pty::spawn(PtySpawnSpec {
            profile: SpawnProfile::Local { shell: "/bin/sh".into() },
            cwd: None,
            env: StdHashMap::new(),
            cols: 80,
            rows: 24,
        })
        .expect("spawn /bin/sh")
    }

    async fn create_test_session(manager: &Arc<SessionManager>, owner: &str) -> SessionInfo {
        let spawned = spawn_sh();
        let (transport, _rx) = ChannelTransport::new();
        manager
            .create(CreateSpec {
                id: None,
                kind: SessionKind::Local,
                pty: spawned.handle,
                data_rx: spawned.data_rx,
                exit_rx: spawned.exit_rx,
                shell: "/bin/sh".into(),
                cwd: "/".into(),
                cols: 80,
                rows: 24,
                owner: owner.to_string(),
                owner_transport: transport,
                container: None,
                label: None,
                allow_join: true,
                enable_history: true,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_rejects_past_capacity() {
        let manager = SessionManager::new(test_config());
        create_test_session(&manager, "c1").await;
        create_test_session(&manager, "c2").await;
        let spawned = spawn_sh();
        let (transport, _rx) = ChannelTransport::new();
        let err = manager
            .create(CreateSpec {
                id: None,
                kind: SessionKind::Local,
                pty: spawned.handle,
                data_rx: spawned.data_rx,
                exit_rx: spawned.exit_rx,
                shell: "/bin/sh".into(),
                cwd: "/".into(),
                cols: 80,
                rows: 24,
                owner: "c3".into(),
                owner_transport: transport,
                container: None,
                label: None,
                allow_join: true,
                enable_history: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CapacityExhausted));
    }

    #[tokio::test]
    async fn add_client_rejects_past_roster_capacity_without_mutating_roster() {
        let manager = SessionManager::new(test_config());
        let info = create_test_session(&manager, "owner").await;
        let (t2, _r2) = ChannelTransport::new();
        manager.add_client(&info.session_id, "c2".into(), t2, false, None).await.unwrap();
        let (t3, _r3) = ChannelTransport::new();
        let err = manager.add_client(&info.session_id, "c3".into(), t3, false, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::RosterFull(_)));
        let info = manager.get(&info.session_id).await.unwrap();
        assert_eq!(info.client_count, 2);
    }

    #[tokio::test]
    async fn remove_client_twice_join_restores_membership() {
        let manager = SessionManager::new(test_config());
        let info = create_test_session(&manager, "owner").await;
        let (t2, _r2) = ChannelTransport::new();
        manager.add_client(&info.session_id, "c2".into(), t2.clone(), false, None).await.unwrap();
        manager.remove_client(&info.session_id, "c2").await;
        let (info2, _) = manager.add_client(&info.session_id, "c2".into(), t2, false, None).await.unwrap();
        assert_eq!(info2.client_count, 2);
    }

    #[tokio::test]
    async fn non_owner_close_only_removes_client() {
        let manager = SessionManager::new(test_config());
        let info = create_test_session(&manager, "owner").await;
        let (t2, _r2) = ChannelTransport::new();
        manager.add_client(&info.session_id, "c2".into(), t2, false, None).await.unwrap();
        let outcome = manager.close(&info.session_id, "c2").await.unwrap();
        assert!(matches!(outcome, CloseOutcome::ClientRemoved));
        assert!(manager.get(&info.session_id).await.is_some());
    }

    #[tokio::test]
    async fn owner_close_tears_down_session() {
        let manager = SessionManager::new(test_config());
        let info = create_test_session(&manager, "owner").await;
        let outcome = manager.close(&info.session_id, "owner").await.unwrap();
        assert!(matches!(outcome, CloseOutcome::SessionClosed));
        assert!(manager.get(&info.session_id).await.is_none());
    }

    #[tokio::test]
    async fn orphan_timeout_closes_session_if_nobody_rejoins() {
        let manager = SessionManager::new(test_config());
        let info = create_test_session(&manager, "owner").await;
        manager.remove_client(&info.session_id, "owner").await;
        assert!(manager.get(&info.session_id).await.is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.get(&info.session_id).await.is_none());
    }

    #[tokio::test]
    async fn rejoin_before_orphan_timeout_cancels_closure() {
        let manager = SessionManager::new(test_config());
        let info = create_test_session(&manager, "owner").await;
        manager.remove_client(&info.session_id, "owner").await;
        let (t2, _r2) = ChannelTransport::new();
        manager.add_client(&info.session_id, "c2".into(), t2, false, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.get(&info.session_id).await.is_some());
    }

    #[tokio::test]
    async fn join_with_history_returns_snapshot_captured_with_roster_insert() {
        let manager = SessionManager::new(test_config());
        let info = create_test_session(&manager, "owner").await;
        manager.write(&info.session_id, "owner", b"printf ABC\n").await.unwrap();
        // Give the session actor a moment to append the PTY's echo to history.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (t2, _r2) = ChannelTransport::new();
        let (joined, history) = manager
            .add_client(&info.session_id, "c2".into(), t2, true, Some(1024))
            .await
            .unwrap();
        assert_eq!(joined.client_count, 2);
        let history = history.expect("history requested and enabled");
        assert!(String::from_utf8_lossy(&history).contains("ABC"));
    }

    #[tokio::test]
    async fn write_to_unjoined_session_is_rejected() {
        let manager = SessionManager::new(test_config());
        let info = create_test_session(&manager, "owner").await;
        let err = manager.write(&info.session_id, "stranger", b"hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotInRoster(_)));
    }
}
