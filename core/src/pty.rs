//! PTY Adapter (C2): starts a child process attached to a pseudo-terminal
//! and exposes a four-verb interface (`write`, `resize`, `kill`) plus two
//! event streams (`on_data`, `on_exit`).
//!
//! The adapter treats the child as an opaque byte pipe — it never
//! interprets PTY output. Three spawn profiles are supported: a local
//! shell, `docker exec` into a running container, and `docker attach` to a
//! container's main process (spec.md §4.2, §6.3).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{GatewayError, Result};

/// How the child process behind a session's PTY was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Local,
    ContainerExec,
    ContainerAttach,
}

/// Spawn profile selector and its parameters (spec.md §4.2).
#[derive(Debug, Clone)]
pub enum SpawnProfile {
    /// A local shell: `command` is the resolved shell path, no args.
    Local { shell: String },
    /// `<runtime> exec -it [-u USER] [-w CWD] [-e K=V]... CONTAINER SHELL`.
    ContainerExec {
        runtime: String,
        container: String,
        shell: String,
        user: Option<String>,
        container_cwd: Option<String>,
    },
    /// `<runtime> attach --sig-proxy=false --detach-keys=ctrl-p,ctrl-q CONTAINER`.
    ///
    /// The detach-keys and sig-proxy flags are load-bearing: without them,
    /// a client detaching from the session would deliver SIGHUP/SIGINT to
    /// the container's main process and kill it.
    ContainerAttach { runtime: String, container: String },
}

impl SpawnProfile {
    pub fn kind(&self) -> SessionKind {
        match self {
            SpawnProfile::Local { .. } => SessionKind::Local,
            SpawnProfile::ContainerExec { .. } => SessionKind::ContainerExec,
            SpawnProfile::ContainerAttach { .. } => SessionKind::ContainerAttach,
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        match self {
            SpawnProfile::Local { .. } => None,
            SpawnProfile::ContainerExec { container, .. } => Some(container),
            SpawnProfile::ContainerAttach { container, .. } => Some(container),
        }
    }
}

/// Inputs to `spawn`.
pub struct PtySpawnSpec {
    pub profile: SpawnProfile,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// `-e K=V` flags for `docker exec`, one per entry in `env` plus a
/// `TERM=xterm-256color` default when the caller didn't set `TERM`.
///
/// `docker exec` does not inherit the launcher's own process environment
/// into the container, so `TERM` has to travel as its own `-e` flag here
/// rather than via `CommandBuilder::env` on the `docker` process itself.
fn container_exec_env_flags(env: &HashMap<String, String>) -> Vec<String> {
    let mut flags: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    if !env.contains_key("TERM") {
        flags.push("TERM=xterm-256color".to_string());
    }
    flags
}

fn build_command(spec: &PtySpawnSpec) -> CommandBuilder {
    let mut cmd = match &spec.profile {
        SpawnProfile::Local { shell } => CommandBuilder::new(shell),
        SpawnProfile::ContainerExec { runtime, container, shell, user, container_cwd } => {
            let mut c = CommandBuilder::new(runtime);
            c.arg("exec");
            c.arg("-it");
            if let Some(u) = user {
                c.arg("-u");
                c.arg(u);
            }
            if let Some(cwd) = container_cwd {
                c.arg("-w");
                c.arg(cwd);
            }
            for flag in container_exec_env_flags(&spec.env) {
                c.arg("-e");
                c.arg(flag);
            }
            c.arg(container);
            c.arg(shell);
            c
        }
        SpawnProfile::ContainerAttach { runtime, container } => {
            let mut c = CommandBuilder::new(runtime);
            c.arg("attach");
            c.arg("--sig-proxy=false");
            c.arg("--detach-keys=ctrl-p,ctrl-q");
            c.arg(container);
            c
        }
    };

    if !matches!(&spec.profile, SpawnProfile::ContainerExec { .. }) {
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        if !spec.env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }
    }
    if let Some(cwd) = &spec.cwd {
        cmd.cwd(cwd);
    }
    cmd
}

/// Live handle to a spawned PTY: write, resize, kill.
pub struct PtyHandle {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
}

impl PtyHandle {
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().expect("pty writer mutex poisoned");
        guard.write_all(bytes)?;
        guard.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let guard = self.master.lock().expect("pty master mutex poisoned");
        guard
            .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| GatewayError::Internal(format!("pty resize failed: {e}")))
    }

    /// Terminate the child. Idempotent: killing an already-exited child is
    /// not an error.
    pub fn kill(&self) -> Result<()> {
        let mut guard = self.child.lock().expect("pty child mutex poisoned");
        match guard.kill() {
            Ok(()) => {
                let _ = guard.wait();
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Result of a successful spawn: the live handle plus the two event
/// streams. `data_rx` yields chunks as produced; `exit_rx` fires exactly
/// once with the child's exit code (or -1 for forced/idle termination,
/// set by the caller, not by this module).
pub struct PtySpawnResult {
    pub handle: PtyHandle,
    pub data_rx: mpsc::Receiver<Vec<u8>>,
    pub exit_rx: oneshot::Receiver<i32>,
}

/// Start a child process attached to a PTY. Spawn failure surfaces
/// synchronously; runtime I/O errors after spawn close the PTY and are
/// reported through `exit_rx` instead.
pub fn spawn(spec: PtySpawnSpec) -> Result<PtySpawnResult> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize { rows: spec.rows, cols: spec.cols, pixel_width: 0, pixel_height: 0 })
        .map_err(|e| GatewayError::SpawnFailed(format!("openpty: {e}")))?;

    let cmd = build_command(&spec);
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| GatewayError::SpawnFailed(e.to_string()))?;
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| GatewayError::SpawnFailed(format!("clone reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| GatewayError::SpawnFailed(format!("take writer: {e}")))?;

    let master: Arc<Mutex<Box<dyn MasterPty + Send>>> = Arc::new(Mutex::new(pair.master));
    let child: Arc<Mutex<Box<dyn Child + Send + Sync>>> = Arc::new(Mutex::new(child));

    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(256);
    let (exit_tx, exit_rx) = oneshot::channel::<i32>();

    // Blocking reader thread: the PTY master's reader has no async
    // equivalent on most platforms, so we bridge it onto a std thread and
    // forward chunks over an async mpsc channel, matching the teacher's
    // `spawn_pty` reader-thread pattern.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if data_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Reap thread: poll try_wait() until the child exits, then report the
    // exit code exactly once.
    let child_poll = Arc::clone(&child);
    std::thread::spawn(move || loop {
        let status = {
            let mut guard = match child_poll.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            guard.try_wait()
        };
        match status {
            Ok(Some(status)) => {
                let _ = exit_tx.send(status.exit_code() as i32);
                return;
            }
            Ok(None) => std::thread::sleep(std::time::Duration::from_millis(200)),
            Err(_) => {
                let _ = exit_tx.send(-1);
                return;
            }
        }
    });

    Ok(PtySpawnResult {
        handle: PtyHandle { writer: Arc::new(Mutex::new(writer)), master, child },
        data_rx,
        exit_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_profile_builds_shell_command() {
        let spec = PtySpawnSpec {
            profile: SpawnProfile::Local { shell: "/bin/sh".into() },
            cwd: None,
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        };
        assert_eq!(spec.profile.kind(), SessionKind::Local);
        assert!(spec.profile.container_id().is_none());
    }

    #[test]
    fn container_exec_profile_reports_container_id() {
        let profile = SpawnProfile::ContainerExec {
            runtime: "docker".into(),
            container: "web-1".into(),
            shell: "/bin/bash".into(),
            user: Some("root".into()),
            container_cwd: None,
        };
        assert_eq!(profile.kind(), SessionKind::ContainerExec);
        assert_eq!(profile.container_id(), Some("web-1"));
    }

    #[test]
    fn container_exec_env_flags_default_term_when_unset() {
        let flags = container_exec_env_flags(&HashMap::new());
        assert_eq!(flags, vec!["TERM=xterm-256color".to_string()]);
    }

    #[test]
    fn container_exec_env_flags_respect_caller_term_override() {
        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "vt100".to_string());
        let flags = container_exec_env_flags(&env);
        assert_eq!(flags, vec!["TERM=vt100".to_string()]);
    }

    #[test]
    fn container_exec_env_flags_include_caller_vars_alongside_term() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let flags = container_exec_env_flags(&env);
        assert!(flags.contains(&"FOO=bar".to_string()));
        assert!(flags.contains(&"TERM=xterm-256color".to_string()));
    }
}
