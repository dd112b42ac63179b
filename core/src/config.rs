//! Configuration surface (spec.md §6.2). Unlike the teacher's
//! process-wide `OnceLock<Config>` singleton (appropriate for a desktop
//! app with one settings.json), `ServerConfig` here is an explicit,
//! constructible struct: tests build independent configs, and a real
//! deployment loads one from a TOML file via `ServerConfig::from_toml_str`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub allowed_shells: Vec<String>,
    pub allowed_paths: Vec<String>,
    pub default_shell: String,
    pub default_cwd: String,
    pub max_sessions_per_client: usize,
    pub idle_timeout_ms: u64,
    pub allow_container_exec: bool,
    pub allowed_container_patterns: Vec<String>,
    pub default_container_shell: Option<String>,
    pub container_runtime_path: String,
    pub max_clients_per_session: usize,
    pub orphan_timeout_ms: u64,
    pub history_size: usize,
    pub history_enabled: bool,
    pub max_sessions_total: usize,
    pub require_auth: bool,
    pub allow_anonymous: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            allowed_shells: Vec::new(),
            allowed_paths: Vec::new(),
            default_shell: default_shell_path(),
            default_cwd: default_cwd_path(),
            max_sessions_per_client: 16,
            idle_timeout_ms: 0,
            allow_container_exec: false,
            allowed_container_patterns: Vec::new(),
            default_container_shell: Some("/bin/bash".to_string()),
            container_runtime_path: "docker".to_string(),
            max_clients_per_session: 8,
            orphan_timeout_ms: 30_000,
            history_size: 1 << 20,
            history_enabled: true,
            max_sessions_total: 256,
            require_auth: false,
            allow_anonymous: true,
        }
    }
}

fn default_shell_path() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

fn default_cwd_path() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/".to_string())
}

impl ServerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| GatewayError::InvalidConfig(e.to_string()))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_millis(self.orphan_timeout_ms)
    }

    /// A requested shell passes if the allowlist is empty, or it matches a
    /// configured entry by normalized path or case-insensitive basename.
    pub fn shell_allowed(&self, shell: &str) -> bool {
        if self.allowed_shells.is_empty() {
            return true;
        }
        let requested_base = std::path::Path::new(shell)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(shell)
            .to_lowercase();
        self.allowed_shells.iter().any(|allowed| {
            normalize(allowed) == normalize(shell)
                || std::path::Path::new(allowed)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|b| b.to_lowercase() == requested_base)
                    .unwrap_or(false)
        })
    }

    /// A requested cwd passes if the allowlist is empty, or it (after
    /// normalization) is prefixed by one of the allowed paths.
    pub fn path_allowed(&self, cwd: &str) -> bool {
        if self.allowed_paths.is_empty() {
            return true;
        }
        let requested = normalize(cwd);
        self.allowed_paths.iter().any(|allowed| requested.starts_with(&normalize(allowed)))
    }

    /// A requested container passes if container exec is disabled entirely
    /// (caller must check that separately), or the pattern list is empty,
    /// or the container id/name matches one of the patterns as a regex —
    /// falling back to an exact-or-prefix string match for patterns that
    /// fail to compile.
    pub fn container_allowed(&self, container: &str) -> bool {
        if self.allowed_container_patterns.is_empty() {
            return true;
        }
        self.allowed_container_patterns.iter().any(|pattern| match regex::Regex::new(pattern) {
            Ok(re) => re.is_match(container),
            Err(_) => container == pattern || container.starts_with(pattern.as_str()),
        })
    }
}

fn normalize(path: &str) -> String {
    path.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_shell_allowlist_permits_anything() {
        let cfg = ServerConfig::default();
        assert!(cfg.shell_allowed("/usr/bin/anything"));
    }

    #[test]
    fn shell_matches_by_basename_case_insensitive() {
        let mut cfg = ServerConfig::default();
        cfg.allowed_shells = vec!["/bin/bash".to_string()];
        assert!(cfg.shell_allowed("/usr/local/bin/BASH"));
        assert!(!cfg.shell_allowed("/bin/zsh"));
    }

    #[test]
    fn path_allowed_requires_prefix_match() {
        let mut cfg = ServerConfig::default();
        cfg.allowed_paths = vec!["/home/user/projects".to_string()];
        assert!(cfg.path_allowed("/home/user/projects/app"));
        assert!(!cfg.path_allowed("/home/user/other"));
    }

    #[test]
    fn container_pattern_falls_back_to_prefix_match_on_bad_regex() {
        let mut cfg = ServerConfig::default();
        cfg.allowed_container_patterns = vec!["web-[".to_string()]; // invalid regex
        assert!(cfg.container_allowed("web-["));
        assert!(!cfg.container_allowed("db-1"));
    }

    #[test]
    fn container_pattern_matches_as_regex() {
        let mut cfg = ServerConfig::default();
        cfg.allowed_container_patterns = vec!["^web-\\d+$".to_string()];
        assert!(cfg.container_allowed("web-12"));
        assert!(!cfg.container_allowed("db-1"));
    }

    #[test]
    fn idle_timeout_zero_disables() {
        let mut cfg = ServerConfig::default();
        cfg.idle_timeout_ms = 0;
        assert!(cfg.idle_timeout().is_none());
    }

    #[test]
    fn from_toml_str_parses_overrides() {
        let cfg = ServerConfig::from_toml_str("max_sessions_total = 4\n").unwrap();
        assert_eq!(cfg.max_sessions_total, 4);
    }

    #[test]
    fn from_toml_str_rejects_malformed_input() {
        assert!(ServerConfig::from_toml_str("max_sessions_total = [oops").is_err());
    }

    #[test]
    fn config_file_on_disk_round_trips_through_from_toml_str() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "allowed_shells = [\"/bin/bash\"]\nidle_timeout_ms = 5000\n").unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let cfg = ServerConfig::from_toml_str(&raw).unwrap();
        assert_eq!(cfg.allowed_shells, vec!["/bin/bash".to_string()]);
        assert_eq!(cfg.idle_timeout(), Some(Duration::from_millis(5000)));
    }
}
