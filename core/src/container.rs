//! Container runtime interface (spec.md §6.3): two one-shot invocations
//! of the external runtime CLI (default `docker`) — listing containers
//! and building exec/attach argv (the argv construction itself lives in
//! `pty::build_command`; this module covers `ps` and its parsing).

use crate::config::ServerConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::{ContainerInfo, ContainerState};

const PS_FORMAT: &str = "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}\t{{.State}}";

pub async fn list_containers(config: &ServerConfig) -> Result<Vec<ContainerInfo>> {
    let output = tokio::process::Command::new(&config.container_runtime_path)
        .arg("ps")
        .arg("--format")
        .arg(PS_FORMAT)
        .output()
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to invoke container runtime: {e}")))?;

    if !output.status.success() {
        return Err(GatewayError::Internal(format!(
            "container runtime exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let containers: Vec<ContainerInfo> = parse_ps_output(&stdout)
        .into_iter()
        .filter(|c| config.container_allowed(&c.id) || config.container_allowed(&c.name))
        .collect();
    Ok(containers)
}

fn parse_ps_output(stdout: &str) -> Vec<ContainerInfo> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?.to_string();
            let name = fields.next()?.to_string();
            let image = fields.next()?.to_string();
            let status = fields.next()?.to_string();
            let state = match fields.next().unwrap_or("").trim() {
                "running" => ContainerState::Running,
                "paused" => ContainerState::Paused,
                "exited" => ContainerState::Exited,
                _ => ContainerState::Unknown,
            };
            Some(ContainerInfo { id, name, image, status, state })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tab_delimited_ps_output() {
        let stdout = "abc123\tweb-1\tnginx:latest\tUp 2 hours\trunning\n\
                       def456\tdb-1\tpostgres:15\tExited (0) 1 day ago\texited\n";
        let containers = parse_ps_output(stdout);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "web-1");
        assert_eq!(containers[0].state, ContainerState::Running);
        assert_eq!(containers[1].state, ContainerState::Exited);
    }

    #[test]
    fn unknown_state_falls_back() {
        let stdout = "abc123\tweb-1\tnginx:latest\tstatus\tfrozen\n";
        let containers = parse_ps_output(stdout);
        assert_eq!(containers[0].state, ContainerState::Unknown);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let stdout = "\n\nabc123\tweb-1\tnginx\tUp\trunning\n\n";
        assert_eq!(parse_ps_output(stdout).len(), 1);
    }
}
