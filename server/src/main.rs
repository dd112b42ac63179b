//! Standalone gateway server binary. Run with `--port`, `--bind`, or
//! `--config <path-to-toml>`; all have sane defaults for local use.

use std::net::SocketAddr;
use std::sync::Arc;

use gateway_core::config::ServerConfig;
use gateway_core::permission::PermissionPolicy;

const DEFAULT_PORT: u16 = 7880;

fn parse_args() -> (u16, String, Option<String>) {
    let mut port = DEFAULT_PORT;
    let mut bind = "127.0.0.1".to_string();
    let mut config_path: Option<String> = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                port = args[i + 1].parse().unwrap_or(DEFAULT_PORT);
                i += 2;
            }
            "--bind" if i + 1 < args.len() => {
                bind = args[i + 1].clone();
                i += 2;
            }
            "--config" if i + 1 < args.len() => {
                config_path = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    (port, bind, config_path)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("gateway_server=info".parse()?))
        .init();

    let (port, bind, config_path) = parse_args();

    let config = match &config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            ServerConfig::from_toml_str(&raw)?
        }
        None => ServerConfig::default(),
    };

    let policy: Arc<dyn PermissionPolicy> = Arc::new(gateway_core::permission::NoOpPolicy);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(gateway_server::run_server(addr, Arc::new(config), policy))
}
