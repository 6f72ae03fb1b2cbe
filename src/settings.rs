//! Process-wide configuration (spec §6 "Environment, exit codes, persisted
//! state layout"), parsed from argv via `clap`.

use std::path::PathBuf;

use clap::Parser;

/// Command-line configuration for the `vmesh` agent.
#[derive(Debug, Parser)]
#[command(name = "vmesh", version, about = "Distributed VM and container orchestration host-agent")]
pub struct Settings {
    /// Hostname this agent identifies itself as on the mesh. Defaults to
    /// the machine's hostname.
    #[arg(long, env = "VMESH_HOST")]
    pub host: Option<String>,

    /// Directory holding per-namespace instance state, the control socket,
    /// and the VLAN alias table (spec §6 persisted state layout).
    #[arg(long, env = "VMESH_BASE", default_value = "/tmp/vmesh")]
    pub base_dir: PathBuf,

    /// TCP address this agent listens on for peer mesh connections.
    #[arg(long, env = "VMESH_MESH_ADDR", default_value = "0.0.0.0:9000")]
    pub mesh_addr: std::net::SocketAddr,

    /// Peer addresses to dial at startup, `host=addr` pairs.
    #[arg(long = "peer", env = "VMESH_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Log level passed to `tracing_subscriber::EnvFilter` when
    /// `RUST_LOG` isn't set.
    #[arg(long, env = "VMESH_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit newline-delimited JSON logs instead of the human-readable
    /// format (spec §6: "container/orchestration deployments prefer JSON
    /// logs").
    #[arg(long, env = "VMESH_LOG_JSON")]
    pub log_json: bool,
}

impl Settings {
    pub fn parse_args() -> Self {
        Settings::parse()
    }

    /// Resolve the agent's hostname: the `--host` flag, falling back to
    /// the OS hostname.
    pub fn resolved_host(&self) -> String {
        self.host.clone().unwrap_or_else(|| {
            hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "localhost".to_string())
        })
    }
}

mod hostname {
    // A tiny local shim: nix's hostname feature is already a dependency
    // for everything else platform-specific this crate does.
    pub fn get() -> std::io::Result<std::ffi::OsString> {
        #[cfg(target_os = "linux")]
        {
            nix::unistd::gethostname().map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        }
        #[cfg(not(target_os = "linux"))]
        {
            Ok(std::ffi::OsString::from("localhost"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_args() {
        let settings = Settings::parse_from(["vmesh", "--host", "h0"]);
        assert_eq!(settings.host.as_deref(), Some("h0"));
        assert_eq!(settings.base_dir, PathBuf::from("/tmp/vmesh"));
    }

    #[test]
    fn splits_comma_separated_peers() {
        let settings = Settings::parse_from(["vmesh", "--peer", "h1=10.0.0.1:9000,h2=10.0.0.2:9000"]);
        assert_eq!(settings.peers, vec!["h1=10.0.0.1:9000".to_string(), "h2=10.0.0.2:9000".to_string()]);
    }
}
