//! Spawning local `stratusd` worker processes.
//!
//! Used by `attach_local` and `init_local` to grow a cluster with
//! nodes on the controller's machine. Spawned children are owned by the
//! controller: they are killed on disposal, and `kill_on_drop` covers
//! the case where the controller is dropped without a clean dispose.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::settings::Settings;
use crate::error::ControllerError;
use crate::transport::NodeRef;

/// Options for spawning one local node.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Port the node listens on.
    pub port: u16,
    /// Hostname to bind; defaults to the loopback address.
    pub hostname: Option<String>,
    /// Start the daemon with verbose diagnostics.
    pub debug: bool,
    /// Detach the daemon from the controlling terminal.
    pub background: bool,
}

/// A spawned local node: its address plus the owned child process.
pub struct LocalNode {
    node: NodeRef,
    child: Child,
}

impl LocalNode {
    /// The node's address handle.
    pub fn node_ref(&self) -> &NodeRef {
        &self.node
    }

    /// Whether the child process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Forcibly terminate the child process.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        debug!(node = %self.node, "killing local node");
        self.child.kill().await
    }
}

/// Spawns `stratusd` processes from a configured executable path.
#[derive(Debug)]
pub struct LocalSpawner {
    executable: PathBuf,
}

impl LocalSpawner {
    /// Build a spawner from settings.
    ///
    /// Fails with a configuration error when no executable path is
    /// configured.
    pub fn from_settings(settings: &Settings) -> Result<Self, ControllerError> {
        let executable = settings.stratusd_path.clone().ok_or_else(|| {
            ControllerError::Configuration(
                "stratusd-path is not configured; cannot spawn local nodes".into(),
            )
        })?;
        if !executable.exists() {
            return Err(ControllerError::Configuration(format!(
                "stratusd executable not found at {}",
                executable.display()
            )));
        }
        Ok(Self { executable })
    }

    /// Command-line arguments for the given options.
    fn build_args(options: &SpawnOptions) -> Vec<String> {
        let mut args = vec!["--port".to_string(), options.port.to_string()];
        if let Some(hostname) = &options.hostname {
            args.push("--hostname".to_string());
            args.push(hostname.clone());
        }
        if options.debug {
            args.push("--debug".to_string());
        }
        if options.background {
            args.push("--background".to_string());
        }
        args
    }

    /// Spawn one node.
    pub fn spawn(&self, options: SpawnOptions) -> Result<LocalNode, ControllerError> {
        let args = Self::build_args(&options);
        let child = Command::new(&self.executable)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ControllerError::Configuration(format!(
                    "failed to spawn {}: {e}",
                    self.executable.display()
                ))
            })?;

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), options.port);
        let node = NodeRef::new(format!("local-{}", options.port), addr);
        info!(node = %node, pid = ?child.id(), "spawned local node");
        Ok(LocalNode { node, child })
    }

    /// Spawn `count` nodes on consecutive ports starting at
    /// `base_port`.
    pub fn spawn_many(
        &self,
        count: usize,
        base_port: u16,
        debug: bool,
    ) -> Result<Vec<LocalNode>, ControllerError> {
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let port = base_port
                .checked_add(i as u16)
                .ok_or_else(|| ControllerError::Configuration("port range overflow".into()))?;
            nodes.push(self.spawn(SpawnOptions {
                port,
                hostname: None,
                debug,
                background: true,
            })?);
        }
        Ok(nodes)
    }
}
