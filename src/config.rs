// src/config.rs
use crate::error::{NocturneError, NocturneResult};
use serde::Deserialize;
use std::path::PathBuf;

/// Which sockets use edge triggering. Connections additionally always get
/// one-shot watches regardless of mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    /// Level-triggered listen socket and connections.
    LevelAll,
    /// Edge-triggered connections, level-triggered listen.
    ConnEdge,
    /// Edge-triggered listen, level-triggered connections.
    ListenEdge,
    /// Edge-triggered everywhere.
    #[default]
    EdgeAll,
}

impl TriggerMode {
    pub fn listen_edge(self) -> bool {
        matches!(self, TriggerMode::ListenEdge | TriggerMode::EdgeAll)
    }

    pub fn conn_edge(self) -> bool {
        matches!(self, TriggerMode::ConnEdge | TriggerMode::EdgeAll)
    }
}

/// Constructor-level server configuration. Loadable from TOML; every field
/// has a default so partial files work.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {
    /// Listen port, 1024-65535.
    pub port: u16,
    pub trigger_mode: TriggerMode,
    /// Idle timeout in milliseconds; 0 disables idle eviction.
    pub timeout_ms: u64,
    /// SO_LINGER on the listen socket.
    pub linger: bool,
    /// Worker threads; 0 selects host parallelism (floored at 2).
    pub workers: usize,
    /// Pin worker threads round-robin onto cores.
    pub pin_workers: bool,
    /// Accepted connections beyond this are refused with a canned reply.
    pub max_connections: usize,
    /// Bound on queued read/write tasks; overflow drops the connection.
    pub task_queue_capacity: usize,
    /// Document root served by GET requests.
    pub src_dir: PathBuf,
    pub log_enabled: bool,
    pub log_level: String,
    /// Queue depth handed to an external async log sink, when one is
    /// attached in place of the built-in subscriber.
    pub log_queue_capacity: usize,
    /// Install a Ctrl-C handler that stops the reactor. Off by default
    /// because a process-wide handler can only be installed once.
    pub install_ctrl_c: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 1316,
            trigger_mode: TriggerMode::default(),
            timeout_ms: 60_000,
            linger: false,
            workers: 0,
            pin_workers: false,
            max_connections: 65_536,
            task_queue_capacity: crate::pool::DEFAULT_QUEUE_CAPACITY,
            src_dir: PathBuf::from("./resources"),
            log_enabled: true,
            log_level: "info".to_string(),
            log_queue_capacity: 1024,
            install_ctrl_c: false,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(raw: &str) -> NocturneResult<Self> {
        toml::from_str(raw).map_err(|e| NocturneError::Config(e.to_string()))
    }

    /// Startup validation; failures here are fatal to the process.
    pub fn validate(&self) -> NocturneResult<()> {
        if self.port < 1024 {
            return Err(NocturneError::Config(format!(
                "port {} out of range (1024-65535)",
                self.port
            )));
        }
        if self.max_connections == 0 {
            return Err(NocturneError::Config(
                "max-connections must be at least 1".to_string(),
            ));
        }
        if !self.src_dir.is_dir() {
            return Err(NocturneError::Config(format!(
                "src-dir {} is not a directory",
                self.src_dir.display()
            )));
        }
        Ok(())
    }
}
