use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{config::ServerConfig, protocol::LockMode};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the lock broker, accepting TCP connections.
    Server(ServerArgs),
    /// Lock a resource, run one critical section against it, and release.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServerArgs {
    /// TOML configuration file; flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Socket address the broker should bind to. Use port 0 for an ephemeral port.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Listen backlog for pending connections.
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Directory where resource payloads are stored.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Keep payloads in memory only.
    #[arg(long)]
    pub memory: bool,

    /// Default log level when RUST_LOG is not set.
    #[arg(long)]
    pub log_level: Option<String>,
}

impl ServerArgs {
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(backlog) = self.backlog {
            config.backlog = backlog;
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if self.memory {
            config.memory = true;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the lock broker.
    #[arg(long, default_value_t = crate::config::default_listen())]
    pub server: SocketAddr,

    /// Resource to lock.
    pub resource: String,

    /// READ or WRITE.
    pub mode: LockMode,

    /// Payload to store while holding a WRITE lock.
    #[arg(default_value = "")]
    pub content: String,

    /// Seconds to keep the lock before finishing the critical section.
    #[arg(long, default_value_t = 0)]
    pub hold_secs: u64,
}
