use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{
    config::RelayConfig,
    frame::{DEFAULT_FILE_CHUNK_SIZE, DEFAULT_FRAME_SIZE},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting chat and file transfers over TCP.
    Server(ServerArgs),
    /// Connect to a relay server and chat with other users.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// TOML file with relay settings; flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Size in bytes of one frame read from a client. Clients must use the
    /// same value.
    #[arg(long)]
    pub frame_size: Option<usize>,

    /// Seconds a new connection has to send its username.
    #[arg(long)]
    pub handshake_timeout_secs: Option<u64>,
}

impl ServerArgs {
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(frame_size) = self.frame_size {
            config.frame_size = frame_size;
        }
        if let Some(secs) = self.handshake_timeout_secs {
            config.handshake_timeout_secs = secs;
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Username to register with the server.
    #[arg(long)]
    pub username: String,

    /// Address of the relay server.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub server: SocketAddr,

    /// User to talk to; can be changed later with `/to <username>`.
    #[arg(long)]
    pub peer: Option<String>,

    /// Directory where received files are written.
    #[arg(long, default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Size in bytes of every frame sent; must match the server's.
    #[arg(long, default_value_t = DEFAULT_FRAME_SIZE)]
    pub frame_size: usize,

    /// File bytes carried per frame; must leave room for the frame header.
    #[arg(long, default_value_t = DEFAULT_FILE_CHUNK_SIZE)]
    pub file_chunk_size: usize,
}
