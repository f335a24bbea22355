//! Error types for the relay library.
//!
//! Frame errors are recoverable (the frame is skipped), server errors are fatal
//! to startup only. Per-connection transport failures stay `std::io::Error`
//! and end just the session that hit them.

use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame has fewer than three fields")]
    MissingFields,

    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error("frame header is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoded frame is {len} bytes, larger than the {frame_size} byte frame")]
    FrameTooLarge { len: usize, frame_size: usize },
}

#[derive(Debug, Error)]
pub enum LineError {
    #[error("line is longer than {max_len} bytes")]
    TooLong { max_len: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("frame_size ({frame_size}) must leave room for a header after file_chunk_size ({file_chunk_size})")]
    ChunkTooLarge {
        frame_size: usize,
        file_chunk_size: usize,
    },
}

impl ServerError {
    /// Short label used in log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }
}
