//! Chat and file relay over plain TCP.
//!
//! Clients register a username with one line, then exchange fixed-size
//! `username;Kind;payload` frames. The server rewrites text frames with the
//! sender's name and echoes them back; file frames are piped to the
//! destination byte for byte.
//!
//! - [`frame`] encodes and decodes the wire format and handshake lines.
//! - [`registry`] maps usernames to live sessions and serializes writes to
//!   each connection.
//! - [`session`] runs the handshake and read loop for one connection.
//! - [`relay`] routes text and file frames between sessions.
//! - [`server`] accepts connections and owns shutdown.
//! - [`event`] publishes join/leave/relay events to observers.
//! - [`client`] is the terminal client, including file reassembly.
//! - [`config`] and [`cli`] cover settings and the command line.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
