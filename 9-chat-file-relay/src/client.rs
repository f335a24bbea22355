use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    error::ConfigError,
    frame::{self, DEFAULT_FILE_CHUNK_SIZE, DEFAULT_FRAME_SIZE, Frame, MessageKind},
};

/// Frame geometry the client writes with. `frame_size` must match the
/// server's, or a server read can span two client frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSizes {
    pub frame_size: usize,
    pub file_chunk_size: usize,
}

impl Default for FrameSizes {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            file_chunk_size: DEFAULT_FILE_CHUNK_SIZE,
        }
    }
}

impl FrameSizes {
    /// A file chunk plus its `username;Kind;` header has to fit in one frame.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_size == 0 {
            return Err(ConfigError::Zero("frame_size"));
        }
        if self.file_chunk_size == 0 {
            return Err(ConfigError::Zero("file_chunk_size"));
        }
        if self.file_chunk_size >= self.frame_size {
            return Err(ConfigError::ChunkTooLarge {
                frame_size: self.frame_size,
                file_chunk_size: self.file_chunk_size,
            });
        }
        Ok(())
    }
}

/// Something the server delivered to this client.
///
/// File frames are forwarded untouched, so their username field still names
/// the recipient and the sender is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text { from: String, text: String },
    FileChunk { kind: MessageKind, payload: Vec<u8> },
}

/// A connected, registered client.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    username: String,
    frame_size: usize,
    file_chunk_size: usize,
    pending: Vec<Incoming>,
}

impl Client {
    /// Connects with the default frame sizes.
    pub async fn connect(addr: SocketAddr, username: &str) -> Result<Self> {
        Self::connect_with(addr, username, FrameSizes::default()).await
    }

    /// Connects and performs the username handshake. Any reply other than the
    /// acceptance line is returned as an error carrying the server's text.
    pub async fn connect_with(addr: SocketAddr, username: &str, sizes: FrameSizes) -> Result<Self> {
        sizes.validate()?;
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(sizes.frame_size, reader);

        frame::write_line(&mut writer, username).await?;
        let reply = frame::read_line(&mut reader, sizes.frame_size)
            .await?
            .context("server closed the connection during handshake")?;
        if reply != frame::ACCEPTED {
            bail!("server rejected username '{username}': {reply}");
        }

        info!(%addr, username, "connected");
        Ok(Self {
            reader,
            writer,
            username: username.to_string(),
            frame_size: sizes.frame_size,
            file_chunk_size: sizes.file_chunk_size,
            pending: Vec::new(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub async fn send_text(&mut self, dest: &str, text: &str) -> Result<()> {
        self.send_frame(dest, MessageKind::Text, text.as_bytes()).await
    }

    /// Writes one frame padded to the full frame size.
    pub async fn send_frame(&mut self, dest: &str, kind: MessageKind, payload: &[u8]) -> Result<()> {
        let encoded = frame::encode_padded(dest, kind, payload, self.frame_size)?;
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Sends file contents as a run of `FilePart` frames ending in a `FileEof`
    /// frame. Returns the number of frames written.
    pub async fn send_file_bytes(&mut self, dest: &str, data: &[u8]) -> Result<usize> {
        let chunks = frame::file_chunks(data, self.file_chunk_size);
        for (kind, chunk) in &chunks {
            self.send_frame(dest, *kind, chunk).await?;
        }
        Ok(chunks.len())
    }

    pub async fn send_file(&mut self, dest: &str, path: &Path) -> Result<usize> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        self.send_file_bytes(dest, &data).await
    }

    /// Reads the next delivery. Returns `None` once the server closes the
    /// connection.
    pub async fn next_incoming(&mut self) -> Result<Option<Incoming>> {
        loop {
            if !self.pending.is_empty() {
                return Ok(Some(self.pending.remove(0)));
            }

            let mut buffer = vec![0u8; self.frame_size];
            let read = self.reader.read(&mut buffer).await?;
            if read == 0 {
                return Ok(None);
            }
            self.pending = split_incoming(&buffer[..read]);
        }
    }

    pub async fn shutdown(&mut self) {
        if let Err(error) = self.writer.shutdown().await {
            warn!(?error, "failed to shutdown client writer cleanly");
        }
    }
}

/// Turns one read buffer into deliveries. Text frames are newline terminated,
/// so a buffer holding several of them is split per line; file frames are
/// taken whole.
fn split_incoming(raw: &[u8]) -> Vec<Incoming> {
    let frames = match frame::decode(raw) {
        Ok(first) if !first.kind.is_file() => raw
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.iter().all(|byte| *byte == 0))
            .filter_map(|line| frame::decode(line).ok())
            .collect(),
        Ok(file_frame) => vec![file_frame],
        Err(err) => {
            debug!(%err, "ignoring undecodable frame");
            Vec::new()
        }
    };

    frames.into_iter().map(Incoming::from).collect()
}

impl From<Frame> for Incoming {
    fn from(frame: Frame) -> Self {
        match frame.kind {
            MessageKind::Text => Incoming::Text {
                text: frame.payload_text(),
                from: frame.username,
            },
            kind => Incoming::FileChunk {
                kind,
                payload: frame.payload,
            },
        }
    }
}

/// Collects incoming file chunks and writes each finished file into a
/// download directory.
#[derive(Debug)]
pub struct FileAssembler {
    dir: PathBuf,
    buffer: Vec<u8>,
    completed: usize,
}

impl FileAssembler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            buffer: Vec::new(),
            completed: 0,
        }
    }

    /// Appends a chunk; on `FileEof` writes the file and returns its path.
    pub async fn push(&mut self, kind: MessageKind, payload: &[u8]) -> Result<Option<PathBuf>> {
        self.buffer.extend_from_slice(payload);
        if kind != MessageKind::FileEof {
            return Ok(None);
        }

        self.completed += 1;
        let path = self.dir.join(format!("received-{}.bin", self.completed));
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, &self.buffer)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        self.buffer.clear();
        Ok(Some(path))
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let sizes = FrameSizes {
        frame_size: args.frame_size,
        file_chunk_size: args.file_chunk_size,
    };
    let mut client = Client::connect_with(args.server, &args.username, sizes).await?;
    write_stdout(&format!("*** connected as {}", client.username())).await?;

    let mut assembler = FileAssembler::new(args.download_dir.clone());
    let mut peer = args.peer.clone();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            incoming = client.next_incoming() => {
                if !handle_incoming(incoming, &mut assembler).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_stdin_input(bytes_read, &input, &mut client, &mut peer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn handle_incoming(incoming: Result<Option<Incoming>>, assembler: &mut FileAssembler) -> Result<bool> {
    match incoming? {
        Some(Incoming::Text { from, text }) => {
            write_stdout(&format!("<{from}> {text}")).await?;
            Ok(true)
        }
        Some(Incoming::FileChunk { kind, payload }) => {
            if let Some(path) = assembler.push(kind, &payload).await? {
                write_stdout(&format!("*** received file {}", path.display())).await?;
            }
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    client: &mut Client,
    peer: &mut Option<String>,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let line = input.trim_end();
    if line.is_empty() {
        return Ok(true);
    }

    if line.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if let Some(name) = line.strip_prefix("/to ") {
        let name = name.trim();
        write_stdout(&format!("*** talking to {name}")).await?;
        *peer = Some(name.to_string());
        return Ok(true);
    }

    let Some(dest) = peer.as_deref() else {
        write_stderr("!!! pick a peer first with /to <username>").await?;
        return Ok(true);
    };

    if let Some(path) = line.strip_prefix("/file ") {
        let path = Path::new(path.trim());
        match client.send_file(dest, path).await {
            Ok(frames) => write_stdout(&format!("*** sent {} in {frames} frames", path.display())).await?,
            Err(err) => write_stderr(&format!("!!! {err:#}")).await?,
        }
        return Ok(true);
    }

    if let Err(err) = client.send_text(dest, line).await {
        write_stderr(&format!("!!! {err:#}")).await?;
    }
    Ok(true)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
