use std::{fmt, io, str::FromStr};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DecodeError, EncodeError, LineError};

pub const FIELD_SEPARATOR: u8 = b';';
pub const DEFAULT_FRAME_SIZE: usize = 4096;
pub const DEFAULT_FILE_CHUNK_SIZE: usize = 3072;

pub const ACCEPTED: &str = "Username accepted";
pub const EMPTY_USERNAME: &str = "Please pick a username";
pub const DUPLICATE_USERNAME: &str = "Username already exist, pick another one";
pub const INVALID_USERNAME: &str = "Username cannot contain ';'";
pub const USERNAME_TOO_LONG: &str = "Username is too long";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    FilePart,
    FileEof,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "Text",
            MessageKind::FilePart => "FilePart",
            MessageKind::FileEof => "FileEof",
        }
    }

    pub fn is_file(self) -> bool {
        matches!(self, MessageKind::FilePart | MessageKind::FileEof)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [MessageKind::Text, MessageKind::FilePart, MessageKind::FileEof]
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| DecodeError::UnknownKind(value.to_string()))
    }
}

/// One unit of post-handshake wire data.
///
/// `username` names the destination when a client sends the frame and the
/// sender when the server delivers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub username: String,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            kind: MessageKind::Text,
            payload: text.into().into_bytes(),
        }
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(&self.username, self.kind, &self.payload)
    }
}

/// Decodes one frame buffer as read off the socket.
///
/// Only the first two separators split fields; anything after the second one
/// belongs to the payload. Trailing NUL padding is dropped for every kind,
/// which also eats NUL bytes that genuinely end a file chunk.
pub fn decode(raw: &[u8]) -> Result<Frame, DecodeError> {
    let raw = trim_padding(raw);
    let mut fields = raw.splitn(3, |byte| *byte == FIELD_SEPARATOR);

    let (Some(username), Some(kind), Some(payload)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(DecodeError::MissingFields);
    };

    let username = std::str::from_utf8(username).map_err(|_| DecodeError::InvalidUtf8)?;
    let kind = std::str::from_utf8(kind).map_err(|_| DecodeError::InvalidUtf8)?;
    let kind: MessageKind = kind.parse()?;

    let payload = if kind.is_file() {
        payload
    } else {
        strip_line_ending(payload)
    };

    Ok(Frame {
        username: username.to_string(),
        kind,
        payload: payload.to_vec(),
    })
}

/// Encodes `username;Kind;payload`. Text frames are newline terminated so line
/// oriented readers can pick them apart; file frames carry no terminator.
pub fn encode(username: &str, kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(username.len() + kind.as_str().len() + payload.len() + 3);
    encoded.extend_from_slice(username.as_bytes());
    encoded.push(FIELD_SEPARATOR);
    encoded.extend_from_slice(kind.as_str().as_bytes());
    encoded.push(FIELD_SEPARATOR);
    encoded.extend_from_slice(payload);
    if kind == MessageKind::Text {
        encoded.push(b'\n');
    }
    encoded
}

/// Encodes a frame and NUL-pads it to exactly `frame_size` bytes.
pub fn encode_padded(
    username: &str,
    kind: MessageKind,
    payload: &[u8],
    frame_size: usize,
) -> Result<Vec<u8>, EncodeError> {
    let mut encoded = encode(username, kind, payload);
    if encoded.len() > frame_size {
        return Err(EncodeError::FrameTooLarge {
            len: encoded.len(),
            frame_size,
        });
    }
    encoded.resize(frame_size, 0);
    Ok(encoded)
}

/// Splits file contents into wire chunks: every chunk is `FilePart` except the
/// last, which is `FileEof`. An empty file still produces one empty `FileEof`.
pub fn file_chunks(data: &[u8], chunk_size: usize) -> Vec<(MessageKind, &[u8])> {
    if data.is_empty() || chunk_size == 0 {
        return vec![(MessageKind::FileEof, data)];
    }

    let count = data.len().div_ceil(chunk_size);
    data.chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let kind = if index + 1 == count {
                MessageKind::FileEof
            } else {
                MessageKind::FilePart
            };
            (kind, chunk)
        })
        .collect()
}

/// Reads the handshake line. At most `max_len` bytes before the `\n` are
/// accepted; a longer line is `LineError::TooLong` and is never truncated.
/// Returns `None` when the peer closed before sending anything.
pub async fn read_line<R>(reader: &mut R, max_len: usize) -> Result<Option<String>, LineError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let bytes = reader
        .take(max_len as u64 + 1)
        .read_until(b'\n', &mut raw)
        .await?;
    if bytes == 0 {
        return Ok(None);
    }
    if !raw.ends_with(b"\n") && raw.len() > max_len {
        return Err(LineError::TooLong { max_len });
    }

    let line = String::from_utf8(raw)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

fn trim_padding(raw: &[u8]) -> &[u8] {
    let end = raw.iter().rposition(|byte| *byte != 0).map_or(0, |pos| pos + 1);
    &raw[..end]
}

fn strip_line_ending(payload: &[u8]) -> &[u8] {
    let payload = payload.strip_suffix(b"\n").unwrap_or(payload);
    payload.strip_suffix(b"\r").unwrap_or(payload)
}
