use std::{fmt, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RelayError;

/// Line a client sends to request a voluntary disconnect.
pub const EXIT_KEYWORD: &str = "exit";

/// A line received from a connected client, after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientLine {
    Chat(String),
    Exit,
}

impl ClientLine {
    pub fn parse(line: String) -> Self {
        if line.eq_ignore_ascii_case(EXIT_KEYWORD) {
            ClientLine::Exit
        } else {
            ClientLine::Chat(line)
        }
    }
}

/// A line the relay sends to its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Joined { name: String },
    Left { name: String },
    Chat { name: String, text: String },
    Error { reason: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Joined { name } => write!(f, "{name} joined"),
            Notice::Left { name } => write!(f, "{name} left"),
            Notice::Chat { name, text } => write!(f, "{name}: {text}"),
            Notice::Error { reason } => write!(f, "error: {reason}"),
        }
    }
}

/// Reads one line, stripping one `\n` and then one `\r`. Bytes that are not
/// valid UTF-8 are replaced with U+FFFD. `Ok(None)` means end of stream.
///
/// Bytes already in `buf` are treated as the start of the line, so a call
/// that was cancelled part way through can be resumed with the same buffer.
pub async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let bytes = reader.read_until(b'\n', buf).await?;
    if bytes == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = decode_line(buf);
    buf.clear();
    Ok(Some(line))
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Line-at-a-time reader over a buffered stream.
///
/// `next_line` is cancel safe: a partial line read before the future was
/// dropped is kept and completed by the next call.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        read_line(&mut self.inner, &mut self.buf).await
    }
}

/// Writes `line` followed by a newline and flushes so peers see it immediately.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// Reads the peer's display name, the first line of every connection.
pub async fn read_handshake<R>(reader: &mut R) -> Result<String, RelayError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let line = match read_line(reader, &mut buf).await {
        Ok(Some(line)) => line,
        Ok(None) => return Err(RelayError::Handshake("connection closed before handshake".into())),
        Err(err) => return Err(RelayError::Handshake(format!("failed to read name: {err}"))),
    };

    let name = line.trim();
    if name.is_empty() {
        return Err(RelayError::Handshake("name cannot be empty".into()));
    }
    Ok(name.to_string())
}
