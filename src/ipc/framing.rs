//! Message framing for JSON-RPC byte streams.
//!
//! A [`Framing`] is chosen by name, independently for the client listener and
//! for the backend pipe. Every strategy carries one JSON document per frame:
//!
//! ```text
//! raw            {"jsonrpc":"2.0",...}{"jsonrpc":"2.0",...}
//! line           {"jsonrpc":"2.0",...}\n
//! header         Content-Length: 47\r\n\r\n{"jsonrpc":"2.0",...}
//! lsp            Content-Length: 47\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n...
//! header:<mime>  Content-Length: 47\r\nContent-Type: <mime>\r\n\r\n...
//! decimal        47\n{"jsonrpc":"2.0",...}
//! varint         <LEB128 length>{"jsonrpc":"2.0",...}
//! ```
//!
//! Header parsing is case-insensitive and handles both CRLF and LF line
//! endings.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ConfigError, FramingError};

/// Maximum message size (100MB) to prevent OOM from malicious/buggy peers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Content type written and expected by the `lsp` framing.
pub const LSP_CONTENT_TYPE: &str = "application/vscode-jsonrpc; charset=utf-8";

/// Upper bound on a header block before the blank line.
const MAX_HEADER_SIZE: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// A byte-level message delimiting strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Concatenated JSON values, delimited only by their own syntax.
    Raw,
    /// One message per newline-terminated line.
    Line,
    /// `Content-Length` header block, with an optional `Content-Type`.
    Header { content_type: Option<String> },
    /// ASCII decimal length and a newline before each body.
    Decimal,
    /// Unsigned LEB128 length before each body.
    Varint,
}

impl Framing {
    /// The framing used by language servers.
    pub fn lsp() -> Self {
        Framing::Header {
            content_type: Some(LSP_CONTENT_TYPE.to_string()),
        }
    }
}

impl FromStr for Framing {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "raw" => Ok(Framing::Raw),
            "line" => Ok(Framing::Line),
            "header" => Ok(Framing::Header { content_type: None }),
            "lsp" => Ok(Framing::lsp()),
            "decimal" => Ok(Framing::Decimal),
            "varint" => Ok(Framing::Varint),
            _ => match name.strip_prefix("header:") {
                Some(mime) if !mime.trim().is_empty() => Ok(Framing::Header {
                    content_type: Some(mime.trim().to_string()),
                }),
                _ => Err(ConfigError::UnknownFraming(name.to_string())),
            },
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Raw => f.write_str("raw"),
            Framing::Line => f.write_str("line"),
            Framing::Header { content_type: None } => f.write_str("header"),
            Framing::Header {
                content_type: Some(t),
            } if t == LSP_CONTENT_TYPE => f.write_str("lsp"),
            Framing::Header {
                content_type: Some(t),
            } => write!(f, "header:{}", t),
            Framing::Decimal => f.write_str("decimal"),
            Framing::Varint => f.write_str("varint"),
        }
    }
}

// =============================================================================
// Reading
// =============================================================================

/// Reads frames from a byte stream.
///
/// All partial state lives in an internal buffer and the only suspension
/// point reads into a local chunk, so [`FrameReader::read_frame`] is cancel
/// safe and may be used as a `tokio::select!` branch.
pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    buf: Vec<u8>,
    scan: Scan,
    eof: bool,
}

/// How far into the buffer the `raw` and `line` decoders have looked, so each
/// read only examines the bytes that just arrived.
#[derive(Debug, Default)]
struct Scan {
    /// Bytes at the front of the buffer already examined.
    pos: usize,
    /// Open `{`/`[` count of the value being read.
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// Buffer length at the last trial parse of an incomplete value.
    parsed_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing) -> Self {
        Self {
            inner,
            framing,
            buf: Vec::new(),
            scan: Scan::default(),
            eof: false,
        }
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    /// Read the next frame body.
    ///
    /// Returns `Ok(None)` when the peer closed the stream between frames.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The stream closes with a partial frame buffered
    /// - The frame header is malformed or declares more than MAX_MESSAGE_SIZE
    /// - The underlying read fails
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        loop {
            if let Some(frame) = decode(&self.framing, &mut self.buf, &mut self.scan, self.eof)? {
                return Ok(Some(frame));
            }
            if self.eof {
                return if self.at_clean_eof() {
                    self.buf.clear();
                    self.scan = Scan::default();
                    Ok(None)
                } else {
                    Err(FramingError::Truncated(self.buf.len()))
                };
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    fn at_clean_eof(&self) -> bool {
        match self.framing {
            // Length bytes can look like whitespace.
            Framing::Varint => self.buf.is_empty(),
            _ => self.buf.iter().all(u8::is_ascii_whitespace),
        }
    }
}

fn decode(
    framing: &Framing,
    buf: &mut Vec<u8>,
    scan: &mut Scan,
    eof: bool,
) -> Result<Option<Vec<u8>>, FramingError> {
    match framing {
        Framing::Raw => decode_raw(buf, scan),
        Framing::Line => decode_line(buf, scan, eof),
        Framing::Header { content_type } => decode_header(buf, content_type.as_deref()),
        Framing::Decimal => decode_decimal(buf),
        Framing::Varint => decode_varint(buf),
    }
}

fn check_size(size: usize) -> Result<(), FramingError> {
    if size > MAX_MESSAGE_SIZE {
        return Err(FramingError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Take `len` body bytes starting at `start`, if they have all arrived.
fn take_body(buf: &mut Vec<u8>, start: usize, len: usize) -> Option<Vec<u8>> {
    if buf.len() < start + len {
        return None;
    }
    let body = buf[start..start + len].to_vec();
    buf.drain(..start + len);
    Some(body)
}

/// Decode one concatenated JSON value.
///
/// Objects, arrays and strings are scanned incrementally for the byte that
/// closes them, and only then parsed in full. An incomplete value is also
/// trial-parsed each time the buffer doubles, so syntax errors surface early
/// while total work stays linear in the frame size.
fn decode_raw(buf: &mut Vec<u8>, scan: &mut Scan) -> Result<Option<Vec<u8>>, FramingError> {
    if scan.pos == 0 {
        match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => {
                buf.drain(..start);
            }
            None => {
                buf.clear();
                return Ok(None);
            }
        }
    }

    if !matches!(buf[0], b'{' | b'[' | b'"') {
        // Bare scalars are short; parse them directly.
        return take_parsed(buf, scan);
    }

    let mut closed = false;
    while scan.pos < buf.len() {
        let b = buf[scan.pos];
        scan.pos += 1;
        if scan.in_string {
            if scan.escaped {
                scan.escaped = false;
            } else if b == b'\\' {
                scan.escaped = true;
            } else if b == b'"' {
                scan.in_string = false;
                closed = scan.depth == 0;
            }
        } else {
            match b {
                b'"' => scan.in_string = true,
                b'{' | b'[' => scan.depth += 1,
                b'}' | b']' => {
                    scan.depth = scan.depth.saturating_sub(1);
                    closed = scan.depth == 0;
                }
                _ => {}
            }
        }
        if closed {
            break;
        }
    }

    if closed || buf.len() >= 2 * scan.parsed_len {
        return take_parsed(buf, scan);
    }
    check_size(buf.len())?;
    Ok(None)
}

/// Parse the value at the front of `buf` and take it if complete.
fn take_parsed(buf: &mut Vec<u8>, scan: &mut Scan) -> Result<Option<Vec<u8>>, FramingError> {
    let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<serde::de::IgnoredAny>();
    match values.next() {
        Some(Ok(_)) => {
            let end = values.byte_offset();
            *scan = Scan::default();
            Ok(take_body(buf, 0, end))
        }
        Some(Err(e)) if e.is_eof() => {
            check_size(buf.len())?;
            scan.parsed_len = buf.len();
            Ok(None)
        }
        Some(Err(e)) => {
            buf.clear();
            *scan = Scan::default();
            Err(FramingError::Malformed(e.to_string()))
        }
        None => Ok(None),
    }
}

fn decode_line(buf: &mut Vec<u8>, scan: &mut Scan, eof: bool) -> Result<Option<Vec<u8>>, FramingError> {
    loop {
        let Some(offset) = buf[scan.pos..].iter().position(|&b| b == b'\n') else {
            check_size(buf.len())?;
            scan.pos = buf.len();
            if eof && !buf.iter().all(u8::is_ascii_whitespace) {
                scan.pos = 0;
                return Ok(Some(std::mem::take(buf)));
            }
            return Ok(None);
        };

        let newline = scan.pos + offset;
        scan.pos = 0;
        let mut line: Vec<u8> = buf.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        // Blank lines between messages are ignored
        if !line.iter().all(u8::is_ascii_whitespace) {
            return Ok(Some(line));
        }
    }
}

/// Parse a `Content-Length` header block.
///
/// # Protocol
///
/// 1. Read headers until an empty line (handles both CRLF and LF)
/// 2. Extract Content-Length header (case-insensitive)
/// 3. Take exactly that many bytes for the body
fn decode_header(buf: &mut Vec<u8>, expected_type: Option<&str>) -> Result<Option<Vec<u8>>, FramingError> {
    let mut content_length: Option<usize> = None;
    let mut content_type: Option<String> = None;
    let mut seen_header = false;
    let mut pos = 0;

    let body_start = loop {
        let Some(offset) = buf[pos..].iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(FramingError::Malformed("header block too long".to_string()));
            }
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&buf[pos..pos + offset]);
        let trimmed = line.trim();
        pos += offset + 1;

        // Empty line signals end of headers; stray blank lines before a
        // header block are skipped.
        if trimmed.is_empty() {
            if seen_header {
                break pos;
            }
            continue;
        }
        seen_header = true;

        if let Some(colon_pos) = trimmed.find(':') {
            let key = trimmed[..colon_pos].trim();
            let value = trimmed[colon_pos + 1..].trim();

            if key.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(value.parse().map_err(|_| {
                    FramingError::Malformed(format!("Invalid Content-Length value: {}", value))
                })?);
            } else if key.eq_ignore_ascii_case("Content-Type") {
                content_type = Some(value.to_string());
            }
        }
    };

    let size = content_length
        .ok_or_else(|| FramingError::Malformed("Missing Content-Length header".to_string()))?;
    check_size(size)?;

    if let (Some(expected), Some(actual)) = (expected_type, content_type.as_deref()) {
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(FramingError::Malformed(format!(
                "Unexpected Content-Type {:?} (want {:?})",
                actual, expected
            )));
        }
    }

    Ok(take_body(buf, body_start, size))
}

fn decode_decimal(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, FramingError> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > 32 {
            return Err(FramingError::Malformed("decimal length prefix too long".to_string()));
        }
        return Ok(None);
    };

    let prefix = String::from_utf8_lossy(&buf[..newline]);
    let size: usize = prefix
        .trim()
        .parse()
        .map_err(|_| FramingError::Malformed(format!("Invalid decimal length {:?}", prefix.trim())))?;
    check_size(size)?;

    Ok(take_body(buf, newline + 1, size))
}

fn decode_varint(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, FramingError> {
    let mut size: u64 = 0;
    for (i, &b) in buf.iter().enumerate().take(10) {
        size |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            let size = usize::try_from(size).unwrap_or(usize::MAX);
            check_size(size)?;
            return Ok(take_body(buf, i + 1, size));
        }
    }
    if buf.len() >= 10 {
        return Err(FramingError::Malformed("varint length overflow".to_string()));
    }
    Ok(None)
}

// =============================================================================
// Writing
// =============================================================================

/// Writes frames to a byte stream. Every frame is flushed before returning.
pub struct FrameWriter<W> {
    inner: W,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, framing: Framing) -> Self {
        Self { inner, framing }
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    /// Write one frame body with this writer's framing.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is too large, cannot be represented in
    /// this framing (a raw newline under `line`), or the write or flush fails.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), FramingError> {
        check_size(body.len())?;

        let mut frame = Vec::with_capacity(body.len() + 64);
        match &self.framing {
            Framing::Raw => frame.extend_from_slice(body),
            Framing::Line => {
                if body.contains(&b'\n') {
                    return Err(FramingError::Malformed(
                        "line framing cannot carry a newline".to_string(),
                    ));
                }
                frame.extend_from_slice(body);
                frame.push(b'\n');
            }
            Framing::Header { content_type } => {
                frame.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
                if let Some(t) = content_type {
                    frame.extend_from_slice(format!("Content-Type: {}\r\n", t).as_bytes());
                }
                frame.extend_from_slice(b"\r\n");
                frame.extend_from_slice(body);
            }
            Framing::Decimal => {
                frame.extend_from_slice(format!("{}\n", body.len()).as_bytes());
                frame.extend_from_slice(body);
            }
            Framing::Varint => {
                let mut n = body.len() as u64;
                loop {
                    let byte = (n & 0x7f) as u8;
                    n >>= 7;
                    if n == 0 {
                        frame.push(byte);
                        break;
                    }
                    frame.push(byte | 0x80);
                }
                frame.extend_from_slice(body);
            }
        }

        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Serialize a JSON value and write it as one frame.
    pub async fn write_value(&mut self, value: &Value) -> Result<(), FramingError> {
        let body = serde_json::to_vec(value)?;
        self.write_frame(&body).await
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<(), FramingError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
