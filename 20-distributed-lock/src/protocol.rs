//! Text wire protocol spoken between clients and the broker.
//!
//! Each frame is a single UTF-8 line. Requests:
//!
//! - `LOCK <resource> <READ|WRITE>`
//! - `UNLOCK <resource> <READ|WRITE>`
//! - `READ <resource>`
//! - `WRITE <resource> <payload...>`
//!
//! Replies are `OK`, `VALUE <payload>` or `ERROR <reason>`. Command words and
//! modes are case-insensitive; resource names and payloads are not.

use std::{fmt, io, str::FromStr};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FrameError, ProtocolError};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest line accepted by [`read_frame`], excluding the newline.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const VALUE_PREFIX: &str = "VALUE ";

/// Whether `payload` can be sent back as the body of one `VALUE` line.
pub fn fits_in_frame(payload: &str) -> bool {
    !payload.contains(LINE_ENDINGS) && VALUE_PREFIX.len() + payload.len() <= MAX_FRAME_LEN
}

/// Broker-assigned identity of one client connection.
pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    pub fn parse(token: &str) -> Result<Self, ProtocolError> {
        match token.to_ascii_uppercase().as_str() {
            "READ" => Ok(LockMode::Read),
            "WRITE" => Ok(LockMode::Write),
            _ => Err(ProtocolError::InvalidMode(token.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Read => "READ",
            LockMode::Write => "WRITE",
        }
    }
}

impl FromStr for LockMode {
    type Err = ProtocolError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Self::parse(token)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Lock { resource: String, mode: LockMode },
    Unlock { resource: String, mode: LockMode },
    Read { resource: String },
    Write { resource: String, payload: String },
}

impl Request {
    /// Parses one request line (without its line terminator).
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (command, rest) = next_token(line).unwrap_or(("", ""));

        match command.to_ascii_uppercase().as_str() {
            "LOCK" => {
                let (resource, mode) = resource_and_mode("LOCK", rest)?;
                Ok(Request::Lock { resource, mode })
            }
            "UNLOCK" => {
                let (resource, mode) = resource_and_mode("UNLOCK", rest)?;
                Ok(Request::Unlock { resource, mode })
            }
            "READ" => {
                let (resource, _) = require_token("READ", "resource", rest)?;
                Ok(Request::Read {
                    resource: resource.to_string(),
                })
            }
            "WRITE" => {
                let (resource, rest) = require_token("WRITE", "resource", rest)?;
                Ok(Request::Write {
                    resource: resource.to_string(),
                    payload: strip_separator(rest).to_string(),
                })
            }
            _ => Err(ProtocolError::UnknownCommand(command.to_string())),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Lock { resource, mode } => write!(f, "LOCK {resource} {mode}"),
            Request::Unlock { resource, mode } => write!(f, "UNLOCK {resource} {mode}"),
            Request::Read { resource } => write!(f, "READ {resource}"),
            Request::Write { resource, payload } => write!(f, "WRITE {resource} {payload}"),
        }
    }
}

fn next_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.find(char::is_whitespace) {
        Some(end) => Some((&input[..end], &input[end..])),
        None => Some((input, "")),
    }
}

/// Drops the single whitespace character that separates tokens.
fn strip_separator(rest: &str) -> &str {
    let mut chars = rest.chars();
    chars.next();
    chars.as_str()
}

fn require_token<'a>(
    command: &'static str,
    argument: &'static str,
    input: &'a str,
) -> Result<(&'a str, &'a str), ProtocolError> {
    next_token(input).ok_or(ProtocolError::MissingArgument { command, argument })
}

fn resource_and_mode(
    command: &'static str,
    input: &str,
) -> Result<(String, LockMode), ProtocolError> {
    let (resource, rest) = require_token(command, "resource", input)?;
    let (mode, _) = require_token(command, "mode", rest)?;
    Ok((resource.to_string(), LockMode::parse(mode)?))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Value(String),
    Error(String),
}

impl Reply {
    pub fn error(reason: &str) -> Self {
        Reply::Error(reason.to_string())
    }

    /// Parses a reply line received by a client.
    pub fn parse(line: &str) -> Self {
        if line == "OK" {
            return Reply::Ok;
        }
        if line == "VALUE" {
            return Reply::Value(String::new());
        }
        if let Some(payload) = line.strip_prefix(VALUE_PREFIX) {
            return Reply::Value(payload.to_string());
        }
        match line.strip_prefix("ERROR ") {
            Some(reason) => Reply::Error(reason.to_string()),
            None => Reply::Error(line.to_string()),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => f.write_str("OK"),
            Reply::Value(payload) => write!(f, "VALUE {payload}"),
            Reply::Error(reason) => write!(f, "ERROR {reason}"),
        }
    }
}

/// Reads the next non-empty line, or `None` once the peer closes the stream.
///
/// A line longer than [`MAX_FRAME_LEN`] or one that is not valid UTF-8 is
/// consumed and reported as [`FrameError::Protocol`]; the reader is then
/// positioned at the start of the following line.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if line.len() > MAX_FRAME_LEN && !line.ends_with(b"\n") {
            skip_line(reader).await?;
            return Err(ProtocolError::LineTooLong {
                limit: MAX_FRAME_LEN,
            }
            .into());
        }

        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return String::from_utf8(line)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidEncoding.into());
    }
}

/// Discards input up to and including the next newline, without buffering it.
async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|byte| *byte == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(frame.len() + 1);
    encoded.extend_from_slice(frame.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
