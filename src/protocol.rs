//! Line-oriented compute protocol.
//!
//! Each request is one newline-terminated ASCII line of four
//! whitespace-separated fields:
//!
//! ```text
//! <tag> <op> <arg1> <arg2>\n
//! ```
//!
//! Supported operations:
//! - `+`: add two integers
//! - `LIST`: list the connections known to the server
//! - `NUMCLIENTS`: count the connections known to the server
//!
//! Every reply echoes the request and appends the result:
//!
//! ```text
//! Request:  100 + 5 5
//! Response: 100 + 5 5 = 10
//! ```
//!
//! A connection may pipeline any number of requests. A malformed or
//! unsupported request ends the session without a reply.

use crate::runtime::client::{Client, ConnectionId};
use bytes::{BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tracing::{debug, trace};

/// Size of the per-session line buffer, including the terminator slot.
pub const LINE_CAPACITY: usize = 256;

/// Longest request line accepted, terminator excluded.
pub const MAX_LINE_LENGTH: usize = LINE_CAPACITY - 1;

/// Fields longer than this are truncated.
pub const FIELD_WIDTH: usize = 19;

const FIELD_COUNT: usize = 4;

/// Server-side view of connected clients, queried by `LIST` and
/// `NUMCLIENTS`.
pub trait Directory {
    /// Number of connections, active or waiting for a worker.
    fn connection_count(&self) -> usize;

    /// `(id, peer)` of every connection in arrival order.
    fn connections(&self) -> Vec<(ConnectionId, String)>;
}

/// Framing violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("leftovers in read buffer at end of stream")]
    TruncatedLine,
    #[error("line longer than {} bytes", MAX_LINE_LENGTH)]
    LineTooLong,
}

/// Reasons a session ends unsuccessfully.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("comm channel in error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("failed to parse line: expected 4 fields, found {fields}")]
    Parse { fields: usize },

    #[error("unknown op {0:?}")]
    UnknownOperation(String),

    #[error("failed to send reply: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

/// Counters for a completed session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Requests answered.
    pub requests: usize,
    /// Bytes consumed from the stream.
    pub bytes_read: usize,
}

/// Request operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    List,
    NumClients,
}

impl Operation {
    fn parse(op: &[u8]) -> Option<Self> {
        match op {
            b"+" => Some(Operation::Add),
            b"LIST" => Some(Operation::List),
            b"NUMCLIENTS" => Some(Operation::NumClients),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "+",
            Operation::List => "LIST",
            Operation::NumClients => "NUMCLIENTS",
        }
    }
}

/// Field separator: ASCII whitespace plus vertical tab, matching C `isspace`.
fn is_separator(byte: &u8) -> bool {
    byte.is_ascii_whitespace() || *byte == 0x0b
}

/// A parsed request line, borrowing its fields from the line buffer.
///
/// Fields are raw bytes: the tag and arguments are echoed back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    /// Opaque tag echoed back in the reply.
    pub tag: &'a [u8],
    pub op: Operation,
    pub arg1: &'a [u8],
    pub arg2: &'a [u8],
}

impl<'a> Request<'a> {
    /// Parse one request line (terminator already stripped).
    pub fn parse(line: &'a [u8]) -> Result<Self, SessionError> {
        let fields: Vec<&[u8]> = line
            .split(is_separator)
            .filter(|field| !field.is_empty())
            .map(|field| &field[..field.len().min(FIELD_WIDTH)])
            .collect();

        let [tag, op, arg1, arg2] = <[&[u8]; FIELD_COUNT]>::try_from(fields).map_err(|fields| {
            SessionError::Parse {
                fields: fields.len(),
            }
        })?;

        let op = Operation::parse(op).ok_or_else(|| {
            SessionError::UnknownOperation(String::from_utf8_lossy(op).into_owned())
        })?;

        Ok(Request {
            tag,
            op,
            arg1,
            arg2,
        })
    }

    /// Build a reply carrying `result`, without terminator.
    fn reply(&self, result: impl std::fmt::Display) -> BytesMut {
        let mut reply = BytesMut::with_capacity(LINE_CAPACITY);
        for field in [self.tag, self.op.as_str().as_bytes(), self.arg1, self.arg2] {
            reply.extend_from_slice(field);
            reply.put_u8(b' ');
        }
        reply.extend_from_slice(b"= ");
        reply.extend_from_slice(result.to_string().as_bytes());
        reply
    }
}

/// Parse an integer the permissive way: optional leading whitespace and
/// sign, then the longest run of digits. Anything unparsable is 0 and
/// out-of-range values saturate to `i32`.
pub fn parse_leading_int(field: &[u8]) -> i64 {
    let start = field
        .iter()
        .position(|byte| !is_separator(byte))
        .unwrap_or(field.len());
    let field = &field[start..];

    let (negative, digits) = match field.first() {
        Some(b'-') => (true, &field[1..]),
        Some(b'+') => (false, &field[1..]),
        _ => (false, field),
    };

    let limit = i64::from(i32::MAX) + 1;
    let magnitude = digits
        .iter()
        .take_while(|byte| byte.is_ascii_digit())
        .fold(0i64, |acc, digit| (acc * 10 + i64::from(digit - b'0')).min(limit));

    let value = if negative { -magnitude } else { magnitude };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX))
}

/// Dispatch one request line and build its reply (without terminator).
pub fn process_line<D: Directory + ?Sized>(
    directory: &D,
    line: &[u8],
) -> Result<BytesMut, SessionError> {
    trace!(line = %String::from_utf8_lossy(line), "Processing line");
    let request = Request::parse(line)?;

    let reply = match request.op {
        Operation::Add => {
            let sum = parse_leading_int(request.arg1) + parse_leading_int(request.arg2);
            request.reply(sum)
        }
        Operation::List => {
            let listing = directory
                .connections()
                .iter()
                .map(|(id, peer)| format!("{id}@{peer}"))
                .collect::<Vec<_>>()
                .join(" ");
            request.reply(listing)
        }
        Operation::NumClients => request.reply(directory.connection_count()),
    };

    Ok(reply)
}

/// Run the protocol on `client` until the peer closes the stream or an
/// error ends the session.
///
/// Bytes are read one at a time so nothing past a request line is ever
/// consumed before its reply is written.
pub fn communicate<D: Directory + ?Sized>(
    directory: &D,
    client: &mut Client,
) -> Result<SessionStats, SessionError> {
    let mut buf = [0u8; LINE_CAPACITY];
    let mut filled = 0;
    let mut stats = SessionStats::default();

    loop {
        let n = match client.read(&mut buf[filled..=filled]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        if n == 0 {
            trace!(conn_id = client.id(), "Client in EOF");
            return if filled == 0 {
                Ok(stats)
            } else {
                Err(ProtocolViolation::TruncatedLine.into())
            };
        }
        stats.bytes_read += 1;

        if buf[filled] != b'\n' {
            filled += 1;
            if filled > MAX_LINE_LENGTH {
                return Err(ProtocolViolation::LineTooLong.into());
            }
            continue;
        }

        let mut response = process_line(directory, &buf[..filled])?;
        filled = 0;
        debug!(
            conn_id = client.id(),
            reply = %String::from_utf8_lossy(&response),
            "Client request processed"
        );
        response.put_u8(b'\n');

        let written = client.write(&response)?;
        if written != response.len() {
            return Err(SessionError::ShortWrite {
                written,
                expected: response.len(),
            });
        }

        stats.requests += 1;
    }
}
