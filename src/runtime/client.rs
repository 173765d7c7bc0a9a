//! Accepted client connections.
//!
//! A `Client` owns one connected byte stream behind the `ClientIo` trait,
//! so sessions run unchanged against sockets in production and against
//! in-memory doubles in tests. Dropping a client closes its stream.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use tracing::trace;

/// Process-unique connection identifier, assigned on accept.
pub type ConnectionId = u64;

/// Byte-stream capability used by a session.
pub trait ClientIo: Send {
    /// Read into `buf`. Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf` with a single call and return the bytes transferred.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl ClientIo for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = Write::write(self, buf)?;
        Write::flush(self)?;
        Ok(written)
    }
}

impl ClientIo for UnixStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = Write::write(self, buf)?;
        Write::flush(self)?;
        Ok(written)
    }
}

/// A single accepted connection.
pub struct Client {
    id: ConnectionId,
    /// Peer label used for logging and directory listings.
    peer: String,
    io: Box<dyn ClientIo>,
}

impl Client {
    /// Wrap an accepted stream.
    pub fn new(id: ConnectionId, peer: String, io: Box<dyn ClientIo>) -> Self {
        Self { id, peer, io }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.read(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io.write(buf)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        trace!(conn_id = self.id, peer = %self.peer, "Connection closed");
    }
}
