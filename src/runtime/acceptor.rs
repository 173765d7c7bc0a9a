//! Listening socket and accept loop.
//!
//! The acceptor only enqueues: it waits for readiness with mio, accepts
//! every pending connection, switches it to blocking mode for its worker,
//! and hands it to the server. A mio `Waker` lets a signal handler break
//! the wait once shutdown has been requested.

use crate::config::ListenAddr;
use crate::runtime::client::ClientIo;
use crate::server::Server;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Kernel accept backlog.
const LISTEN_BACKLOG: i32 = 100;

const EVENTS_CAPACITY: usize = 64;

/// Consecutive accept failures tolerated before yielding back to the poll.
const MAX_ACCEPT_ERRORS: usize = 32;

/// A bound, non-blocking listening socket.
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind to `addr`. A stale Unix socket file from a previous run is
    /// removed first.
    pub fn bind(addr: &ListenAddr) -> io::Result<Self> {
        match addr {
            ListenAddr::Tcp(addr) => Ok(Listener::Tcp(create_tcp_listener(*addr)?)),
            ListenAddr::Unix(path) => {
                match fs::remove_file(path) {
                    Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                let listener = UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// Human-readable local address.
    pub fn local_addr(&self) -> String {
        match self {
            Listener::Tcp(listener) => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            Listener::Unix { path, .. } => format!("unix:{}", path.display()),
        }
    }

    /// Accept one connection as a blocking stream plus a peer label.
    fn accept(&self) -> io::Result<(Box<dyn ClientIo>, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            Listener::Unix { listener, .. } => {
                let (stream, addr) = listener.accept()?;
                stream.set_nonblocking(false)?;
                let peer = addr
                    .as_pathname()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "local".to_string());
                Ok((Box::new(stream), peer))
            }
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(listener) => listener.as_raw_fd(),
            Listener::Unix { listener, .. } => listener.as_raw_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(e) = fs::remove_file(&*path) {
                debug!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}

/// Accept loop feeding a `Server`.
pub struct Acceptor {
    listener: Listener,
    poll: Poll,
    waker: Arc<Waker>,
}

impl Acceptor {
    pub fn new(listener: Listener) -> io::Result<Self> {
        let poll = Poll::new()?;
        let fd = listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            listener,
            poll,
            waker,
        })
    }

    /// Waker that interrupts `run` so it re-checks the shutdown flag.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Accept connections until the server reports shutdown.
    pub fn run(&mut self, server: &Server) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!(address = %self.listener.local_addr(), "Server listening");

        while !server.shutdown_requested() {
            if let Err(e) = self.poll_once(&mut events, server) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                server.request_shutdown();
                return Err(e);
            }
        }

        info!("Acceptor stopped");
        Ok(())
    }

    fn poll_once(&mut self, events: &mut Events, server: &Server) -> io::Result<()> {
        self.poll.poll(events, None)?;
        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                self.accept_pending(server)?;
            }
        }
        Ok(())
    }

    /// Drain the accept queue and hand every stream to the server.
    ///
    /// Readiness is edge-triggered. If the drain gives up on repeated
    /// errors the listener is re-registered so the remaining backlog is
    /// reported again.
    fn accept_pending(&self, server: &Server) -> io::Result<()> {
        let drained = drain_accept_queue(
            || self.listener.accept(),
            |stream, peer| match server.accept_connection(stream, peer.clone()) {
                Ok(conn_id) => debug!(
                    conn_id,
                    peer = %peer,
                    connections = server.connection_count(),
                    "Accepted connection"
                ),
                Err(e) => warn!(peer = %peer, error = %e, "Failed to accept connection"),
            },
        );

        if !drained {
            let fd = self.listener.as_raw_fd();
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)?;
        }
        Ok(())
    }
}

/// Accept until the queue reports `WouldBlock`, passing each connection to
/// `handle`. Failed accepts are logged and skipped.
///
/// Returns `false` if it stopped after `MAX_ACCEPT_ERRORS` consecutive
/// failures with the queue possibly still non-empty.
fn drain_accept_queue<A, H>(mut accept: A, mut handle: H) -> bool
where
    A: FnMut() -> io::Result<(Box<dyn ClientIo>, String)>,
    H: FnMut(Box<dyn ClientIo>, String),
{
    let mut failures = 0;
    loop {
        match accept() {
            Ok((stream, peer)) => {
                failures = 0;
                handle(stream, peer);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Failed to low-level accept()");
                failures += 1;
                if failures >= MAX_ACCEPT_ERRORS {
                    return false;
                }
            }
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR.
fn create_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
