//! Connection server.
//!
//! Owns the connection queue and the worker pool. Accepted streams are
//! queued in arrival order and claimed by the first idle worker; each
//! worker runs one session at a time to completion.
//!
//! Shutdown is cooperative: `request_shutdown` wakes idle workers, busy
//! workers finish their current session first, and `destroy` blocks until
//! every worker has exited.

use crate::protocol::Directory;
use crate::runtime::client::{Client, ClientIo, ConnectionId};
use crate::runtime::queue::{ConnectionQueue, QueueKey};
use crate::runtime::sync::{self, Condition, Mutex, MutexGuard, DEFAULT_STACK_SIZE};
use crate::runtime::worker;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Worker pool sizing and admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum connections waiting for a worker (0 = unbounded).
    pub max_pending: usize,
    /// Stack size of each worker thread in bytes.
    pub stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 64,
            max_pending: 1024,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Errors reported to the owner of the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("worker pool size must be at least 1")]
    InvalidPoolSize,

    #[error("failed to start worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("too many pending connections ({pending}, limit {limit})")]
    ResourceExhausted { pending: usize, limit: usize },

    #[error("server is shutting down")]
    ShuttingDown,
}

/// State guarded by the server mutex.
pub(crate) struct State {
    shutdown: bool,
    live_workers: usize,
    next_id: ConnectionId,
    queue: ConnectionQueue,
}

/// State shared between the server handle and its workers.
pub(crate) struct Shared {
    state: Mutex<State>,
    condition: Condition,
    pool_size: usize,
    max_pending: usize,
}

impl Shared {
    fn new(pool_size: usize, max_pending: usize) -> Self {
        Self {
            state: Mutex::new(State {
                shutdown: false,
                live_workers: pool_size,
                next_id: 1,
                queue: ConnectionQueue::new(),
            }),
            condition: Condition::new(),
            pool_size,
            max_pending,
        }
    }

    fn check(&self, state: &State) {
        debug_assert!(state.queue.claimed() <= self.pool_size);
        debug_assert!(state.live_workers <= self.pool_size);
    }

    /// Block until a connection can be claimed. Returns `None` once
    /// shutdown has been requested.
    pub(crate) fn claim_next(&self) -> Option<(QueueKey, Client)> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(claimed) = state.queue.claim() {
                self.check(&state);
                return Some(claimed);
            }
            state = self.condition.wait(state);
        }
    }

    /// Unlink a finished session from the queue.
    pub(crate) fn remove(&self, key: QueueKey) {
        let mut state = self.state.lock();
        if state.queue.remove(key).is_none() {
            error!(key, "Finished session was not queued");
        }
        self.check(&state);
    }

    /// Record that a worker has left its loop.
    pub(crate) fn worker_exited(&self) {
        let mut state = self.state.lock();
        state.live_workers -= 1;
        if state.live_workers == 0 {
            self.condition.broadcast();
        }
    }

    fn request_shutdown(&self) {
        let mut state = self.state.lock();
        if !state.shutdown {
            state.shutdown = true;
            info!("Shutdown requested");
        }
        self.condition.broadcast();
    }

    /// Wait for every worker to exit. Returns the locked state.
    fn wait_for_workers(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock();
        while state.live_workers > 0 {
            state = self.condition.wait(state);
        }
        state
    }
}

impl Directory for Shared {
    fn connection_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn connections(&self) -> Vec<(ConnectionId, String)> {
        self.state
            .lock()
            .queue
            .iter()
            .map(|(id, peer)| (id, peer.to_string()))
            .collect()
    }
}

/// Cloneable handle that requests shutdown, e.g. from a signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.shared.request_shutdown();
    }
}

/// Server instance
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Create the server and start `config.workers` worker threads.
    pub fn start(config: &PoolConfig) -> Result<Self, ServerError> {
        if config.workers == 0 {
            return Err(ServerError::InvalidPoolSize);
        }

        let server = Server {
            shared: Arc::new(Shared::new(config.workers, config.max_pending)),
        };

        for worker_id in 0..config.workers {
            let shared = Arc::clone(&server.shared);
            let spawned = sync::spawn(format!("worker-{worker_id}"), config.stack_size, move || {
                worker::run(worker_id, shared)
            });

            if let Err(e) = spawned {
                error!(worker = worker_id, error = %e, "Failed to start worker");
                // Workers that never started will never check out.
                server.shared.state.lock().live_workers -= config.workers - worker_id;
                server.destroy();
                return Err(ServerError::Spawn(e));
            }
        }

        info!(
            workers = config.workers,
            max_pending = config.max_pending,
            stack_size = config.stack_size,
            "Worker pool started"
        );
        Ok(server)
    }

    /// Queue an accepted stream for the worker pool.
    ///
    /// On rejection the stream is dropped, closing the connection.
    pub fn accept_connection(
        &self,
        io: Box<dyn ClientIo>,
        peer: String,
    ) -> Result<ConnectionId, ServerError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(ServerError::ShuttingDown);
        }

        let limit = self.shared.max_pending;
        if limit > 0 && state.queue.pending() >= limit {
            return Err(ServerError::ResourceExhausted {
                pending: state.queue.pending(),
                limit,
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        state.queue.push(Client::new(id, peer, io));
        self.shared.check(&state);
        self.shared.condition.signal();
        drop(state);

        debug!(conn_id = id, "Connection queued");
        Ok(id)
    }

    /// Ask the workers to stop. Sessions in progress run to completion.
    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Handle that can request shutdown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of connections queued or in service.
    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }

    /// Get the number of running workers for testing
    #[cfg(test)]
    pub fn live_workers(&self) -> usize {
        self.shared.state.lock().live_workers
    }

    /// Stop the server: request shutdown, wait until every worker has
    /// exited, then close connections no worker claimed.
    ///
    /// Blocks for as long as the slowest in-flight session.
    pub fn destroy(self) {
        self.shared.request_shutdown();

        let mut state = self.shared.wait_for_workers();
        let unclaimed = state.queue.drain_pending();
        drop(state);
        if !unclaimed.is_empty() {
            warn!(count = unclaimed.len(), "Closing unclaimed connections");
        }
        drop(unclaimed);

        info!("Server destroyed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Workers hold their own reference; make sure they wind down.
        self.shared.request_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::client::testing::ScriptedIo;
    use std::collections::HashSet;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    fn pool(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            ..PoolConfig::default()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn request(stream: &mut UnixStream, line: &str) -> String {
        stream.write_all(line.as_bytes()).unwrap();
        let mut reply = String::new();
        BufReader::new(stream.try_clone().unwrap())
            .read_line(&mut reply)
            .unwrap();
        reply
    }

    #[test]
    fn test_server_shutdown() {
        let server = Server::start(&pool(4)).unwrap();
        assert!(!server.shutdown_requested());

        server.request_shutdown();
        assert!(server.shutdown_requested());

        server.destroy();
    }

    #[test]
    fn test_destroy_idle_server() {
        let server = Server::start(&pool(2)).unwrap();
        assert_eq!(server.connection_count(), 0);
        server.destroy();
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            Server::start(&pool(0)),
            Err(ServerError::InvalidPoolSize)
        ));
    }

    #[test]
    fn test_serves_connection() {
        let server = Server::start(&pool(2)).unwrap();
        let (local, mut remote) = UnixStream::pair().unwrap();
        server
            .accept_connection(Box::new(local), "local".to_string())
            .unwrap();

        assert_eq!(request(&mut remote, "100 + 2 102\n"), "100 + 2 102 = 104\n");
        assert_eq!(request(&mut remote, "7 NUMCLIENTS a b\n"), "7 NUMCLIENTS a b = 1\n");
        assert_eq!(request(&mut remote, "8 LIST a b\n"), "8 LIST a b = 1@local\n");

        drop(remote);
        wait_until(|| server.connection_count() == 0);
        server.destroy();
    }

    #[test]
    fn test_failed_session_closes_connection() {
        let server = Server::start(&pool(1)).unwrap();
        let (local, mut remote) = UnixStream::pair().unwrap();
        server
            .accept_connection(Box::new(local), "local".to_string())
            .unwrap();

        remote.write_all(b"1 ? 2 3\n").unwrap();
        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());

        // The worker survives and serves the next client.
        let (local, mut remote) = UnixStream::pair().unwrap();
        server
            .accept_connection(Box::new(local), "local".to_string())
            .unwrap();
        assert_eq!(request(&mut remote, "2 + 2 2\n"), "2 + 2 2 = 4\n");

        drop(remote);
        server.destroy();
    }

    /// Stream whose first read panics.
    struct PanickingIo;

    impl ClientIo for PanickingIo {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            panic!("session blew up");
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
    }

    #[test]
    fn test_panicking_session_keeps_worker() {
        let server = Server::start(&pool(1)).unwrap();
        server
            .accept_connection(Box::new(PanickingIo), "panicking".to_string())
            .unwrap();

        let io = ScriptedIo::new("1 + 1 1\n");
        let output = io.output();
        server
            .accept_connection(Box::new(io), "scripted".to_string())
            .unwrap();

        wait_until(|| server.connection_count() == 0);
        assert_eq!(output.lock().unwrap().as_slice(), b"1 + 1 1 = 2\n");
        assert_eq!(server.live_workers(), 1);
        server.destroy();
    }

    #[test]
    fn test_directory_counts_claimed_and_pending() {
        let server = Server::start(&pool(1)).unwrap();

        let (first, mut first_remote) = UnixStream::pair().unwrap();
        server
            .accept_connection(Box::new(first), "first".to_string())
            .unwrap();
        wait_until(|| server.shared.state.lock().queue.pending() == 0);

        // The only worker is busy, so this one stays queued.
        let (second, second_remote) = UnixStream::pair().unwrap();
        server
            .accept_connection(Box::new(second), "second".to_string())
            .unwrap();

        assert_eq!(
            request(&mut first_remote, "x NUMCLIENTS a b\n"),
            "x NUMCLIENTS a b = 2\n"
        );
        assert_eq!(
            request(&mut first_remote, "y LIST a b\n"),
            "y LIST a b = 1@first 2@second\n"
        );

        drop(first_remote);
        drop(second_remote);
        server.destroy();
    }

    #[test]
    fn test_every_connection_served_exactly_once() {
        const WORKERS: usize = 4;
        const CONNECTIONS: usize = 40;

        let server = Server::start(&pool(WORKERS)).unwrap();

        let outputs: Vec<_> = (0..CONNECTIONS)
            .map(|i| {
                let io = ScriptedIo::new(format!("{i} + {i} 1\n"));
                let output = io.output();
                server
                    .accept_connection(Box::new(io), format!("scripted-{i}"))
                    .unwrap();
                output
            })
            .collect();

        wait_until(|| server.connection_count() == 0);

        for (i, output) in outputs.iter().enumerate() {
            let written = String::from_utf8(output.lock().unwrap().clone()).unwrap();
            assert_eq!(written, format!("{i} + {i} 1 = {}\n", i + 1));
        }
        server.destroy();
    }

    #[test]
    fn test_concurrent_producers() {
        const WORKERS: usize = 3;
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 25;

        let server = Server::start(&pool(WORKERS)).unwrap();

        let ids: Vec<ConnectionId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..PRODUCERS)
                .map(|p| {
                    let server = &server;
                    scope.spawn(move || {
                        (0..PER_PRODUCER)
                            .map(|i| {
                                let io = ScriptedIo::new(format!("{p} + {i} 0\n"));
                                server
                                    .accept_connection(Box::new(io), format!("{p}-{i}"))
                                    .unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER);

        wait_until(|| server.connection_count() == 0);
        server.destroy();
    }

    #[test]
    fn test_busy_workers_queue_excess_connections() {
        let server = Server::start(&pool(2)).unwrap();

        // Two held-open sessions occupy both workers.
        let held: Vec<_> = (0..2)
            .map(|_| {
                let (local, remote) = UnixStream::pair().unwrap();
                server
                    .accept_connection(Box::new(local), "held".to_string())
                    .unwrap();
                remote
            })
            .collect();

        let (local, mut waiting) = UnixStream::pair().unwrap();
        server
            .accept_connection(Box::new(local), "waiting".to_string())
            .unwrap();
        assert_eq!(server.connection_count(), 3);

        // Freeing one worker lets the queued connection through.
        let mut held = held.into_iter();
        drop(held.next());
        assert_eq!(request(&mut waiting, "9 + 4 5\n"), "9 + 4 5 = 9\n");

        drop(held);
        drop(waiting);
        server.destroy();
    }

    #[test]
    fn test_pending_limit_rejects() {
        let server = Server::start(&PoolConfig {
            workers: 1,
            max_pending: 1,
            ..PoolConfig::default()
        })
        .unwrap();

        let (busy, busy_remote) = UnixStream::pair().unwrap();
        server
            .accept_connection(Box::new(busy), "busy".to_string())
            .unwrap();
        wait_until(|| server.shared.state.lock().queue.pending() == 0);

        let (queued, queued_remote) = UnixStream::pair().unwrap();
        server
            .accept_connection(Box::new(queued), "queued".to_string())
            .unwrap();

        let (rejected, mut rejected_remote) = UnixStream::pair().unwrap();
        match server.accept_connection(Box::new(rejected), "rejected".to_string()) {
            Err(ServerError::ResourceExhausted { pending: 1, limit: 1 }) => {}
            other => panic!("unexpected: {:?}", other),
        }

        // Rejected streams are closed.
        let mut buf = [0u8; 1];
        assert_eq!(Read::read(&mut rejected_remote, &mut buf).unwrap(), 0);

        drop(busy_remote);
        drop(queued_remote);
        server.destroy();
    }

    #[test]
    fn test_accept_after_shutdown_rejected() {
        let server = Server::start(&pool(1)).unwrap();
        server.request_shutdown();

        let (local, _remote) = UnixStream::pair().unwrap();
        assert!(matches!(
            server.accept_connection(Box::new(local), "late".to_string()),
            Err(ServerError::ShuttingDown)
        ));
        server.destroy();
    }

    #[test]
    fn test_destroy_drains_in_flight_sessions() {
        let server = Server::start(&pool(2)).unwrap();
        let (local, mut remote) = UnixStream::pair().unwrap();
        server
            .accept_connection(Box::new(local), "in-flight".to_string())
            .unwrap();
        assert_eq!(request(&mut remote, "1 + 1 1\n"), "1 + 1 1 = 2\n");

        server.request_shutdown();
        // The idle worker exits; the busy one waits for its session.
        wait_until(|| server.live_workers() == 1);

        let started = Instant::now();
        let client = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let reply = request(&mut remote, "2 + 2 2\n");
            drop(remote);
            reply
        });

        server.destroy();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(client.join().unwrap(), "2 + 2 2 = 4\n");
    }

    #[test]
    fn test_destroy_closes_unclaimed_connections() {
        let server = Server::start(&pool(1)).unwrap();

        let (busy, busy_remote) = UnixStream::pair().unwrap();
        server
            .accept_connection(Box::new(busy), "busy".to_string())
            .unwrap();
        wait_until(|| server.shared.state.lock().queue.pending() == 0);

        let (queued, mut queued_remote) = UnixStream::pair().unwrap();
        server
            .accept_connection(Box::new(queued), "queued".to_string())
            .unwrap();

        server.request_shutdown();
        drop(busy_remote);
        server.destroy();

        let mut buf = [0u8; 1];
        assert_eq!(Read::read(&mut queued_remote, &mut buf).unwrap(), 0);
    }
}
