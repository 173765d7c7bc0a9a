//! Worker pool loop.
//!
//! Each worker cycles `WAITING -> PROCESSING -> WAITING` until it observes
//! shutdown while idle, then checks out of the pool. A failed or panicking
//! session is logged and torn down like any other; it never takes the
//! worker down with it.

use crate::protocol;
use crate::server::Shared;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Serve connections from the shared queue until shutdown.
pub(crate) fn run(worker_id: usize, shared: Arc<Shared>) {
    debug!(worker = worker_id, "Worker started");

    while let Some((key, mut client)) = shared.claim_next() {
        let conn_id = client.id();
        trace!(worker = worker_id, conn_id, peer = %client.peer(), "Communicating");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            protocol::communicate(&*shared, &mut client)
        }));

        match outcome {
            Ok(Ok(stats)) => debug!(
                worker = worker_id,
                conn_id,
                requests = stats.requests,
                bytes_read = stats.bytes_read,
                "Communication successful"
            ),
            Ok(Err(e)) => warn!(worker = worker_id, conn_id, error = %e, "Communication failed"),
            Err(_) => error!(worker = worker_id, conn_id, "Session panicked"),
        }

        shared.remove(key);
        drop(client);
    }

    shared.worker_exited();
    debug!(worker = worker_id, "Worker exited");
}
