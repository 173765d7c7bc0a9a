//! Threaded runtime for the connection server.
//!
//! Building blocks, leaf-first:
//! - `sync`: checked mutex, condition variable, bounded-stack threads
//! - `client`: one accepted connection behind the `ClientIo` trait
//! - `queue`: arrival-ordered connection queue over a slab arena
//! - `worker`: the loop each pool thread runs
//! - `acceptor`: listening socket and mio-driven accept loop

pub mod acceptor;
pub mod client;
pub mod queue;
pub mod sync;
pub(crate) mod worker;

pub use acceptor::{Acceptor, Listener};
