//! Arrival-ordered connection queue.
//!
//! Entries live in a slab arena and are threaded into a doubly-linked list
//! by slab key, giving O(1) append, claim and removal without raw links.
//! A cursor marks the oldest entry not yet claimed by a worker. Claimed
//! entries stay linked until their session is removed, so directory
//! queries see both active and pending connections.
//!
//! Not synchronized; the server guards it with its mutex.

use crate::runtime::client::{Client, ConnectionId};
use slab::Slab;

/// Stable handle to a queue entry.
pub type QueueKey = usize;

struct Entry {
    id: ConnectionId,
    peer: String,
    /// `Some` until a worker claims the client.
    client: Option<Client>,
    prev: Option<QueueKey>,
    next: Option<QueueKey>,
}

/// Doubly-linked list of connections over a slab arena.
#[derive(Default)]
pub struct ConnectionQueue {
    entries: Slab<Entry>,
    head: Option<QueueKey>,
    tail: Option<QueueKey>,
    /// Oldest unclaimed entry.
    next: Option<QueueKey>,
    /// Number of unclaimed entries.
    pending: usize,
}

impl ConnectionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a client at the tail.
    pub fn push(&mut self, client: Client) -> QueueKey {
        let key = self.entries.insert(Entry {
            id: client.id(),
            peer: client.peer().to_string(),
            client: Some(client),
            prev: self.tail,
            next: None,
        });

        match self.tail {
            Some(tail) => self.entries[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);

        if self.next.is_none() {
            self.next = Some(key);
        }
        self.pending += 1;

        self.check_invariants();
        key
    }

    /// Take the oldest unclaimed client and advance the cursor.
    ///
    /// The entry stays linked until `remove` is called with its key.
    pub fn claim(&mut self) -> Option<(QueueKey, Client)> {
        let key = self.next?;
        let entry = &mut self.entries[key];
        let client = entry.client.take()?;

        self.next = entry.next;
        self.pending -= 1;

        self.check_invariants();
        Some((key, client))
    }

    /// Unlink an entry. Returns its connection id, or `None` for a
    /// stale key.
    pub fn remove(&mut self, key: QueueKey) -> Option<ConnectionId> {
        let entry = self.entries.try_remove(key)?;

        match entry.prev {
            Some(prev) => self.entries[prev].next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => self.entries[next].prev = entry.prev,
            None => self.tail = entry.prev,
        }

        if entry.client.is_some() {
            // Unclaimed entries form the suffix starting at the cursor.
            if self.next == Some(key) {
                self.next = entry.next;
            }
            self.pending -= 1;
        }

        self.check_invariants();
        Some(entry.id)
    }

    /// Unlink and return every unclaimed client, oldest first.
    pub fn drain_pending(&mut self) -> Vec<Client> {
        let mut drained = Vec::with_capacity(self.pending);
        while let Some((key, client)) = self.claim() {
            self.remove(key);
            drained.push(client);
        }
        drained
    }

    /// Number of linked connections, claimed or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of connections waiting for a worker.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Number of connections currently owned by workers.
    pub fn claimed(&self) -> usize {
        self.entries.len() - self.pending
    }

    /// Iterate `(id, peer)` in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &str)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let entry = &self.entries[cursor?];
            cursor = entry.next;
            Some((entry.id, entry.peer.as_str()))
        })
    }

    fn check_invariants(&self) {
        debug_assert_eq!(self.is_empty(), self.head.is_none());
        debug_assert_eq!(self.is_empty(), self.tail.is_none());
        debug_assert!(self.pending <= self.entries.len());
        debug_assert_eq!(self.pending == 0, self.next.is_none());
    }
}
