//! Idle connections parked for one destination.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::client::conn::{Connection, ConnectionState};

#[derive(Debug)]
struct Entry {
    connection: Connection,
    since: Instant,
}

impl Entry {
    fn is_expired(&self, timeout: Option<Duration>, now: Instant) -> bool {
        timeout.is_some_and(|timeout| now.saturating_duration_since(self.since) >= timeout)
    }
}

/// Most-recently-used stack of idle connections.
///
/// The most recently returned connection is handed out first, so the oldest connections
/// sit at the bottom and age out.
#[derive(Debug, Default)]
pub(super) struct IdleConnections {
    stack: Vec<Entry>,
}

impl IdleConnections {
    pub(super) fn len(&self) -> usize {
        self.stack.len()
    }

    pub(super) fn push(&mut self, mut connection: Connection) {
        connection.set_state(ConnectionState::Idle);
        self.stack.push(Entry {
            connection,
            since: Instant::now(),
        });
    }

    /// Pop the most recent live connection.
    ///
    /// Expired connections and those the peer has closed are dropped on the way; the second
    /// value counts them.
    pub(super) fn pop(&mut self, timeout: Option<Duration>) -> (Option<Connection>, usize) {
        let now = Instant::now();
        let mut discarded = 0;

        while let Some(mut entry) = self.stack.pop() {
            if entry.is_expired(timeout, now) {
                trace!(id = %entry.connection.id(), "dropping expired idle connection");
                discarded += 1;
                continue;
            }

            if !entry.connection.probe() {
                discarded += 1;
                continue;
            }

            entry.connection.set_state(ConnectionState::InUse);
            return (Some(entry.connection), discarded);
        }

        (None, discarded)
    }

    /// Drop every connection idle for longer than `timeout`. Returns how many were dropped.
    pub(super) fn evict(&mut self, timeout: Option<Duration>) -> usize {
        let now = Instant::now();
        let before = self.stack.len();
        self.stack.retain(|entry| !entry.is_expired(timeout, now));
        before - self.stack.len()
    }

    /// Drop every connection. Returns how many were dropped.
    pub(super) fn clear(&mut self) -> usize {
        let count = self.stack.len();
        self.stack.clear();
        count
    }
}
