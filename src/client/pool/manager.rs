//! Connection pool management for a single destination.
//!
//! Each destination key gets a manager which owns its idle connections, counts every
//! connection that is open or being opened, and queues callers waiting for capacity.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::trace;

use super::Config;
use super::PoolStats;
use super::Pooled;
use super::SlotGuard;
use super::idle::IdleConnections;
use super::key::DestinationKey;
use super::lock::WeakMutex;
use crate::client::conn::Connection;

/// What a waiting caller receives once capacity frees up.
#[derive(Debug)]
pub(super) enum Handoff {
    /// A released connection, ready for another request.
    Connection(Pooled),

    /// Permission to open a new connection.
    Slot(SlotGuard),
}

/// Outcome of asking a manager for a connection.
#[derive(Debug)]
pub(super) enum Checkout {
    /// An idle connection was available.
    Idle(Connection),

    /// A slot was reserved; the caller should open a connection.
    Connect,

    /// The destination is at capacity; wait for a handoff.
    Wait(oneshot::Receiver<Handoff>),

    /// The pool has been closed.
    Closed,
}

/// Manage the connections targeting one destination.
#[derive(Debug)]
pub(super) struct Manager {
    key: DestinationKey,
    idle: IdleConnections,
    total: usize,
    waiting: VecDeque<oneshot::Sender<Handoff>>,
    closed: bool,
    config: Arc<Config>,
}

impl Manager {
    pub(super) fn new(key: DestinationKey, config: Arc<Config>) -> Self {
        Self {
            key,
            idle: IdleConnections::default(),
            total: 0,
            waiting: VecDeque::new(),
            closed: false,
            config,
        }
    }

    pub(super) fn checkout(&mut self) -> Checkout {
        if self.closed {
            return Checkout::Closed;
        }

        let (connection, discarded) = self.idle.pop(self.config.idle_timeout);
        self.total -= discarded;

        if let Some(connection) = connection {
            trace!(key = %self.key, id = %connection.id(), "connection found in pool");
            return Checkout::Idle(connection);
        }

        if self.total < self.config.max_connections_per_host {
            self.total += 1;
            trace!(key = %self.key, total = self.total, "reserved slot for new connection");
            return Checkout::Connect;
        }

        trace!(key = %self.key, waiters = self.waiting.len() + 1, "destination at capacity, will wait");
        let (tx, rx) = oneshot::channel();
        self.waiting.push_back(tx);
        Checkout::Wait(rx)
    }

    /// Return a reusable connection: the longest waiter gets it, otherwise it is parked.
    pub(super) fn push(&mut self, mut connection: Connection, manager: &WeakMutex<Self>) {
        let _span = tracing::trace_span!("manager::push").entered();

        if self.closed {
            trace!("pool closed, dropping returned connection");
            self.total -= 1;
            return;
        }

        trace!(waiters = %self.waiting.len(), "walking waiters");
        while let Some(waiter) = self.waiting.pop_front() {
            if waiter.is_closed() {
                trace!("skipping closed waiter");
                continue;
            }

            let pooled = Pooled::new(connection, manager.clone());
            match waiter.send(Handoff::Connection(pooled)) {
                Ok(()) => {
                    trace!("connection sent to waiter");
                    return;
                }
                Err(handoff) => {
                    trace!("waiter closed, continuing");
                    match handoff.disarm() {
                        Some(returned) => connection = returned,
                        None => return,
                    }
                }
            }
        }

        trace!("push idle connection");
        self.idle.push(connection);
    }

    /// Give up a slot: a connection closed, or a reserved slot went unused.
    pub(super) fn release_slot(&mut self, manager: &WeakMutex<Self>) {
        if !self.closed {
            while let Some(waiter) = self.waiting.pop_front() {
                if waiter.is_closed() {
                    continue;
                }

                match waiter.send(Handoff::Slot(SlotGuard::new(manager.clone()))) {
                    Ok(()) => {
                        trace!(key = %self.key, "slot handed to waiter");
                        return;
                    }
                    Err(handoff) => {
                        handoff.disarm();
                    }
                }
            }
        }

        self.total -= 1;
        trace!(key = %self.key, total = self.total, "slot released");
    }

    pub(super) fn evict(&mut self) -> usize {
        let evicted = self.idle.evict(self.config.idle_timeout);
        self.total -= evicted;
        evicted
    }

    /// Whether nothing refers to this manager's slots.
    pub(super) fn is_unused(&self) -> bool {
        self.total == 0 && self.waiting.iter().all(|waiter| waiter.is_closed())
    }

    pub(super) fn close(&mut self) {
        self.closed = true;
        let waiters = self.waiting.len();
        self.waiting.clear();
        let dropped = self.idle.clear();
        self.total -= dropped;
        trace!(key = %self.key, waiters, dropped, "manager closed");
    }

    pub(super) fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            total: self.total,
            waiting: self
                .waiting
                .iter()
                .filter(|waiter| !waiter.is_closed())
                .count(),
        }
    }
}

impl Handoff {
    /// Take back what a failed send carried, without touching the manager.
    fn disarm(self) -> Option<Connection> {
        match self {
            Handoff::Connection(pooled) => pooled.disarm(),
            Handoff::Slot(slot) => {
                slot.disarm();
                None
            }
        }
    }
}
