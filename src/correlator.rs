//! Pending request table keyed by `ActionID`
//!
//! Flow:
//! 1. `execute` calls [`Correlator::register`] and gets a oneshot receiver
//! 2. The action is queued for the writer task
//! 3. The reader task calls [`Correlator::resolve`] when the reply arrives,
//!    or the request timer calls [`Correlator::expire`] first
//! 4. Whichever removes the entry delivers; the other is a no-op

use crate::{
    error::{AmiError, AmiResult},
    record::Record,
};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

/// Concurrent map from `ActionID` to the waiter's reply channel.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: DashMap<String, oneshot::Sender<Record>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request.
    ///
    /// Fails if `action_id` is already waiting for a reply.
    pub fn register(&self, action_id: &str) -> AmiResult<oneshot::Receiver<Record>> {
        match self
            .pending
            .entry(action_id.to_string())
        {
            Entry::Occupied(_) => Err(AmiError::DuplicateActionId {
                action_id: action_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                trace!(action_id, "Registered pending request");
                Ok(rx)
            }
        }
    }

    /// Deliver a reply from the server.
    ///
    /// Returns false if nothing is waiting for `action_id` (already timed out,
    /// or never ours); the record is logged and dropped.
    pub fn resolve(&self, action_id: &str, record: Record) -> bool {
        match self.take(action_id) {
            Some(tx) => {
                let delivered = tx
                    .send(record)
                    .is_ok();
                if !delivered {
                    debug!(action_id, "Waiter went away before its reply arrived");
                }
                delivered
            }
            None => {
                info!(action_id, response = ?record, "Reply discarded: no pending request");
                false
            }
        }
    }

    /// Deliver the synthetic timeout reply.
    ///
    /// Same take-and-remove as [`resolve`](Self::resolve): returns false if the
    /// real reply won the race.
    pub fn expire(&self, action_id: &str, timeout_record: Record) -> bool {
        match self.take(action_id) {
            Some(tx) => {
                debug!(action_id, "Pending request timed out");
                tx.send(timeout_record)
                    .is_ok()
            }
            None => {
                trace!(action_id, "Expire skipped: already resolved");
                false
            }
        }
    }

    /// Drop a pending entry without delivering anything.
    pub fn discard(&self, action_id: &str) -> bool {
        self.take(action_id)
            .is_some()
    }

    /// Whether `action_id` is waiting for a reply.
    pub fn contains(&self, action_id: &str) -> bool {
        self.pending
            .contains_key(action_id)
    }

    /// Number of requests waiting for a reply.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take(&self, action_id: &str) -> Option<oneshot::Sender<Record>> {
        self.pending
            .remove(action_id)
            .map(|(_, tx)| tx)
    }
}

/// Removes a registration when the waiting future is dropped early.
pub(crate) struct PendingGuard<'a> {
    correlator: &'a Correlator,
    action_id: &'a str,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(correlator: &'a Correlator, action_id: &'a str) -> Self {
        Self {
            correlator,
            action_id,
            armed: true,
        }
    }

    /// The entry has been taken by resolve/expire; nothing left to clean up.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.correlator.discard(self.action_id) {
            debug!(action_id = self.action_id, "Abandoned pending request removed");
        }
    }
}
