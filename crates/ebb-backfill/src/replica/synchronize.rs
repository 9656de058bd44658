//! Synchronize: hold a reader's ack until a range has caught up.
//!
//! A waiter is checked every time the version map moves, whether the move
//! came from a backfill chunk or a replicated live write. Nothing else about
//! the replica depends on a waiter, so a caller that stops waiting leaves
//! no trace beyond the eventual ack.

use ebb_types::{Address, KeyRange};
use tracing::{debug, trace};

use crate::history::Version;
use crate::message::{MessagePayload, Synchronize, SynchronizeAck};
use crate::storage::Storage;

use super::ReplicaOutput;
use super::state::{ReplicaState, SYNCHRONIZE_MAILBOX};

/// A pending `Synchronize` request.
#[derive(Debug, Clone)]
pub(crate) struct SyncWaiter {
    pub(crate) range: KeyRange,
    pub(crate) target: Version,
    pub(crate) ack_addr: Address,
}

impl<S: Storage> ReplicaState<S> {
    pub(super) fn on_synchronize(&mut self, request: Synchronize, out: &mut ReplicaOutput) {
        let waiter = SyncWaiter {
            range: request.range,
            target: Version::new(self.branch, request.target),
            ack_addr: request.ack_addr,
        };
        if self.is_caught_up(&waiter) {
            trace!(node = %self.node, range = %waiter.range, target = %waiter.target, "already synchronized");
            self.ack(&waiter, out);
            return;
        }
        debug!(
            node = %self.node,
            range = %waiter.range,
            target = %waiter.target,
            version_map = %self.version_map.restrict(&waiter.range),
            "synchronize pending"
        );
        self.waiters.push(waiter);
    }

    /// Acks every waiter whose range is now at least as current as its
    /// target.
    pub(crate) fn check_waiters(&mut self, out: &mut ReplicaOutput) {
        if self.waiters.is_empty() {
            return;
        }
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| self.is_caught_up(w));
        self.waiters = pending;
        for waiter in &ready {
            trace!(node = %self.node, range = %waiter.range, target = %waiter.target, "synchronized");
            self.ack(waiter, out);
        }
    }

    fn is_caught_up(&self, waiter: &SyncWaiter) -> bool {
        self.version_map
            .covers(&waiter.range, waiter.target, &self.history)
    }

    fn ack(&self, waiter: &SyncWaiter, out: &mut ReplicaOutput) {
        out.send(
            self.address(SYNCHRONIZE_MAILBOX),
            waiter.ack_addr,
            MessagePayload::SynchronizeAck(SynchronizeAck),
        );
    }
}
