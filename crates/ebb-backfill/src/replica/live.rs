//! Live write stream.
//!
//! The authoritative copy stamps each local write on its followed branch,
//! applies it, and forwards it to every subscriber. Each subscriber gets
//! its own token domain; a receiver validates every inbound domain
//! separately and resolves overlap with concurrent backfill chunks through
//! the version map, never by comparing tokens across domains.

use std::collections::BTreeMap;

use ebb_types::{Address, KeyRange, Timestamp};
use tracing::{debug, info, trace, warn};

use crate::history::Version;
use crate::message::{FailureReason, MessagePayload, ReplicateWrite};
use crate::order_token::{TokenDomainId, TokenValidator, validate};
use crate::storage::{KvEntry, ScopedRecord, Storage};
use crate::{BackfillError, BackfillResult};

use super::ReplicaOutput;
use super::state::{LIVE_WRITE_MAILBOX, ReplicaState};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Subscriber {
    pub(crate) addr: Address,
    pub(crate) domain: TokenDomainId,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct LiveState {
    /// Accepts local writes.
    pub(crate) authoritative: bool,

    /// Timestamp of the latest local write on the followed branch.
    pub(crate) clock: Timestamp,

    pub(crate) subscribers: Vec<Subscriber>,

    /// One validator per inbound writer domain.
    pub(crate) inbound: BTreeMap<TokenDomainId, TokenValidator>,
}

impl<S: Storage> ReplicaState<S> {
    // ========================================================================
    // Writer
    // ========================================================================

    /// Subscribes `addr` to future local writes under a fresh domain.
    ///
    /// Subscribing an address again replaces its old domain, which is how
    /// a follower whose stream stalled on an ordering error resumes.
    pub(super) fn on_subscribe(&mut self, addr: Address) {
        if let Some(pos) = self.live.subscribers.iter().position(|s| s.addr == addr) {
            let old = self.live.subscribers.remove(pos);
            self.sequencer.retire(old.domain);
        }
        let domain = self.sequencer.new_domain();
        self.live.subscribers.push(Subscriber { addr, domain });
        info!(node = %self.node, subscriber = %addr, domain = %domain, "live write subscriber added");
    }

    pub(super) fn on_local_write(
        &mut self,
        scope: KeyRange,
        entries: Vec<KvEntry>,
        out: &mut ReplicaOutput,
    ) {
        match self.write_local(scope, entries, out) {
            Ok(version) => out.written = Some(version),
            Err(err) => warn!(node = %self.node, error = %err, "local write rejected"),
        }
    }

    fn write_local(
        &mut self,
        scope: KeyRange,
        entries: Vec<KvEntry>,
        out: &mut ReplicaOutput,
    ) -> BackfillResult<Version> {
        if !self.live.authoritative {
            return Err(BackfillError::InvalidRequest {
                reason: "copy is not authoritative for its region",
            });
        }
        if scope.is_empty() || !self.region.contains_range(&scope) {
            return Err(BackfillError::InvalidRequest {
                reason: "write scope is not hosted here",
            });
        }
        if entries.iter().any(|e| !scope.contains_key(&e.key)) {
            return Err(BackfillError::InvalidRequest {
                reason: "write entry lies outside its scope",
            });
        }

        let version = Version::new(self.branch, self.live.clock.next());
        let record = ScopedRecord::new(vec![scope], version, entries);
        self.apply_record(&record, out)?;
        self.live.clock = version.timestamp;
        trace!(node = %self.node, version = %version, subscribers = self.live.subscribers.len(), "local write applied");

        let from = self.address(LIVE_WRITE_MAILBOX);
        for subscriber in &self.live.subscribers {
            let token = self.sequencer.next(subscriber.domain);
            out.send(
                from,
                subscriber.addr,
                MessagePayload::ReplicateWrite(ReplicateWrite {
                    record: record.clone(),
                    token,
                }),
            );
        }
        Ok(version)
    }

    // ========================================================================
    // Follower
    // ========================================================================

    pub(super) fn on_replicate_write(
        &mut self,
        write: ReplicateWrite,
        from: Address,
        out: &mut ReplicaOutput,
    ) {
        match self.apply_replicated(&write, out) {
            Ok(0) => debug!(node = %self.node, token = %write.token, "live write is stale"),
            Ok(_) => {
                trace!(node = %self.node, token = %write.token, version = %write.record.version, "live write applied");
            }
            Err(err) => {
                let reason = err.failure_reason().unwrap_or(FailureReason::ProtocolViolation);
                warn!(
                    node = %self.node,
                    from = %from,
                    token = %write.token,
                    error = %err,
                    reason = %reason,
                    "live write dropped, stream stalled"
                );
                out.stall(from, write.token, reason);
            }
        }
    }

    /// Applies one replicated write and returns the number of pieces that
    /// were newer than local data.
    ///
    /// The domain's validator only advances once the write is applied. A
    /// write that fails leaves the stream stalled at its token: every later
    /// write in the domain is rejected until the writer resubscribes this
    /// replica.
    fn apply_replicated(
        &mut self,
        write: &ReplicateWrite,
        out: &mut ReplicaOutput,
    ) -> BackfillResult<usize> {
        let domain = write.token.domain;
        let validator = *self
            .live
            .inbound
            .entry(domain)
            .or_insert_with(|| TokenValidator::new(domain));
        validate(validator.domain(), validator.last_seen(), write.token)?;

        let applied = self.apply_record(&write.record, out)?;
        self.live
            .inbound
            .entry(domain)
            .or_insert(validator)
            .accept(write.token)?;
        Ok(applied.len())
    }
}
