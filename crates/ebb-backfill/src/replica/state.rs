//! Replica state structure.
//!
//! This module defines [`ReplicaState`], the state of one hosted region
//! copy, together with event dispatch and the shared apply path used by
//! backfill chunks and live writes alike.

use std::collections::BTreeMap;

use ebb_types::{Address, BranchId, KeyRange, MailboxId, NodeId, SessionId, ShardId, Timestamp};
use tracing::{debug, trace};

use crate::business_card::{BackfillerBusinessCard, ReplicaBusinessCard};
use crate::config::BackfillConfig;
use crate::history::{BranchHistory, Version};
use crate::message::{Message, MessagePayload};
use crate::order_token::OrderTokenSequencer;
use crate::storage::{MemoryStorage, ScopedRecord, Storage};
use crate::version_map::VersionMap;
use crate::{BackfillError, BackfillResult};

use super::live::LiveState;
use super::session::{BackfillerSession, ReceiverSession, SessionState};
use super::synchronize::SyncWaiter;
use super::{ReplicaEvent, ReplicaOutput};

// ============================================================================
// Fixed Mailboxes
// ============================================================================

/// Accepts `BackfillRequest`.
pub const BACKFILL_MAILBOX: MailboxId = MailboxId::new(0);

/// Accepts `CancelBackfill` and `BackfillFailed` from receivers.
pub const CANCEL_MAILBOX: MailboxId = MailboxId::new(1);

/// Accepts `Synchronize`.
pub const SYNCHRONIZE_MAILBOX: MailboxId = MailboxId::new(2);

/// Accepts `ReplicateWrite`.
pub const LIVE_WRITE_MAILBOX: MailboxId = MailboxId::new(3);

const FIRST_SESSION_MAILBOX: MailboxId = MailboxId::new(4);

/// What a mailbox is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Backfill,
    Cancel,
    Synchronize,
    LiveWrite,
    /// Receiver side: negotiation reply, chunks, completion, peer cancel.
    Reply(SessionId),
    /// Backfiller side: chunk acks.
    ChunkAcks(SessionId),
    /// Backfiller side: allowance grants.
    Allowance(SessionId),
}

// ============================================================================
// Replica State
// ============================================================================

/// The state of one hosted region copy.
///
/// # State Categories
///
/// 1. **Identity**: `node`, `shard`, `config`
/// 2. **Region**: `region`, `branch`, `version_map`, `history`, `storage`
/// 3. **Mailboxes**: `routes`, `next_mailbox`
/// 4. **Sessions**: `serving`, `receiving`, `sequencer`
/// 5. **Readers and writers**: `waiters`, `live`
#[derive(Debug, Clone)]
pub struct ReplicaState<S = MemoryStorage> {
    // ========================================================================
    // Identity
    // ========================================================================
    pub(crate) node: NodeId,
    pub(crate) shard: ShardId,
    pub(crate) config: BackfillConfig,

    // ========================================================================
    // Region
    // ========================================================================
    pub(crate) region: KeyRange,

    /// The branch this copy follows.
    pub(crate) branch: BranchId,

    pub(crate) version_map: VersionMap,
    pub(crate) history: BranchHistory,
    pub(crate) storage: S,

    // ========================================================================
    // Mailboxes
    // ========================================================================
    pub(crate) routes: BTreeMap<MailboxId, Route>,
    pub(crate) next_mailbox: MailboxId,

    // ========================================================================
    // Sessions
    // ========================================================================
    pub(crate) sequencer: OrderTokenSequencer,

    /// Sessions this copy serves as backfiller.
    pub(crate) serving: BTreeMap<SessionId, BackfillerSession>,

    /// Sessions this copy requested as receiver.
    pub(crate) receiving: BTreeMap<SessionId, ReceiverSession>,

    // ========================================================================
    // Readers and Writers
    // ========================================================================
    pub(crate) waiters: Vec<SyncWaiter>,
    pub(crate) live: LiveState,
}

impl<S: Storage> ReplicaState<S> {
    /// Opens a region copy.
    ///
    /// If `storage` holds persisted metadata it is reloaded and `history`
    /// is merged into it; otherwise the whole region starts at `branch`'s
    /// initial timestamp. `branch` must be present in `history`.
    pub fn new(
        node: NodeId,
        shard: ShardId,
        region: KeyRange,
        branch: BranchId,
        history: BranchHistory,
        storage: S,
        config: BackfillConfig,
    ) -> BackfillResult<Self> {
        config.validate()?;
        let Some(record) = history.get(&branch) else {
            return Err(BackfillError::InvalidRequest {
                reason: "followed branch missing from history",
            });
        };
        let initial = Version::new(branch, record.initial_timestamp);

        let (version_map, history) = match storage.load_metadata()? {
            Some((map, mut persisted)) => {
                if map.region() != &region {
                    return Err(BackfillError::InvalidRequest {
                        reason: "persisted region differs from the hosted region",
                    });
                }
                persisted.merge(&history)?;
                (map, persisted)
            }
            None => (VersionMap::new(region.clone(), initial), history),
        };

        let routes = BTreeMap::from([
            (BACKFILL_MAILBOX, Route::Backfill),
            (CANCEL_MAILBOX, Route::Cancel),
            (SYNCHRONIZE_MAILBOX, Route::Synchronize),
            (LIVE_WRITE_MAILBOX, Route::LiveWrite),
        ]);

        let mut state = Self {
            node,
            shard,
            config,
            region,
            branch,
            version_map,
            history,
            storage,
            routes,
            next_mailbox: FIRST_SESSION_MAILBOX,
            sequencer: OrderTokenSequencer::new(node),
            serving: BTreeMap::new(),
            receiving: BTreeMap::new(),
            waiters: Vec::new(),
            live: LiveState::default(),
        };
        state.persist()?;
        Ok(state)
    }

    /// Replaces the version map, for copies whose storage already holds
    /// data at known versions.
    pub fn with_version_map(mut self, map: VersionMap) -> BackfillResult<Self> {
        if map.region() != &self.region {
            return Err(BackfillError::InvalidRequest {
                reason: "version map does not cover the hosted region",
            });
        }
        map.check_resolvable(&self.history)?;
        self.version_map = map;
        self.persist()?;
        if self.live.authoritative {
            self.live.clock = self.latest_own_timestamp();
        }
        Ok(self)
    }

    /// Makes this copy the authoritative writer for its region.
    ///
    /// Local writes are stamped on the followed branch after the latest
    /// timestamp the copy already holds.
    pub fn with_authority(mut self) -> Self {
        self.live.authoritative = true;
        self.live.clock = self.latest_own_timestamp();
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn region(&self) -> &KeyRange {
        &self.region
    }

    pub fn branch(&self) -> BranchId {
        self.branch
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub fn version_map(&self) -> &VersionMap {
        &self.version_map
    }

    pub fn history(&self) -> &BranchHistory {
        &self.history
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Returns the full address of one of this copy's mailboxes.
    pub fn address(&self, mailbox: MailboxId) -> Address {
        Address::new(self.node, self.shard, mailbox)
    }

    pub fn backfiller_card(&self) -> BackfillerBusinessCard {
        BackfillerBusinessCard {
            backfill_addr: self.address(BACKFILL_MAILBOX),
            cancel_addr: self.address(CANCEL_MAILBOX),
        }
    }

    pub fn business_card(&self) -> ReplicaBusinessCard {
        ReplicaBusinessCard {
            synchronize_addr: self.address(SYNCHRONIZE_MAILBOX),
            live_write_addr: self.address(LIVE_WRITE_MAILBOX),
            branch_id: self.branch,
            backfiller: self.backfiller_card(),
        }
    }

    /// Returns the state of a live session, on either end.
    pub fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        self.serving
            .get(&session_id)
            .map(|s| s.state)
            .or_else(|| self.receiving.get(&session_id).map(|s| s.state))
    }

    /// Number of sessions still holding resources.
    pub fn active_sessions(&self) -> usize {
        self.serving.len() + self.receiving.len()
    }

    /// Number of mailboxes currently allocated, fixed ones included.
    pub fn open_mailboxes(&self) -> usize {
        self.routes.len()
    }

    /// Number of synchronize requests not yet acked.
    pub fn pending_synchronize(&self) -> usize {
        self.waiters.len()
    }

    /// Returns true if this copy accepts local writes.
    pub fn is_authoritative(&self) -> bool {
        self.live.authoritative
    }

    // ========================================================================
    // Event Processing
    // ========================================================================

    /// Processes one event, returning the new state and its output.
    pub fn process(mut self, event: ReplicaEvent) -> (Self, ReplicaOutput) {
        let mut out = ReplicaOutput::empty();
        match event {
            ReplicaEvent::Message(msg) => self.on_message(msg, &mut out),
            ReplicaEvent::StartBackfill {
                session_id,
                region,
                backfiller,
            } => self.start_backfill(session_id, region, backfiller, &mut out),
            ReplicaEvent::CancelBackfill { session_id } => {
                if self.receiving.contains_key(&session_id) {
                    self.cancel_receiving(session_id, &mut out);
                } else if self.serving.contains_key(&session_id) {
                    self.cancel_serving(session_id, &mut out);
                } else {
                    debug!(node = %self.node, session = %session_id, "cancel for unknown session");
                }
            }
            ReplicaEvent::LocalWrite { scope, entries } => {
                self.on_local_write(scope, entries, &mut out);
            }
            ReplicaEvent::Subscribe { live_write_addr } => self.on_subscribe(live_write_addr),
        }
        (self, out)
    }

    fn on_message(&mut self, msg: Message, out: &mut ReplicaOutput) {
        let Message { from, to, payload } = msg;
        if to.node != self.node || to.shard != self.shard {
            debug!(node = %self.node, to = %to, message = payload.name(), "misaddressed message, dropping");
            return;
        }
        let Some(route) = self.routes.get(&to.mailbox).copied() else {
            // Expected after a session ends: its mailboxes are gone.
            debug!(
                node = %self.node,
                mailbox = %to.mailbox,
                message = payload.name(),
                "no such mailbox, dropping"
            );
            return;
        };
        trace!(node = %self.node, from = %from, to = %to, message = payload.name(), "message received");

        match (route, payload) {
            (Route::Backfill, MessagePayload::BackfillRequest(request)) => {
                self.on_backfill_request(request, out);
            }
            (Route::Cancel, MessagePayload::CancelBackfill(cancel)) => {
                self.on_cancel_from_receiver(cancel.session_id, out);
            }
            (Route::Cancel, MessagePayload::BackfillFailed(failed)) => {
                self.on_receiver_failed(failed, out);
            }
            (Route::ChunkAcks(id), MessagePayload::BackfillChunkAck(ack)) if ack.session_id == id => {
                self.on_chunk_ack(ack, out);
            }
            (Route::Allowance(id), MessagePayload::AllowanceGrant(grant))
                if grant.session_id == id =>
            {
                self.on_allowance_grant(grant, out);
            }
            (Route::Reply(id), MessagePayload::BackfillNegotiationReply(reply))
                if reply.session_id == id =>
            {
                self.on_negotiation_reply(reply, out);
            }
            (Route::Reply(id), MessagePayload::BackfillChunk(chunk)) if chunk.session_id == id => {
                self.on_chunk(&chunk, out);
            }
            (Route::Reply(id), MessagePayload::BackfillComplete(complete))
                if complete.session_id == id =>
            {
                self.on_complete(&complete, out);
            }
            (Route::Reply(id), MessagePayload::CancelBackfill(cancel)) if cancel.session_id == id => {
                self.on_cancel_from_backfiller(id, out);
            }
            (Route::Reply(id), MessagePayload::BackfillFailed(failed)) if failed.session_id == id => {
                self.on_backfiller_failed(failed, out);
            }
            (Route::Synchronize, MessagePayload::Synchronize(request)) => {
                self.on_synchronize(request, out);
            }
            (Route::LiveWrite, MessagePayload::ReplicateWrite(write)) => {
                self.on_replicate_write(write, from, out);
            }
            (route, payload) => {
                debug!(
                    node = %self.node,
                    route = ?route,
                    message = payload.name(),
                    "message not accepted by mailbox, dropping"
                );
            }
        }
    }

    // ========================================================================
    // Shared Helpers
    // ========================================================================

    pub(crate) fn allocate_mailbox(&mut self, route: Route) -> MailboxId {
        let mailbox = self.next_mailbox;
        self.next_mailbox = mailbox.next();
        self.routes.insert(mailbox, route);
        mailbox
    }

    pub(crate) fn release_mailbox(&mut self, mailbox: MailboxId) {
        self.routes.remove(&mailbox);
    }

    pub(crate) fn persist(&mut self) -> BackfillResult<()> {
        self.storage
            .persist_metadata(&self.version_map, &self.history)?;
        Ok(())
    }

    /// Applies `record` wherever it is causally newer than what this copy
    /// holds.
    ///
    /// Storage is written first, as one atomic record covering every piece,
    /// and only then does the version map move. Returns the pieces applied;
    /// an empty result means the record was entirely stale.
    pub(crate) fn apply_record(
        &mut self,
        record: &ScopedRecord,
        out: &mut ReplicaOutput,
    ) -> BackfillResult<Vec<KeyRange>> {
        let mut pieces = Vec::new();
        for scope in &record.scopes {
            pieces.extend(
                self.version_map
                    .plan_apply(scope, record.version, &self.history)?,
            );
        }
        if pieces.is_empty() {
            debug!(node = %self.node, version = %record.version, "record is stale, skipping");
            return Ok(pieces);
        }

        self.storage.apply_write(&record.narrowed(pieces.clone()))?;
        for piece in &pieces {
            self.version_map.apply_update(piece, record.version)?;
        }
        self.version_map = self.version_map.coalesced();
        self.persist()?;

        self.check_waiters(out);
        Ok(pieces)
    }

    /// Latest timestamp this copy holds on its followed branch.
    fn latest_own_timestamp(&self) -> Timestamp {
        let initial = self
            .history
            .get(&self.branch)
            .map_or(Timestamp::ZERO, |r| r.initial_timestamp);
        self.version_map
            .entries()
            .iter()
            .filter(|e| e.version.branch == self.branch)
            .map(|e| e.version.timestamp)
            .fold(initial, std::cmp::max)
    }
}
