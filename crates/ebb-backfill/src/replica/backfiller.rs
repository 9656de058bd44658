//! Backfiller role: negotiate, stream chunks under allowance, complete.
//!
//! ```text
//! BackfillRequest ──► merge history ──► diff maps ──► plan pieces
//!                                                        │
//!        ┌──── allowance > 0: read one chunk ◄───────────┘
//!        ▼
//!   BackfillChunk ... last chunk sent ──► Completing ──► last ack ──► BackfillComplete
//! ```
//!
//! Negotiation plans only the pieces where the receiver is behind and the
//! version each catches up to. Data is read when a chunk is sent, so the
//! backfiller holds at most one chunk of data per session regardless of
//! region size. A chunk's version tag never exceeds the version of the data
//! it carries: a local write landing mid-session only makes the data newer.

use std::collections::VecDeque;

use ebb_types::{Address, SessionId};
use tracing::{debug, info, trace, warn};

use crate::message::{
    AllowanceGrant, BackfillChunk, BackfillChunkAck, BackfillComplete, BackfillFailed,
    BackfillNegotiationReply, BackfillRequest, CancelBackfill, MessagePayload,
};
use crate::order_token::TokenValidator;
use crate::storage::Storage;
use crate::version_map::{DiffKind, VersionMap};
use crate::{BackfillError, BackfillResult};

use super::session::{BackfillerSession, PlannedPiece, SessionState, chunk_count, transition};
use super::state::{BACKFILL_MAILBOX, ReplicaState, Route};
use super::{ReplicaOutput, SessionEnd, SessionRole};

impl<S: Storage> ReplicaState<S> {
    // ========================================================================
    // Negotiation
    // ========================================================================

    pub(super) fn on_backfill_request(&mut self, request: BackfillRequest, out: &mut ReplicaOutput) {
        let session_id = request.session_id;
        if self.serving.contains_key(&session_id) {
            debug!(node = %self.node, session = %session_id, "duplicate backfill request, dropping");
            return;
        }

        match self.negotiate(&request) {
            Ok((mut session, map)) => {
                info!(
                    node = %self.node,
                    session = %session_id,
                    region = %request.region,
                    chunks = session.total_chunks,
                    "backfill accepted"
                );
                let reply = BackfillNegotiationReply {
                    session_id,
                    version_map: map,
                    history: self.history.clone(),
                    chunk_addr: self.address(session.chunk_mailbox),
                    allowance_addr: self.address(session.allowance_mailbox),
                    domain: session.domain,
                    total_chunks: session.total_chunks,
                };
                out.send(
                    self.address(BACKFILL_MAILBOX),
                    request.reply_addr,
                    MessagePayload::BackfillNegotiationReply(reply),
                );
                transition(session_id, &mut session.state, SessionState::Streaming);
                self.serving.insert(session_id, session);
                self.pump(session_id, out);
            }
            Err(err) => {
                let reason = err.failure_reason().unwrap_or(crate::FailureReason::ProtocolViolation);
                warn!(
                    node = %self.node,
                    session = %session_id,
                    error = %err,
                    reason = %reason,
                    "backfill negotiation failed"
                );
                out.send(
                    self.address(BACKFILL_MAILBOX),
                    request.reply_addr,
                    MessagePayload::BackfillFailed(BackfillFailed { session_id, reason }),
                );
                // No session was registered. The rejection is still this
                // end's one outcome for the session id.
                out.outcome(session_id, SessionRole::Backfiller, SessionEnd::Failed(reason));
            }
        }
    }

    /// Merges histories, diffs the maps and plans the chunk stream.
    ///
    /// Mailboxes and the token domain are only allocated once nothing else
    /// can fail, so a rejected request leaves no resources behind.
    fn negotiate(
        &mut self,
        request: &BackfillRequest,
    ) -> BackfillResult<(BackfillerSession, VersionMap)> {
        if request.region.is_empty() || !self.region.contains_range(&request.region) {
            return Err(BackfillError::InvalidRequest {
                reason: "requested region is not hosted here",
            });
        }
        if request.version_map.region() != &request.region {
            return Err(BackfillError::InvalidRequest {
                reason: "version map does not cover the requested region",
            });
        }
        if request.initial_allowance == 0 {
            return Err(BackfillError::InvalidRequest {
                reason: "initial allowance is zero",
            });
        }

        self.history.merge(&request.history)?;
        self.persist()?;

        let mine = self.version_map.restrict(&request.region);
        let diff = request.version_map.diff(&mine, &self.history)?;

        let mut plan = VecDeque::new();
        let mut total_chunks = 0;
        for (piece, kind) in diff {
            if kind != DiffKind::IAmBehind {
                continue;
            }
            for entry in mine.restrict(&piece).entries() {
                let keys = self.storage.count_range(&entry.range)?;
                total_chunks += chunk_count(keys, self.config.max_chunk_entries);
                plan.push_back(PlannedPiece {
                    range: entry.range.clone(),
                    version: entry.version,
                });
            }
        }

        let session_id = request.session_id;
        let domain = self.sequencer.new_domain();
        let chunk_mailbox = self.allocate_mailbox(Route::ChunkAcks(session_id));
        let allowance_mailbox = self.allocate_mailbox(Route::Allowance(session_id));
        let session = BackfillerSession {
            state: SessionState::Negotiating,
            region: request.region.clone(),
            peer: request.reply_addr,
            chunk_mailbox,
            allowance_mailbox,
            domain,
            negotiated: mine.clone(),
            plan,
            cursor: None,
            total_chunks,
            sent: 0,
            allowance: request.initial_allowance,
            acks: TokenValidator::new(domain),
        };
        Ok((session, mine))
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    /// Sends as many chunks as the allowance permits, reading each from
    /// storage as it goes out.
    fn pump(&mut self, session_id: SessionId, out: &mut ReplicaOutput) {
        let (node, shard) = (self.node, self.shard);
        let max_entries = self.config.max_chunk_entries;
        let Some(session) = self.serving.get_mut(&session_id) else {
            return;
        };
        if session.state != SessionState::Streaming {
            return;
        }

        let from = Address::new(node, shard, session.chunk_mailbox);
        while session.allowance > 0 {
            let chunk = match session.next_chunk(&self.storage, max_entries) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    let err = BackfillError::from(err);
                    self.fail_serving(session_id, &err, out);
                    return;
                }
            };
            session.allowance -= 1;
            session.sent += 1;
            let token = self.sequencer.next(session.domain);
            let progress = session.progress();
            trace!(
                node = %node,
                session = %session_id,
                range = %chunk.range,
                token = %token,
                entries = chunk.entries.len(),
                progress,
                "sending chunk"
            );
            out.send(
                from,
                session.peer,
                MessagePayload::BackfillChunk(BackfillChunk {
                    session_id,
                    range: chunk.range,
                    version: chunk.version,
                    entries: chunk.entries,
                    progress,
                    token,
                }),
            );
        }

        if session.is_drained() {
            transition(session_id, &mut session.state, SessionState::Completing);
            if session.all_acked() {
                self.finish_serving(session_id, out);
            }
        } else if session.allowance == 0 {
            trace!(node = %node, session = %session_id, "allowance exhausted, waiting for grant");
        }
    }

    pub(super) fn on_chunk_ack(&mut self, ack: BackfillChunkAck, out: &mut ReplicaOutput) {
        let session_id = ack.session_id;
        let Some(session) = self.serving.get_mut(&session_id) else {
            return;
        };
        let result = match session.state {
            SessionState::Streaming | SessionState::Completing if ack.token.sequence > session.sent => {
                Err(BackfillError::InvalidRequest {
                    reason: "ack for a chunk that was never sent",
                })
            }
            SessionState::Streaming | SessionState::Completing => {
                session.acks.accept(ack.token).map_err(BackfillError::from)
            }
            state => Err(BackfillError::UnexpectedMessage {
                message: "BackfillChunkAck",
                state,
            }),
        };
        if let Err(err) = result {
            self.fail_serving(session_id, &err, out);
            return;
        }
        if session.state == SessionState::Completing && session.all_acked() {
            self.finish_serving(session_id, out);
        }
    }

    pub(super) fn on_allowance_grant(&mut self, grant: AllowanceGrant, out: &mut ReplicaOutput) {
        let Some(session) = self.serving.get_mut(&grant.session_id) else {
            return;
        };
        session.allowance = session.allowance.saturating_add(grant.chunks);
        trace!(
            node = %self.node,
            session = %grant.session_id,
            allowance = session.allowance,
            "allowance granted"
        );
        self.pump(grant.session_id, out);
    }

    fn finish_serving(&mut self, session_id: SessionId, out: &mut ReplicaOutput) {
        let Some(mut session) = self.serving.remove(&session_id) else {
            return;
        };
        out.send(
            self.address(session.chunk_mailbox),
            session.peer,
            MessagePayload::BackfillComplete(BackfillComplete {
                session_id,
                version_map: session.negotiated.clone(),
                history: self.history.clone(),
            }),
        );
        transition(session_id, &mut session.state, SessionState::Done);
        self.release_serving(&session);
        info!(node = %self.node, session = %session_id, chunks = session.sent, "backfill served");
        out.outcome(session_id, SessionRole::Backfiller, SessionEnd::Completed);
    }

    // ========================================================================
    // Cancellation and Failure
    // ========================================================================

    /// The receiver cancelled.
    pub(super) fn on_cancel_from_receiver(&mut self, session_id: SessionId, out: &mut ReplicaOutput) {
        let Some(mut session) = self.serving.remove(&session_id) else {
            debug!(node = %self.node, session = %session_id, "cancel for unknown session, dropping");
            return;
        };
        transition(session_id, &mut session.state, SessionState::Cancelled);
        self.release_serving(&session);
        info!(node = %self.node, session = %session_id, sent = session.sent, "backfill cancelled by receiver");
        out.outcome(session_id, SessionRole::Backfiller, SessionEnd::Cancelled);
    }

    /// This node cancels a session it serves.
    pub(super) fn cancel_serving(&mut self, session_id: SessionId, out: &mut ReplicaOutput) {
        let Some(mut session) = self.serving.remove(&session_id) else {
            return;
        };
        out.send(
            self.address(session.chunk_mailbox),
            session.peer,
            MessagePayload::CancelBackfill(CancelBackfill { session_id }),
        );
        transition(session_id, &mut session.state, SessionState::Cancelled);
        self.release_serving(&session);
        info!(node = %self.node, session = %session_id, "backfill cancelled");
        out.outcome(session_id, SessionRole::Backfiller, SessionEnd::Cancelled);
    }

    pub(super) fn on_receiver_failed(&mut self, failed: BackfillFailed, out: &mut ReplicaOutput) {
        let session_id = failed.session_id;
        let Some(mut session) = self.serving.remove(&session_id) else {
            debug!(node = %self.node, session = %session_id, "failure for unknown session, dropping");
            return;
        };
        transition(session_id, &mut session.state, SessionState::Failed);
        self.release_serving(&session);
        warn!(node = %self.node, session = %session_id, reason = %failed.reason, "receiver failed backfill");
        out.outcome(session_id, SessionRole::Backfiller, SessionEnd::Failed(failed.reason));
    }

    /// Ends a served session on a fatal error and tells the receiver why.
    fn fail_serving(&mut self, session_id: SessionId, err: &BackfillError, out: &mut ReplicaOutput) {
        let Some(reason) = err.failure_reason() else {
            debug!(node = %self.node, session = %session_id, error = %err, "dropping message");
            return;
        };
        let Some(mut session) = self.serving.remove(&session_id) else {
            return;
        };
        warn!(
            node = %self.node,
            session = %session_id,
            error = %err,
            reason = %reason,
            "backfill failed"
        );
        out.send(
            self.address(session.chunk_mailbox),
            session.peer,
            MessagePayload::BackfillFailed(BackfillFailed { session_id, reason }),
        );
        transition(session_id, &mut session.state, SessionState::Failed);
        self.release_serving(&session);
        out.outcome(session_id, SessionRole::Backfiller, SessionEnd::Failed(reason));
    }

    fn release_serving(&mut self, session: &BackfillerSession) {
        self.release_mailbox(session.chunk_mailbox);
        self.release_mailbox(session.allowance_mailbox);
        self.sequencer.retire(session.domain);
    }
}
