//! Receiver role: request a backfill, apply chunks in order, grant allowance.
//!
//! Chunk handling order matters:
//!
//! 1. The session must be streaming and the token must be next in domain.
//! 2. The chunk must fit under the outstanding allowance.
//! 3. Progress must not go backwards and must hit `1.0` exactly on the last
//!    chunk.
//! 4. The data is applied where causally newer, atomically, and only then
//!    does the version map move.
//! 5. The ack goes out, followed by a fresh grant once enough chunks have
//!    been drained.
//!
//! On completion the copy's map must dominate the map the backfiller
//! negotiated; anything less means chunks went missing.

use ebb_types::{KeyRange, SessionId};
use tracing::{debug, info, trace, warn};

use crate::business_card::BackfillerBusinessCard;
use crate::message::{
    AllowanceGrant, BackfillChunk, BackfillChunkAck, BackfillComplete, BackfillFailed,
    BackfillNegotiationReply, BackfillRequest, CancelBackfill, FailureReason, MessagePayload,
};
use crate::order_token::TokenValidator;
use crate::storage::Storage;
use crate::{BackfillError, BackfillResult};

use super::session::{ReceiverSession, SessionState, transition};
use super::state::{ReplicaState, Route};
use super::{ReplicaOutput, SessionEnd, SessionRole};

impl<S: Storage> ReplicaState<S> {
    // ========================================================================
    // Request
    // ========================================================================

    pub(super) fn start_backfill(
        &mut self,
        session_id: SessionId,
        region: KeyRange,
        backfiller: BackfillerBusinessCard,
        out: &mut ReplicaOutput,
    ) {
        if self.receiving.contains_key(&session_id) || self.serving.contains_key(&session_id) {
            debug!(node = %self.node, session = %session_id, "session id already in use");
            return;
        }
        if region.is_empty() || !self.region.contains_range(&region) {
            warn!(node = %self.node, session = %session_id, region = %region, "backfill region not hosted here");
            out.outcome(
                session_id,
                SessionRole::Receiver,
                SessionEnd::Failed(FailureReason::ProtocolViolation),
            );
            return;
        }

        let reply_mailbox = self.allocate_mailbox(Route::Reply(session_id));
        let window = self.config.allowance_window;
        let request = BackfillRequest {
            session_id,
            region: region.clone(),
            version_map: self.version_map.restrict(&region),
            history: self.history.clone(),
            reply_addr: self.address(reply_mailbox),
            initial_allowance: window,
        };
        out.send(
            self.address(reply_mailbox),
            backfiller.backfill_addr,
            MessagePayload::BackfillRequest(request),
        );
        info!(
            node = %self.node,
            session = %session_id,
            region = %region,
            backfiller = %backfiller.backfill_addr,
            "backfill requested"
        );
        self.receiving.insert(
            session_id,
            ReceiverSession::new(region, reply_mailbox, backfiller, window),
        );
    }

    // ========================================================================
    // Negotiation Reply
    // ========================================================================

    pub(super) fn on_negotiation_reply(
        &mut self,
        reply: BackfillNegotiationReply,
        out: &mut ReplicaOutput,
    ) {
        let session_id = reply.session_id;
        if let Err(err) = self.accept_negotiation(&reply, out) {
            self.fail_receiving(session_id, &err, out);
        }
    }

    fn accept_negotiation(
        &mut self,
        reply: &BackfillNegotiationReply,
        out: &mut ReplicaOutput,
    ) -> BackfillResult<()> {
        let session_id = reply.session_id;
        let state = self
            .receiving
            .get(&session_id)
            .map(|s| s.state)
            .ok_or(BackfillError::UnknownSession { session_id })?;
        if state != SessionState::Requested {
            return Err(BackfillError::UnexpectedMessage {
                message: "BackfillNegotiationReply",
                state,
            });
        }

        // Learn the backfiller's history before any chunk needs it.
        self.history.merge(&reply.history)?;
        reply.version_map.check_resolvable(&self.history)?;
        self.persist()?;

        let session = self
            .receiving
            .get_mut(&session_id)
            .ok_or(BackfillError::UnknownSession { session_id })?;
        session.chunk_addr = Some(reply.chunk_addr);
        session.allowance_addr = Some(reply.allowance_addr);
        session.validator = Some(TokenValidator::new(reply.domain));
        transition(session_id, &mut session.state, SessionState::Streaming);
        if reply.total_chunks == 0 {
            transition(session_id, &mut session.state, SessionState::Completing);
        }
        info!(
            node = %self.node,
            session = %session_id,
            chunks = reply.total_chunks,
            "backfill negotiated"
        );

        self.check_waiters(out);
        Ok(())
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    pub(super) fn on_chunk(&mut self, chunk: &BackfillChunk, out: &mut ReplicaOutput) {
        if let Err(err) = self.accept_chunk(chunk, out) {
            self.fail_receiving(chunk.session_id, &err, out);
        }
    }

    fn accept_chunk(&mut self, chunk: &BackfillChunk, out: &mut ReplicaOutput) -> BackfillResult<()> {
        let session_id = chunk.session_id;
        let session = self
            .receiving
            .get_mut(&session_id)
            .ok_or(BackfillError::UnknownSession { session_id })?;
        if session.state != SessionState::Streaming {
            return Err(BackfillError::UnexpectedMessage {
                message: "BackfillChunk",
                state: session.state,
            });
        }
        let (Some(validator), Some(chunk_addr), Some(allowance_addr)) = (
            session.validator.as_mut(),
            session.chunk_addr,
            session.allowance_addr,
        ) else {
            return Err(BackfillError::UnexpectedMessage {
                message: "BackfillChunk",
                state: session.state,
            });
        };

        validator.accept(chunk.token)?;
        let is_last = chunk.is_last();
        if session.outstanding == 0 {
            return Err(BackfillError::AllowanceExceeded { session_id });
        }
        session.outstanding -= 1;

        if !(chunk.progress >= session.last_progress && chunk.progress <= 1.0) {
            return Err(BackfillError::InvalidRequest {
                reason: "chunk progress is not monotonic",
            });
        }
        session.last_progress = chunk.progress;
        if !session.region.contains_range(&chunk.range) {
            return Err(BackfillError::InvalidRequest {
                reason: "chunk lies outside the session region",
            });
        }
        let reply_mailbox = session.reply_mailbox;

        let applied = self.apply_record(&chunk.to_record(), out)?;
        trace!(
            node = %self.node,
            session = %session_id,
            range = %chunk.range,
            token = %chunk.token,
            progress = chunk.progress,
            pieces = applied.len(),
            "chunk applied"
        );

        let from = self.address(reply_mailbox);
        out.send(
            from,
            chunk_addr,
            MessagePayload::BackfillChunkAck(BackfillChunkAck {
                session_id,
                token: chunk.token,
            }),
        );

        let refill_threshold = self.config.refill_threshold;
        let session = self
            .receiving
            .get_mut(&session_id)
            .ok_or(BackfillError::UnknownSession { session_id })?;
        session.applied_since_grant += 1;
        if is_last {
            transition(session_id, &mut session.state, SessionState::Completing);
        } else if session.applied_since_grant >= refill_threshold {
            let chunks = session.applied_since_grant;
            session.applied_since_grant = 0;
            session.outstanding = session.outstanding.saturating_add(chunks);
            out.send(
                from,
                allowance_addr,
                MessagePayload::AllowanceGrant(AllowanceGrant { session_id, chunks }),
            );
        }
        Ok(())
    }

    // ========================================================================
    // Completion
    // ========================================================================

    pub(super) fn on_complete(&mut self, complete: &BackfillComplete, out: &mut ReplicaOutput) {
        let session_id = complete.session_id;
        if let Err(err) = self.accept_complete(complete) {
            self.fail_receiving(session_id, &err, out);
            return;
        }

        let Some(mut session) = self.receiving.remove(&session_id) else {
            return;
        };
        transition(session_id, &mut session.state, SessionState::Done);
        self.release_mailbox(session.reply_mailbox);
        info!(
            node = %self.node,
            session = %session_id,
            region = %session.region,
            version_map = %self.version_map.restrict(&session.region),
            "backfill complete"
        );
        out.outcome(session_id, SessionRole::Receiver, SessionEnd::Completed);
        self.check_waiters(out);
    }

    /// Checks that the applied stream caught this copy up to the map the
    /// backfiller negotiated, then learns its final history.
    fn accept_complete(&mut self, complete: &BackfillComplete) -> BackfillResult<()> {
        let session_id = complete.session_id;
        let session = self
            .receiving
            .get(&session_id)
            .ok_or(BackfillError::UnknownSession { session_id })?;
        if session.state != SessionState::Completing {
            return Err(BackfillError::UnexpectedMessage {
                message: "BackfillComplete",
                state: session.state,
            });
        }
        if complete.version_map.region() != &session.region {
            return Err(BackfillError::InvalidRequest {
                reason: "completion map does not cover the session region",
            });
        }
        let region = session.region.clone();

        self.history.merge(&complete.history)?;
        self.persist()?;
        let mine = self.version_map.restrict(&region);
        if !mine.dominates(&complete.version_map, &self.history)? {
            debug!(
                node = %self.node,
                session = %session_id,
                mine = %mine,
                theirs = %complete.version_map,
                "backfill ended behind the negotiated map"
            );
            return Err(BackfillError::InvalidRequest {
                reason: "applied chunks do not reach the negotiated map",
            });
        }
        Ok(())
    }

    // ========================================================================
    // Cancellation and Failure
    // ========================================================================

    /// This node cancels a session it requested.
    pub(super) fn cancel_receiving(&mut self, session_id: SessionId, out: &mut ReplicaOutput) {
        let Some(mut session) = self.receiving.remove(&session_id) else {
            return;
        };
        out.send(
            self.address(session.reply_mailbox),
            session.backfiller.cancel_addr,
            MessagePayload::CancelBackfill(CancelBackfill { session_id }),
        );
        transition(session_id, &mut session.state, SessionState::Cancelled);
        self.release_mailbox(session.reply_mailbox);
        info!(node = %self.node, session = %session_id, "backfill cancelled");
        out.outcome(session_id, SessionRole::Receiver, SessionEnd::Cancelled);
    }

    /// The backfiller cancelled.
    pub(super) fn on_cancel_from_backfiller(&mut self, session_id: SessionId, out: &mut ReplicaOutput) {
        let Some(mut session) = self.receiving.remove(&session_id) else {
            return;
        };
        transition(session_id, &mut session.state, SessionState::Cancelled);
        self.release_mailbox(session.reply_mailbox);
        info!(node = %self.node, session = %session_id, "backfill cancelled by backfiller");
        out.outcome(session_id, SessionRole::Receiver, SessionEnd::Cancelled);
    }

    pub(super) fn on_backfiller_failed(&mut self, failed: BackfillFailed, out: &mut ReplicaOutput) {
        let session_id = failed.session_id;
        let Some(mut session) = self.receiving.remove(&session_id) else {
            return;
        };
        transition(session_id, &mut session.state, SessionState::Failed);
        self.release_mailbox(session.reply_mailbox);
        warn!(node = %self.node, session = %session_id, reason = %failed.reason, "backfiller failed backfill");
        out.outcome(session_id, SessionRole::Receiver, SessionEnd::Failed(failed.reason));
    }

    /// Ends a requested session on a fatal error and tells the backfiller
    /// why. Chunks already applied stay applied.
    fn fail_receiving(&mut self, session_id: SessionId, err: &BackfillError, out: &mut ReplicaOutput) {
        let Some(reason) = err.failure_reason() else {
            debug!(node = %self.node, session = %session_id, error = %err, "dropping message");
            return;
        };
        let Some(mut session) = self.receiving.remove(&session_id) else {
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
            self.address(session.reply_mailbox),
            session.backfiller.cancel_addr,
            MessagePayload::BackfillFailed(BackfillFailed { session_id, reason }),
        );
        transition(session_id, &mut session.state, SessionState::Failed);
        self.release_mailbox(session.reply_mailbox);
        out.outcome(session_id, SessionRole::Receiver, SessionEnd::Failed(reason));
    }
}
