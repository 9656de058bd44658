//! Replica tasks and the handles that drive them.
//!
//! Each replica runs in its own task. The task owns the [`ReplicaState`]
//! and feeds it two inputs: peer messages from the [`Network`], and
//! commands from [`NodeHandle`]s. Every output message goes back through
//! the network.

use std::collections::HashMap;
use std::sync::Arc;

use ebb_backfill::{
    BackfillError, BackfillerBusinessCard, KvEntry, Message, MessagePayload, ReplicaBusinessCard,
    ReplicaEvent, ReplicaOutput, ReplicaState, SessionEnd, SessionRole, Storage, Synchronize,
    Version, VersionMap,
};
use ebb_types::{Address, KeyRange, NodeId, SessionId, ShardId, Timestamp};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::RuntimeError;
use crate::cluster::Network;

// ============================================================================
// Commands
// ============================================================================

pub(crate) enum Command {
    Start {
        session_id: SessionId,
        region: KeyRange,
        backfiller: BackfillerBusinessCard,
        done: oneshot::Sender<SessionEnd>,
    },
    Cancel {
        session_id: SessionId,
    },
    Write {
        scope: KeyRange,
        entries: Vec<KvEntry>,
        done: oneshot::Sender<Option<Version>>,
    },
    Subscribe {
        live_write_addr: Address,
    },
    Snapshot(oneshot::Sender<Result<ReplicaSnapshot, BackfillError>>),
    Shutdown(oneshot::Sender<()>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Start { session_id, .. } => write!(f, "Start({session_id})"),
            Command::Cancel { session_id } => write!(f, "Cancel({session_id})"),
            Command::Write { scope, .. } => write!(f, "Write({scope})"),
            Command::Subscribe { live_write_addr } => write!(f, "Subscribe({live_write_addr})"),
            Command::Snapshot(_) => write!(f, "Snapshot"),
            Command::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

/// Point-in-time view of one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSnapshot {
    pub version_map: VersionMap,
    /// Every stored entry in the hosted region, in key order.
    pub entries: Vec<KvEntry>,
    pub active_sessions: usize,
    pub open_mailboxes: usize,
    pub pending_synchronize: usize,
    pub is_authoritative: bool,
}

impl ReplicaSnapshot {
    fn capture<S: Storage>(state: &ReplicaState<S>) -> Result<Self, BackfillError> {
        Ok(Self {
            version_map: state.version_map().clone(),
            entries: state.storage().read_range(state.region())?,
            active_sessions: state.active_sessions(),
            open_mailboxes: state.open_mailboxes(),
            pending_synchronize: state.pending_synchronize(),
            is_authoritative: state.is_authoritative(),
        })
    }
}

// ============================================================================
// Replica Task
// ============================================================================

pub(crate) async fn run_replica<S: Storage>(
    mut state: ReplicaState<S>,
    mut peers: mpsc::UnboundedReceiver<Message>,
    mut commands: mpsc::Receiver<Command>,
    network: Arc<Network>,
) {
    let node = state.node();
    let shard = state.shard();
    let region = state.region().clone();

    // Receivers waiting on the sessions this replica started.
    let mut waiting: HashMap<SessionId, oneshot::Sender<SessionEnd>> = HashMap::new();
    let mut stopped = None;

    loop {
        let mut write_done = None;
        let event = tokio::select! {
            Some(message) = peers.recv() => ReplicaEvent::Message(message),
            command = commands.recv() => match command {
                Some(Command::Start { session_id, region, backfiller, done }) => {
                    waiting.insert(session_id, done);
                    ReplicaEvent::StartBackfill { session_id, region, backfiller }
                }
                Some(Command::Cancel { session_id }) => ReplicaEvent::CancelBackfill { session_id },
                Some(Command::Write { scope, entries, done }) => {
                    write_done = Some(done);
                    ReplicaEvent::LocalWrite { scope, entries }
                }
                Some(Command::Subscribe { live_write_addr }) => {
                    ReplicaEvent::Subscribe { live_write_addr }
                }
                Some(Command::Snapshot(reply)) => {
                    let _ = reply.send(ReplicaSnapshot::capture(&state));
                    continue;
                }
                Some(Command::Shutdown(done)) => {
                    stopped = Some(done);
                    break;
                }
                None => break,
            },
        };

        let (next, out) = state.process(event);
        state = next;
        if let Some(done) = write_done {
            let _ = done.send(out.written);
        }
        dispatch(out, &mut waiting, &network).await;
    }

    network.unregister(node, shard, &region).await;
    info!(active_sessions = state.active_sessions(), "replica stopped");
    if let Some(done) = stopped {
        let _ = done.send(());
    }
}

async fn dispatch(
    out: ReplicaOutput,
    waiting: &mut HashMap<SessionId, oneshot::Sender<SessionEnd>>,
    network: &Network,
) {
    for outcome in out.outcomes {
        debug!(session = %outcome.session_id, role = ?outcome.role, end = ?outcome.end, "session ended");
        if outcome.role != SessionRole::Receiver {
            continue;
        }
        if let Some(done) = waiting.remove(&outcome.session_id) {
            // The caller may have stopped waiting.
            let _ = done.send(outcome.end);
        }
    }
    for stalled in out.stalled {
        warn!(writer = %stalled.writer, token = %stalled.token, reason = %stalled.reason, "live write stream stalled");
    }
    for message in out.messages {
        network.deliver(message).await;
    }
}

// ============================================================================
// Handles
// ============================================================================

/// A cheaply-cloneable handle to one running replica.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    node: NodeId,
    shard: ShardId,
    region: KeyRange,
    card: ReplicaBusinessCard,
    commands: mpsc::Sender<Command>,
    network: Arc<Network>,
}

impl NodeHandle {
    pub(crate) fn new(
        node: NodeId,
        shard: ShardId,
        region: KeyRange,
        card: ReplicaBusinessCard,
        commands: mpsc::Sender<Command>,
        network: Arc<Network>,
    ) -> Self {
        Self {
            node,
            shard,
            region,
            card,
            commands,
            network,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn region(&self) -> &KeyRange {
        &self.region
    }

    pub fn business_card(&self) -> ReplicaBusinessCard {
        self.card
    }

    async fn command(&self, command: Command) -> Result<(), RuntimeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RuntimeError::Shutdown)
    }

    /// Starts catching up `region` from a peer found in the directory.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::DirectoryError`] if no other node hosts `region`
    /// - [`RuntimeError::Shutdown`] if the replica has stopped
    pub async fn start_backfill(&self, region: KeyRange) -> Result<BackfillHandle, RuntimeError> {
        let backfiller = {
            let directory = self.network.directory.read().await;
            let entry = directory.backfiller_for(&region, self.node)?;
            debug!(node = %self.node, backfiller = %entry.node, region = %region, "backfiller chosen");
            entry.card.backfiller
        };

        let session_id = SessionId::generate();
        let (done, rx) = oneshot::channel();
        self.command(Command::Start {
            session_id,
            region,
            backfiller,
            done,
        })
        .await?;
        Ok(BackfillHandle {
            session_id,
            done: rx,
        })
    }

    /// Catches up `region` and waits for the session to end.
    pub async fn backfill(&self, region: KeyRange) -> Result<SessionId, RuntimeError> {
        let handle = self.start_backfill(region).await?;
        let session_id = handle.session_id();
        handle.wait().await?;
        Ok(session_id)
    }

    /// Cancels a session this replica takes part in. Cancelling a session
    /// that already ended does nothing.
    pub async fn cancel_backfill(&self, session_id: SessionId) -> Result<(), RuntimeError> {
        self.command(Command::Cancel { session_id }).await
    }

    /// Waits until this replica's copy of `range` is at least as current as
    /// `target` on its followed branch.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Shutdown`] if the replica stops first.
    pub async fn synchronize(&self, range: KeyRange, target: Timestamp) -> Result<(), RuntimeError> {
        let (ack_addr, ack) = self.network.register_ack(self.node, self.shard).await;
        let message = Message::new(
            ack_addr,
            self.card.synchronize_addr,
            MessagePayload::Synchronize(Synchronize {
                range,
                target,
                ack_addr,
            }),
        );
        if !self.network.deliver(message).await {
            self.network.cancel_ack(&ack_addr).await;
            return Err(RuntimeError::Shutdown);
        }
        ack.await.map_err(|_| RuntimeError::Shutdown)
    }

    /// [`synchronize`](Self::synchronize) over the whole hosted region.
    pub async fn synchronize_region(&self, target: Timestamp) -> Result<(), RuntimeError> {
        self.synchronize(self.region.clone(), target).await
    }

    /// Applies a local write to `scope` and replicates it to subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::WriteRejected`] if the replica is not the
    /// authoritative writer, the scope is not hosted, or the write failed.
    pub async fn write(&self, scope: KeyRange, entries: Vec<KvEntry>) -> Result<Version, RuntimeError> {
        let (done, rx) = oneshot::channel();
        self.command(Command::Write {
            scope,
            entries,
            done,
        })
        .await?;
        rx.await
            .map_err(|_| RuntimeError::Shutdown)?
            .ok_or(RuntimeError::WriteRejected {
                node: self.node,
                shard: self.shard,
            })
    }

    /// Replicates this replica's future local writes to `follower`.
    pub async fn subscribe(&self, follower: &NodeHandle) -> Result<(), RuntimeError> {
        self.command(Command::Subscribe {
            live_write_addr: follower.card.live_write_addr,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<ReplicaSnapshot, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot(reply)).await?;
        Ok(rx.await.map_err(|_| RuntimeError::Shutdown)??)
    }

    /// Stops the replica and retracts its business card. Sessions still
    /// open end with [`RuntimeError::Shutdown`] for their waiters.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (done, rx) = oneshot::channel();
        self.command(Command::Shutdown(done)).await?;
        rx.await.map_err(|_| RuntimeError::Shutdown)
    }
}

/// A backfill session started by [`NodeHandle::start_backfill`].
#[derive(Debug)]
pub struct BackfillHandle {
    session_id: SessionId,
    done: oneshot::Receiver<SessionEnd>,
}

impl BackfillHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Waits for the session to end.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Cancelled`] if either end cancelled
    /// - [`RuntimeError::BackfillFailed`] if either end failed
    /// - [`RuntimeError::Shutdown`] if the replica stopped first
    pub async fn wait(self) -> Result<(), RuntimeError> {
        let session_id = self.session_id;
        match self.done.await {
            Ok(SessionEnd::Completed) => Ok(()),
            Ok(SessionEnd::Cancelled) => Err(RuntimeError::Cancelled { session_id }),
            Ok(SessionEnd::Failed(reason)) => {
                warn!(session = %session_id, reason = %reason, "backfill failed");
                Err(RuntimeError::BackfillFailed { session_id, reason })
            }
            Err(_) => Err(RuntimeError::Shutdown),
        }
    }
}
