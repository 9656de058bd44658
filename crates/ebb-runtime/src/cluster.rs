//! In-process cluster: the transport and directory shared by replica tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ebb_backfill::{BranchHistory, Message, ReplicaState, Storage};
use ebb_directory::Directory;
use ebb_types::{Address, BranchId, KeyRange, MailboxId, NodeId, ShardId};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{Instrument, debug, info, info_span};

use crate::node::{NodeHandle, run_replica};
use crate::{RuntimeConfig, RuntimeError};

/// Shard reserved for client reply mailboxes. No replica may run on it.
pub const CLIENT_SHARD: ShardId = ShardId::new(u64::MAX);

type ReplicaKey = (NodeId, ShardId);

/// Routes messages between replica tasks and back to waiting clients.
///
/// Peer channels are unbounded: a backfiller never has more chunks in
/// flight than the receiver allowed, and every other message is a single
/// reply to a request.
#[derive(Debug, Default)]
pub(crate) struct Network {
    peers: RwLock<HashMap<ReplicaKey, mpsc::UnboundedSender<Message>>>,

    /// One-shot client mailboxes, with the shard of the replica they wait on.
    acks: Mutex<HashMap<Address, (ShardId, oneshot::Sender<()>)>>,
    next_ack: AtomicU64,

    pub(crate) directory: RwLock<Directory>,
}

impl Network {
    /// Delivers `message` to its destination. Returns false if nothing is
    /// listening there.
    pub(crate) async fn deliver(&self, message: Message) -> bool {
        let to = message.to;
        if to.shard == CLIENT_SHARD {
            return match self.acks.lock().await.remove(&to) {
                Some((_, ack)) => ack.send(()).is_ok(),
                None => false,
            };
        }

        let peers = self.peers.read().await;
        match peers.get(&(to.node, to.shard)) {
            Some(tx) => tx.send(message).is_ok(),
            None => {
                debug!(to = %to, "no replica at destination, dropping");
                false
            }
        }
    }

    /// Allocates a client mailbox on `node` that resolves once a message
    /// from the replica on `shard` arrives.
    pub(crate) async fn register_ack(
        &self,
        node: NodeId,
        shard: ShardId,
    ) -> (Address, oneshot::Receiver<()>) {
        let mailbox = MailboxId::new(self.next_ack.fetch_add(1, Ordering::Relaxed));
        let addr = Address::new(node, CLIENT_SHARD, mailbox);
        let (tx, rx) = oneshot::channel();
        self.acks.lock().await.insert(addr, (shard, tx));
        (addr, rx)
    }

    pub(crate) async fn cancel_ack(&self, addr: &Address) {
        self.acks.lock().await.remove(addr);
    }

    async fn register(
        &self,
        key: ReplicaKey,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Result<(), RuntimeError> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&key) {
            return Err(RuntimeError::AlreadyRunning {
                node: key.0,
                shard: key.1,
            });
        }
        peers.insert(key, tx);
        Ok(())
    }

    /// Removes a stopped replica's route, directory card and pending acks.
    pub(crate) async fn unregister(&self, node: NodeId, shard: ShardId, region: &KeyRange) {
        self.peers.write().await.remove(&(node, shard));
        // A missing card only means it was already retracted.
        let _ = self.directory.write().await.retract(node, region);
        self.acks
            .lock()
            .await
            .retain(|addr, (target, _)| !(addr.node == node && *target == shard));
    }
}

/// A set of replica tasks sharing one network and one directory.
///
/// Cloning is cheap; every clone refers to the same cluster.
#[derive(Debug, Clone)]
pub struct Cluster {
    config: RuntimeConfig,
    network: Arc<Network>,
}

impl Cluster {
    /// Creates an empty cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        Ok(Self {
            config,
            network: Arc::new(Network::default()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Returns a copy of the current directory.
    pub async fn directory(&self) -> Directory {
        self.network.directory.read().await.clone()
    }

    /// Opens a region copy with the cluster's backfill configuration and
    /// starts it.
    pub async fn open_replica<S>(
        &self,
        node: NodeId,
        shard: ShardId,
        region: KeyRange,
        branch: BranchId,
        history: BranchHistory,
        storage: S,
    ) -> Result<NodeHandle, RuntimeError>
    where
        S: Storage + Send + 'static,
    {
        let state = ReplicaState::new(
            node,
            shard,
            region,
            branch,
            history,
            storage,
            self.config.backfill,
        )?;
        self.spawn_replica(state).await
    }

    /// Starts a task driving `state` and publishes its business card.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::ReservedShard`] if the replica runs on [`CLIENT_SHARD`]
    /// - [`RuntimeError::AlreadyRunning`] if the node and shard are taken
    /// - [`RuntimeError::DirectoryError`] if the card cannot be published
    pub async fn spawn_replica<S>(&self, state: ReplicaState<S>) -> Result<NodeHandle, RuntimeError>
    where
        S: Storage + Send + 'static,
    {
        let node = state.node();
        let shard = state.shard();
        if shard == CLIENT_SHARD {
            return Err(RuntimeError::ReservedShard { shard });
        }
        let region = state.region().clone();
        let card = state.business_card();

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        self.network.register((node, shard), peer_tx).await?;
        let published = self
            .network
            .directory
            .write()
            .await
            .publish(node, region.clone(), card);
        if let Err(err) = published {
            self.network.peers.write().await.remove(&(node, shard));
            return Err(err.into());
        }

        let (command_tx, command_rx) = mpsc::channel(self.config.mailbox_capacity);
        let span = info_span!("replica", node = %node, shard = %shard);
        tokio::spawn(
            run_replica(state, peer_rx, command_rx, Arc::clone(&self.network)).instrument(span),
        );
        info!(node = %node, shard = %shard, region = %region, "replica started");

        Ok(NodeHandle::new(
            node,
            shard,
            region,
            card,
            command_tx,
            Arc::clone(&self.network),
        ))
    }
}
