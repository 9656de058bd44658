#![allow(dead_code)]

//! Deterministic simulation harness for the backfill protocol.
//!
//! Replicas exchange messages over per-node-pair links. Each link is FIFO,
//! matching the in-order delivery the protocol assumes, while the harness
//! interleaves links at random from a seeded RNG. Messages for nodes that
//! host no replica (readers waiting on `Synchronize`) land in an inbox.
//!
//! ```text
//!   submit(event) ──► ReplicaState::process ──► outgoing messages
//!                                                   │
//!            ┌──────────── links[(from, to)] ◄──────┘
//!            ▼
//!   step(): pick a random non-empty link, deliver its head
//! ```

use std::collections::{BTreeMap, VecDeque};

use ebb_types::{Address, MailboxId, NodeId, ShardId};
use rand::prelude::*;
use rand::rngs::SmallRng;

use crate::history::Version;
use crate::message::{Message, MessagePayload};
use crate::replica::{ReplicaEvent, ReplicaOutput, ReplicaState, SessionOutcome, StalledStream};
use crate::storage::MemoryStorage;

/// Node id used for readers and other callers outside the cluster.
pub const CLIENT: NodeId = NodeId::new(1000);

/// Upper bound on deliveries in one [`BackfillSimulation::run`].
const MAX_STEPS: usize = 100_000;

/// Returns a client address for collecting replies.
pub fn client_addr(mailbox: u64) -> Address {
    Address::new(CLIENT, ShardId::new(0), MailboxId::new(mailbox))
}

type Link = (NodeId, NodeId);

pub struct BackfillSimulation {
    rng: SmallRng,
    replicas: BTreeMap<NodeId, ReplicaState>,
    links: BTreeMap<Link, VecDeque<Message>>,
    /// Every message delivered to a replica, in delivery order.
    delivered: Vec<Message>,
    /// Messages addressed to nodes outside the cluster.
    inbox: Vec<Message>,
    outcomes: Vec<(NodeId, SessionOutcome)>,
    written: Vec<(NodeId, Version)>,
    stalled: Vec<(NodeId, StalledStream)>,
}

impl BackfillSimulation {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            replicas: BTreeMap::new(),
            links: BTreeMap::new(),
            delivered: Vec::new(),
            inbox: Vec::new(),
            outcomes: Vec::new(),
            written: Vec::new(),
            stalled: Vec::new(),
        }
    }

    pub fn add_replica(&mut self, replica: ReplicaState) {
        self.replicas.insert(replica.node(), replica);
    }

    pub fn replica(&self, node: NodeId) -> &ReplicaState {
        &self.replicas[&node]
    }

    pub fn storage_mut(&mut self, node: NodeId) -> &mut MemoryStorage {
        self.replicas
            .get_mut(&node)
            .expect("unknown replica")
            .storage_mut()
    }

    /// Processes a local event on `node` immediately.
    pub fn submit(&mut self, node: NodeId, event: ReplicaEvent) {
        let replica = self.replicas.remove(&node).expect("unknown replica");
        let (replica, out) = replica.process(event);
        self.replicas.insert(node, replica);
        self.dispatch(node, out);
    }

    /// Queues a message from outside the cluster.
    pub fn send(&mut self, message: Message) {
        self.enqueue(message);
    }

    /// Delivers the head of one randomly chosen link. Returns false once
    /// every link is empty.
    pub fn step(&mut self) -> bool {
        let ready: Vec<Link> = self
            .links
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(link, _)| *link)
            .collect();
        if ready.is_empty() {
            return false;
        }
        let link = ready[self.rng.gen_range(0..ready.len())];
        let Some(message) = self.links.get_mut(&link).and_then(VecDeque::pop_front) else {
            return false;
        };

        let node = message.to.node;
        self.delivered.push(message.clone());
        self.submit(node, ReplicaEvent::Message(message));
        true
    }

    /// Delivers at most `steps` messages.
    pub fn run_steps(&mut self, steps: usize) {
        for _ in 0..steps {
            if !self.step() {
                break;
            }
        }
    }

    /// Delivers messages until the network is quiet.
    pub fn run(&mut self) {
        for _ in 0..MAX_STEPS {
            if !self.step() {
                return;
            }
        }
        panic!("simulation did not quiesce within {MAX_STEPS} steps");
    }

    /// Gives a test direct access to one link's queue.
    pub fn tamper(&mut self, from: NodeId, to: NodeId, f: impl FnOnce(&mut VecDeque<Message>)) {
        f(self.links.entry((from, to)).or_default());
    }

    pub fn in_flight(&self) -> usize {
        self.links.values().map(VecDeque::len).sum()
    }

    pub fn delivered(&self) -> &[Message] {
        &self.delivered
    }

    pub fn inbox(&self) -> &[Message] {
        &self.inbox
    }

    pub fn outcomes(&self) -> &[(NodeId, SessionOutcome)] {
        &self.outcomes
    }

    pub fn written(&self) -> &[(NodeId, Version)] {
        &self.written
    }

    /// Live writes each replica dropped, in order.
    pub fn stalled(&self) -> &[(NodeId, StalledStream)] {
        &self.stalled
    }

    /// Number of `SynchronizeAck`s that reached clients.
    pub fn synchronize_acks(&self) -> usize {
        self.inbox
            .iter()
            .filter(|m| matches!(m.payload, MessagePayload::SynchronizeAck(_)))
            .count()
    }

    fn dispatch(&mut self, node: NodeId, out: ReplicaOutput) {
        for outcome in out.outcomes {
            self.outcomes.push((node, outcome));
        }
        if let Some(version) = out.written {
            self.written.push((node, version));
        }
        for stalled in out.stalled {
            self.stalled.push((node, stalled));
        }
        for message in out.messages {
            self.enqueue(message);
        }
    }

    fn enqueue(&mut self, message: Message) {
        if self.replicas.contains_key(&message.to.node) {
            self.links
                .entry((message.from.node, message.to.node))
                .or_default()
                .push_back(message);
        } else {
            self.inbox.push(message);
        }
    }
}
