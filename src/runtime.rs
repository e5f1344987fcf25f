//! Async shell around [`ReplicaNode`]: timers, networking, and client waits.
//!
//! [`spawn_node`] binds the node's listener, starts one link task per peer,
//! and hands the node core to a worker task. The worker is the only owner of
//! the node state; everything else talks to it over channels. Client calls
//! through [`NodeHandle`] carry a oneshot for the reply, so a write waiting
//! for its concern or a read waiting for causality suspends only that
//! caller, never the worker loop.
//!
//! Peer traffic is connect-per-message: each outbound message opens a TCP
//! connection, writes one length-prefixed frame, and drops the connection.
//! Failures are logged and forgotten; heartbeats retransmit whatever a peer
//! missed.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, TimingConfig};
use crate::error::StoreError;
use crate::message::{read_frame, write_frame, Message};
use crate::node::ReplicaNode;
use crate::types::{
    CausalToken, LogIndex, NodeId, ReadConcern, ReadOutcome, ReadPreference, Role, Term, WriteAck,
    WriteConcern,
};
use crate::view::MemberSummary;

/// Point-in-time description of one node, as returned by
/// [`NodeHandle::status`].
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_index: LogIndex,
    pub members: Vec<MemberSummary>,
    pub store: BTreeMap<String, String>,
}

/// Cheap cloneable handle to a spawned node.
#[derive(Clone)]
pub struct NodeHandle {
    request_tx: mpsc::UnboundedSender<ClientRequest>,
}

impl NodeHandle {
    /// Proposes a write and waits until the concern is satisfied.
    pub async fn write(
        &self,
        key: String,
        value: String,
        concern: WriteConcern,
        causal_token: Option<CausalToken>,
    ) -> Result<WriteAck, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::Write {
                key,
                value,
                concern,
                causal_token,
                respond_to: tx,
            })
            .map_err(|_| StoreError::NodeShutdown)?;
        rx.await.map_err(|_| StoreError::NodeShutdown)?
    }

    /// Reads a key under the given concern and preference, waiting for the
    /// causal token to be satisfied first when one is passed.
    pub async fn read(
        &self,
        key: String,
        concern: ReadConcern,
        preference: ReadPreference,
        causal_token: Option<CausalToken>,
    ) -> Result<ReadOutcome, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::Read {
                key,
                concern,
                preference,
                causal_token,
                respond_to: tx,
            })
            .map_err(|_| StoreError::NodeShutdown)?;
        rx.await.map_err(|_| StoreError::NodeShutdown)?
    }

    /// Snapshot of role, term, membership, and applied data.
    pub async fn status(&self) -> Result<NodeStatus, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::Status { respond_to: tx })
            .map_err(|_| StoreError::NodeShutdown)?;
        rx.await.map_err(|_| StoreError::NodeShutdown)
    }

    /// Forces an immediate election on this node.
    pub async fn campaign(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::Campaign { respond_to: tx })
            .map_err(|_| StoreError::NodeShutdown)?;
        rx.await.map_err(|_| StoreError::NodeShutdown)
    }

    /// Stops the worker. Pending operations fail with [`StoreError::NodeShutdown`].
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::Shutdown { respond_to: tx })
            .map_err(|_| StoreError::NodeShutdown)?;
        rx.await.map_err(|_| StoreError::NodeShutdown)
    }
}

enum ClientRequest {
    Write {
        key: String,
        value: String,
        concern: WriteConcern,
        causal_token: Option<CausalToken>,
        respond_to: oneshot::Sender<Result<WriteAck, StoreError>>,
    },
    Read {
        key: String,
        concern: ReadConcern,
        preference: ReadPreference,
        causal_token: Option<CausalToken>,
        respond_to: oneshot::Sender<Result<ReadOutcome, StoreError>>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Campaign {
        respond_to: oneshot::Sender<()>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// A write waiting for its concern. `term` pins the leadership that accepted
/// it; if the node's term or role moves on, the write fails instead of
/// hanging.
struct PendingWrite {
    index: LogIndex,
    term: Term,
    concern: WriteConcern,
    deadline: Instant,
    respond_to: oneshot::Sender<Result<WriteAck, StoreError>>,
}

/// A read that cannot be answered yet: its causal floor is ahead of the log,
/// or it needs the leader's commit watermark first.
struct PendingRead {
    key: String,
    concern: ReadConcern,
    preference: ReadPreference,
    causal_floor: Option<CausalToken>,
    /// Leader commit watermark learned from a `CommitInfo` reply; a follower
    /// majority read resolves once the local watermark reaches it.
    wait_commit: Option<LogIndex>,
    /// Term the commit probe went out in. A later term deposed that leader,
    /// so the probe and any watermark it brought back are discarded.
    probed_in: Option<Term>,
    deadline: Instant,
    respond_to: oneshot::Sender<Result<ReadOutcome, StoreError>>,
}

/// Starts a node: binds its listener, opens links to every peer, and spawns
/// the worker that owns the [`ReplicaNode`].
pub async fn spawn_node(config: NodeConfig) -> anyhow::Result<NodeHandle> {
    if !config.peers.contains_key(&config.id) {
        anyhow::bail!("node {} missing from its own peer map", config.id);
    }
    let mut members: Vec<NodeId> = config.peers.keys().copied().collect();
    members.sort_unstable();

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    let (request_tx, client_rx) = mpsc::unbounded_channel();
    let (network_tx, network_rx) = mpsc::unbounded_channel();
    let listener_task = tokio::spawn(run_listener(listener, network_tx));

    let mut links = HashMap::new();
    for (&peer, addr) in &config.peers {
        if peer != config.id {
            links.insert(peer, spawn_link(peer, addr.clone()));
        }
    }

    let node = ReplicaNode::new(config.id, &members, config.timing.offline_after);
    let worker = Worker {
        node,
        timing: config.timing.clone(),
        client_rx,
        network_rx,
        links,
        pending_writes: Vec::new(),
        pending_reads: Vec::new(),
        election_deadline: Instant::now() + config.timing.random_election_timeout(),
        last_role: Role::Follower,
        listener_task,
    };
    tokio::spawn(worker.run());

    info!(node = config.id, addr = %config.listen_addr, "node listening");
    Ok(NodeHandle { request_tx })
}

struct Worker {
    node: ReplicaNode,
    timing: TimingConfig,
    client_rx: mpsc::UnboundedReceiver<ClientRequest>,
    network_rx: mpsc::UnboundedReceiver<Message>,
    links: HashMap<NodeId, mpsc::UnboundedSender<Message>>,
    pending_writes: Vec<PendingWrite>,
    pending_reads: Vec<PendingRead>,
    election_deadline: Instant,
    last_role: Role,
    listener_task: JoinHandle<()>,
}

impl Worker {
    async fn run(mut self) {
        let mut heartbeat = time::interval(self.timing.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let pending_deadline = self.next_pending_deadline();
            tokio::select! {
                request = self.client_rx.recv() => {
                    match request {
                        Some(request) => {
                            if !self.handle_client_request(request) {
                                break;
                            }
                        }
                        // Every handle dropped; nothing can reach us again.
                        None => break,
                    }
                }
                Some(msg) = self.network_rx.recv() => {
                    self.node.handle_message(msg, Instant::now());
                }
                _ = heartbeat.tick() => {
                    self.node.heartbeat(Instant::now());
                }
                _ = time::sleep_until(time::Instant::from_std(self.election_deadline)) => {
                    if self.node.role() == Role::Leader {
                        // Leaders do not campaign against themselves.
                        self.election_deadline = far_future();
                    } else {
                        self.node.start_election(Instant::now());
                    }
                }
                // Wakes the loop when the earliest pending operation expires;
                // the sweep below resolves it.
                _ = time::sleep_until(time::Instant::from_std(pending_deadline)) => {}
            }
            self.drain_effects();
            self.sweep_pending(Instant::now());
            self.observe_role();
        }
        self.finish();
    }

    /// Returns `false` when the worker should stop.
    fn handle_client_request(&mut self, request: ClientRequest) -> bool {
        let now = Instant::now();
        match request {
            ClientRequest::Write {
                key,
                value,
                concern,
                causal_token,
                respond_to,
            } => match self.node.propose(key, value, causal_token) {
                Ok(index) => {
                    if concern == WriteConcern::One {
                        // Appended and persisted locally, which is all One asks.
                        let _ = respond_to.send(Ok(WriteAck {
                            index,
                            token: index,
                        }));
                    } else {
                        self.pending_writes.push(PendingWrite {
                            index,
                            term: self.node.term(),
                            concern,
                            deadline: now + self.timing.operation_deadline,
                            respond_to,
                        });
                    }
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            ClientRequest::Read {
                key,
                concern,
                preference,
                causal_token,
                respond_to,
            } => {
                let mut read = PendingRead {
                    key,
                    concern,
                    preference,
                    causal_floor: causal_token,
                    wait_commit: None,
                    probed_in: None,
                    deadline: now + self.timing.operation_deadline,
                    respond_to,
                };
                match Self::read_decision(&self.node, &read) {
                    Some(result) => {
                        let _ = read.respond_to.send(result);
                    }
                    None => {
                        self.maybe_probe(&mut read);
                        self.pending_reads.push(read);
                    }
                }
            }
            ClientRequest::Status { respond_to } => {
                let _ = respond_to.send(self.status(now));
            }
            ClientRequest::Campaign { respond_to } => {
                self.node.start_election(now);
                let _ = respond_to.send(());
            }
            ClientRequest::Shutdown { respond_to } => {
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    fn next_pending_deadline(&self) -> Instant {
        self.pending_writes
            .iter()
            .map(|w| w.deadline)
            .chain(self.pending_reads.iter().map(|r| r.deadline))
            .min()
            .unwrap_or_else(far_future)
    }

    fn status(&self, now: Instant) -> NodeStatus {
        NodeStatus {
            id: self.node.id(),
            role: self.node.role(),
            term: self.node.term(),
            leader: self.node.leader_hint(),
            commit_index: self.node.commit_index(),
            last_index: self.node.last_index(),
            members: self.node.member_summaries(now),
            store: self.node.store_snapshot(),
        }
    }

    fn drain_effects(&mut self) {
        let Some(bundle) = self.node.poll_effects() else {
            return;
        };
        for out in bundle.outbound {
            match self.links.get(&out.to) {
                Some(link) => {
                    if link.send(out.message).is_err() {
                        debug!(peer = out.to, "link task gone");
                    }
                }
                None => warn!(peer = out.to, "no link for outbound message"),
            }
        }
        for entry in &bundle.applied {
            debug!(index = entry.index, key = %entry.key, "applied entry");
        }
        for watermark in bundle.leader_commits {
            for read in &mut self.pending_reads {
                if read.probed_in.is_some() && read.wait_commit.is_none() {
                    read.wait_commit = Some(watermark);
                }
            }
        }
        if bundle.reset_election_timer {
            self.election_deadline = if self.node.role() == Role::Leader {
                far_future()
            } else {
                Instant::now() + self.timing.random_election_timeout()
            };
        }
    }

    /// Re-checks every suspended operation against the node state.
    fn sweep_pending(&mut self, now: Instant) {
        // A term change deposes the leader a commit probe went to; forget
        // the probe so the pass below asks the new leader instead.
        let term = self.node.term();
        for read in &mut self.pending_reads {
            if read.probed_in.is_some_and(|t| t != term) {
                read.probed_in = None;
                read.wait_commit = None;
            }
        }

        let writes = std::mem::take(&mut self.pending_writes);
        for write in writes {
            if self
                .node
                .write_concern_met(write.index, write.term, write.concern)
            {
                let _ = write.respond_to.send(Ok(WriteAck {
                    index: write.index,
                    token: write.index,
                }));
            } else if self.node.term() != write.term || self.node.role() != Role::Leader {
                let _ = write.respond_to.send(Err(StoreError::LeadershipLost));
            } else if now >= write.deadline {
                let _ = write.respond_to.send(Err(StoreError::QuorumTimeout));
            } else {
                self.pending_writes.push(write);
            }
        }

        let reads = std::mem::take(&mut self.pending_reads);
        for mut read in reads {
            match Self::read_decision(&self.node, &read) {
                Some(result) => {
                    let _ = read.respond_to.send(result);
                }
                None if now >= read.deadline => {
                    let err = Self::timeout_error(&self.node, &read);
                    let _ = read.respond_to.send(Err(err));
                }
                None => {
                    self.maybe_probe(&mut read);
                    self.pending_reads.push(read);
                }
            }
        }
    }

    /// Answers a read if the node can already satisfy it, `None` to keep
    /// waiting.
    fn read_decision(
        node: &ReplicaNode,
        read: &PendingRead,
    ) -> Option<Result<ReadOutcome, StoreError>> {
        if read.preference == ReadPreference::Leader && node.role() != Role::Leader {
            return Some(Err(StoreError::NotLeader {
                hint: node.leader_hint(),
            }));
        }
        let floor = read.causal_floor.unwrap_or(0);
        match read.concern {
            ReadConcern::Local => {
                if node.last_index() >= floor {
                    Some(Ok(node.read_local(&read.key)))
                } else {
                    None
                }
            }
            ReadConcern::Majority => {
                let target = if node.role() == Role::Leader {
                    // The leader's own watermark is the majority watermark.
                    floor
                } else {
                    read.wait_commit?.max(floor)
                };
                if node.commit_index() >= target {
                    Some(Ok(node.read_committed(&read.key)))
                } else {
                    None
                }
            }
        }
    }

    /// Sends one `CommitQuery` to the leader for a follower majority read.
    fn maybe_probe(&mut self, read: &mut PendingRead) {
        if read.probed_in.is_some()
            || read.concern != ReadConcern::Majority
            || self.node.role() == Role::Leader
        {
            return;
        }
        let Some(leader) = self.node.leader_hint().filter(|&l| l != self.node.id()) else {
            return;
        };
        if let Some(link) = self.links.get(&leader) {
            let term = self.node.term();
            let query = Message::CommitQuery {
                term,
                from: self.node.id(),
            };
            if link.send(query).is_ok() {
                read.probed_in = Some(term);
            }
        }
    }

    /// Picks the error for a read that ran out its deadline.
    fn timeout_error(node: &ReplicaNode, read: &PendingRead) -> StoreError {
        let floor = read.causal_floor.unwrap_or(0);
        match read.concern {
            // A local read only ever waits on its causal floor.
            ReadConcern::Local => StoreError::CausalityNotSatisfied { token: floor },
            ReadConcern::Majority => {
                let caught_up = match read.wait_commit {
                    Some(watermark) => node.commit_index() >= watermark,
                    None => node.role() == Role::Leader,
                };
                if caught_up && floor > node.commit_index() {
                    StoreError::CausalityNotSatisfied { token: floor }
                } else {
                    StoreError::QuorumTimeout
                }
            }
        }
    }

    fn observe_role(&mut self) {
        let role = self.node.role();
        if role != self.last_role {
            info!(
                node = self.node.id(),
                term = self.node.term(),
                from = %self.last_role,
                to = %role,
                "role changed"
            );
            self.last_role = role;
        }
    }

    fn finish(mut self) {
        self.listener_task.abort();
        for write in self.pending_writes.drain(..) {
            let _ = write.respond_to.send(Err(StoreError::NodeShutdown));
        }
        for read in self.pending_reads.drain(..) {
            let _ = read.respond_to.send(Err(StoreError::NodeShutdown));
        }
        info!(node = self.node.id(), "node stopped");
    }
}

/// Accepts peer connections; each carries exactly one frame.
async fn run_listener(listener: TcpListener, network_tx: mpsc::UnboundedSender<Message>) {
    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let tx = network_tx.clone();
                tokio::spawn(async move {
                    match read_frame::<_, Message>(&mut stream).await {
                        Ok(Some(msg)) => {
                            let _ = tx.send(msg);
                        }
                        Ok(None) => {}
                        Err(err) => debug!(error = %err, "bad frame from peer"),
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// One task per peer: connect, write one frame, drop. Unreachable peers cost
/// a log line; heartbeats carry the retry.
fn spawn_link(peer: NodeId, addr: String) -> mpsc::UnboundedSender<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match TcpStream::connect(&addr).await {
                Ok(mut stream) => {
                    if let Err(err) = write_frame(&mut stream, &msg).await {
                        debug!(peer, error = %err, "send failed");
                    }
                }
                Err(err) => debug!(peer, error = %err, "peer unreachable"),
            }
        }
    });
    tx
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}
