//! Replicated key-value store with tunable write and read concerns.
//!
//! A cluster of nodes replicates writes through a leader-sequenced log.
//! Clients choose, per operation, how durable a write must be before it is
//! acknowledged (one node, a majority, or every member) and how fresh a read
//! must be (local state or majority-committed state), optionally pinning
//! reads to the leader or threading a causal token through a session so
//! reads follow the session's own writes across nodes.
//!
//! # Architecture
//!
//! Each node runs a small set of tokio tasks around a single owner of all
//! node state:
//!
//! - **Worker task**: owns the [`node::ReplicaNode`] state machine, the log,
//!   and the applied store; consumes client requests, peer messages, and
//!   timer expirations from channels
//! - **Listener task**: accepts peer connections and forwards decoded frames
//!   to the worker
//! - **Link tasks**: one per peer, each draining a queue of outbound
//!   messages into short-lived connections
//!
//! The state machine itself is synchronous and lock-free; every await point
//! lives in the shell around it. Client calls carry a oneshot channel for
//! the reply, so an operation waiting on replication or causality suspends
//! only its caller, never the worker.
//!
//! # Modules
//!
//! - [`node`]: consensus state machine, log replication, reads
//! - [`log`]: ordered entry log with commit watermark and persistence hook
//! - [`runtime`]: worker loop, networking, [`runtime::NodeHandle`]
//! - [`view`]: per-node picture of membership, roles, and liveness
//! - [`session`]: client-side causal sessions
//! - [`store`]: applied key-value state
//! - [`message`]: peer wire protocol and framing
//! - [`protocol`]: console command parsing
//! - [`config`]: node identity and protocol timing
//! - [`types`]: shared identifiers, concern knobs, operation results
//! - [`error`]: client-visible and log-level error types

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod store;
pub mod types;
pub mod view;
