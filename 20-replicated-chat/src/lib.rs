//! Replicated multi-user messaging store.
//!
//! A fixed cluster of nodes keeps identical copies of an accounts table and a
//! messages table. One node at a time (the primary) applies every operation
//! and pushes full snapshots to the others; any node accepts client requests
//! and forwards them to the primary. When a node stops answering, each peer
//! that notices marks it down locally and the next-lowest index takes over.
//!
//! # Architecture
//!
//! - **Client threads**: one per client connection, see [`server`]
//! - **Peer reader threads**: one per inbound command or sync stream, see [`store`]
//! - **Callers**: forward over their own outbound command streams while holding
//!   the store lock
//!
//! All threads share one [`store::ReplicatedStore`] per node. Mesh formation
//! uses crossbeam channels to collect the peer streams.
//!
//! # Modules
//!
//! - [`codec`]: self-delimiting binary encoding
//! - [`schema`]: wire records and opcodes
//! - [`frame`]: length-prefixed framing on streams
//! - [`config`]: cluster layout and timeouts
//! - [`cluster`]: full-mesh peer connections
//! - [`liveness`]: down-node view and primary rule
//! - [`tables`]: in-memory accounts and messages
//! - [`persistence`]: per-node files
//! - [`store`]: primary-or-forward execution and snapshot sync
//! - [`events`]: client operations
//! - [`server`]: client TCP server
//! - [`client`]: blocking client
//! - [`node`]: boot sequence

pub mod client;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod events;
pub mod frame;
pub mod liveness;
pub mod node;
pub mod persistence;
pub mod schema;
pub mod server;
pub mod store;
pub mod tables;
