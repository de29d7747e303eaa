//! # Tree Mesh Network Layer
//!
//! This crate implements a tree-topology mesh network layer for small
//! fixed-size radio frames: nodes self-organize into a tree rooted at a
//! single master (the data sink), pick parents by hop-count weight, and
//! relay application data hop by hop toward the root.
//!
//! ## Overview
//!
//! Each node runs the same cooperative, single-threaded cycle:
//!
//! - **Join protocol**: a joining node broadcasts a Join, collects
//!   unicast Welcome replies, and adopts the neighbor whose weight plus
//!   one beats its own; improvements propagate via WeightUpdate
//!   broadcasts.
//! - **Routing table**: a bounded neighbor table that always selects a
//!   local hop-count minimum; losing the parent falls back to the next
//!   best candidate or forces a rejoin.
//! - **Frame queues**: bounded send (FIFO) and receive (newest-first)
//!   buffers that fail closed, decoupling radio I/O from protocol work.
//! - **Dispatch & forwarding**: relayed frames are re-addressed one hop
//!   closer to the master each hop, retagged Data at the last hop.
//!
//! ## Message Flow
//!
//! ```text
//! join:    leaf --J(broadcast)--> all; parent --W(unicast)--> leaf
//! data:    leaf --F--> relay --F--> relay --D--> master
//! improve: node --U(broadcast)--> neighbors
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Instant;
//! use treemesh_core::config::MeshConfig;
//! use treemesh_core::frame::NodeAddress;
//! use treemesh_core::node::MeshNode;
//!
//! let config = MeshConfig::new(90, NodeAddress::new(0x0002));
//! let mut node = MeshNode::new(config, radio, sink, Instant::now())?;
//! loop {
//!     node.poll(Instant::now());
//!     if node.is_joined() {
//!         node.send_data(b"sensor reading")?;
//!     }
//!     // ... application cadence ...
//! }
//! ```

pub mod config;
pub mod error;
pub mod frame;
pub mod node;
pub mod queue;
pub mod routing;
pub mod sim;
pub mod state;
pub mod traits;

pub use config::{MeshConfig, RadioConfig};
pub use error::{MeshError, MeshResult};
pub use frame::{Frame, Header, MessageType, NodeAddress, NodeIdentity, FRAME_LEN};
pub use node::MeshNode;
pub use routing::{resolve_address, RoutingTable, MAX_NEAR_NODE};
pub use state::NodeState;
pub use traits::{EventSink, MeshStats, Radio, TransportAddress};
