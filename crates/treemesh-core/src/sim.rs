//! In-process mesh network simulation
//!
//! A shared [`SimChannel`] models the shared medium: every attached
//! [`SimRadio`] gets an inbox, unicast sends succeed only when the
//! destination is attached, linked, and up, and broadcast reaches every
//! linked neighbor. Everything is single-threaded and deterministic, so
//! whole-network scenarios run inside ordinary unit tests with
//! caller-controlled time.
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Instant;
//! use treemesh_core::frame::NodeAddress;
//! use treemesh_core::sim::{spawn_node, SimChannel};
//!
//! let channel = SimChannel::new();
//! let (mut master, master_sink) = spawn_node(&channel, 0x0000, Instant::now());
//! let (mut leaf, _leaf_sink) = spawn_node(&channel, 0x0002, Instant::now());
//!
//! let now = Instant::now();
//! leaf.poll(now);   // broadcasts a Join
//! master.poll(now); // replies with a Welcome
//! leaf.poll(now);   // adopts the master as parent
//! assert!(leaf.is_joined());
//! ```

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use tracing::trace;

use crate::config::{MeshConfig, RadioConfig};
use crate::error::MeshResult;
use crate::frame::{Frame, Header, NodeAddress, FRAME_LEN};
use crate::node::MeshNode;
use crate::routing::resolve_address;
use crate::traits::{EventSink, Radio, TransportAddress};

#[derive(Default)]
struct ChannelInner {
    /// Per-node inboxes, keyed by logical address
    inboxes: HashMap<NodeAddress, VecDeque<Frame>>,
    /// Explicit adjacency; empty means every pair can hear each other
    links: HashSet<(NodeAddress, NodeAddress)>,
    /// Nodes currently unreachable
    down: HashSet<NodeAddress>,
    /// Physical send attempts across the whole channel
    send_attempts: u64,
}

impl ChannelInner {
    fn linked(&self, a: NodeAddress, b: NodeAddress) -> bool {
        self.links.is_empty() || self.links.contains(&(a, b)) || self.links.contains(&(b, a))
    }

    fn reachable(&self, from: NodeAddress, to: NodeAddress) -> bool {
        self.inboxes.contains_key(&to) && !self.down.contains(&to) && self.linked(from, to)
    }
}

/// Shared medium connecting every [`SimRadio`] attached to it
#[derive(Clone, Default)]
pub struct SimChannel {
    inner: Rc<RefCell<ChannelInner>>,
}

impl SimChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a radio for the node at `address`
    pub fn attach(&self, address: NodeAddress) -> SimRadio {
        self.inner
            .borrow_mut()
            .inboxes
            .entry(address)
            .or_default();
        SimRadio {
            channel: self.inner.clone(),
            address,
            listening: false,
            writing_to: None,
        }
    }

    /// Restrict the topology: once any link is declared, only declared
    /// pairs can hear each other. Links are bidirectional.
    pub fn set_link(&self, a: NodeAddress, b: NodeAddress) {
        self.inner.borrow_mut().links.insert((a, b));
    }

    /// Make a node unreachable: unicasts to it fail, broadcast skips it
    pub fn set_down(&self, address: NodeAddress) {
        self.inner.borrow_mut().down.insert(address);
    }

    /// Bring a previously downed node back
    pub fn set_up(&self, address: NodeAddress) {
        self.inner.borrow_mut().down.remove(&address);
    }

    /// Deliver a frame straight into a node's inbox, bypassing the
    /// medium rules
    pub fn inject(&self, to: NodeAddress, frame: Frame) {
        if let Some(inbox) = self.inner.borrow_mut().inboxes.get_mut(&to) {
            inbox.push_back(frame);
        }
    }

    /// Copy of the frames currently waiting in a node's inbox, in
    /// arrival order
    pub fn snapshot(&self, address: NodeAddress) -> Vec<Frame> {
        self.inner
            .borrow()
            .inboxes
            .get(&address)
            .map(|inbox| inbox.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Frames currently waiting in a node's inbox
    pub fn pending(&self, address: NodeAddress) -> usize {
        self.inner
            .borrow()
            .inboxes
            .get(&address)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Physical send attempts made across the whole channel so far
    pub fn send_attempts(&self) -> u64 {
        self.inner.borrow().send_attempts
    }
}

/// Radio driver backed by a [`SimChannel`]
pub struct SimRadio {
    channel: Rc<RefCell<ChannelInner>>,
    address: NodeAddress,
    listening: bool,
    writing_to: Option<TransportAddress>,
}

impl SimRadio {
    /// Map a transport address back to the logical address it was
    /// derived from
    fn destination_of(transport: TransportAddress) -> NodeAddress {
        if transport == resolve_address(NodeAddress::BROADCAST) {
            NodeAddress::BROADCAST
        } else if transport == resolve_address(NodeAddress::MASTER) {
            NodeAddress::MASTER
        } else {
            NodeAddress::new((transport.raw() & 0xFFFF) as u16)
        }
    }
}

impl Radio for SimRadio {
    fn configure(&mut self, _config: &RadioConfig) -> MeshResult<()> {
        Ok(())
    }

    fn open_reading_address(&mut self, _slot: u8, _address: TransportAddress) -> MeshResult<()> {
        Ok(())
    }

    fn start_listening(&mut self) {
        self.listening = true;
    }

    fn stop_listening(&mut self) {
        self.listening = false;
    }

    fn poll_receivable(&mut self) -> Option<u8> {
        if !self.listening {
            return None;
        }
        let inner = self.channel.borrow();
        match inner.inboxes.get(&self.address) {
            Some(inbox) if !inbox.is_empty() => Some(0),
            _ => None,
        }
    }

    fn receive_frame(&mut self, buf: &mut [u8]) -> bool {
        let mut inner = self.channel.borrow_mut();
        let inbox = match inner.inboxes.get_mut(&self.address) {
            Some(inbox) => inbox,
            None => return true,
        };
        if let Some(frame) = inbox.pop_front() {
            let bytes = frame.to_bytes();
            let len = buf.len().min(FRAME_LEN);
            buf[..len].copy_from_slice(&bytes[..len]);
        }
        inbox.is_empty()
    }

    fn open_writing_address(&mut self, address: TransportAddress) {
        self.writing_to = Some(address);
    }

    fn send_frame(&mut self, buf: &[u8]) -> bool {
        let mut inner = self.channel.borrow_mut();
        inner.send_attempts += 1;
        let transport = match self.writing_to {
            Some(transport) => transport,
            None => return false,
        };
        let frame = match Frame::from_bytes(buf) {
            Ok(frame) => frame,
            Err(_) => return false,
        };
        let destination = Self::destination_of(transport);
        if destination.is_broadcast() {
            let hearers: Vec<NodeAddress> = inner
                .inboxes
                .keys()
                .copied()
                .filter(|addr| *addr != self.address)
                .filter(|addr| inner.reachable(self.address, *addr))
                .collect();
            trace!(from = %self.address, count = hearers.len(), "broadcast on sim channel");
            for addr in hearers {
                if let Some(inbox) = inner.inboxes.get_mut(&addr) {
                    inbox.push_back(frame);
                }
            }
            // Broadcast has no acknowledgment, so it always "succeeds"
            true
        } else {
            if !inner.reachable(self.address, destination) {
                return false;
            }
            if let Some(inbox) = inner.inboxes.get_mut(&destination) {
                inbox.push_back(frame);
            }
            true
        }
    }

    fn set_auto_ack(&mut self, _slot: u8, _enabled: bool) {}
}

#[derive(Default)]
struct SinkLog {
    failed: Vec<TransportAddress>,
    delivered: Vec<Header>,
}

/// Event sink that records every notification for later assertions.
/// Clones share the same log, so tests keep a handle after handing the
/// sink to a node.
#[derive(Clone, Default)]
pub struct RecordingSink {
    log: Rc<RefCell<SinkLog>>,
}

impl RecordingSink {
    /// Transport addresses reported via `on_send_failed`, in order
    pub fn failed(&self) -> Vec<TransportAddress> {
        self.log.borrow().failed.clone()
    }

    /// Headers delivered via `on_data_received`, in order
    pub fn delivered(&self) -> Vec<Header> {
        self.log.borrow().delivered.clone()
    }
}

impl EventSink for RecordingSink {
    fn on_send_failed(&mut self, address: TransportAddress) {
        self.log.borrow_mut().failed.push(address);
    }

    fn on_data_received(&mut self, header: &Header) {
        self.log.borrow_mut().delivered.push(*header);
    }
}

/// Bring up a node on the channel with default configuration and a
/// recording sink; returns the node and a handle to its sink log.
pub fn spawn_node(
    channel: &SimChannel,
    address: u16,
    now: Instant,
) -> (MeshNode<SimRadio, RecordingSink>, RecordingSink) {
    let address = NodeAddress::new(address);
    let config = MeshConfig::new(90, address);
    let sink = RecordingSink::default();
    let node = MeshNode::new(config, channel.attach(address), sink.clone(), now)
        .unwrap_or_else(|err| panic!("sim node bring-up cannot fail: {err}"));
    (node, sink)
}
