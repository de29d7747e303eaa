//! Mesh node: dispatch, forwarding, and the maintenance cycle
//!
//! [`MeshNode`] owns every piece of per-node state (routing table, state
//! machine, both frame queues, counters) and glues them to the two
//! external collaborators, the radio driver and the application sink.
//! All processing happens inside [`MeshNode::poll`], one cooperative
//! cycle at a time, driven by the embedding application's loop: drain the
//! radio, tick the join state machine, dispatch staged application
//! frames, flush the send queue. Nothing runs between cycles and nothing
//! preempts one.

use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::frame::{Frame, Header, MessageType, NodeAddress, NodeIdentity, FRAME_LEN};
use crate::queue::{ReceiveStack, SendQueue};
use crate::routing::{resolve_address, EntryStatus, RoutingTable};
use crate::state::{NodeState, StateMachine, TickAction};
use crate::traits::{EventSink, MeshStats, Radio, TransportAddress};

/// Reading pipe carrying broadcast traffic; doubles as the write pipe,
/// so its hardware acknowledgment toggles per destination
const PIPE_BROADCAST: u8 = 0;

/// Reading pipe carrying unicast traffic addressed to this node
const PIPE_UNICAST: u8 = 1;

/// One node of the mesh network layer.
///
/// Generic over the radio driver and the application notification sink so
/// the same logic runs against hardware or the in-process simulation.
pub struct MeshNode<R: Radio, S: EventSink> {
    config: MeshConfig,
    radio: R,
    sink: S,
    table: RoutingTable,
    machine: StateMachine,
    send_queue: SendQueue,
    receive_stack: ReceiveStack,
    stats: MeshStats,
    /// Local monotonic reference for network time
    epoch: Instant,
    /// Correction from the last adopted Welcome, in milliseconds
    clock_offset_ms: i64,
}

impl<R: Radio, S: EventSink> MeshNode<R, S> {
    /// Bring up a node: configure the radio, open the unicast and
    /// broadcast reading pipes, and start listening.
    pub fn new(config: MeshConfig, mut radio: R, sink: S, now: Instant) -> MeshResult<Self> {
        radio.configure(&config.radio_config())?;
        radio.open_reading_address(PIPE_BROADCAST, resolve_address(NodeAddress::BROADCAST))?;
        radio.set_auto_ack(PIPE_BROADCAST, false);
        radio.open_reading_address(PIPE_UNICAST, resolve_address(config.address))?;
        radio.set_auto_ack(PIPE_UNICAST, true);
        radio.start_listening();

        let table = RoutingTable::new(config.address);
        let machine = StateMachine::new(
            table.is_master(),
            config.welcome_wait,
            config.join_refresh,
            now,
        );
        info!(
            address = %config.address,
            master = table.is_master(),
            channel = config.channel,
            "mesh node up"
        );
        Ok(Self {
            send_queue: SendQueue::new(config.send_depth),
            receive_stack: ReceiveStack::new(config.receive_depth),
            config,
            radio,
            sink,
            table,
            machine,
            stats: MeshStats::default(),
            epoch: now,
            clock_offset_ms: 0,
        })
    }

    /// This node's identity and current weight
    pub fn identity(&self) -> NodeIdentity {
        self.table.identity()
    }

    pub fn state(&self) -> NodeState {
        self.machine.state()
    }

    pub fn is_joined(&self) -> bool {
        self.table.is_joined()
    }

    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Milliseconds offset between local time and the network time
    /// adopted from the last accepted Welcome
    pub fn clock_offset_ms(&self) -> i64 {
        self.clock_offset_ms
    }

    /// Network time in milliseconds at `now`
    pub fn network_time_ms(&self, now: Instant) -> u64 {
        let local = now.saturating_duration_since(self.epoch).as_millis() as i64;
        local.saturating_add(self.clock_offset_ms).max(0) as u64
    }

    /// Run one maintenance/processing cycle to completion.
    ///
    /// Drains the radio (handling control traffic in arrival order and
    /// staging application frames), ticks the join state machine,
    /// dispatches the staged frames newest-first, and flushes the send
    /// queue.
    pub fn poll(&mut self, now: Instant) {
        self.listen_radio(now);

        match self.machine.tick(self.table.is_joined(), now) {
            TickAction::Idle => {}
            TickAction::BeginJoin => self.begin_join(),
            TickAction::AnnounceWeight => self.announce_weight(),
        }

        while let Some(frame) = self.receive_stack.pop() {
            self.dispatch(frame, now);
        }

        self.flush_send_queue(now);
    }

    /// Queue an application payload for delivery to the master.
    ///
    /// Fails with [`MeshError::NotJoined`] when no route exists. The
    /// master delivers to its own sink without touching the radio.
    pub fn send_data(&mut self, payload: &[u8]) -> MeshResult<()> {
        if !self.table.is_joined() {
            return Err(MeshError::NotJoined);
        }
        let me = self.table.identity();
        if self.table.is_master() {
            let header = Header::new(me.ip, me.ip, MessageType::Data, NodeIdentity::master());
            self.sink.on_data_received(&header);
            self.stats.data_delivered += 1;
            return Ok(());
        }
        let next = self.table.best_next_hop();
        let kind = if next.ip.is_master() {
            MessageType::Data
        } else {
            MessageType::Forward
        };
        // source carries the originator and a forward hop count
        let origin = NodeIdentity { ip: me.ip, weight: 0 };
        let header = Header::new(me.ip, next.ip, kind, origin);
        self.enqueue_send(Frame::with_payload(header, payload))
    }

    /// Drain every frame the radio currently holds, within the listen
    /// time budget.
    ///
    /// Only frames addressed to this node or to the broadcast address
    /// survive the drain; overheard unicast traffic for another node is
    /// dropped here. Control frames (Join, Welcome, WeightUpdate) are
    /// handled inline, in arrival order: a Join processed after a newer
    /// Welcome from the same neighbor would read as a parent reset.
    /// Application frames are staged on the receive stack, which is
    /// consumed newest-first.
    fn listen_radio(&mut self, now: Instant) {
        let entry = Instant::now();
        while entry.elapsed() < self.config.listen_budget {
            if self.radio.poll_receivable().is_none() {
                break;
            }
            let mut buf = [0u8; FRAME_LEN];
            self.radio.receive_frame(&mut buf);
            self.stats.frames_rx += 1;
            let frame = match Frame::from_bytes(&buf) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%err, "discarding undecodable frame");
                    continue;
                }
            };
            let to = frame.header.to;
            if to != self.table.identity().ip && !to.is_broadcast() {
                trace!(header = %frame.header, "overheard traffic for another node, dropping");
                continue;
            }
            match frame.header.kind {
                MessageType::Data | MessageType::Forward => {
                    if self.receive_stack.push(frame).is_err() {
                        self.stats.queue_drops += 1;
                    }
                }
                _ => self.dispatch(frame, now),
            }
        }
    }

    /// Total dispatch: every message type has a handler; unknown tags are
    /// drained with a diagnostic.
    fn dispatch(&mut self, frame: Frame, now: Instant) {
        let me = self.table.identity().ip;
        if frame.header.from == me {
            // Reflected own transmission, nothing to do
            return;
        }
        trace!(header = %frame.header, "dispatch");
        self.table.on_frame_from(frame.header.from, now);
        match frame.header.kind {
            MessageType::Join => self.handle_join(frame, now),
            MessageType::Welcome => self.handle_welcome(frame, now),
            MessageType::Data => self.handle_data(frame),
            MessageType::Forward => self.handle_forward(frame),
            MessageType::WeightUpdate => self.handle_weight_update(frame, now),
            MessageType::Unknown(tag) => {
                warn!(tag, header = %frame.header, "unknown message type, dropping");
                self.stats.unknown_dropped += 1;
            }
        }
    }

    /// A neighbor is looking for a parent.
    ///
    /// Loop guard: a Join from our own selected parent means the parent
    /// reset, so our route through it is stale and must be dropped.
    /// Otherwise, if we have a route ourselves, reply with a unicast
    /// Welcome carrying our identity and network time.
    fn handle_join(&mut self, frame: Frame, now: Instant) {
        let sender = frame.header.source;
        if self.table.is_joined() {
            if !self.table.is_master() && frame.header.from == self.table.best_next_hop().ip {
                info!(parent = %frame.header.from, "parent rejoined, dropping own route");
                self.table.clear();
                self.machine.route_lost(now);
                return;
            }
            self.table.add_neighbor(sender, EntryStatus::SentWelcome, now);
            self.send_welcome(sender.ip, now);
        } else {
            // Sighting only; an unjoined node cannot vouch for a route
            self.table.add_neighbor(sender, EntryStatus::GotJoin, now);
        }
    }

    /// A Welcome reply: feed the candidate to the table; adopting it also
    /// adopts the replier's network time.
    fn handle_welcome(&mut self, frame: Frame, now: Instant) {
        let sender = frame.header.source;
        if self.table.add_neighbor(sender, EntryStatus::GotWelcome, now) {
            let local = now.saturating_duration_since(self.epoch).as_millis() as i64;
            self.clock_offset_ms = frame.time_ms() as i64 - local;
            debug!(
                parent = %sender.ip,
                weight = self.table.identity().weight,
                offset_ms = self.clock_offset_ms,
                "route improved via welcome"
            );
            self.machine.route_improved(now);
        }
    }

    /// Application data that terminates at this node
    fn handle_data(&mut self, frame: Frame) {
        if frame.header.source.ip == self.table.identity().ip {
            // Self-loop, should not normally occur
            warn!(header = %frame.header, "dropping self-originated data");
            return;
        }
        self.sink.on_data_received(&frame.header);
        self.stats.data_delivered += 1;
    }

    /// Relay application data one hop closer to the master.
    ///
    /// The frame is re-addressed to this node's best next hop and
    /// retagged Data when that hop is the master, Forward otherwise; the
    /// carried hop count increments and `prev_hop` records the immediate
    /// sender.
    fn handle_forward(&mut self, mut frame: Frame) {
        if frame.header.source.ip == self.table.identity().ip {
            warn!(header = %frame.header, "dropping self-originated forward");
            return;
        }
        if self.table.is_master() {
            // Terminal hop regardless of tag
            self.handle_data(frame);
            return;
        }
        if !self.table.is_joined() {
            warn!(header = %frame.header, "no route, dropping forward");
            return;
        }
        let next = self.table.best_next_hop();
        if next.ip == frame.header.from || next.ip == frame.header.prev_hop {
            // Relaying would point the frame back toward where it came from
            warn!(header = %frame.header, next = %next.ip, "routing loop, dropping frame");
            return;
        }
        frame.header.prev_hop = frame.header.from;
        frame.header.from = self.table.identity().ip;
        frame.header.to = next.ip;
        frame.header.source.weight = frame.header.source.weight.saturating_add(1);
        frame.header.kind = if next.ip.is_master() {
            MessageType::Data
        } else {
            MessageType::Forward
        };
        trace!(header = %frame.header, "relaying toward master");
        if self.enqueue_send(frame).is_ok() {
            self.stats.frames_forwarded += 1;
        }
    }

    /// A neighbor announced an improved path.
    ///
    /// Echo guard: the announcer stamps `prev_hop` with its own parent's
    /// address, so an update that names us came from our own child and
    /// carries nothing we did not already know.
    fn handle_weight_update(&mut self, frame: Frame, now: Instant) {
        if frame.header.prev_hop == self.table.identity().ip {
            trace!(child = %frame.header.from, "ignoring weight update echo from child");
            return;
        }
        if self.table.add_neighbor(frame.header.source, EntryStatus::GotJoin, now) {
            debug!(
                neighbor = %frame.header.from,
                weight = self.table.identity().weight,
                "route improved via weight update"
            );
            self.machine.route_improved(now);
        }
    }

    /// Clear the table and broadcast a Join seeking a parent
    fn begin_join(&mut self) {
        self.table.clear();
        let me = self.table.identity();
        let header = Header::new(me.ip, NodeAddress::BROADCAST, MessageType::Join, me);
        debug!(header = %header, "broadcasting join");
        if self.enqueue_send(Frame::new(header)).is_ok() {
            self.stats.joins_sent += 1;
        }
    }

    /// Broadcast a WeightUpdate announcing the improved path; `prev_hop`
    /// names our parent so the parent can recognize the echo.
    fn announce_weight(&mut self) {
        let me = self.table.identity();
        let mut header = Header::new(me.ip, NodeAddress::BROADCAST, MessageType::WeightUpdate, me);
        header.prev_hop = self.table.best_next_hop().ip;
        debug!(header = %header, "broadcasting weight update");
        let _ = self.enqueue_send(Frame::new(header));
    }

    fn send_welcome(&mut self, to: NodeAddress, now: Instant) {
        let me = self.table.identity();
        let header = Header::new(me.ip, to, MessageType::Welcome, me);
        let mut frame = Frame::new(header);
        frame.set_time_ms(self.network_time_ms(now));
        debug!(header = %header, "replying with welcome");
        if self.enqueue_send(frame).is_ok() {
            self.stats.welcomes_sent += 1;
        }
    }

    fn enqueue_send(&mut self, frame: Frame) -> MeshResult<()> {
        self.send_queue.push(frame).map_err(|err| {
            self.stats.queue_drops += 1;
            err
        })
    }

    /// Hand every queued frame to the transport, oldest first.
    ///
    /// A unicast that exhausts the retry budget notifies the sink and
    /// removes the destination from the table; losing the selected parent
    /// that way forces the state machine back to rejoining.
    fn flush_send_queue(&mut self, now: Instant) {
        while let Some(frame) = self.send_queue.pop() {
            let to = frame.header.to;
            let address = resolve_address(to);
            let broadcast = to.is_broadcast();
            match self.transmit(&frame.to_bytes(), address, broadcast) {
                Ok(()) => {
                    self.stats.frames_tx += 1;
                    if !broadcast {
                        self.table.on_sent_to(to);
                    }
                }
                Err(err) => {
                    self.stats.send_failures += 1;
                    warn!(%err, destination = %to, "dropping undeliverable frame");
                    self.sink.on_send_failed(address);
                    if !broadcast && !self.table.remove_unreachable(to) {
                        info!("no neighbors remain, forcing rejoin");
                        self.machine.route_lost(now);
                    }
                }
            }
        }
    }

    /// One physical transmission with the configured retry budget;
    /// exhausting the budget yields [`MeshError::TransmitFailed`].
    /// Listening stops for the duration and resumes afterward; hardware
    /// acknowledgment is enabled for unicast and disabled for broadcast.
    fn transmit(&mut self, bytes: &[u8], address: TransportAddress, broadcast: bool) -> MeshResult<()> {
        self.radio.stop_listening();
        self.radio.open_writing_address(address);
        self.radio.set_auto_ack(PIPE_BROADCAST, !broadcast);
        let mut ok = false;
        for _ in 0..self.config.retry_budget {
            if self.radio.send_frame(bytes) {
                ok = true;
                break;
            }
        }
        self.radio.set_auto_ack(PIPE_BROADCAST, false);
        self.radio.start_listening();
        if ok {
            Ok(())
        } else {
            Err(MeshError::TransmitFailed(address))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{spawn_node, SimChannel};

    #[test]
    fn test_send_data_requires_route() {
        let channel = SimChannel::new();
        let (mut leaf, _sink) = spawn_node(&channel, 0x0002, Instant::now());
        assert_eq!(leaf.send_data(b"hello"), Err(MeshError::NotJoined));
    }

    #[test]
    fn test_master_send_data_delivers_locally() {
        let channel = SimChannel::new();
        let (mut master, sink) = spawn_node(&channel, 0x0000, Instant::now());
        master.send_data(b"note to self").unwrap();
        assert_eq!(master.stats().data_delivered, 1);
        assert_eq!(sink.delivered().len(), 1);
        assert_eq!(channel.send_attempts(), 0);
    }

    #[test]
    fn test_retry_exhaustion_notifies_once() {
        let channel = SimChannel::new();
        let leaf_addr = NodeAddress::new(0x0002);
        let now = Instant::now();
        let (mut master, sink) = spawn_node(&channel, 0x0000, now);
        channel.set_down(leaf_addr);

        // A join from the leaf makes the master queue a Welcome reply
        let join = Frame::new(Header::new(
            leaf_addr,
            NodeAddress::BROADCAST,
            MessageType::Join,
            NodeIdentity::unjoined(leaf_addr),
        ));
        channel.inject(NodeAddress::MASTER, join);

        let before = channel.send_attempts();
        master.poll(now);

        // Exactly the retry budget in attempts, exactly one notification
        assert_eq!(channel.send_attempts() - before, 15);
        assert_eq!(master.stats().send_failures, 1);
        assert_eq!(sink.failed(), vec![resolve_address(leaf_addr)]);
    }

    #[test]
    fn test_unknown_type_is_drained() {
        let channel = SimChannel::new();
        let (mut master, sink) = spawn_node(&channel, 0x0000, Instant::now());
        let other = NodeAddress::new(0x0009);
        let header = Header::new(
            other,
            NodeAddress::MASTER,
            MessageType::Unknown(b'X'),
            NodeIdentity::unjoined(other),
        );
        channel.inject(NodeAddress::MASTER, Frame::new(header));
        master.poll(Instant::now());
        assert_eq!(master.stats().unknown_dropped, 1);
        assert!(sink.delivered().is_empty());
    }

    #[test]
    fn test_stale_parent_join_in_same_drain_keeps_fresh_route() {
        let channel = SimChannel::new();
        let now = Instant::now();
        let me = NodeAddress::new(0x0002);
        let parent = NodeAddress::new(0x0005);
        let (mut node, _sink) = spawn_node(&channel, me.raw(), now);
        let _parent_radio = channel.attach(parent);

        // The parent's original Join broadcast is still in the inbox when
        // its Welcome arrives; handled in arrival order the Join is only a
        // sighting, not a reset of the route the Welcome establishes.
        let stale_join = Frame::new(Header::new(
            parent,
            NodeAddress::BROADCAST,
            MessageType::Join,
            NodeIdentity::unjoined(parent),
        ));
        let mut welcome = Frame::new(Header::new(
            parent,
            me,
            MessageType::Welcome,
            NodeIdentity {
                ip: parent,
                weight: 1,
            },
        ));
        welcome.set_time_ms(0);
        channel.inject(me, stale_join);
        channel.inject(me, welcome);
        node.poll(now);

        assert!(node.is_joined());
        assert_eq!(node.identity().weight, 2);
        assert_eq!(node.table().best_next_hop().ip, parent);
    }

    #[test]
    fn test_overheard_unicast_for_another_node_is_dropped() {
        let channel = SimChannel::new();
        let (mut master, sink) = spawn_node(&channel, 0x0000, Instant::now());
        let origin = NodeAddress::new(0x0009);
        let other = NodeAddress::new(0x0005);
        // Data addressed to a third node, overheard on the shared medium
        let header = Header::new(
            origin,
            other,
            MessageType::Data,
            NodeIdentity { ip: origin, weight: 0 },
        );
        channel.inject(NodeAddress::MASTER, Frame::new(header));
        master.poll(Instant::now());
        assert!(sink.delivered().is_empty());
        assert_eq!(master.stats().data_delivered, 0);
        assert_eq!(master.stats().frames_rx, 1);
    }

    #[test]
    fn test_forward_back_toward_sender_is_dropped() {
        let channel = SimChannel::new();
        let now = Instant::now();
        let me = NodeAddress::new(0x0002);
        let parent = NodeAddress::new(0x0005);
        let (mut node, _sink) = spawn_node(&channel, me.raw(), now);
        let _parent_radio = channel.attach(parent);

        let mut welcome = Frame::new(Header::new(
            parent,
            me,
            MessageType::Welcome,
            NodeIdentity {
                ip: parent,
                weight: 1,
            },
        ));
        welcome.set_time_ms(0);
        channel.inject(me, welcome);
        node.poll(now);
        assert!(node.is_joined());

        // Relaying this would point it straight back at the parent
        let origin = NodeAddress::new(0x0009);
        let forward = Frame::new(Header::new(
            parent,
            me,
            MessageType::Forward,
            NodeIdentity {
                ip: origin,
                weight: 1,
            },
        ));
        channel.inject(me, forward);
        node.poll(now);
        assert_eq!(node.stats().frames_forwarded, 0);
    }

    #[test]
    fn test_self_originated_data_is_discarded() {
        let channel = SimChannel::new();
        let (mut master, sink) = spawn_node(&channel, 0x0000, Instant::now());
        let relay = NodeAddress::new(0x0005);
        // Frame claiming to originate from the master itself
        let header = Header::new(
            relay,
            NodeAddress::MASTER,
            MessageType::Data,
            NodeIdentity::master(),
        );
        channel.inject(NodeAddress::MASTER, Frame::new(header));
        master.poll(Instant::now());
        assert!(sink.delivered().is_empty());
        assert_eq!(master.stats().data_delivered, 0);
    }
}
