//! External collaborator contracts
//!
//! The network layer talks to exactly two collaborators supplied by the
//! embedding system: the physical radio driver and the application
//! notification sink. Both are specified here as traits so nodes can run
//! against real hardware or the in-process simulation in [`crate::sim`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RadioConfig;
use crate::error::MeshResult;
use crate::frame::Header;

/// Opaque fixed-width physical/transport address.
///
/// Derived deterministically from a logical address by
/// [`crate::routing::resolve_address`]; this layer never interprets its
/// internal format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportAddress(u64);

impl TransportAddress {
    pub fn new(raw: u64) -> Self {
        TransportAddress(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#012x}", self.0)
    }
}

/// Physical radio driver contract.
///
/// The radio is either listening or sending, never both; callers stop
/// listening before a send and restore it afterward. All calls are
/// synchronous and non-blocking apart from the driver's own hardware
/// retry timing.
pub trait Radio {
    /// Apply channel, data rate, CRC, and hardware retry configuration
    fn configure(&mut self, config: &RadioConfig) -> MeshResult<()>;

    /// Open a reading pipe on `slot` for the given transport address
    fn open_reading_address(&mut self, slot: u8, address: TransportAddress) -> MeshResult<()>;

    /// Enter receive mode
    fn start_listening(&mut self);

    /// Leave receive mode so a frame can be sent
    fn stop_listening(&mut self);

    /// Check for a receivable frame; returns the reading slot it arrived on
    fn poll_receivable(&mut self) -> Option<u8>;

    /// Copy the next received frame into `buf`; returns true if this was
    /// the last frame currently held by the driver
    fn receive_frame(&mut self, buf: &mut [u8]) -> bool;

    /// Select the destination address for subsequent sends
    fn open_writing_address(&mut self, address: TransportAddress);

    /// Attempt one physical transmission; returns whether the send (and
    /// hardware-level acknowledgment, if enabled) succeeded
    fn send_frame(&mut self, buf: &[u8]) -> bool;

    /// Enable or disable hardware acknowledgment on a pipe
    fn set_auto_ack(&mut self, slot: u8, enabled: bool);
}

/// Application notification sink.
///
/// Both callbacks are fire-and-forget, invoked synchronously from within
/// the processing cycle; they must not block indefinitely.
pub trait EventSink {
    /// A frame addressed to `address` exhausted the whole retry budget
    fn on_send_failed(&mut self, address: TransportAddress);

    /// An application payload reached this node
    fn on_data_received(&mut self, header: &Header);
}

/// Counters for network layer operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct MeshStats {
    /// Frames handed to the transport successfully
    pub frames_tx: u64,
    /// Frames drained from the radio
    pub frames_rx: u64,
    /// Application frames relayed toward the master
    pub frames_forwarded: u64,
    /// Application payloads delivered to the sink
    pub data_delivered: u64,
    /// Frames dropped against a full queue
    pub queue_drops: u64,
    /// Transmissions that exhausted the retry budget
    pub send_failures: u64,
    /// Join broadcasts sent
    pub joins_sent: u64,
    /// Welcome replies sent
    pub welcomes_sent: u64,
    /// Frames drained due to an unrecognized type tag
    pub unknown_dropped: u64,
}
