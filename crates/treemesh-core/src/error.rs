//! Error types for the mesh network layer.
//!
//! There is no fatal condition inside the core logic: every failure path
//! degrades to "not currently joined", from which the maintenance cycle
//! recovers on its own.

use thiserror::Error;

use crate::traits::TransportAddress;

/// Mesh network layer error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Enqueue against a full frame queue; the frame is dropped
    #[error("queue full, frame dropped")]
    QueueFull,

    /// Operation requires a route to the master
    #[error("not joined to a network")]
    NotJoined,

    /// The physical send retry budget was exhausted
    #[error("transmit to {0} failed after exhausting the retry budget")]
    TransmitFailed(TransportAddress),

    /// A received buffer was smaller than one frame
    #[error("frame too short: {0} bytes")]
    ShortFrame(usize),

    /// Radio driver error
    #[error("radio error: {0}")]
    Radio(String),
}

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;
