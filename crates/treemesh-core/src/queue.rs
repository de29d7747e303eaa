//! Bounded frame queues
//!
//! Two disciplines, both capacity-enforced at the type level rather than
//! by callers: outbound frames leave in arrival order, inbound frames are
//! processed newest-first so a fresh routing update is never stuck behind
//! stale traffic.

use std::collections::VecDeque;

use tracing::warn;

use crate::error::{MeshError, MeshResult};
use crate::frame::Frame;

/// FIFO queue for frames awaiting transmission
#[derive(Debug)]
pub struct SendQueue {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Enqueue a frame for sending; fails without side effects when full
    pub fn push(&mut self, frame: Frame) -> MeshResult<()> {
        if self.frames.len() >= self.capacity {
            warn!(header = %frame.header, "send queue full, dropping frame");
            return Err(MeshError::QueueFull);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Oldest enqueued frame
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// LIFO stack for frames drained from the radio
#[derive(Debug)]
pub struct ReceiveStack {
    frames: Vec<Frame>,
    capacity: usize,
}

impl ReceiveStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Stack a received frame; fails without side effects when full
    pub fn push(&mut self, frame: Frame) -> MeshResult<()> {
        if self.frames.len() >= self.capacity {
            warn!(header = %frame.header, "receive stack full, dropping frame");
            return Err(MeshError::QueueFull);
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Most recently received frame
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
