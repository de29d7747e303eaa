//! Static configuration supplied at startup
//!
//! All values are fixed for the lifetime of a node; nothing here is
//! renegotiated at runtime.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::frame::NodeAddress;

/// On-air data rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataRate {
    Kbps250,
    #[default]
    Mbps1,
    Mbps2,
}

/// Frame CRC mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CrcMode {
    Disabled,
    Crc8,
    #[default]
    Crc16,
}

/// Physical radio bring-up parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// RF channel number
    pub channel: u8,
    pub data_rate: DataRate,
    pub crc: CrcMode,
    /// Hardware retry delay, in 250 us units
    pub retry_delay: u8,
    /// Hardware retry count per send attempt
    pub retry_count: u8,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            channel: 90,
            data_rate: DataRate::Mbps1,
            crc: CrcMode::Crc16,
            retry_delay: 5,
            retry_count: 15,
        }
    }
}

/// Network layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// RF channel to operate on
    pub channel: u8,
    /// This node's logical address; the reserved master value selects
    /// root behavior
    pub address: NodeAddress,
    /// How long a joining node waits for Welcome replies before checking
    /// whether the join succeeded
    pub welcome_wait: Duration,
    /// How long a joined node trusts its route before re-running the join
    /// sequence (defends against silent parent loss)
    pub join_refresh: Duration,
    /// Receive queue depth, in frames
    pub receive_depth: usize,
    /// Send queue depth, in frames
    pub send_depth: usize,
    /// Physical send attempts per frame before reporting failure
    pub retry_budget: u8,
    /// Time budget for one radio drain loop
    pub listen_budget: Duration,
}

impl MeshConfig {
    /// Configuration for a node at `address` on `channel`, with the
    /// reference deployment's defaults for everything else.
    pub fn new(channel: u8, address: NodeAddress) -> Self {
        Self {
            channel,
            address,
            welcome_wait: Duration::from_millis(5000),
            join_refresh: Duration::from_secs(60),
            receive_depth: 5,
            send_depth: 5,
            retry_budget: 15,
            listen_budget: Duration::from_millis(50),
        }
    }

    /// Radio bring-up parameters for this node
    pub fn radio_config(&self) -> RadioConfig {
        RadioConfig {
            channel: self.channel,
            ..RadioConfig::default()
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::new(90, NodeAddress::MASTER)
    }
}
