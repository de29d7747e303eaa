//! Routing table and next-hop selection
//!
//! Tracks this node's identity and weight, a bounded set of neighbor
//! candidates, and the currently selected best next hop toward the master.
//! Selection is purely local: a candidate is promoted only when its
//! advertised `weight + 1` strictly beats the current weight, so the chosen
//! route is always a local hop-count minimum (not necessarily a global one;
//! there is no network-wide recomputation).
//!
//! The master's reserved address is never stored as a table entry; it is
//! resolved structurally, as is the broadcast address. Physical transport
//! addresses are a pure function of the logical address, so resolution can
//! never miss.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::frame::{NodeAddress, NodeIdentity, MAX_WEIGHT};
use crate::traits::TransportAddress;

/// Neighbor candidate capacity
pub const MAX_NEAR_NODE: usize = 10;

/// Base for unicast transport addresses: `UNICAST_BASE | ip`
const UNICAST_BASE: u64 = 0xC5C5_C500_00;

/// Well-known broadcast transport address
const BROADCAST_MAC: u64 = 0xE8_E8E8_E8E8;

/// Well-known master transport address
const MASTER_MAC: u64 = 0xD7_D7D7_D7D7;

/// Derive the physical transport address for a logical address.
///
/// Pure function of `ip`: the reserved broadcast and master addresses map
/// to their well-known constants, everything else hangs off a fixed base.
pub fn resolve_address(ip: NodeAddress) -> TransportAddress {
    if ip.is_broadcast() {
        TransportAddress::new(BROADCAST_MAC)
    } else if ip.is_master() {
        TransportAddress::new(MASTER_MAC)
    } else {
        TransportAddress::new(UNICAST_BASE | u64::from(ip.raw()))
    }
}

/// How a neighbor entry last interacted with the join protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// We answered this neighbor's Join with a Welcome
    SentWelcome,
    /// Sighted via a Welcome reply
    GotWelcome,
    /// Sighted via a Join or weight-update broadcast
    GotJoin,
    /// Promoted to the selected next hop
    Shortened,
    /// A unicast to this neighbor succeeded
    Connected,
    /// Marked unreachable, about to be removed
    Dead,
}

/// One known neighbor candidate
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub identity: NodeIdentity,
    /// Frames sent to this neighbor
    pub send_seq: u16,
    /// Frames received from this neighbor
    pub recv_seq: u16,
    pub status: EntryStatus,
    pub last_seen: Instant,
}

/// Bounded neighbor table with best-next-hop selection.
///
/// At most one entry per distinct address; never holds an entry for this
/// node's own address, the master, or the broadcast address.
#[derive(Debug)]
pub struct RoutingTable {
    identity: NodeIdentity,
    is_master: bool,
    entries: HashMap<NodeAddress, RoutingEntry>,
    capacity: usize,
    /// Address of the selected next hop; `None` means not joined
    shortest: Option<NodeAddress>,
    /// The master was heard directly; it is adoptable as parent without
    /// occupying a table slot
    master_adjacent: bool,
}

impl RoutingTable {
    /// Create a table for the node at `address`. The master's reserved
    /// address makes this node the root: weight 0, permanently joined.
    pub fn new(address: NodeAddress) -> Self {
        let is_master = address.is_master();
        let identity = if is_master {
            NodeIdentity::master()
        } else {
            NodeIdentity::unjoined(address)
        };
        debug!(ip = %identity.ip, master = is_master, "routing table created");
        Self {
            identity,
            is_master,
            entries: HashMap::new(),
            capacity: MAX_NEAR_NODE,
            shortest: None,
            master_adjacent: false,
        }
    }

    /// This node's identity and current weight
    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    /// Whether a route to the master is currently selected
    pub fn is_joined(&self) -> bool {
        self.is_master || self.shortest.is_some()
    }

    /// The selected next hop toward the master.
    ///
    /// Caller contract: check [`is_joined`](Self::is_joined) first; the
    /// result while unjoined is meaningless.
    pub fn best_next_hop(&self) -> NodeIdentity {
        debug_assert!(self.is_joined(), "best_next_hop called while unjoined");
        if self.is_master {
            return self.identity;
        }
        match self.shortest {
            Some(ip) if ip.is_master() => NodeIdentity::master(),
            Some(ip) => match self.entries.get(&ip) {
                Some(entry) => entry.identity,
                None => NodeIdentity::unjoined(self.identity.ip),
            },
            None => NodeIdentity::unjoined(self.identity.ip),
        }
    }

    /// Record a sighted neighbor candidate and adopt it as the new best
    /// path when its `weight + 1` strictly improves on the current weight.
    ///
    /// Returns true when the topology improved (callers propagate it).
    /// Equal-or-worse candidates are recorded for future failover but
    /// never promoted.
    pub fn add_neighbor(&mut self, candidate: NodeIdentity, seen: EntryStatus, now: Instant) -> bool {
        if candidate.ip == self.identity.ip || candidate.ip.is_broadcast() {
            return false;
        }

        if candidate.ip.is_master() {
            if self.is_master {
                return false;
            }
            // Structural: the master never occupies a slot.
            self.master_adjacent = true;
            if 1 < self.identity.weight {
                self.identity.weight = 1;
                self.shortest = Some(NodeAddress::MASTER);
                debug!(ip = %self.identity.ip, "adopted master as parent, weight 1");
                return true;
            }
            return false;
        }

        let improved = candidate.weight.saturating_add(1) < self.identity.weight;

        if !self.entries.contains_key(&candidate.ip) && self.entries.len() >= self.capacity {
            if !self.evict_worst() {
                warn!(candidate = %candidate.ip, "neighbor table saturated, refusing entry");
                return false;
            }
        }

        let entry = self
            .entries
            .entry(candidate.ip)
            .or_insert_with(|| RoutingEntry {
                identity: candidate,
                send_seq: 0,
                recv_seq: 0,
                status: seen,
                last_seen: now,
            });
        entry.identity = candidate;
        entry.last_seen = now;

        if improved {
            entry.status = EntryStatus::Shortened;
            self.identity.weight = candidate.weight + 1;
            self.shortest = Some(candidate.ip);
            debug!(
                parent = %candidate.ip,
                weight = self.identity.weight,
                "adopted better path"
            );
            true
        } else {
            entry.status = seen;
            trace!(candidate = %candidate.ip, "recorded neighbor, no improvement");
            false
        }
    }

    /// Delete the entry for `ip` and recompute the best remaining path.
    ///
    /// Returns false when no candidates remain at all: the table is
    /// cleared and this node has no route.
    pub fn remove_unreachable(&mut self, ip: NodeAddress) -> bool {
        if ip.is_master() {
            if self.is_master {
                return true;
            }
            self.master_adjacent = false;
            debug!("master marked unreachable");
        } else if let Some(entry) = self.entries.get_mut(&ip) {
            entry.status = EntryStatus::Dead;
            debug!(neighbor = %ip, "removing unreachable neighbor");
            self.entries.remove(&ip);
        }
        if self.is_master {
            // The master routes nothing upward; its weight never changes
            return true;
        }
        self.recompute();
        if !self.is_joined() {
            self.clear();
            false
        } else {
            true
        }
    }

    /// Reset the neighbor set and own weight/path; a no-op for the master
    pub fn clear(&mut self) {
        if self.is_master {
            return;
        }
        self.entries.clear();
        self.master_adjacent = false;
        self.shortest = None;
        self.identity.weight = MAX_WEIGHT;
    }

    /// Note a frame received from `ip`
    pub fn on_frame_from(&mut self, ip: NodeAddress, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&ip) {
            entry.recv_seq = entry.recv_seq.wrapping_add(1);
            entry.last_seen = now;
        }
    }

    /// Note a successful unicast to `ip`
    pub fn on_sent_to(&mut self, ip: NodeAddress) {
        if let Some(entry) = self.entries.get_mut(&ip) {
            entry.send_seq = entry.send_seq.wrapping_add(1);
            entry.status = EntryStatus::Connected;
        }
    }

    /// Overwrite the status of an existing entry
    pub fn set_status(&mut self, ip: NodeAddress, status: EntryStatus) {
        if let Some(entry) = self.entries.get_mut(&ip) {
            entry.status = status;
        }
    }

    pub fn entry(&self, ip: NodeAddress) -> Option<&RoutingEntry> {
        self.entries.get(&ip)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-derive shortest path and own weight from the remaining
    /// candidates. The master, when adjacent, always wins (weight 0).
    fn recompute(&mut self) {
        if self.master_adjacent {
            self.shortest = Some(NodeAddress::MASTER);
            self.identity.weight = 1;
            return;
        }
        match self
            .entries
            .values()
            .min_by_key(|e| (e.identity.weight, e.identity.ip))
        {
            Some(best) => {
                self.identity.weight = best.identity.weight.saturating_add(1);
                self.shortest = Some(best.identity.ip);
            }
            None => {
                self.shortest = None;
                self.identity.weight = MAX_WEIGHT;
            }
        }
    }

    /// Evict the worst candidate: highest weight, stalest on ties, never
    /// the selected next hop. Returns false when nothing is evictable.
    fn evict_worst(&mut self) -> bool {
        let worst = self
            .entries
            .iter()
            .filter(|(ip, _)| Some(**ip) != self.shortest)
            .max_by_key(|(_, e)| (e.identity.weight, std::cmp::Reverse(e.last_seen)))
            .map(|(ip, _)| *ip);
        match worst {
            Some(ip) => {
                debug!(evicted = %ip, "neighbor table full, evicting worst entry");
                self.entries.remove(&ip);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: u16) -> NodeAddress {
        NodeAddress::new(raw)
    }

    fn candidate(raw: u16, weight: u8) -> NodeIdentity {
        NodeIdentity {
            ip: addr(raw),
            weight,
        }
    }

    #[test]
    fn test_resolve_address_is_pure() {
        assert_eq!(resolve_address(NodeAddress::BROADCAST).raw(), BROADCAST_MAC);
        assert_eq!(resolve_address(NodeAddress::MASTER).raw(), MASTER_MAC);
        assert_eq!(resolve_address(addr(0x0042)).raw(), UNICAST_BASE | 0x42);
        // Same input, same output, no table involved
        assert_eq!(resolve_address(addr(7)), resolve_address(addr(7)));
    }

    #[test]
    fn test_master_table() {
        let mut table = RoutingTable::new(NodeAddress::MASTER);
        assert!(table.is_master());
        assert!(table.is_joined());
        assert_eq!(table.identity().weight, 0);
        assert_eq!(table.best_next_hop().ip, NodeAddress::MASTER);

        // Children are recorded but never promoted; weight stays 0
        assert!(!table.add_neighbor(candidate(2, 1), EntryStatus::SentWelcome, Instant::now()));
        assert_eq!(table.len(), 1);
        assert_eq!(table.identity().weight, 0);
        table.clear();
        assert!(table.is_joined());
        assert!(table.remove_unreachable(addr(2)));
        assert!(table.is_joined());
        assert!(table.is_empty());
    }

    #[test]
    fn test_add_neighbor_improvement() {
        let now = Instant::now();
        let mut table = RoutingTable::new(addr(5));
        assert!(!table.is_joined());

        // Worse-or-equal candidates are recorded but not promoted
        assert!(table.add_neighbor(candidate(2, 3), EntryStatus::GotWelcome, now));
        assert_eq!(table.identity().weight, 4);
        assert!(!table.add_neighbor(candidate(3, 3), EntryStatus::GotWelcome, now));
        assert_eq!(table.identity().weight, 4);
        assert_eq!(table.len(), 2);

        // Strictly better candidate wins
        assert!(table.add_neighbor(candidate(4, 1), EntryStatus::GotWelcome, now));
        assert_eq!(table.identity().weight, 2);
        assert_eq!(table.best_next_hop().ip, addr(4));
        assert_eq!(table.entry(addr(4)).unwrap().status, EntryStatus::Shortened);
    }

    #[test]
    fn test_weight_monotonic_under_additions() {
        let now = Instant::now();
        let mut table = RoutingTable::new(addr(9));
        let mut last = table.identity().weight;
        for (ip, weight) in [(1u16, 6u8), (2, 9), (3, 2), (4, 2), (5, 7), (6, 1)] {
            table.add_neighbor(candidate(ip, weight), EntryStatus::GotJoin, now);
            let current = table.identity().weight;
            assert!(current <= last, "weight increased from {last} to {current}");
            last = current;
        }
    }

    #[test]
    fn test_single_valid_path_invariant() {
        let now = Instant::now();
        let mut table = RoutingTable::new(addr(9));
        table.add_neighbor(candidate(1, 4), EntryStatus::GotWelcome, now);
        table.add_neighbor(candidate(2, 2), EntryStatus::GotWelcome, now);
        table.add_neighbor(candidate(3, 6), EntryStatus::GotWelcome, now);

        assert!(table.is_joined());
        let best = table.best_next_hop();
        assert!(table.entry(best.ip).is_some());
        assert_eq!(best.weight + 1, table.identity().weight);
    }

    #[test]
    fn test_master_adjacency_is_structural() {
        let now = Instant::now();
        let mut table = RoutingTable::new(addr(1));
        assert!(table.add_neighbor(NodeIdentity::master(), EntryStatus::GotWelcome, now));
        assert!(table.is_joined());
        assert_eq!(table.identity().weight, 1);
        assert_eq!(table.best_next_hop(), NodeIdentity::master());
        // No slot consumed
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_unreachable_recomputes() {
        let now = Instant::now();
        let mut table = RoutingTable::new(addr(9));
        table.add_neighbor(candidate(1, 1), EntryStatus::GotWelcome, now);
        table.add_neighbor(candidate(2, 3), EntryStatus::GotWelcome, now);
        assert_eq!(table.identity().weight, 2);

        // Losing the parent falls back to the next best candidate
        assert!(table.remove_unreachable(addr(1)));
        assert_eq!(table.best_next_hop().ip, addr(2));
        assert_eq!(table.identity().weight, 4);

        // Losing the last candidate clears everything
        assert!(!table.remove_unreachable(addr(2)));
        assert!(!table.is_joined());
        assert_eq!(table.identity().weight, MAX_WEIGHT);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_unreachable_master() {
        let now = Instant::now();
        let mut table = RoutingTable::new(addr(1));
        table.add_neighbor(NodeIdentity::master(), EntryStatus::GotWelcome, now);
        assert!(!table.remove_unreachable(NodeAddress::MASTER));
        assert!(!table.is_joined());
    }

    #[test]
    fn test_eviction_spares_best_path() {
        let now = Instant::now();
        let mut table = RoutingTable::new(addr(99));
        table.add_neighbor(candidate(1, 1), EntryStatus::GotWelcome, now);
        for ip in 2..=MAX_NEAR_NODE as u16 {
            table.add_neighbor(candidate(ip, 8), EntryStatus::GotJoin, now);
        }
        assert_eq!(table.len(), MAX_NEAR_NODE);

        // One more candidate evicts a weight-8 entry, never the parent
        table.add_neighbor(candidate(50, 5), EntryStatus::GotJoin, now);
        assert_eq!(table.len(), MAX_NEAR_NODE);
        assert!(table.entry(addr(1)).is_some());
        assert!(table.entry(addr(50)).is_some());
        assert_eq!(table.best_next_hop().ip, addr(1));
    }

    #[test]
    fn test_sequence_counters() {
        let now = Instant::now();
        let mut table = RoutingTable::new(addr(9));
        table.add_neighbor(candidate(1, 1), EntryStatus::GotWelcome, now);

        table.on_frame_from(addr(1), now);
        table.on_frame_from(addr(1), now);
        table.on_sent_to(addr(1));

        let entry = table.entry(addr(1)).unwrap();
        assert_eq!(entry.recv_seq, 2);
        assert_eq!(entry.send_seq, 1);
        assert_eq!(entry.status, EntryStatus::Connected);
    }

    #[test]
    fn test_never_stores_self_or_broadcast() {
        let now = Instant::now();
        let mut table = RoutingTable::new(addr(9));
        assert!(!table.add_neighbor(candidate(9, 0), EntryStatus::GotJoin, now));
        assert!(!table.add_neighbor(
            NodeIdentity {
                ip: NodeAddress::BROADCAST,
                weight: 0
            },
            EntryStatus::GotJoin,
            now
        ));
        assert!(table.is_empty());
    }
}
