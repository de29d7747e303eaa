//! Join protocol state machine
//!
//! Tagged state with an explicit entered-at stamp, so every
//! timeout-driven transition is a comparison against one recorded
//! instant instead of time arithmetic scattered across call sites. The
//! machine decides *what* the maintenance cycle should do next; the node
//! owns the side effects (clearing the table, sending frames).

use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

/// Join protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Fresh node, has not attempted to join yet
    Init,
    /// No route to the master; will broadcast a Join on the next tick
    NotJoined,
    /// Join broadcast out, collecting Welcome replies
    SendingJoin,
    /// Route just improved; a weight update announcement is owed
    NewlyJoined,
    /// Route to the master selected and trusted
    Joined,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Init => "init",
            NodeState::NotJoined => "not-joined",
            NodeState::SendingJoin => "sending-join",
            NodeState::NewlyJoined => "newly-joined",
            NodeState::Joined => "joined",
        };
        f.write_str(name)
    }
}

/// What the maintenance cycle must do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Nothing owed this tick
    Idle,
    /// Clear the routing table and broadcast a Join
    BeginJoin,
    /// Broadcast a WeightUpdate announcing the improved path
    AnnounceWeight,
}

/// Drives the join lifecycle for one node.
///
/// The master is constructed directly in [`NodeState::Joined`] and every
/// transition is a no-op for it.
#[derive(Debug)]
pub struct StateMachine {
    state: NodeState,
    is_master: bool,
    /// When the current state was entered
    entered_at: Instant,
    /// Last successful join, for refresh scheduling
    joined_at: Option<Instant>,
    welcome_wait: Duration,
    join_refresh: Duration,
}

impl StateMachine {
    pub fn new(is_master: bool, welcome_wait: Duration, join_refresh: Duration, now: Instant) -> Self {
        Self {
            state: if is_master {
                NodeState::Joined
            } else {
                NodeState::Init
            },
            is_master,
            entered_at: now,
            joined_at: if is_master { Some(now) } else { None },
            welcome_wait,
            join_refresh,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn time_in_state(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.entered_at)
    }

    /// Advance the machine one maintenance tick.
    ///
    /// `joined` is the routing table's current `is_joined()`; the machine
    /// never inspects the table itself.
    pub fn tick(&mut self, joined: bool, now: Instant) -> TickAction {
        if self.is_master {
            return TickAction::Idle;
        }
        match self.state {
            NodeState::Init | NodeState::NotJoined => {
                self.enter(NodeState::SendingJoin, now);
                TickAction::BeginJoin
            }
            NodeState::SendingJoin => {
                if self.time_in_state(now) < self.welcome_wait {
                    return TickAction::Idle;
                }
                if joined {
                    self.joined_at = Some(now);
                    self.enter(NodeState::Joined, now);
                } else {
                    self.enter(NodeState::NotJoined, now);
                }
                TickAction::Idle
            }
            NodeState::NewlyJoined => {
                self.joined_at = Some(now);
                self.enter(NodeState::Joined, now);
                TickAction::AnnounceWeight
            }
            NodeState::Joined => {
                let stale = self
                    .joined_at
                    .map(|at| now.saturating_duration_since(at) >= self.join_refresh)
                    .unwrap_or(true);
                if stale {
                    debug!("route refresh due, re-running join sequence");
                    self.enter(NodeState::SendingJoin, now);
                    TickAction::BeginJoin
                } else {
                    TickAction::Idle
                }
            }
        }
    }

    /// The routing table just adopted a strictly better path
    pub fn route_improved(&mut self, now: Instant) {
        if self.is_master {
            return;
        }
        self.enter(NodeState::NewlyJoined, now);
    }

    /// The route to the master is gone; rejoin from scratch
    pub fn route_lost(&mut self, now: Instant) {
        if self.is_master {
            return;
        }
        self.joined_at = None;
        self.enter(NodeState::NotJoined, now);
    }

    fn enter(&mut self, next: NodeState, now: Instant) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "state transition");
        }
        self.state = next;
        self.entered_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(is_master: bool) -> (StateMachine, Instant) {
        let now = Instant::now();
        let machine = StateMachine::new(
            is_master,
            Duration::from_millis(5000),
            Duration::from_secs(60),
            now,
        );
        (machine, now)
    }

    #[test]
    fn test_master_is_permanently_joined() {
        let (mut sm, now) = machine(true);
        assert_eq!(sm.state(), NodeState::Joined);
        for step in 0..10 {
            let later = now + Duration::from_secs(step * 120);
            assert_eq!(sm.tick(true, later), TickAction::Idle);
            assert_eq!(sm.state(), NodeState::Joined);
        }
        sm.route_lost(now);
        assert_eq!(sm.state(), NodeState::Joined);
    }

    #[test]
    fn test_join_succeeds_after_welcome_wait() {
        let (mut sm, now) = machine(false);
        assert_eq!(sm.tick(false, now), TickAction::BeginJoin);
        assert_eq!(sm.state(), NodeState::SendingJoin);

        // Still inside the wait window, nothing owed
        let mid = now + Duration::from_millis(1000);
        assert_eq!(sm.tick(true, mid), TickAction::Idle);
        assert_eq!(sm.state(), NodeState::SendingJoin);

        let late = now + Duration::from_millis(5000);
        assert_eq!(sm.tick(true, late), TickAction::Idle);
        assert_eq!(sm.state(), NodeState::Joined);
    }

    #[test]
    fn test_failed_join_retries() {
        let (mut sm, now) = machine(false);
        sm.tick(false, now);

        let late = now + Duration::from_millis(5001);
        assert_eq!(sm.tick(false, late), TickAction::Idle);
        assert_eq!(sm.state(), NodeState::NotJoined);

        // Next tick rebroadcasts
        assert_eq!(sm.tick(false, late), TickAction::BeginJoin);
        assert_eq!(sm.state(), NodeState::SendingJoin);
    }

    #[test]
    fn test_improvement_announces_weight() {
        let (mut sm, now) = machine(false);
        sm.tick(false, now);
        sm.route_improved(now + Duration::from_millis(100));
        assert_eq!(sm.state(), NodeState::NewlyJoined);

        let later = now + Duration::from_millis(200);
        assert_eq!(sm.tick(true, later), TickAction::AnnounceWeight);
        assert_eq!(sm.state(), NodeState::Joined);
    }

    #[test]
    fn test_refresh_after_interval() {
        let (mut sm, now) = machine(false);
        sm.tick(false, now);
        sm.route_improved(now);
        sm.tick(true, now);
        assert_eq!(sm.state(), NodeState::Joined);

        let before = now + Duration::from_secs(59);
        assert_eq!(sm.tick(true, before), TickAction::Idle);

        let after = now + Duration::from_secs(60);
        assert_eq!(sm.tick(true, after), TickAction::BeginJoin);
        assert_eq!(sm.state(), NodeState::SendingJoin);
    }

    #[test]
    fn test_route_loss_forces_rejoin() {
        let (mut sm, now) = machine(false);
        sm.tick(false, now);
        sm.route_improved(now);
        sm.tick(true, now);

        sm.route_lost(now);
        assert_eq!(sm.state(), NodeState::NotJoined);
        assert_eq!(sm.tick(false, now), TickAction::BeginJoin);
    }
}
