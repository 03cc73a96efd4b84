//! Coordinator election among open tabs
//!
//! Exactly one tab per logical session talks to the server; the rest
//! follow. Election is claim-based: a joining tab bids with its
//! identifier after a short random delay, the lowest identifier in the
//! claim window wins, and the winner asserts liveness with periodic bus
//! heartbeats. A follower that stops observing heartbeats for the
//! liveness window re-runs the election.
//!
//! The state machine here is purely decisional; the engine drives it from
//! its tick and bus branches and performs the publishes it requests.

use std::time::Duration;

use tokio::time::Instant;

use crate::bus::{TabId, TabIdRef};

/// The tab's current coordination role
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Bidding for coordinatorship until the claim window closes
    Candidate {
        /// When the claim window closes
        until: Instant,
    },
    /// Elected: owns heartbeat/extend/complete traffic
    Coordinator,
    /// Deferring to another tab's coordinatorship
    Follower {
        /// When a coordinator heartbeat was last observed
        last_heartbeat: Instant,
    },
}

/// What the engine should do after feeding the state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do
    None,
    /// Broadcast a claim; a new election has begun
    PublishClaim,
    /// Broadcast a heartbeat immediately to squash a losing claim
    ReassertLeadership,
    /// This tab just became coordinator
    Promoted,
    /// This tab just lost coordinatorship
    Demoted,
}

/// The per-tab election state machine
#[derive(Debug)]
pub struct Coordinator {
    tab: TabId,
    role: Role,
    heartbeat_period: Duration,
}

impl Coordinator {
    /// Creates the state machine, opening the first claim window
    pub fn new(tab: TabId, heartbeat_period: Duration, claim_delay: Duration) -> Self {
        Self {
            tab,
            role: Role::Candidate {
                until: Instant::now() + claim_delay,
            },
            heartbeat_period,
        }
    }

    /// This tab's identifier
    pub fn tab(&self) -> &TabIdRef {
        &self.tab
    }

    /// The current role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this tab currently owns server communication
    pub fn is_coordinator(&self) -> bool {
        self.role == Role::Coordinator
    }

    /// Opens a fresh claim window, bidding for coordinatorship
    pub fn start_election(&mut self, claim_delay: Duration) -> Action {
        self.role = Role::Candidate {
            until: Instant::now() + claim_delay,
        };
        Action::PublishClaim
    }

    /// Feeds a competing claim observed on the bus
    pub fn on_claim(&mut self, from: &TabIdRef) -> Action {
        match self.role {
            Role::Candidate { .. } if from.as_str() < self.tab.as_str() => {
                // The competing bid outranks ours; concede and treat the
                // claim as evidence of an imminent coordinator.
                self.role = Role::Follower {
                    last_heartbeat: Instant::now(),
                };
                Action::None
            }
            Role::Candidate { .. } => Action::None,
            Role::Coordinator => {
                // A stable coordinator is not usurped by late joiners;
                // answer the claim so the bidder settles as a follower.
                Action::ReassertLeadership
            }
            Role::Follower { .. } => Action::None,
        }
    }

    /// Feeds a coordinator heartbeat observed on the bus
    pub fn on_heartbeat(&mut self, from: &TabIdRef) -> Action {
        match self.role {
            Role::Coordinator if from.as_str() < self.tab.as_str() => {
                // Two coordinators after a partition heals: the lower
                // identifier wins.
                tracing::info!(other = %from, "conceding coordinatorship to lower tab id");
                self.role = Role::Follower {
                    last_heartbeat: Instant::now(),
                };
                Action::Demoted
            }
            Role::Coordinator => Action::ReassertLeadership,
            Role::Candidate { .. } | Role::Follower { .. } => {
                self.role = Role::Follower {
                    last_heartbeat: Instant::now(),
                };
                Action::None
            }
        }
    }

    /// Feeds a coordinator release (the coordinating tab is going away)
    pub fn on_released(&mut self, claim_delay: Duration) -> Action {
        match self.role {
            Role::Coordinator => Action::None,
            Role::Candidate { .. } | Role::Follower { .. } => {
                tracing::debug!("coordinator released; re-running election");
                self.start_election(claim_delay)
            }
        }
    }

    /// Advances time-driven transitions: claim-window expiry and
    /// coordinator-silence detection
    pub fn poll(&mut self, now: Instant, claim_delay: Duration) -> Action {
        match self.role {
            Role::Candidate { until } if now >= until => {
                tracing::info!(tab = %self.tab, "claim window closed; assuming coordinatorship");
                self.role = Role::Coordinator;
                Action::Promoted
            }
            Role::Follower { last_heartbeat }
                if now.saturating_duration_since(last_heartbeat) > self.liveness_window() =>
            {
                tracing::warn!(
                    tab = %self.tab,
                    "coordinator went silent past the liveness window; re-electing"
                );
                self.start_election(claim_delay)
            }
            _ => Action::None,
        }
    }

    /// How long coordinator silence is tolerated before re-election
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_period * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(100);
    const DELAY: Duration = Duration::from_millis(20);

    fn machine(tab: &str) -> Coordinator {
        Coordinator::new(TabId::new(tab.to_string()), PERIOD, DELAY)
    }

    #[test]
    fn uncontested_candidate_promotes_after_window() {
        let mut c = machine("bbbb");
        assert_eq!(c.poll(Instant::now(), DELAY), Action::None);
        assert_eq!(c.poll(Instant::now() + DELAY, DELAY), Action::Promoted);
        assert!(c.is_coordinator());
    }

    #[test]
    fn lower_claim_wins_the_window() {
        let mut c = machine("bbbb");
        c.on_claim(TabIdRef::from_str("aaaa"));
        assert!(matches!(c.role(), Role::Follower { .. }));

        // A higher claim would not have displaced us
        let mut c = machine("bbbb");
        c.on_claim(TabIdRef::from_str("cccc"));
        assert!(matches!(c.role(), Role::Candidate { .. }));
    }

    #[test]
    fn candidate_defers_to_observed_heartbeat() {
        let mut c = machine("aaaa");
        c.on_heartbeat(TabIdRef::from_str("zzzz"));
        assert!(matches!(c.role(), Role::Follower { .. }));
    }

    #[test]
    fn coordinator_reasserts_against_late_claims() {
        let mut c = machine("bbbb");
        c.poll(Instant::now() + DELAY, DELAY);
        assert!(c.is_coordinator());
        assert_eq!(
            c.on_claim(TabIdRef::from_str("aaaa")),
            Action::ReassertLeadership
        );
        assert!(c.is_coordinator());
    }

    #[test]
    fn dual_coordinators_resolve_to_lowest() {
        let mut c = machine("bbbb");
        c.poll(Instant::now() + DELAY, DELAY);
        assert_eq!(c.on_heartbeat(TabIdRef::from_str("aaaa")), Action::Demoted);
        assert!(!c.is_coordinator());

        let mut c = machine("bbbb");
        c.poll(Instant::now() + DELAY, DELAY);
        assert_eq!(
            c.on_heartbeat(TabIdRef::from_str("cccc")),
            Action::ReassertLeadership
        );
        assert!(c.is_coordinator());
    }

    #[test]
    fn follower_reelects_after_silence() {
        let mut c = machine("bbbb");
        c.on_heartbeat(TabIdRef::from_str("aaaa"));

        let now = Instant::now();
        assert_eq!(c.poll(now + PERIOD, DELAY), Action::None);
        assert_eq!(c.poll(now + PERIOD * 4, DELAY), Action::PublishClaim);
        assert!(matches!(c.role(), Role::Candidate { .. }));
    }

    #[test]
    fn release_triggers_immediate_reelection() {
        let mut c = machine("bbbb");
        c.on_heartbeat(TabIdRef::from_str("aaaa"));
        assert_eq!(c.on_released(DELAY), Action::PublishClaim);
        assert!(matches!(c.role(), Role::Candidate { .. }));
    }
}
