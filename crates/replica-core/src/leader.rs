//! Session-owner election over the cross-process channel.
//!
//! Heartbeat-based, one leader per client:
//! - `claim` succeeds when no leader is known, the known one is stale
//!   (`now - last_heartbeat > leader_timeout`), or we already lead
//! - the leader re-announces its [`LeaderState`] every heartbeat interval
//! - two leaders that see each other resolve deterministically: the one with
//!   the greater `(claimed_at, leader_id)` stays, the other demotes
//! - followers only mirror the leader's session state
//!
//! Pure state machine; the hub sends what it returns and feeds it what
//! arrives.

use crate::config::LeaderConfig;
use crate::error::{Result, SyncError};
use crate::message::{ChannelEvent, LeaderState, SessionState};
use crate::origin::OriginId;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

/// What an incoming message did to the local role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// We were leader and another claim outranked ours.
    Demoted { by: OriginId },
    /// A (new) leader is now known.
    LeaderObserved { leader: OriginId },
    /// The known leader stepped down.
    LeaderReleased { leader: OriginId },
}

fn rank(state: &LeaderState) -> (u64, OriginId) {
    (state.claimed_at, state.leader_id)
}

pub struct LeaderElection {
    own_id: OriginId,
    config: LeaderConfig,
    role: Role,
    /// Our own announcement while leading, the mirrored one otherwise.
    known: Option<LeaderState>,
    /// Session state kept across leader changes so a new leader continues it.
    session: SessionState,
}

impl LeaderElection {
    pub fn new(own_id: OriginId, config: LeaderConfig) -> Self {
        Self {
            own_id,
            config,
            role: Role::Follower,
            known: None,
            session: SessionState::default(),
        }
    }

    pub fn own_id(&self) -> OriginId {
        self.own_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn leader(&self) -> Option<&LeaderState> {
        self.known.as_ref()
    }

    pub fn session_state(&self) -> &SessionState {
        &self.session
    }

    /// No leader known, or its last heartbeat is older than the timeout.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        match &self.known {
            None => true,
            Some(state) => now_ms.saturating_sub(state.last_heartbeat) > self.config.leader_timeout_ms,
        }
    }

    /// Watchdog check for followers: forget a leader whose heartbeat timed
    /// out. Returns true when the session is unowned and may be claimed.
    pub fn check_staleness(&mut self, now_ms: u64) -> bool {
        if self.is_leader() || !self.is_stale(now_ms) {
            return false;
        }
        if let Some(old) = self.known.take() {
            info!("Session leader {} timed out", old.leader_id);
        }
        true
    }

    /// Try to become leader. Returns the announcement to broadcast as a
    /// `SessionClaim`, or `None` while another leader is alive.
    pub fn claim(&mut self, now_ms: u64) -> Option<LeaderState> {
        if self.is_leader() {
            return self.heartbeat(now_ms);
        }
        if !self.is_stale(now_ms) {
            debug!(
                "Claim refused, {} is alive",
                self.known.as_ref().map(|l| l.leader_id.to_string()).unwrap_or_default()
            );
            return None;
        }

        info!("{} claimed session leadership", self.own_id);
        let state = LeaderState {
            leader_id: self.own_id,
            last_heartbeat: now_ms,
            claimed_at: now_ms,
            session_state: self.session.clone(),
        };
        self.role = Role::Leader;
        self.known = Some(state.clone());
        Some(state)
    }

    /// Refresh our announcement. `None` when not leading.
    pub fn heartbeat(&mut self, now_ms: u64) -> Option<LeaderState> {
        if !self.is_leader() {
            return None;
        }
        let state = self.known.as_mut()?;
        state.last_heartbeat = now_ms;
        state.session_state = self.session.clone();
        Some(state.clone())
    }

    /// Replace the session state. Only the leader may.
    pub fn set_session_state(&mut self, session: SessionState, now_ms: u64) -> Result<LeaderState> {
        if !self.is_leader() {
            return Err(SyncError::NotLeader);
        }
        self.session = session;
        self.heartbeat(now_ms).ok_or(SyncError::NotLeader)
    }

    /// Step down. Returns our id for a `SessionReleased` broadcast.
    pub fn release(&mut self) -> Option<OriginId> {
        if !self.is_leader() {
            return None;
        }
        info!("{} released session leadership", self.own_id);
        self.role = Role::Follower;
        self.known = None;
        Some(self.own_id)
    }

    /// Apply a session message from another process.
    pub fn on_message(&mut self, event: &ChannelEvent) -> Option<Transition> {
        match event {
            ChannelEvent::SessionClaim(incoming) | ChannelEvent::SessionHeartbeat(incoming) => {
                self.on_announcement(incoming)
            }
            ChannelEvent::SessionReleased { leader_id } => {
                let is_known = self.known.as_ref().map(|k| k.leader_id) == Some(*leader_id);
                if is_known && *leader_id != self.own_id {
                    self.known = None;
                    return Some(Transition::LeaderReleased { leader: *leader_id });
                }
                None
            }
            _ => None,
        }
    }

    fn on_announcement(&mut self, incoming: &LeaderState) -> Option<Transition> {
        if incoming.leader_id == self.own_id {
            return None;
        }

        match (&self.role, &self.known) {
            (Role::Leader, Some(mine)) => {
                if rank(incoming) > rank(mine) {
                    info!(
                        "{} demoted: {} holds the newer claim",
                        self.own_id, incoming.leader_id
                    );
                    self.role = Role::Follower;
                    self.adopt(incoming);
                    Some(Transition::Demoted {
                        by: incoming.leader_id,
                    })
                } else {
                    None
                }
            }
            (Role::Follower, Some(current))
                if current.leader_id != incoming.leader_id
                    && current.last_heartbeat >= incoming.last_heartbeat.saturating_sub(self.config.leader_timeout_ms)
                    && rank(incoming) < rank(current) =>
            {
                // Outranked leader that has not noticed yet
                None
            }
            _ => {
                let changed = self.known.as_ref().map(|k| k.leader_id) != Some(incoming.leader_id);
                self.adopt(incoming);
                changed.then_some(Transition::LeaderObserved {
                    leader: incoming.leader_id,
                })
            }
        }
    }

    fn adopt(&mut self, incoming: &LeaderState) {
        self.session = incoming.session_state.clone();
        self.known = Some(incoming.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn election(id: u64) -> LeaderElection {
        LeaderElection::new(OriginId::from(id), LeaderConfig::default())
    }

    fn deliver(to: &mut LeaderElection, state: Option<LeaderState>, claim: bool) {
        if let Some(state) = state {
            let event = if claim {
                ChannelEvent::SessionClaim(state)
            } else {
                ChannelEvent::SessionHeartbeat(state)
            };
            to.on_message(&event);
        }
    }

    #[test]
    fn test_first_claim_wins_when_no_leader() {
        let mut a = election(1);
        let mut b = election(2);

        let claim = a.claim(0);
        assert!(claim.is_some());
        deliver(&mut b, claim, true);

        assert!(b.claim(1_000).is_none());
        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert_eq!(b.leader().unwrap().leader_id, OriginId::from(1));
    }

    #[test]
    fn test_simultaneous_claims_leave_exactly_one_leader() {
        let mut a = election(1);
        let mut b = election(2);

        // Same tick, neither has seen the other
        let claim_a = a.claim(0);
        let claim_b = b.claim(0);
        deliver(&mut a, claim_b, true);
        deliver(&mut b, claim_a, true);

        // Step the frozen clock through several heartbeat rounds
        for step in 1..=5u64 {
            let now = step * 2_000;
            let hb_a = a.heartbeat(now);
            let hb_b = b.heartbeat(now);
            deliver(&mut a, hb_b, false);
            deliver(&mut b, hb_a, false);
        }

        let leaders = [a.is_leader(), b.is_leader()].iter().filter(|l| **l).count();
        assert_eq!(leaders, 1);
        // Ties on claimed_at go to the larger id
        assert!(b.is_leader());
        assert_eq!(a.leader().unwrap().leader_id, OriginId::from(2));
    }

    #[test]
    fn test_newer_claim_demotes_leader() {
        let mut a = election(9);
        a.claim(0);

        let newer = LeaderState {
            leader_id: OriginId::from(1),
            last_heartbeat: 6_000,
            claimed_at: 6_000,
            session_state: SessionState::default(),
        };
        let transition = a.on_message(&ChannelEvent::SessionClaim(newer));
        assert_eq!(
            transition,
            Some(Transition::Demoted {
                by: OriginId::from(1)
            })
        );
        assert!(!a.is_leader());
    }

    #[test]
    fn test_follower_reclaims_after_timeout() {
        let mut a = election(1);
        let mut b = election(2);
        deliver(&mut b, a.claim(0), true);
        deliver(&mut b, a.heartbeat(2_000), false);

        // Leader goes silent
        assert!(!b.is_stale(7_000));
        assert!(b.claim(7_000).is_none());
        assert!(b.is_stale(7_001));
        assert!(b.claim(7_001).is_some());
        assert!(b.is_leader());

        // The old leader comes back and yields to the newer claim
        let b_state = b.heartbeat(7_500);
        deliver(&mut a, b_state, false);
        assert!(!a.is_leader());
    }

    #[test]
    fn test_follower_mirrors_session_and_cannot_mutate() {
        let mut a = election(1);
        let mut b = election(2);
        deliver(&mut b, a.claim(0), true);

        let session = SessionState {
            task_id: Some("t1".into()),
            running: true,
            started_at: Some(100),
            accumulated_ms: 0,
        };
        let announced = a.set_session_state(session.clone(), 100).unwrap();
        deliver(&mut b, Some(announced), false);

        assert_eq!(b.session_state(), &session);
        assert!(matches!(
            b.set_session_state(SessionState::default(), 200),
            Err(SyncError::NotLeader)
        ));
    }

    #[test]
    fn test_check_staleness_forgets_silent_leader() {
        let mut a = election(1);
        let mut b = election(2);
        deliver(&mut b, a.claim(0), true);

        assert!(!b.check_staleness(5_000));
        assert!(b.leader().is_some());
        assert!(b.check_staleness(5_001));
        assert!(b.leader().is_none());

        // A leader never considers itself stale
        assert!(!a.check_staleness(60_000));
    }

    #[test]
    fn test_release_clears_leader_for_followers() {
        let mut a = election(1);
        let mut b = election(2);
        deliver(&mut b, a.claim(0), true);

        let released = a.release().unwrap();
        let transition = b.on_message(&ChannelEvent::SessionReleased {
            leader_id: released,
        });
        assert!(matches!(transition, Some(Transition::LeaderReleased { .. })));
        assert!(b.is_stale(1));
        assert!(b.claim(1).is_some());
    }
}
