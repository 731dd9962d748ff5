//! Processing claims
//!
//! A claim marks "a pipeline is assigned to this participant". The claim set
//! is the only place the one-pipeline-per-participant rule is enforced, so
//! acquiring a claim is a single insert-if-absent on the map entry.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Identity of a claim: one participant inside one session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    pub session: String,
    pub participant: String,
}

impl ClaimKey {
    pub fn new(session: &str, participant: &str) -> Self {
        Self {
            session: session.to_string(),
            participant: participant.to_string(),
        }
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.participant)
    }
}

#[derive(Debug, Clone, Copy)]
struct ClaimEntry {
    id: u64,
    claimed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ParticipantTracker {
    claims: DashMap<ClaimKey, ClaimEntry>,
    next_id: AtomicU64,
}

impl ParticipantTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Claim a participant. Returns false, changing nothing, if already claimed.
    pub fn try_claim(&self, session: &str, participant: &str) -> bool {
        self.acquire(ClaimKey::new(session, participant)).is_some()
    }

    fn acquire(&self, key: ClaimKey) -> Option<u64> {
        match self.claims.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                slot.insert(ClaimEntry {
                    id,
                    claimed_at: Utc::now(),
                });
                Some(id)
            }
        }
    }

    /// Drop a claim. Returns whether one existed.
    pub fn release(&self, session: &str, participant: &str) -> bool {
        self.claims
            .remove(&ClaimKey::new(session, participant))
            .is_some()
    }

    /// Claim a participant and get a guard that releases on drop
    pub fn claim(self: &Arc<Self>, session: &str, participant: &str) -> Option<Claim> {
        let key = ClaimKey::new(session, participant);
        let id = self.acquire(key.clone())?;
        Some(Claim {
            tracker: Arc::clone(self),
            key,
            id,
        })
    }

    /// When the participant was claimed, if it is
    pub fn claimed_at(&self, session: &str, participant: &str) -> Option<DateTime<Utc>> {
        self.claims
            .get(&ClaimKey::new(session, participant))
            .map(|entry| entry.claimed_at)
    }

    pub fn is_claimed(&self, session: &str, participant: &str) -> bool {
        self.claims.contains_key(&ClaimKey::new(session, participant))
    }

    /// Participants currently claimed in a session
    pub fn claimed_in(&self, session: &str) -> Vec<String> {
        let mut participants: Vec<String> = self
            .claims
            .iter()
            .filter(|entry| entry.key().session == session)
            .map(|entry| entry.key().participant.clone())
            .collect();
        participants.sort();
        participants
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

/// A held claim. Dropping it releases the claim.
#[derive(Debug)]
pub struct Claim {
    tracker: Arc<ParticipantTracker>,
    key: ClaimKey,
    id: u64,
}

impl Claim {
    pub fn key(&self) -> &ClaimKey {
        &self.key
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        // Only remove the entry this guard created; a later claim on the same key survives
        let id = self.id;
        if self.tracker.claims.remove_if(&self.key, |_, entry| entry.id == id).is_some() {
            debug!("Released claim {}", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_refused() {
        let tracker = ParticipantTracker::new();
        assert!(tracker.try_claim("r1", "alice"));
        assert!(!tracker.try_claim("r1", "alice"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_claims_are_scoped_by_session() {
        let tracker = ParticipantTracker::new();
        assert!(tracker.try_claim("r1", "alice"));
        assert!(tracker.try_claim("r2", "alice"));
        assert_eq!(tracker.claimed_in("r1"), vec!["alice"]);
    }

    #[test]
    fn test_release_of_unknown_key_is_noop() {
        let tracker = ParticipantTracker::new();
        assert!(!tracker.release("r1", "nobody"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let tracker = ParticipantTracker::new_shared();
        let claim = tracker.claim("r1", "alice").unwrap();
        assert!(tracker.claim("r1", "alice").is_none());

        drop(claim);
        assert!(!tracker.is_claimed("r1", "alice"));
        assert!(tracker.try_claim("r1", "alice"));
    }

    #[test]
    fn test_stale_guard_does_not_release_newer_claim() {
        let tracker = ParticipantTracker::new_shared();
        let stale = tracker.claim("r1", "alice").unwrap();
        assert!(tracker.release("r1", "alice"));

        let fresh = tracker.claim("r1", "alice").unwrap();
        drop(stale);
        assert!(tracker.is_claimed("r1", "alice"));

        drop(fresh);
        assert!(!tracker.is_claimed("r1", "alice"));
    }
}
