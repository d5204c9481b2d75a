//! # State Invariant Definitions & Verification
//!
//! Defines invariants that must hold across all proof-of-service state
//! transitions. Invariants are checked after every action of a randomized
//! sequence and can be composed via the `InvariantSet` builder.
//!
//! ## Complexity
//!
//! - Counter/session agreement is O(c·s) for c tracked counters and s stored
//!   sessions. Sequences in the test suite keep both below a few hundred.

extern crate std;

use std::boxed::Box;
use std::string::String;
use std::vec::Vec;

use super::ProofSnapshot;

// ── Invariant Trait ──────────────────────────────────────────────────────────

/// A named invariant that can be verified against a state snapshot.
pub trait Invariant {
    /// Human-readable name for error messages.
    fn name(&self) -> &str;

    /// Check the invariant. Returns `Ok(())` on success, `Err(description)` on violation.
    fn check(&self, snapshot: &ProofSnapshot) -> Result<(), String>;
}

// ── Built-in Invariants ──────────────────────────────────────────────────────

/// **Sequential Ids**: every id in `1..=session_count` is stored, in order.
///
/// A gap means an id was handed out for a session that was never written.
pub struct SequentialSessionIds;

impl Invariant for SequentialSessionIds {
    fn name(&self) -> &str {
        "session ids are 1..=session_count"
    }

    fn check(&self, snapshot: &ProofSnapshot) -> Result<(), String> {
        if !snapshot.missing_ids.is_empty() {
            return Err(std::format!(
                "session_count is {} but ids {:?} are missing",
                snapshot.session_count,
                snapshot.missing_ids
            ));
        }
        for (index, session) in snapshot.sessions.iter().enumerate() {
            let expected = index as u32 + 1;
            if session.id != expected {
                return Err(std::format!(
                    "session stored under id {} reports id {}",
                    expected,
                    session.id
                ));
            }
        }
        Ok(())
    }
}

/// **Counter Agreement**: each monthly counter equals the number of stored
/// sessions with the same beneficiary, month and kind.
pub struct CountersMatchSessions;

impl Invariant for CountersMatchSessions {
    fn name(&self) -> &str {
        "monthly counter == matching sessions"
    }

    fn check(&self, snapshot: &ProofSnapshot) -> Result<(), String> {
        for counter in &snapshot.counters {
            let stored = snapshot.sessions_for(counter);
            if counter.count != stored {
                return Err(std::format!(
                    "counter for {} in {} reads {} but {} sessions are stored",
                    counter.kind,
                    counter.yyyymm,
                    counter.count,
                    stored
                ));
            }
        }
        Ok(())
    }
}

/// **Counter Bound**: tracked counters never sum past the session count.
pub struct CountersWithinSessionCount;

impl Invariant for CountersWithinSessionCount {
    fn name(&self) -> &str {
        "sum(monthly counters) <= session_count"
    }

    fn check(&self, snapshot: &ProofSnapshot) -> Result<(), String> {
        let sum = snapshot.sum_counters();
        if sum > snapshot.session_count {
            return Err(std::format!(
                "counters sum to {} with only {} sessions recorded",
                sum,
                snapshot.session_count
            ));
        }
        Ok(())
    }
}

/// **Known Vocabulary**: stored sessions only carry accepted kinds, statuses
/// and month buckets.
pub struct StoredSessionsAreValid;

impl Invariant for StoredSessionsAreValid {
    fn name(&self) -> &str {
        "stored sessions use the contract vocabulary"
    }

    fn check(&self, snapshot: &ProofSnapshot) -> Result<(), String> {
        for session in &snapshot.sessions {
            if session.kind.is_none() || session.status.is_none() {
                return Err(std::format!(
                    "session {} has an unknown kind or status",
                    session.id
                ));
            }
            let (year, month) = (session.yyyymm / 100, session.yyyymm % 100);
            if !(2000..=2100).contains(&year) || !(1..=12).contains(&month) {
                return Err(std::format!(
                    "session {} has invalid month bucket {}",
                    session.id,
                    session.yyyymm
                ));
            }
        }
        Ok(())
    }
}

/// **No Future Timestamps**: a session is never stamped after the ledger's
/// current time.
pub struct TimestampsNotInFuture;

impl Invariant for TimestampsNotInFuture {
    fn name(&self) -> &str {
        "session timestamps <= ledger time"
    }

    fn check(&self, snapshot: &ProofSnapshot) -> Result<(), String> {
        for session in &snapshot.sessions {
            if session.timestamp > snapshot.timestamp {
                return Err(std::format!(
                    "session {} stamped {} after ledger time {}",
                    session.id,
                    session.timestamp,
                    snapshot.timestamp
                ));
            }
        }
        Ok(())
    }
}

// ── Invariant Set ────────────────────────────────────────────────────────────

/// A composable collection of invariants checked together.
pub struct InvariantSet {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantSet {
    /// Empty set.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// The standard invariants for the proof-of-service contract.
    pub fn proof_of_service_defaults() -> Self {
        let mut set = Self::new();
        set.add(Box::new(SequentialSessionIds));
        set.add(Box::new(CountersMatchSessions));
        set.add(Box::new(CountersWithinSessionCount));
        set.add(Box::new(StoredSessionsAreValid));
        set.add(Box::new(TimestampsNotInFuture));
        set
    }

    /// Add a custom invariant.
    pub fn add(&mut self, invariant: Box<dyn Invariant>) {
        self.invariants.push(invariant);
    }

    /// Check all invariants and return `(name, message)` for each violation.
    pub fn check_all(&self, snapshot: &ProofSnapshot) -> Vec<(String, String)> {
        self.invariants
            .iter()
            .filter_map(|inv| {
                inv.check(snapshot)
                    .err()
                    .map(|msg| (String::from(inv.name()), msg))
            })
            .collect()
    }

    /// Panic with a readable report if any invariant is violated.
    pub fn assert_all(&self, snapshot: &ProofSnapshot) {
        let violations = self.check_all(snapshot);
        if !violations.is_empty() {
            let mut report = String::from("Invariant violations:\n");
            for (name, msg) in &violations {
                report.push_str(&std::format!("  ✗ [{}]: {}\n", name, msg));
            }
            panic!("{}", report);
        }
    }

    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

impl Default for InvariantSet {
    fn default() -> Self {
        Self::new()
    }
}

// ── Transition Invariants ────────────────────────────────────────────────────

/// An invariant over a pair of consecutive snapshots.
pub trait TransitionInvariant {
    fn name(&self) -> &str;

    fn check(&self, before: &ProofSnapshot, after: &ProofSnapshot) -> Result<(), String>;
}

/// **Append Only**: the session count never decreases and grows by at most
/// one per action.
pub struct AppendOnlyCount;

impl TransitionInvariant for AppendOnlyCount {
    fn name(&self) -> &str {
        "session_count grows by 0 or 1"
    }

    fn check(&self, before: &ProofSnapshot, after: &ProofSnapshot) -> Result<(), String> {
        if after.session_count < before.session_count
            || after.session_count > before.session_count.saturating_add(1)
        {
            return Err(std::format!(
                "session_count went from {} to {}",
                before.session_count,
                after.session_count
            ));
        }
        Ok(())
    }
}

/// **Immutable Sessions**: a stored session never changes.
pub struct SessionsImmutable;

impl TransitionInvariant for SessionsImmutable {
    fn name(&self) -> &str {
        "stored sessions never change"
    }

    fn check(&self, before: &ProofSnapshot, after: &ProofSnapshot) -> Result<(), String> {
        for old in &before.sessions {
            match after.sessions.iter().find(|s| s.id == old.id) {
                Some(new) if new == old => {}
                Some(_) => return Err(std::format!("session {} was rewritten", old.id)),
                None => return Err(std::format!("session {} disappeared", old.id)),
            }
        }
        Ok(())
    }
}

/// **Monotonic Counters**: monthly counters never decrease.
///
/// Both snapshots must track the same beneficiaries and months.
pub struct CountersMonotonic;

impl TransitionInvariant for CountersMonotonic {
    fn name(&self) -> &str {
        "monthly counters never decrease"
    }

    fn check(&self, before: &ProofSnapshot, after: &ProofSnapshot) -> Result<(), String> {
        for (old, new) in before.counters.iter().zip(after.counters.iter()) {
            if new.count < old.count {
                return Err(std::format!(
                    "counter for {} in {} dropped from {} to {}",
                    old.kind,
                    old.yyyymm,
                    old.count,
                    new.count
                ));
            }
        }
        Ok(())
    }
}

pub struct TransitionInvariantSet {
    invariants: Vec<Box<dyn TransitionInvariant>>,
}

impl TransitionInvariantSet {
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    pub fn proof_of_service_defaults() -> Self {
        let mut set = Self::new();
        set.add(Box::new(AppendOnlyCount));
        set.add(Box::new(SessionsImmutable));
        set.add(Box::new(CountersMonotonic));
        set
    }

    pub fn add(&mut self, invariant: Box<dyn TransitionInvariant>) {
        self.invariants.push(invariant);
    }

    pub fn check_all(&self, before: &ProofSnapshot, after: &ProofSnapshot) -> Vec<(String, String)> {
        self.invariants
            .iter()
            .filter_map(|inv| {
                inv.check(before, after)
                    .err()
                    .map(|msg| (String::from(inv.name()), msg))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

impl Default for TransitionInvariantSet {
    fn default() -> Self {
        Self::new()
    }
}
