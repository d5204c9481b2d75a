//! # Property-Based Test Generators
//!
//! Composable `proptest` strategies for generating valid and adversarial
//! session inputs for the proof-of-service contract.
//!
//! ## Design Decisions
//!
//! - Generators produce *semantic* values (names, PINs, month buckets, action
//!   sequences), not raw bytes, so tests exercise real validation paths.
//! - Boundary weights are tuned: month buckets favour the first and last
//!   accepted years and months.
//! - Invalid-input generators keep `kind` and `status` as legal symbol text so
//!   failures come from the contract, never from symbol construction.

extern crate std;

use proof_of_service::{ATTENDANCE_STATUSES, THERAPY_KINDS};
use proptest::prelude::*;
use std::string::String;
use std::vec::Vec;

use super::{Beneficiary, SessionSpec};

// ── Scalar Generators ────────────────────────────────────────────────────────

/// Beneficiary names: letters (including accented ones) and inner spaces.
pub fn name_strategy() -> impl Strategy<Value = String> {
    "[A-Za-zÁÉÍÓÚÑáéíóúñ][A-Za-zÁÉÍÓÚÑáéíóúñ ]{0,59}"
}

/// PINs the contract accepts: 1 to 6 ASCII digits.
pub fn pin_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        1 => "[0-9]",
        1 => "[0-9]{6}",
        6 => "[0-9]{1,6}",
    ]
}

/// PINs the contract rejects: empty, too long, or not all digits.
pub fn invalid_pin_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        2 => Just(String::new()),
        3 => "[0-9]{7,12}",
        5 => "[0-9]{0,2}[A-Za-z -][0-9]{0,3}",
    ]
}

pub fn beneficiary_strategy() -> impl Strategy<Value = Beneficiary> {
    (name_strategy(), pin_strategy()).prop_map(|(name, pin)| Beneficiary { name, pin })
}

pub fn kind_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(THERAPY_KINDS.to_vec())
}

pub fn status_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(ATTENDANCE_STATUSES.to_vec())
}

/// Symbol text outside the therapy-kind vocabulary.
pub fn unknown_kind_strategy() -> impl Strategy<Value = String> {
    "[A-Z_]{1,14}".prop_filter("must not be a therapy kind", |k| {
        !THERAPY_KINDS.contains(&k.as_str())
    })
}

/// Symbol text outside the attendance vocabulary.
pub fn unknown_status_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        // Lower-case spellings of real statuses must still be rejected.
        2 => prop::sample::select(ATTENDANCE_STATUSES.to_vec()).prop_map(str::to_lowercase),
        8 => "[A-Z_]{1,14}".prop_filter("must not be a status", |s| {
            !ATTENDANCE_STATUSES.contains(&s.as_str())
        }),
    ]
}

/// Valid `yyyymm` buckets, biased toward the edges of the accepted range.
pub fn yyyymm_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![
        1 => Just(200001u32),
        1 => Just(210012u32),
        1 => (2000u32..=2100u32).prop_map(|y| y * 100 + 12),
        7 => (2000u32..=2100u32, 1u32..=12u32).prop_map(|(y, m)| y * 100 + m),
    ]
}

/// `yyyymm` values the contract rejects.
pub fn invalid_yyyymm_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![
        2 => (2000u32..=2100u32).prop_map(|y| y * 100),
        2 => (2000u32..=2100u32, 13u32..=99u32).prop_map(|(y, m)| y * 100 + m),
        2 => (0u32..2000u32, 1u32..=12u32).prop_map(|(y, m)| y * 100 + m),
        2 => (2101u32..=9999u32, 1u32..=12u32).prop_map(|(y, m)| y * 100 + m),
        1 => Just(0u32),
        1 => Just(u32::MAX),
    ]
}

/// Ledger time jumps, in seconds.
pub fn time_delta_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![
        1 => Just(0u64),
        3 => (1u64..=3_600u64),          // within the hour
        3 => (3_600u64..=86_400u64),     // within the day
        2 => (86_400u64..=2_678_400u64), // up to a month
    ]
}

// ── Session Generators ───────────────────────────────────────────────────────

/// A session the contract must accept from an allow-listed therapist.
pub fn valid_session_strategy() -> impl Strategy<Value = SessionSpec> {
    (
        beneficiary_strategy(),
        kind_strategy(),
        status_strategy(),
        yyyymm_strategy(),
    )
        .prop_map(|(beneficiary, kind, status, yyyymm)| SessionSpec {
            beneficiary,
            kind: kind.into(),
            status: status.into(),
            yyyymm,
        })
}

/// A session with exactly one invalid field.
pub fn invalid_session_strategy() -> impl Strategy<Value = SessionSpec> {
    prop_oneof![
        (valid_session_strategy(), invalid_pin_strategy()).prop_map(|(mut s, pin)| {
            s.beneficiary.pin = pin;
            s
        }),
        valid_session_strategy().prop_map(|mut s| {
            s.beneficiary.name = String::new();
            s
        }),
        (valid_session_strategy(), unknown_kind_strategy()).prop_map(|(mut s, kind)| {
            s.kind = kind;
            s
        }),
        (valid_session_strategy(), unknown_status_strategy()).prop_map(|(mut s, status)| {
            s.status = status;
            s
        }),
        (valid_session_strategy(), invalid_yyyymm_strategy()).prop_map(|(mut s, yyyymm)| {
            s.yyyymm = yyyymm;
            s
        }),
    ]
}

// ── Action Sequence Generators ───────────────────────────────────────────────

/// An action against the contract, expressed in terms of participant indices
/// so sequences stay meaningful for any [`Cast`](super::Cast) size.
#[derive(Debug, Clone)]
pub enum SessionAction {
    Record {
        therapist_index: usize,
        beneficiary_index: usize,
        period_index: usize,
        kind: &'static str,
        status: &'static str,
    },
    RecordInvalid {
        therapist_index: usize,
        session: SessionSpec,
    },
    SetTherapist {
        therapist_index: usize,
        active: bool,
    },
    AdvanceTime {
        delta: u64,
    },
}

impl SessionAction {
    /// The contract entry point the action invokes, if any.
    pub fn entry_point(&self) -> Option<&'static str> {
        match self {
            SessionAction::Record { .. } | SessionAction::RecordInvalid { .. } => {
                Some("record_session")
            }
            SessionAction::SetTherapist { .. } => Some("set_therapist"),
            SessionAction::AdvanceTime { .. } => None,
        }
    }
}

/// Single action, weighted toward valid recordings.
///
/// Weights:
///   50% → valid record
///   15% → invalid record
///   20% → allow-list change (mostly re-activation)
///   15% → time advance
pub fn session_action_strategy(
    num_therapists: usize,
    num_beneficiaries: usize,
    num_periods: usize,
) -> impl Strategy<Value = SessionAction> {
    let therapist = 0..num_therapists.max(1);
    let beneficiary = 0..num_beneficiaries.max(1);
    let period = 0..num_periods.max(1);

    prop_oneof![
        50 => (therapist.clone(), beneficiary, period, kind_strategy(), status_strategy())
            .prop_map(|(t, b, p, kind, status)| SessionAction::Record {
                therapist_index: t,
                beneficiary_index: b,
                period_index: p,
                kind,
                status,
            }),
        15 => (therapist.clone(), invalid_session_strategy())
            .prop_map(|(t, session)| SessionAction::RecordInvalid { therapist_index: t, session }),
        20 => (therapist, prop::bool::weighted(0.6))
            .prop_map(|(t, active)| SessionAction::SetTherapist { therapist_index: t, active }),
        15 => time_delta_strategy().prop_map(|delta| SessionAction::AdvanceTime { delta }),
    ]
}

/// Sequence of `min_len..=max_len` actions.
pub fn session_action_sequence(
    min_len: usize,
    max_len: usize,
    num_therapists: usize,
    num_beneficiaries: usize,
    num_periods: usize,
) -> impl Strategy<Value = Vec<SessionAction>> {
    prop::collection::vec(
        session_action_strategy(num_therapists, num_beneficiaries, num_periods),
        min_len..=max_len,
    )
}
