//! # Contract Testing Framework: Integration Tests
//!
//! Tests exercising the proof-of-service contract through the framework:
//! - Property-based testing with invariant verification
//! - Randomized action sequences
//! - Scenario DSL
//! - Invariant self-checks against tampered snapshots

extern crate std;

use proof_of_service::ContractError;
use proptest::prelude::*;
use soroban_sdk::testutils::Address as _;
use soroban_sdk::Address;

use test_framework::generators::*;
use test_framework::invariants::*;
use test_framework::scenario_dsl::{run_scenarios, Scenario};
use test_framework::*;

fn fixtures() -> std::vec::Vec<Beneficiary> {
    std::vec![
        Beneficiary::new("Ana Gomez", "1234"),
        Beneficiary::new("Luis Perez", "77"),
        Beneficiary::new("María Ñúñez", "000001"),
    ]
}

fn periods() -> std::vec::Vec<u32> {
    std::vec![202501, 202502, 210012]
}

// ═════════════════════════════════════════════════════════════════════════════
//  Property-Based Tests
// ═════════════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// **Property**: A valid session from an allow-listed therapist is stored
    /// under the next id and bumps exactly one monthly counter.
    #[test]
    fn prop_valid_session_is_counted(session in valid_session_strategy()) {
        let mut env = TestEnv::new();
        let harness = ProofOfServiceHarness::new(&mut env);
        let therapist = harness.add_therapist();

        let before = harness.monthly_count(&session.beneficiary, session.yyyymm, &session.kind);
        let id = harness.record(&therapist, &session);
        let after = harness.monthly_count(&session.beneficiary, session.yyyymm, &session.kind);

        prop_assert_eq!(id, 1);
        prop_assert_eq!(after, before + 1);
        prop_assert_eq!(harness.session_count(), 1);
    }

    /// **Property**: Sessions with any single invalid field are rejected with
    /// `InvalidInput` and leave no trace.
    #[test]
    fn prop_invalid_session_rejected(session in invalid_session_strategy()) {
        let mut env = TestEnv::new();
        let harness = ProofOfServiceHarness::new(&mut env);
        let therapist = harness.add_therapist();

        let result = harness.try_record(&therapist, &session);

        prop_assert_eq!(result, Err(ContractError::InvalidInput),
            "session {:?} should have been rejected", session);
        prop_assert_eq!(harness.session_count(), 0);
    }

    /// **Property**: Only allow-listed addresses can record, whatever the input.
    #[test]
    fn prop_unlisted_therapist_rejected(session in valid_session_strategy()) {
        let mut env = TestEnv::new();
        let harness = ProofOfServiceHarness::new(&mut env);
        let stranger = Address::generate(&harness.env.env);

        let result = harness.try_record(&stranger, &session);

        prop_assert_eq!(result, Err(ContractError::TherapistNotAuthorized));
        prop_assert_eq!(harness.session_count(), 0);
    }

    /// **Property**: The beneficiary id stored with a session is the salted
    /// hash of exactly the supplied name and PIN.
    #[test]
    fn prop_beneficiary_id_is_salted_hash(
        session in valid_session_strategy(),
        salt in any::<[u8; 32]>(),
    ) {
        let mut env = TestEnv::new();
        let harness = ProofOfServiceHarness::with_salt(&mut env, salt);
        let therapist = harness.add_therapist();

        let id = harness.record(&therapist, &session);
        let stored = harness.client.get_session(&id);

        prop_assert_eq!(stored.beneficiary_id, harness.beneficiary_id(&session.beneficiary));
    }

    /// **Property**: Invariants hold after arbitrary action sequences.
    #[test]
    fn prop_invariants_hold_under_random_actions(
        actions in session_action_sequence(3, 20, 2, 3, 3),
    ) {
        let mut env = TestEnv::new();
        let harness = ProofOfServiceHarness::new(&mut env);
        let cast = Cast::assemble(&harness, 2, fixtures(), periods());

        let summary = run_sequence(
            &harness,
            &cast,
            &actions,
            &InvariantSet::proof_of_service_defaults(),
            &TransitionInvariantSet::proof_of_service_defaults(),
            true,
        );

        prop_assert!(summary.passed(),
            "Invariant violations: {:?}", summary.invariant_violations);
        prop_assert_eq!(summary.actions_executed, actions.len());
    }
}

// ═════════════════════════════════════════════════════════════════════════════
//  Invariant Tests
// ═════════════════════════════════════════════════════════════════════════════

#[test]
fn test_all_invariants_hold_on_fresh_contract() {
    let mut env = TestEnv::new();
    let harness = ProofOfServiceHarness::new(&mut env);

    let snapshot = harness.snapshot(&fixtures(), &periods());

    assert_eq!(snapshot.session_count, 0);
    assert_eq!(snapshot.counters.len(), 3 * 3 * 4);
    InvariantSet::proof_of_service_defaults().assert_all(&snapshot);
}

#[test]
fn test_invariants_across_therapists_and_months() {
    let mut env = TestEnv::new();
    let harness = ProofOfServiceHarness::new(&mut env);
    let invariants = InvariantSet::proof_of_service_defaults();
    let first = harness.add_therapist();
    let second = harness.add_therapist();
    let [ana, luis, _] = <[Beneficiary; 3]>::try_from(fixtures()).unwrap();

    harness.env.set_timestamp(1_735_689_600);
    let session = |b: &Beneficiary, kind: &str, status: &str, yyyymm| {
        SessionSpec::new(&b.name, &b.pin, kind, status, yyyymm)
    };

    harness.record(&first, &session(&ana, "KINESIO", "COMPLETADA", 202501));
    invariants.assert_all(&harness.snapshot(&fixtures(), &periods()));

    harness.record(&second, &session(&ana, "KINESIO", "NO_ASISTIO", 202501));
    harness.env.advance_time(86_400);
    harness.record(&first, &session(&luis, "PSICO", "CANCELADA", 202502));
    invariants.assert_all(&harness.snapshot(&fixtures(), &periods()));

    assert_eq!(harness.monthly_count(&ana, 202501, "KINESIO"), 2);
    assert_eq!(harness.monthly_count(&ana, 202502, "KINESIO"), 0);
    assert_eq!(harness.monthly_count(&luis, 202502, "PSICO"), 1);
    assert_eq!(harness.snapshot(&fixtures(), &periods()).sum_counters(), 3);
}

#[test]
fn test_revoked_therapist_cannot_record() {
    let mut env = TestEnv::new();
    let harness = ProofOfServiceHarness::new(&mut env);
    let therapist = harness.add_therapist();
    let session = SessionSpec::new("Ana Gomez", "1234", "FONO", "COMPLETADA", 202503);

    harness.record(&therapist, &session);
    harness.set_therapist(&therapist, false);

    assert!(!harness.is_therapist(&therapist));
    assert_eq!(
        harness.try_record(&therapist, &session),
        Err(ContractError::TherapistNotAuthorized)
    );
    assert_eq!(harness.session_count(), 1);

    harness.set_therapist(&therapist, true);
    assert_eq!(harness.try_record(&therapist, &session), Ok(2));
}

#[test]
fn test_transition_invariants_on_record() {
    let mut env = TestEnv::new();
    let harness = ProofOfServiceHarness::new(&mut env);
    let therapist = harness.add_therapist();
    let transitions = TransitionInvariantSet::proof_of_service_defaults();

    let before = harness.snapshot(&fixtures(), &periods());
    harness.record(
        &therapist,
        &SessionSpec::new("Luis Perez", "77", "OCUPACIONAL", "COMPLETADA", 210012),
    );
    let after = harness.snapshot(&fixtures(), &periods());

    assert!(transitions.check_all(&before, &after).is_empty());
    assert_eq!(after.session_count, before.session_count + 1);
}

#[test]
fn test_rejected_session_is_a_no_op_transition() {
    let mut env = TestEnv::new();
    let harness = ProofOfServiceHarness::new(&mut env);
    let therapist = harness.add_therapist();

    let before = harness.snapshot(&fixtures(), &periods());
    let result = harness.try_record(
        &therapist,
        &SessionSpec::new("Ana Gomez", "12a4", "FONO", "COMPLETADA", 202501),
    );
    let after = harness.snapshot(&fixtures(), &periods());

    assert_eq!(result, Err(ContractError::InvalidInput));
    assert_eq!(before.counters, after.counters);
    assert_eq!(before.session_count, after.session_count);
}

// ═════════════════════════════════════════════════════════════════════════════
//  Invariant Self-Checks
// ═════════════════════════════════════════════════════════════════════════════

fn recorded_snapshot() -> ProofSnapshot {
    let mut env = TestEnv::new();
    let harness = ProofOfServiceHarness::new(&mut env);
    let therapist = harness.add_therapist();
    harness.record(
        &therapist,
        &SessionSpec::new("Ana Gomez", "1234", "KINESIO", "COMPLETADA", 202501),
    );
    harness.record(
        &therapist,
        &SessionSpec::new("Ana Gomez", "1234", "FONO", "CANCELADA", 202502),
    );
    harness.snapshot(&fixtures(), &periods())
}

#[test]
fn test_inflated_counter_is_detected() {
    let mut snapshot = recorded_snapshot();
    assert!(CountersMatchSessions.check(&snapshot).is_ok());

    let counter = snapshot
        .counters
        .iter_mut()
        .find(|c| c.count == 1)
        .unwrap();
    counter.count = 2;

    assert!(CountersMatchSessions.check(&snapshot).is_err());
}

#[test]
fn test_counter_bound_is_detected() {
    let mut snapshot = recorded_snapshot();
    assert!(CountersWithinSessionCount.check(&snapshot).is_ok());

    snapshot.session_count = 1;

    assert!(CountersWithinSessionCount.check(&snapshot).is_err());
}

#[test]
fn test_id_gap_is_detected() {
    let mut snapshot = recorded_snapshot();
    assert!(SequentialSessionIds.check(&snapshot).is_ok());

    snapshot.sessions.remove(0);
    snapshot.missing_ids.push(1);

    assert!(SequentialSessionIds.check(&snapshot).is_err());
}

#[test]
fn test_unknown_vocabulary_is_detected() {
    let mut snapshot = recorded_snapshot();
    snapshot.sessions[1].status = None;
    assert!(StoredSessionsAreValid.check(&snapshot).is_err());

    let mut snapshot = recorded_snapshot();
    snapshot.sessions[0].yyyymm = 202513;
    assert!(StoredSessionsAreValid.check(&snapshot).is_err());
}

#[test]
fn test_future_timestamp_is_detected() {
    let mut snapshot = recorded_snapshot();
    snapshot.sessions[0].timestamp = snapshot.timestamp + 1;
    assert!(TimestampsNotInFuture.check(&snapshot).is_err());
}

#[test]
fn test_rewritten_session_is_detected() {
    let before = recorded_snapshot();
    let mut after = before.clone();
    after.sessions[0].yyyymm = 202512;

    assert!(SessionsImmutable.check(&before, &after).is_err());
    assert!(AppendOnlyCount.check(&before, &after).is_ok());
}

#[test]
fn test_counter_decrease_and_count_jump_are_detected() {
    let before = recorded_snapshot();

    let mut dropped = before.clone();
    let counter = dropped.counters.iter_mut().find(|c| c.count == 1).unwrap();
    counter.count = 0;
    assert!(CountersMonotonic.check(&before, &dropped).is_err());

    let mut jumped = before.clone();
    jumped.session_count += 2;
    assert!(AppendOnlyCount.check(&before, &jumped).is_err());
}

// ═════════════════════════════════════════════════════════════════════════════
//  Sequence Runner Tests
// ═════════════════════════════════════════════════════════════════════════════

#[test]
fn test_sequence_with_revocation_and_invalid_input() {
    let mut env = TestEnv::new();
    let harness = ProofOfServiceHarness::new(&mut env);
    let cast = Cast::assemble(&harness, 2, fixtures(), periods());

    let actions = std::vec![
        SessionAction::Record {
            therapist_index: 0,
            beneficiary_index: 0,
            period_index: 0,
            kind: "KINESIO",
            status: "COMPLETADA",
        },
        SessionAction::AdvanceTime { delta: 3_600 },
        SessionAction::SetTherapist { therapist_index: 1, active: false },
        SessionAction::Record {
            therapist_index: 1,
            beneficiary_index: 1,
            period_index: 1,
            kind: "FONO",
            status: "NO_ASISTIO",
        },
        SessionAction::RecordInvalid {
            therapist_index: 0,
            session: SessionSpec::new("Ana Gomez", "1234567", "FONO", "COMPLETADA", 202501),
        },
        SessionAction::Record {
            therapist_index: 0,
            beneficiary_index: 2,
            period_index: 2,
            kind: "OCUPACIONAL",
            status: "CANCELADA",
        },
    ];

    let summary = run_sequence(
        &harness,
        &cast,
        &actions,
        &InvariantSet::proof_of_service_defaults(),
        &TransitionInvariantSet::proof_of_service_defaults(),
        false,
    );

    assert!(summary.passed(), "Violations: {:?}", summary.invariant_violations);
    assert_eq!(summary.actions_executed, 6);
    assert_eq!(harness.session_count(), 2);
    assert!(summary.entry_points_hit.contains("record_session"));
    assert!(summary.entry_points_hit.contains("set_therapist"));
}

#[test]
fn test_apply_reports_contract_error_codes() {
    let mut env = TestEnv::new();
    let harness = ProofOfServiceHarness::new(&mut env);
    let cast = Cast::assemble(&harness, 1, fixtures(), periods());

    harness.set_therapist(&cast.therapists[0], false);
    let outcome = harness.apply(
        &cast,
        &SessionAction::Record {
            therapist_index: 0,
            beneficiary_index: 0,
            period_index: 0,
            kind: "PSICO",
            status: "COMPLETADA",
        },
    );

    assert_eq!(
        outcome,
        ActionOutcome::ExpectedError(ContractError::TherapistNotAuthorized as u32)
    );
}

#[test]
fn test_sequence_coverage_tracking() {
    let mut env = TestEnv::new();
    let harness = ProofOfServiceHarness::new(&mut env);
    let cast = Cast::assemble(&harness, 1, fixtures(), periods());

    let actions = std::vec![
        SessionAction::Record {
            therapist_index: 0,
            beneficiary_index: 0,
            period_index: 0,
            kind: "PSICO",
            status: "COMPLETADA",
        },
        SessionAction::AdvanceTime { delta: 60 },
    ];

    let summary = run_sequence(
        &harness,
        &cast,
        &actions,
        &InvariantSet::proof_of_service_defaults(),
        &TransitionInvariantSet::proof_of_service_defaults(),
        true,
    );

    let coverage = summary.entry_point_coverage(ENTRY_POINTS.len());
    assert!(
        coverage >= 0.5,
        "Expected at least 50% coverage, got {:.1}%",
        coverage * 100.0
    );
    assert_eq!(summary.transitions_observed, 2);
}

// ═════════════════════════════════════════════════════════════════════════════
//  Scenario DSL Tests
// ═════════════════════════════════════════════════════════════════════════════

#[test]
fn test_scenario_monthly_counter_follows_recordings() {
    Scenario::new("Monthly counter follows recordings")
        .with_invariants(InvariantSet::proof_of_service_defaults())
        .given(|ctx| {
            let therapist = ctx.harness.add_therapist();
            ctx.therapists.push(therapist);
            ctx.track(Beneficiary::new("Ana Gomez", "1234"));
            ctx.periods.push(202503);
        })
        .when("three sessions are recorded in March", |ctx| {
            for status in ["COMPLETADA", "NO_ASISTIO", "CANCELADA"] {
                let session = SessionSpec::new("Ana Gomez", "1234", "FONO", status, 202503);
                let id = ctx.harness.record(&ctx.therapists[0], &session);
                ctx.store("last_id", id);
            }
        })
        .then("every attendance status is counted", |ctx| {
            let ana = ctx.beneficiaries[0].clone();
            assert_eq!(ctx.harness.monthly_count(&ana, 202503, "FONO"), 3);
        })
        .then("ids are sequential", |ctx| {
            assert_eq!(ctx.load("last_id"), 3);
        })
        .run();
}

#[test]
fn test_scenario_session_keeps_ledger_time() {
    Scenario::new("Session keeps ledger time")
        .starting_at(1_735_689_600)
        .given(|ctx| {
            let therapist = ctx.harness.add_therapist();
            ctx.therapists.push(therapist);
        })
        .when("a session is recorded a day later", |ctx| {
            ctx.harness.env.advance_time(86_400);
            let session = SessionSpec::new("Luis", "7", "KINESIO", "COMPLETADA", 202501);
            let id = ctx.harness.record(&ctx.therapists[0], &session);
            ctx.store("id", id);
        })
        .then("the stored timestamp is the ledger time", |ctx| {
            let stored = ctx.harness.client.get_session(&ctx.load("id"));
            assert_eq!(stored.timestamp, 1_735_689_600 + 86_400);
            assert_eq!(stored.therapist, ctx.therapists[0]);
        })
        .run();
}

#[test]
fn test_scenario_salt_separates_beneficiary_ids() {
    Scenario::new("Salt separates beneficiary ids")
        .with_salt([42u8; 32])
        .given(|ctx| {
            let therapist = ctx.harness.add_therapist();
            ctx.therapists.push(therapist);
        })
        .when("a session is recorded", |ctx| {
            let session = SessionSpec::new("Ana Gomez", "1234", "PSICO", "COMPLETADA", 202501);
            ctx.harness.record(&ctx.therapists[0], &session);
        })
        .then("the stored id does not match the default salt", |ctx| {
            let stored = ctx.harness.client.get_session(&1);
            let ana = Beneficiary::new("Ana Gomez", "1234");
            assert_eq!(stored.beneficiary_id, ctx.harness.beneficiary_id(&ana));

            let mut other_env = TestEnv::new();
            let other = ProofOfServiceHarness::new(&mut other_env);
            assert_ne!(
                other.beneficiary_id(&ana).to_array(),
                stored.beneficiary_id.to_array()
            );
        })
        .run();
}

#[test]
fn test_scenario_double_init_is_rejected() {
    Scenario::new("Double init is rejected")
        .when("init is called again", |ctx| {
            let salt = ctx.harness.salt.clone();
            let result = ctx.harness.client.try_init(&ctx.harness.admin, &salt);
            assert_contract_error!(result, ContractError::AlreadyInitialized);
        })
        .then("the admin is unchanged", |ctx| {
            assert_eq!(ctx.harness.client.get_admin(), ctx.harness.admin);
            assert_eq!(ctx.harness.client.version(), 2);
        })
        .run();
}

#[test]
fn test_batch_scenarios() {
    let scenarios = std::vec![
        Scenario::new("Empty contract has no sessions").then("count is zero", |ctx| {
            assert_eq!(ctx.harness.session_count(), 0);
        }),
        Scenario::new("Unknown session is missing").then("get_session fails", |ctx| {
            assert_contract_error!(
                ctx.harness.client.try_get_session(&1),
                ContractError::SessionNotFound
            );
        }),
        Scenario::new("A failing scenario is counted").then("always fails", |_| {
            panic!("intentional");
        }),
    ];

    let (passed, failed) = run_scenarios(scenarios);

    assert_eq!(passed, 2);
    assert_eq!(failed, 1);
}
