use crate::Session;
use soroban_sdk::{symbol_short, Address, Env, Symbol};

/// Event published when the contract is initialized.
#[soroban_sdk::contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitializedEvent {
    pub admin: Address,
    pub timestamp: u64,
}

/// Event published when a therapist is added to or removed from the allow-list.
#[soroban_sdk::contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TherapistUpdatedEvent {
    pub therapist: Address,
    pub active: bool,
    pub timestamp: u64,
}

pub fn publish_initialized(env: &Env, admin: Address) {
    let topics = (symbol_short!("INIT"),);
    let data = InitializedEvent {
        admin,
        timestamp: env.ledger().timestamp(),
    };
    env.events().publish(topics, data);
}

pub fn publish_therapist_updated(env: &Env, therapist: Address, active: bool) {
    let topics = (symbol_short!("THER_UPD"), therapist.clone());
    let data = TherapistUpdatedEvent {
        therapist,
        active,
        timestamp: env.ledger().timestamp(),
    };
    env.events().publish(topics, data);
}

/// Publishes a new session under `("new_sess", kind)` so indexers can
/// filter by therapy kind without decoding the payload.
pub fn publish_session_recorded(env: &Env, kind: Symbol, session: Session) {
    let topics = (symbol_short!("new_sess"), kind);
    env.events().publish(topics, session);
}
