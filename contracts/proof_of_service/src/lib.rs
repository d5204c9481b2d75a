#![no_std]
#![allow(clippy::arithmetic_side_effects)]

pub mod events;
pub mod validation;


use soroban_sdk::{contract, contractimpl, contracttype, Address, Bytes, BytesN, Env, Symbol};

pub use validation::{ATTENDANCE_STATUSES, THERAPY_KINDS};

const INSTANCE_TTL_THRESHOLD: u32 = 50_000;
const INSTANCE_TTL_EXTEND_TO: u32 = 100_000;

/// Sessions and monthly counters must outlive a full reporting year.
const RECORD_TTL_THRESHOLD: u32 = 530_000;
const RECORD_TTL_EXTEND_TO: u32 = 535_680;

/// Storage keys for the contract
#[contracttype]
#[derive(Clone)]
pub enum DataKey {
    Admin,
    Salt,
    SessionCount,
    Therapist(Address),
    Session(u32),
    MonthlyStats(BytesN<32>, u32, Symbol),
}

/// A therapy session as stored on the ledger.
///
/// The beneficiary is never stored in clear: `beneficiary_id` is the salted
/// sha256 of the name and PIN bytes supplied by the caller.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    pub id: u32,
    pub beneficiary_id: BytesN<32>,
    pub therapist: Address,
    pub timestamp: u64,
    pub kind: Symbol,
    pub status: Symbol,
    pub yyyymm: u32,
}

/// Contract errors
///
/// # Code ranges
/// | Range   | Purpose                        |
/// |---------|--------------------------------|
/// | 1 – 9   | Lifecycle / initialisation     |
/// | 10 – 19 | Authentication & authorisation |
/// | 20 – 29 | Resource not found             |
/// | 30 – 39 | Validation / input             |
/// | 40 – 49 | Contract state                 |
#[soroban_sdk::contracterror]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ContractError {
    NotInitialized = 1,
    AlreadyInitialized = 2,
    TherapistNotAuthorized = 10,
    SessionNotFound = 20,
    InvalidInput = 30,
    CounterOverflow = 40,
}

#[contract]
pub struct ProofOfService;

#[contractimpl]
impl ProofOfService {
    /// Initialize the contract with an admin and the salt used to derive
    /// beneficiary identifiers.
    pub fn init(env: Env, admin: Address, salt: BytesN<32>) -> Result<(), ContractError> {
        if env.storage().instance().has(&DataKey::Admin) {
            return Err(ContractError::AlreadyInitialized);
        }

        env.storage().instance().set(&DataKey::Admin, &admin);
        env.storage().instance().set(&DataKey::Salt, &salt);
        env.storage().instance().set(&DataKey::SessionCount, &0u32);
        extend_instance_ttl(&env);

        events::publish_initialized(&env, admin);

        Ok(())
    }

    /// Get the admin address
    pub fn get_admin(env: Env) -> Result<Address, ContractError> {
        env.storage()
            .instance()
            .get(&DataKey::Admin)
            .ok_or(ContractError::NotInitialized)
    }

    /// Add or remove a therapist from the allow-list. Admin only.
    pub fn set_therapist(env: Env, therapist: Address, active: bool) -> Result<(), ContractError> {
        let admin = Self::get_admin(env.clone())?;
        admin.require_auth();

        let key = DataKey::Therapist(therapist.clone());
        env.storage().persistent().set(&key, &active);
        if active {
            env.storage()
                .persistent()
                .extend_ttl(&key, INSTANCE_TTL_THRESHOLD, INSTANCE_TTL_EXTEND_TO);
        }

        events::publish_therapist_updated(&env, therapist, active);

        Ok(())
    }

    pub fn is_therapist(env: Env, therapist: Address) -> bool {
        env.storage()
            .persistent()
            .get(&DataKey::Therapist(therapist))
            .unwrap_or(false)
    }

    /// Record one therapy session and return its ledger id.
    ///
    /// Argument order is part of the public interface: off-chain callers
    /// build the invocation positionally.
    pub fn record_session(
        env: Env,
        therapist: Address,
        beneficiary_name: Bytes,
        beneficiary_pin: Bytes,
        kind: Symbol,
        status: Symbol,
        yyyymm: u32,
    ) -> Result<u32, ContractError> {
        therapist.require_auth();

        if !Self::is_therapist(env.clone(), therapist.clone()) {
            return Err(ContractError::TherapistNotAuthorized);
        }

        validation::validate_session(
            &env,
            &beneficiary_name,
            &beneficiary_pin,
            &kind,
            &status,
            yyyymm,
        )?;

        let beneficiary_id = beneficiary_id(&env, &beneficiary_name, &beneficiary_pin)?;

        let count: u32 = env
            .storage()
            .instance()
            .get(&DataKey::SessionCount)
            .unwrap_or(0);
        let id = count.checked_add(1).ok_or(ContractError::CounterOverflow)?;

        let stats_key = DataKey::MonthlyStats(beneficiary_id.clone(), yyyymm, kind.clone());
        let monthly = env
            .storage()
            .persistent()
            .get::<_, u32>(&stats_key)
            .unwrap_or(0)
            .checked_add(1)
            .ok_or(ContractError::CounterOverflow)?;

        let session = Session {
            id,
            beneficiary_id: beneficiary_id.clone(),
            therapist,
            timestamp: env.ledger().timestamp(),
            kind: kind.clone(),
            status,
            yyyymm,
        };

        let session_key = DataKey::Session(id);
        env.storage().persistent().set(&session_key, &session);
        env.storage()
            .persistent()
            .extend_ttl(&session_key, RECORD_TTL_THRESHOLD, RECORD_TTL_EXTEND_TO);

        env.storage().persistent().set(&stats_key, &monthly);
        env.storage()
            .persistent()
            .extend_ttl(&stats_key, RECORD_TTL_THRESHOLD, RECORD_TTL_EXTEND_TO);

        env.storage().instance().set(&DataKey::SessionCount, &id);
        extend_instance_ttl(&env);

        events::publish_session_recorded(&env, kind, session);

        Ok(id)
    }

    /// Get a session by id
    pub fn get_session(env: Env, id: u32) -> Result<Session, ContractError> {
        env.storage()
            .persistent()
            .get(&DataKey::Session(id))
            .ok_or(ContractError::SessionNotFound)
    }

    /// Number of sessions of `kind` recorded for a beneficiary in a month.
    /// Accepts a single kind per call.
    pub fn get_monthly_count(
        env: Env,
        name: Bytes,
        pin: Bytes,
        yyyymm: u32,
        kind: Symbol,
    ) -> Result<u32, ContractError> {
        let bid = beneficiary_id(&env, &name, &pin)?;
        Ok(env
            .storage()
            .persistent()
            .get(&DataKey::MonthlyStats(bid, yyyymm, kind))
            .unwrap_or(0))
    }

    /// Total number of sessions recorded so far
    pub fn get_session_count(env: Env) -> u32 {
        env.storage()
            .instance()
            .get(&DataKey::SessionCount)
            .unwrap_or(0)
    }

    /// Contract version
    pub fn version() -> u32 {
        2
    }
}

fn extend_instance_ttl(env: &Env) {
    env.storage()
        .instance()
        .extend_ttl(INSTANCE_TTL_THRESHOLD, INSTANCE_TTL_EXTEND_TO);
}

/// sha256(salt ‖ name ‖ pin)
fn beneficiary_id(env: &Env, name: &Bytes, pin: &Bytes) -> Result<BytesN<32>, ContractError> {
    let salt: BytesN<32> = env
        .storage()
        .instance()
        .get(&DataKey::Salt)
        .ok_or(ContractError::NotInitialized)?;

    let mut preimage = Bytes::from(salt);
    preimage.append(name);
    preimage.append(pin);

    Ok(env.crypto().sha256(&preimage).to_bytes())
}
