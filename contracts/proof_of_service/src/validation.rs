use crate::ContractError;
use soroban_sdk::{Bytes, Env, Symbol};

pub const THERAPY_KINDS: [&str; 4] = ["KINESIO", "FONO", "PSICO", "OCUPACIONAL"];
pub const ATTENDANCE_STATUSES: [&str; 3] = ["COMPLETADA", "NO_ASISTIO", "CANCELADA"];

/// 100 characters of UTF-8, at most four bytes each.
const MAX_NAME_LEN: u32 = 400;
const MAX_PIN_LEN: u32 = 6;

const MIN_YEAR: u32 = 2000;
const MAX_YEAR: u32 = 2100;

pub fn is_therapy_kind(env: &Env, kind: &Symbol) -> bool {
    THERAPY_KINDS
        .iter()
        .any(|candidate| *kind == Symbol::new(env, candidate))
}

pub fn is_attendance_status(env: &Env, status: &Symbol) -> bool {
    ATTENDANCE_STATUSES
        .iter()
        .any(|candidate| *status == Symbol::new(env, candidate))
}

/// Validate the beneficiary name bytes. Content is opaque; only the size is checked.
pub fn validate_name(name: &Bytes) -> Result<(), ContractError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ContractError::InvalidInput);
    }
    Ok(())
}

/// Validate a beneficiary PIN: 1 to 6 ASCII digits.
pub fn validate_pin(pin: &Bytes) -> Result<(), ContractError> {
    let len = pin.len();
    if !(1..=MAX_PIN_LEN).contains(&len) {
        return Err(ContractError::InvalidInput);
    }

    let mut buf = [0u8; MAX_PIN_LEN as usize];
    pin.copy_into_slice(&mut buf[..len as usize]);

    if !buf[..len as usize].iter().all(u8::is_ascii_digit) {
        return Err(ContractError::InvalidInput);
    }

    Ok(())
}

/// Validate a `yyyymm` month bucket.
pub fn validate_yyyymm(yyyymm: u32) -> Result<(), ContractError> {
    let year = yyyymm / 100;
    let month = yyyymm % 100;
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) || !(1..=12).contains(&month) {
        return Err(ContractError::InvalidInput);
    }
    Ok(())
}

pub fn validate_session(
    env: &Env,
    name: &Bytes,
    pin: &Bytes,
    kind: &Symbol,
    status: &Symbol,
    yyyymm: u32,
) -> Result<(), ContractError> {
    validate_name(name)?;
    validate_pin(pin)?;
    validate_yyyymm(yyyymm)?;
    if !is_therapy_kind(env, kind) || !is_attendance_status(env, status) {
        return Err(ContractError::InvalidInput);
    }
    Ok(())
}
