//! Inbound field checks and normalisation.
//!
//! Every check returns the normalised value or a [`ValidationError`] naming
//! the offending field. Nothing here touches the ledger or the cache.

use std::fmt;

use chrono::{Datelike, Utc};
use proof_of_service::{ATTENDANCE_STATUSES, THERAPY_KINDS};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

pub const MAX_NAME_CHARS: usize = 100;
pub const MAX_PIN_DIGITS: usize = 6;
pub const MAX_DURATION_MINUTES: u32 = 480;
pub const MIN_YEAR: i64 = 2000;
pub const MAX_YEAR: i64 = 2100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TherapyKind {
    Kinesio,
    Fono,
    Psico,
    Ocupacional,
}

impl TherapyKind {
    pub const ALL: [TherapyKind; 4] = [
        TherapyKind::Kinesio,
        TherapyKind::Fono,
        TherapyKind::Psico,
        TherapyKind::Ocupacional,
    ];

    /// Contract symbol for this kind. `ALL` follows the contract's order.
    pub fn as_str(self) -> &'static str {
        THERAPY_KINDS[self as usize]
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for TherapyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Completada,
    NoAsistio,
    Cancelada,
}

impl AttendanceStatus {
    pub const ALL: [AttendanceStatus; 3] = [
        AttendanceStatus::Completada,
        AttendanceStatus::NoAsistio,
        AttendanceStatus::Cancelada,
    ];

    pub fn as_str(self) -> &'static str {
        ATTENDANCE_STATUSES[self as usize]
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == raw)
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A calendar month, always within `MIN_YEAR..=MAX_YEAR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct YearMonth {
    year: u16,
    month: u8,
}

impl YearMonth {
    pub fn new(year: i64, month: i64) -> Result<Self, ValidationError> {
        if !(1..=12).contains(&month) {
            return Err(ValidationError::new("mes", "must be an integer between 1 and 12"));
        }
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(ValidationError::new(
                "anio",
                format!("must be an integer between {MIN_YEAR} and {MAX_YEAR}"),
            ));
        }
        Ok(Self {
            year: year as u16,
            month: month as u8,
        })
    }

    /// The month containing "now" in UTC.
    pub fn current() -> Self {
        let now = Utc::now();
        Self {
            year: now.year().clamp(MIN_YEAR as i32, MAX_YEAR as i32) as u16,
            month: now.month() as u8,
        }
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    /// `year * 100 + month`, e.g. 202512.
    pub fn yyyymm(&self) -> u32 {
        u32::from(self.year) * 100 + u32::from(self.month)
    }
}

/// Beneficiary identity as typed by the therapist. Both parts are trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beneficiary {
    pub name: String,
    pub pin: String,
}

impl Beneficiary {
    pub fn name_bytes(&self) -> Vec<u8> {
        self.name.as_bytes().to_vec()
    }

    pub fn pin_bytes(&self) -> Vec<u8> {
        self.pin.as_bytes().to_vec()
    }
}

/// A fully validated session submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInput {
    pub beneficiary: Beneficiary,
    pub kind: TherapyKind,
    pub status: AttendanceStatus,
    pub duration_minutes: u32,
    pub notes: Option<String>,
    pub period: YearMonth,
}

pub fn validate_name(raw: Option<&str>) -> Result<String, ValidationError> {
    let name = raw.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(ValidationError::new("beneficiario_nombre", "is required"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(ValidationError::new(
            "beneficiario_nombre",
            format!("must be at most {MAX_NAME_CHARS} characters"),
        ));
    }
    Ok(name.to_string())
}

pub fn validate_pin(raw: Option<&str>) -> Result<String, ValidationError> {
    let pin = raw.map(str::trim).unwrap_or_default();
    let valid = (1..=MAX_PIN_DIGITS).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit());
    if !valid {
        return Err(ValidationError::new(
            "beneficiario_pin",
            format!("must be 1 to {MAX_PIN_DIGITS} digits"),
        ));
    }
    Ok(pin.to_string())
}

pub fn validate_beneficiary(
    name: Option<&str>,
    pin: Option<&str>,
) -> Result<Beneficiary, ValidationError> {
    Ok(Beneficiary {
        name: validate_name(name)?,
        pin: validate_pin(pin)?,
    })
}

pub fn validate_therapy_kind(raw: Option<&str>) -> Result<TherapyKind, ValidationError> {
    raw.map(str::trim)
        .and_then(TherapyKind::parse)
        .ok_or_else(|| {
            ValidationError::new(
                "tipo_terapia",
                format!("must be one of: {}", THERAPY_KINDS.join(", ")),
            )
        })
}

pub fn validate_status(raw: Option<&str>) -> Result<AttendanceStatus, ValidationError> {
    raw.map(str::trim)
        .and_then(AttendanceStatus::parse)
        .ok_or_else(|| {
            ValidationError::new(
                "asistencia",
                format!("must be one of: {}", ATTENDANCE_STATUSES.join(", ")),
            )
        })
}

pub fn validate_duration(raw: Option<&Value>) -> Result<u32, ValidationError> {
    let minutes = integer_field("duracion_minutos", raw)?;
    if !(0..=i64::from(MAX_DURATION_MINUTES)).contains(&minutes) {
        return Err(ValidationError::new(
            "duracion_minutos",
            format!("must be between 0 and {MAX_DURATION_MINUTES}"),
        ));
    }
    Ok(minutes as u32)
}

/// Month and year, in that order of checking.
pub fn validate_period(
    month: Option<&Value>,
    year: Option<&Value>,
) -> Result<YearMonth, ValidationError> {
    let month = integer_field("mes", month)?;
    let year = integer_field("anio", year)?;
    YearMonth::new(year, month)
}

/// Trimmed notes; blank notes are stored as absent.
pub fn normalize_notes(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|notes| !notes.is_empty())
        .map(str::to_string)
}

/// Accepts JSON integers, integral floats and numeric strings.
fn integer_field(field: &'static str, raw: Option<&Value>) -> Result<i64, ValidationError> {
    let parsed = match raw {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ValidationError::new(field, "must be an integer"))
}
