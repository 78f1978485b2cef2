use crate::resolver::AccountStatus;
use thiserror::Error;
use uuid::Uuid;

const UUID_LEN: usize = 36;
const UUID_HYPHENS: [usize; 4] = [8, 13, 18, 23];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Required(&'static str),
    #[error("{0} must be a hyphenated UUID")]
    InvalidUuid(&'static str),
    #[error("latitude must be within [-90, 90] and longitude within [-180, 180]")]
    Coordinates,
    #[error("{0} is not an accepted account status")]
    Status(String),
    #[error("{0} is not an accepted account type")]
    Role(String),
}

/// Reject empty and whitespace-only values
pub fn require<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ValidationError::Required(field))
    } else {
        Ok(trimmed)
    }
}

/// Only the canonical 8-4-4-4-12 form is accepted; braces, URNs and the
/// simple 32-digit form are rejected.
pub fn parse_uuid(value: &str, field: &'static str) -> Result<Uuid, ValidationError> {
    let shaped = value.len() == UUID_LEN
        && value.char_indices().all(|(index, c)| {
            if UUID_HYPHENS.contains(&index) {
                c == '-'
            } else {
                c.is_ascii_hexdigit()
            }
        });
    if !shaped {
        return Err(ValidationError::InvalidUuid(field));
    }
    Uuid::parse_str(value).map_err(|_| ValidationError::InvalidUuid(field))
}

/// Used by callers validating postal addresses
pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), ValidationError> {
    if (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude) {
        Ok(())
    } else {
        Err(ValidationError::Coordinates)
    }
}

/// Status must parse and be enabled for this deployment
pub fn validate_status(value: &str, allowed: &[String]) -> Result<AccountStatus, ValidationError> {
    let status = value
        .parse::<AccountStatus>()
        .map_err(|_| ValidationError::Status(value.to_string()))?;
    let name = status.to_string();
    if allowed.iter().any(|allowed| *allowed == name) {
        Ok(status)
    } else {
        Err(ValidationError::Status(value.to_string()))
    }
}

/// An empty allowlist admits every account type
pub fn validate_role(value: &str, allowed: &[String]) -> Result<(), ValidationError> {
    if allowed.is_empty() || allowed.iter().any(|role| role.eq_ignore_ascii_case(value.trim())) {
        Ok(())
    } else {
        Err(ValidationError::Role(value.to_string()))
    }
}
