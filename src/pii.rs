//! Normalization and one-way hashing of personally identifying fields.
//!
//! Providers match users on SHA-256 digests of canonical values, so raw phone
//! numbers and emails never leave the process.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::errors::DeliveryError;

/// Fewer digits than this can never match a real subscriber on the provider side.
pub const MIN_PHONE_DIGITS: usize = 10;

/// Lowercases and trims the value, then returns its SHA-256 hex digest.
pub fn hash(value: &str) -> String {
    let normalized = value.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Strips everything but ASCII digits and hashes the result.
///
/// `"+1 (555) 123-4567"` and `"15551234567"` produce the same digest.
pub fn hash_phone(raw: &str) -> Result<String, DeliveryError> {
    let digits = normalize_phone(raw);
    if digits.len() < MIN_PHONE_DIGITS {
        return Err(DeliveryError::InvalidIdentity(format!(
            "phone has {} digit(s), at least {} required",
            digits.len(),
            MIN_PHONE_DIGITS
        )));
    }
    Ok(hash(&digits))
}

/// Digits-only form of a phone number.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Lowercases, trims and hashes an email.
///
/// Only the shape `local@domain` is required. Internationalized and dotless
/// domains are accepted as-is; the provider decides whether they match.
pub fn hash_email(raw: &str) -> Result<String, DeliveryError> {
    let normalized = raw.trim().to_lowercase();
    if !email_regex().is_match(&normalized) {
        return Err(DeliveryError::InvalidIdentity(
            "email must have the form local@domain".to_string(),
        ));
    }
    Ok(hash(&normalized))
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+$").expect("email regex is valid"))
}
