//! Identifier hygiene for SQL text.
//!
//! User values never reach SQL text as anything but bound parameters;
//! identifiers (table and column names) cannot be bound, so they are
//! validated here before interpolation. This is a security invariant.

use thiserror::Error;

const MAX_IDENTIFIER_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier too long ({0} chars)")]
    TooLong(usize),
    #[error("invalid character {ch:?} in identifier {name:?}")]
    BadCharacter { name: String, ch: char },
}

/// Validate an unquoted warehouse identifier and hand it back.
///
/// Accepts `[A-Za-z_][A-Za-z0-9_$]*`, the unquoted-identifier grammar. Dots,
/// quotes, whitespace, and anything else that could splice SQL are rejected.
pub fn validate_identifier(name: &str) -> Result<&str, IdentError> {
    if name.is_empty() {
        return Err(IdentError::Empty);
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(IdentError::TooLong(name.len()));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('\0');
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(IdentError::BadCharacter {
            name: name.to_string(),
            ch: first,
        });
    }
    for ch in chars {
        if !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '$') {
            return Err(IdentError::BadCharacter {
                name: name.to_string(),
                ch,
            });
        }
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(validate_identifier("sales").is_ok());
        assert!(validate_identifier("SALES_2024").is_ok());
        assert!(validate_identifier("_staging$tmp").is_ok());
    }

    #[test]
    fn rejects_injection_shapes() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1table").is_err());
        assert!(validate_identifier("t;DROP TABLE x").is_err());
        assert!(validate_identifier("t\"quoted\"").is_err());
        assert!(validate_identifier("sch.table").is_err());
        assert!(validate_identifier("name with space").is_err());
        assert!(validate_identifier(&"x".repeat(300)).is_err());
    }
}
