//! Task identifiers and template names.
//!
//! Both end up as file names (`{output}/{task_id}.pdf`, `{views}/{name}.html`),
//! so they are restricted to a conservative character set.

use thiserror::Error;
use ulid::Ulid;

const MAX_IDENTIFIER_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },
    #[error("{kind} exceeds {MAX_IDENTIFIER_LEN} characters")]
    TooLong { kind: &'static str },
    #[error("{kind} `{value}` may only contain ASCII letters, digits, `-` and `_`")]
    InvalidCharacters { kind: &'static str, value: String },
}

/// Generate a new task identifier: a ULID, i.e. a millisecond timestamp
/// prefix followed by 80 random bits, sortable by creation time.
pub fn new_task_id() -> String {
    Ulid::new().to_string()
}

pub fn validate_task_id(value: &str) -> Result<(), IdentifierError> {
    validate("task id", value)
}

pub fn validate_template_name(value: &str) -> Result<(), IdentifierError> {
    validate("template name", value)
}

fn validate(kind: &'static str, value: &str) -> Result<(), IdentifierError> {
    if value.is_empty() {
        return Err(IdentifierError::Empty { kind });
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(IdentifierError::TooLong { kind });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(IdentifierError::InvalidCharacters {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_time_ordered() {
        let first = new_task_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_task_id();

        assert!(validate_task_id(&first).is_ok());
        assert_eq!(first.len(), 26);
        assert!(first < second);
    }

    #[test]
    fn rejects_path_like_names() {
        assert!(matches!(
            validate_template_name("../secrets"),
            Err(IdentifierError::InvalidCharacters { .. })
        ));
        assert!(matches!(
            validate_task_id(""),
            Err(IdentifierError::Empty { .. })
        ));
        assert!(validate_template_name("invoice_v2").is_ok());
    }

    #[test]
    fn rejects_overlong_identifiers() {
        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert_eq!(
            validate_task_id(&long),
            Err(IdentifierError::TooLong { kind: "task id" })
        );
    }
}
