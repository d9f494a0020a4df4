//! Identifier rules for worker ids, task names and stage names.
//!
//! Identifiers end up as launcher arguments and in artifact file names, so
//! only a leading letter followed by letters, digits or `-` is accepted.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::DispatchError;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").unwrap());

pub fn is_valid_identifier(value: &str) -> bool {
    IDENT_RE.is_match(value)
}

/// Validate `value`, naming `field` in the error.
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), DispatchError> {
    if is_valid_identifier(value) {
        return Ok(());
    }
    Err(DispatchError::InvalidArgument {
        field,
        value: value.to_string(),
    })
}
