//! Session identifiers

use uuid::Uuid;

use crate::error::{BerthError, Result};

/// A fresh random session id in canonical UUID v4 text form.
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Reject ids that could escape the sessions directory.
///
/// Ids are normally UUIDs, but any short token of ASCII letters, digits,
/// `-` and `_` is accepted so hand-named sessions keep working.
pub fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BerthError::InvalidSessionId(id.to_string()))
    }
}
