//! Actor id and key validation.
//!
//! Actor ids are `[A-Za-z0-9_-]{1,64}`. Keys are non-empty byte strings up
//! to 256 bytes with no further character restrictions. Validation happens
//! once at the boundary; interior code trusts validated inputs.

use crate::constants::{ACTOR_ID_LENGTH_BYTES_MAX, KEY_LENGTH_BYTES_MAX};
use crate::error::{Error, Result};

/// Validate an actor id against `[A-Za-z0-9_-]{1,64}`.
pub fn validate_actor_id(actor_id: &str) -> Result<()> {
    if actor_id.is_empty() {
        return Err(Error::invalid_actor_id(actor_id, "must not be empty"));
    }
    if actor_id.len() > ACTOR_ID_LENGTH_BYTES_MAX {
        return Err(Error::invalid_actor_id(
            actor_id,
            format!(
                "length {} exceeds limit {}",
                actor_id.len(),
                ACTOR_ID_LENGTH_BYTES_MAX
            ),
        ));
    }
    let valid = actor_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if !valid {
        return Err(Error::invalid_actor_id(
            actor_id,
            "contains invalid characters",
        ));
    }
    Ok(())
}

/// Validate a store key: non-empty, at most 256 bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_key("must not be empty"));
    }
    if key.len() > KEY_LENGTH_BYTES_MAX {
        return Err(Error::invalid_key(format!(
            "length {} exceeds limit {}",
            key.len(),
            KEY_LENGTH_BYTES_MAX
        )));
    }
    Ok(())
}
