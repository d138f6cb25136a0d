//! Reaction bookkeeping. A user holds at most one reaction per item; reacting
//! with a different kind moves them, `incr = false` removes them.

use super::model::Reactions;
use super::topic::Identity;
use crate::error::ValidationError;

const MAX_KIND_LEN: usize = 32;

/// Reaction kinds are short tokens such as `like` or `thumbs_up`.
pub fn validate_kind(kind: &str) -> Result<(), ValidationError> {
    if kind.is_empty() {
        return Err(ValidationError::InvalidReaction("reaction must not be empty".into()));
    }
    if kind.len() > MAX_KIND_LEN {
        return Err(ValidationError::InvalidReaction(format!(
            "reaction longer than {} characters",
            MAX_KIND_LEN
        )));
    }
    if !kind
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidReaction(format!("'{}' has invalid characters", kind)));
    }
    Ok(())
}

/// Applies one reaction change to `reactions`.
pub fn apply_reaction(
    reactions: &mut Reactions,
    user: &Identity,
    kind: &str,
    incr: bool,
) -> Result<(), ValidationError> {
    validate_kind(kind)?;

    if !incr {
        // Removal clears the user's reaction whatever kind it was filed under.
        let mut removed = false;
        reactions.retain(|_, users| {
            let before = users.len();
            users.retain(|u| u != user);
            removed |= users.len() != before;
            !users.is_empty()
        });
        return if removed { Ok(()) } else { Err(ValidationError::NotReacted) };
    }

    // Drop any other reaction this user holds.
    reactions.retain(|k, users| {
        if k != kind {
            users.retain(|u| u != user);
        }
        !users.is_empty()
    });

    let users = reactions.entry(kind.to_string()).or_default();
    if !users.contains(user) {
        users.push(user.clone());
    }
    Ok(())
}
