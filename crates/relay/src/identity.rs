// Identity enrichment and validation.
//
// Presence lists are user-visible; admitting a placeholder or unverified
// identity corrupts the member list and cursor overlays for everyone in the
// session. Enrichment therefore fails closed: an identity that cannot be
// resolved to a real display name is rejected and must never reach a
// session.

use atelier_common::types::{PresenceUser, UserCandidate};
use thiserror::Error;
use tracing::warn;

use crate::stores::UserDirectory;

/// The literal name assigned to unresolved accounts by some clients.
pub const PLACEHOLDER_NAME: &str = "User";

/// Minimum length of a durable directory identifier. Anything shorter is a
/// client-fabricated stand-in and cannot be resolved.
const MIN_DURABLE_ID_LEN: usize = 11;

/// Presence colors, assigned deterministically from the user id so that
/// re-enrichment never changes a member's color mid-session.
const PRESENCE_PALETTE: &[&str] = &[
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#e5c07b", "#56b6c2", "#d19a66", "#abb2bf",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("identity rejected: {reason}")]
pub struct IdentityRejected {
    pub reason: String,
}

impl IdentityRejected {
    fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Resolve a client-supplied descriptor into a validated [`PresenceUser`].
///
/// A candidate carrying a usable name is accepted as-is. Otherwise the user
/// directory is consulted by id, falling back from the directory name to the
/// account email. The resolved name is re-validated against the placeholder
/// rules before admission.
pub async fn enrich(
    directory: &UserDirectory,
    candidate: &UserCandidate,
) -> Result<PresenceUser, IdentityRejected> {
    let name = match candidate.name.as_deref().map(str::trim) {
        Some(name) if !is_placeholder_name(name) => name.to_string(),
        _ => resolve_from_directory(directory, &candidate.id).await?,
    };

    // Second pass: a directory fallback can itself be a placeholder.
    if is_placeholder_name(&name) {
        return Err(IdentityRejected::new(format!(
            "resolved name for '{}' is a placeholder",
            candidate.id
        )));
    }

    Ok(PresenceUser {
        id: candidate.id.clone(),
        name,
        color: candidate
            .color
            .clone()
            .unwrap_or_else(|| presence_color(&candidate.id).to_string()),
    })
}

async fn resolve_from_directory(
    directory: &UserDirectory,
    user_id: &str,
) -> Result<String, IdentityRejected> {
    if !is_durable_id(user_id) {
        return Err(IdentityRejected::new(format!(
            "'{user_id}' is not a durable directory identifier"
        )));
    }

    let record = match directory.find_user(user_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return Err(IdentityRejected::new(format!("no directory record for '{user_id}'")));
        }
        Err(error) => {
            warn!(user_id = %user_id, error = ?error, "user directory lookup failed");
            return Err(IdentityRejected::new(format!(
                "directory lookup failed for '{user_id}'"
            )));
        }
    };

    Ok(record
        .name
        .filter(|name| !name.trim().is_empty())
        .or(record.email)
        .unwrap_or_else(|| PLACEHOLDER_NAME.to_string()))
}

/// True when a name is empty after trimming, the literal placeholder, or a
/// placeholder-derived name like "User 3".
pub fn is_placeholder_name(name: &str) -> bool {
    let trimmed = name.trim();
    trimmed.is_empty() || trimmed == PLACEHOLDER_NAME || trimmed.starts_with("User ")
}

/// True when an id plausibly came from the user directory rather than being
/// fabricated by a client.
pub fn is_durable_id(id: &str) -> bool {
    id.len() >= MIN_DURABLE_ID_LEN && !id.starts_with("User ")
}

fn presence_color(user_id: &str) -> &'static str {
    let index = user_id.bytes().fold(0usize, |acc, b| acc.wrapping_add(b as usize));
    PRESENCE_PALETTE[index % PRESENCE_PALETTE.len()]
}
