//! Membership: instance creation, invitations, and short join codes.
//!
//! Admission is rooted in the instance creator: the creator is the first
//! admin, admins issue invitations, and an invitation is consumed exactly
//! once by the peer it names. Join codes are the out-of-band half — a
//! requester mints a code bound to their public key, an admin reads it off
//! their screen and resolves it back to the key to invite.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;

use refsync_sdk::identity::PeerId;
use refsync_sdk::protocol::{ErrorReason, Invitation};

use crate::server::SharedState;
use crate::web::Refusal;

/// Code alphabet with the usual lookalikes (0/O, 1/I) removed — codes are
/// read off a phone screen across a competition field.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

/// A short-lived join-request code, bound to the requesting peer's key.
#[derive(Debug, Clone)]
pub struct RequestCode {
    pub sku: String,
    pub peer: PeerId,
    pub expires_at: DateTime<Utc>,
}

fn db_err(e: rusqlite::Error) -> Refusal {
    Refusal::new(ErrorReason::ServerError, Some(e.to_string()))
}

pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// A fresh instance secret: 32 bytes, base64url.
pub fn new_secret() -> String {
    use base64::Engine;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

// ── Instance & invitations ─────────────────────────────────────────────

/// Create the instance for an event. The creator becomes the sole admin,
/// admitted through an already-accepted self-invitation so no second
/// round-trip is needed.
pub fn create_instance(
    state: &Arc<SharedState>,
    sku: &str,
    creator: &PeerId,
) -> Result<Invitation, Refusal> {
    let secret = new_secret();
    let created = state
        .with_db(|db| db.create_instance(sku, &secret, Utc::now().timestamp()))
        .map_err(db_err)?;
    if !created {
        return Err(Refusal::bad_request("instance already exists"));
    }

    let invitation = Invitation {
        id: uuid::Uuid::new_v4().to_string(),
        sku: sku.to_string(),
        from: creator.clone(),
        to: creator.clone(),
        admin: true,
        accepted: true,
        instance_secret: Some(secret),
    };
    state
        .with_db(|db| db.insert_invitation(&invitation, Utc::now().timestamp()))
        .map_err(db_err)?;

    state.ensure_instance(sku);
    tracing::info!(sku, creator = %creator, "instance created");
    Ok(invitation)
}

/// The caller's invitation state. The secret is attached only once the
/// invitation is accepted.
pub fn read_invitation(
    state: &SharedState,
    sku: &str,
    peer: &PeerId,
) -> Result<Option<Invitation>, Refusal> {
    let mut invitation = state.with_db(|db| db.invitation_for(sku, peer)).map_err(db_err)?;
    if let Some(inv) = invitation.as_mut() {
        if inv.accepted {
            inv.instance_secret =
                state.with_db(|db| db.instance_secret(sku)).map_err(db_err)?;
        }
    }
    Ok(invitation)
}

/// Consume an invitation — exactly once, and only by the peer it names.
/// Returns it with the instance secret attached.
pub fn accept_invitation(
    state: &SharedState,
    sku: &str,
    peer: &PeerId,
    invitation_id: &str,
) -> Result<Invitation, Refusal> {
    let Some(mut invitation) =
        state.with_db(|db| db.invitation_by_id(invitation_id)).map_err(db_err)?
    else {
        return Err(Refusal::bad_request("no such invitation"));
    };
    if invitation.sku != sku || invitation.to != *peer {
        return Err(Refusal::forbidden());
    }
    if invitation.accepted {
        return Err(Refusal::bad_request("invitation already accepted"));
    }

    state.with_db(|db| db.mark_accepted(&invitation.id)).map_err(db_err)?;
    invitation.accepted = true;
    invitation.instance_secret =
        state.with_db(|db| db.instance_secret(sku)).map_err(db_err)?;
    tracing::info!(sku, peer = %peer, admin = invitation.admin, "invitation accepted");
    Ok(invitation)
}

/// Issue a pending invitation for a peer.
pub fn invite(
    state: &SharedState,
    sku: &str,
    from: &PeerId,
    to: PeerId,
    admin: bool,
) -> Result<Invitation, Refusal> {
    let invitation = Invitation {
        id: uuid::Uuid::new_v4().to_string(),
        sku: sku.to_string(),
        from: from.clone(),
        to,
        admin,
        accepted: false,
        instance_secret: None,
    };
    state
        .with_db(|db| db.insert_invitation(&invitation, Utc::now().timestamp()))
        .map_err(db_err)?;
    tracing::info!(sku, from = %from, to = %invitation.to, "invitation issued");
    Ok(invitation)
}

/// Expunge a peer from the instance and close any live socket they hold.
/// An instance must keep at least one admin.
pub async fn revoke(
    state: &Arc<SharedState>,
    sku: &str,
    by: &PeerId,
    target: &PeerId,
) -> Result<bool, Refusal> {
    let target_is_admin = state.with_db(|db| db.is_admin(sku, target)).map_err(db_err)?;
    if target_is_admin && state.with_db(|db| db.admin_count(sku)).map_err(db_err)? <= 1 {
        return Err(Refusal::bad_request("cannot remove the last admin"));
    }

    let removed = state.with_db(|db| db.remove_invitation(sku, target)).map_err(db_err)?;
    if removed {
        if let Some(instance) = state.instance(sku) {
            instance.evict_peer(target).await;
        }
        tracing::info!(sku, by = %by, peer = %target, "peer revoked");
    }
    Ok(removed)
}

// ── Join codes ─────────────────────────────────────────────────────────

/// Mint a code for a peer's public key. Expired entries are swept on the
/// way in.
pub fn issue_code(state: &SharedState, sku: &str, peer: &PeerId) -> String {
    let code = generate_code();
    let expires_at = Utc::now() + chrono::Duration::seconds(state.config.code_secs as i64);
    let mut codes = state.codes.lock();
    codes.retain(|_, c| c.expires_at > Utc::now());
    codes.insert(
        code.clone(),
        RequestCode { sku: sku.to_string(), peer: peer.clone(), expires_at },
    );
    code
}

/// Resolve a code back to the peer that requested it. None for unknown,
/// expired, or wrong-event codes.
pub fn resolve_code(state: &SharedState, sku: &str, code: &str) -> Option<PeerId> {
    let codes = state.codes.lock();
    let entry = codes.get(&code.to_uppercase())?;
    if entry.sku != sku || entry.expires_at <= Utc::now() {
        return None;
    }
    Some(entry.peer.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_the_unambiguous_alphabet() {
        for _ in 0..64 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LEN);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)), "bad code: {code}");
            assert!(!code.contains('0') && !code.contains('O') && !code.contains('I'));
        }
    }

    #[test]
    fn secrets_are_distinct() {
        assert_ne!(new_secret(), new_secret());
    }
}
