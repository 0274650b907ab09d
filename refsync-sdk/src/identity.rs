//! Peer identity: P-256 keypairs and public-key-derived peer ids.
//!
//! There is no account system. A peer *is* its ECDSA P-256 public key; the
//! peer id is the base64url encoding of the uncompressed curve point with the
//! leading `0x04` stripped. The private key is generated on first run and
//! never leaves the device.

use std::fmt;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A peer identifier: base64url of the raw uncompressed public key point
/// (64 bytes, no `0x04` prefix).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accept an externally supplied id (e.g. from a query parameter).
    /// The id is only trusted once a signature verifies against it.
    pub fn from_encoded(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Decode back to a verifying key. Fails if the id is not a valid
    /// encoding of a P-256 point.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let raw = URL_SAFE_NO_PAD
            .decode(&self.0)
            .map_err(|e| Error::Key(format!("peer id is not base64url: {e}")))?;
        let mut sec1 = Vec::with_capacity(raw.len() + 1);
        sec1.push(0x04);
        sec1.extend_from_slice(&raw);
        VerifyingKey::from_sec1_bytes(&sec1)
            .map_err(|e| Error::Key(format!("peer id is not a P-256 point: {e}")))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer as seen by other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
}

/// The long-lived device keypair.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        Self { signing: SigningKey::random(&mut rand::thread_rng()) }
    }

    /// Restore a keypair from its 32-byte scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let signing = SigningKey::from_slice(bytes)
            .map_err(|e| Error::Key(format!("invalid secret scalar: {e}")))?;
        Ok(Self { signing })
    }

    pub fn secret_bytes(&self) -> Vec<u8> {
        self.signing.to_bytes().to_vec()
    }

    /// The peer id derived from the public half.
    pub fn peer_id(&self) -> PeerId {
        let point = self.signing.verifying_key().to_encoded_point(false);
        // Uncompressed SEC1 is 0x04 || x || y; the id drops the prefix byte.
        PeerId(URL_SAFE_NO_PAD.encode(&point.as_bytes()[1..]))
    }

    /// Sign a canonical string: ECDSA P-256 over SHA-256, raw `r || s`,
    /// base64url encoded.
    pub fn sign(&self, canonical: &str) -> String {
        let sig: Signature = self.signing.sign(canonical.as_bytes());
        URL_SAFE_NO_PAD.encode(sig.to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("peer_id", &self.peer_id()).finish()
    }
}

/// Verify a base64url `r || s` signature over `canonical` against a peer id.
pub fn verify(peer: &PeerId, canonical: &str, signature_b64: &str) -> Result<()> {
    let key = peer.verifying_key().map_err(|_| Error::BadSignature)?;
    let raw = URL_SAFE_NO_PAD.decode(signature_b64).map_err(|_| Error::BadSignature)?;
    let sig = Signature::from_slice(&raw).map_err(|_| Error::BadSignature)?;
    key.verify(canonical.as_bytes(), &sig).map_err(|_| Error::BadSignature)
}

/// Load the device keypair from `path`, generating and persisting one on
/// first run. The file holds the base64url secret scalar.
pub fn load_or_generate(path: &Path) -> Result<Keypair> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let raw = URL_SAFE_NO_PAD
                .decode(contents.trim())
                .map_err(|e| Error::Key(format!("corrupt key file: {e}")))?;
            Keypair::from_secret_bytes(&raw)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Storage(e.to_string()))?;
            }
            std::fs::write(path, URL_SAFE_NO_PAD.encode(keypair.secret_bytes()))
                .map_err(|e| Error::Storage(e.to_string()))?;
            Ok(keypair)
        }
        Err(e) => Err(Error::Storage(e.to_string())),
    }
}

/// Default on-disk location for the device key.
pub fn default_key_path() -> std::path::PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("refsync")
        .join("peer.key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_roundtrips_to_verifying_key() {
        let kp = Keypair::generate();
        let id = kp.peer_id();
        let vk = id.verifying_key().unwrap();
        assert_eq!(&vk, kp.signing.verifying_key());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let kp = Keypair::generate();
        let sig = kp.sign("GET\n/api/abc/get\n2026-03-01T10:00:00Z\nxyz");
        verify(&kp.peer_id(), "GET\n/api/abc/get\n2026-03-01T10:00:00Z\nxyz", &sig).unwrap();
    }

    #[test]
    fn tampered_canonical_fails() {
        let kp = Keypair::generate();
        let sig = kp.sign("PUT\n/api/abc/incident\n2026-03-01T10:00:00Z\nxyz");
        let err = verify(&kp.peer_id(), "PUT\n/api/abc/incident\n2026-03-01T10:00:01Z\nxyz", &sig);
        assert!(matches!(err, Err(Error::BadSignature)));
    }

    #[test]
    fn wrong_peer_fails() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sig = kp.sign("payload");
        assert!(verify(&other.peer_id(), "payload", &sig).is_err());
    }

    #[test]
    fn keypair_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.key");
        let first = load_or_generate(&path).unwrap();
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }
}
