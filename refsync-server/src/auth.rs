//! Request authentication.
//!
//! The declared public key *is* the identity — there is no login. The
//! server recomputes the canonical string from what it actually received
//! and verifies the ECDSA signature against the declared key. Dates outside
//! the skew window are rejected, uniformly for HTTP requests and the socket
//! handshake.

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;

use refsync_sdk::canonical;
use refsync_sdk::identity::{self, Peer, PeerId};
use refsync_sdk::protocol::ErrorReason;

use crate::web::Refusal;

/// A verified caller.
#[derive(Debug, Clone)]
pub struct AuthedPeer {
    pub peer: PeerId,
    /// The caller's process-lifetime session UUID, when supplied.
    pub session: Option<Uuid>,
}

fn bad_signature(details: &str) -> Refusal {
    Refusal::new(ErrorReason::BadSignature, Some(details.to_string()))
}

fn check_skew(date: &str, skew: Duration, now: DateTime<Utc>) -> Result<(), Refusal> {
    let signed = DateTime::parse_from_rfc3339(date)
        .map_err(|_| bad_signature("unparseable signing date"))?
        .with_timezone(&Utc);
    let delta = now.signed_duration_since(signed);
    if delta > skew || delta < -skew {
        return Err(bad_signature("signing date outside the skew window"));
    }
    Ok(())
}

/// Verify the signed headers of an HTTP request.
pub fn verify_headers(
    headers: &HeaderMap,
    method: &str,
    path_and_query: &str,
    body: &[u8],
    skew_secs: i64,
    now: DateTime<Utc>,
) -> Result<AuthedPeer, Refusal> {
    let header = |name: &str| -> Result<&str, Refusal> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| bad_signature(&format!("missing {name} header")))
    };
    let signature = header(canonical::HEADER_SIGNATURE)?;
    let public_key = header(canonical::HEADER_PUBLIC_KEY)?;
    let date = header(canonical::HEADER_DATE)?;
    let session = headers
        .get(canonical::HEADER_SESSION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok());

    check_skew(date, Duration::seconds(skew_secs), now)?;

    let peer = PeerId::from_encoded(public_key);
    let canonical = canonical::canonical_request(method, path_and_query, date, body);
    identity::verify(&peer, &canonical, signature)
        .map_err(|_| bad_signature("signature verification failed"))?;

    Ok(AuthedPeer { peer, session })
}

/// Query parameters of the `/join` handshake.
#[derive(Debug, Deserialize)]
pub struct JoinParams {
    pub id: String,
    pub name: String,
    pub date: String,
    pub signature: String,
}

/// Verify a socket handshake: the signature covers the request path and
/// query with the `signature` parameter stripped, and the date goes through
/// the same skew check as the HTTP header date.
pub fn verify_join(
    params: &JoinParams,
    path_and_query: &str,
    skew_secs: i64,
    now: DateTime<Utc>,
) -> Result<Peer, Refusal> {
    check_skew(&params.date, Duration::seconds(skew_secs), now)?;

    let peer = PeerId::from_encoded(params.id.clone());
    let canonical = canonical::canonical_socket(path_and_query);
    identity::verify(&peer, &canonical, &params.signature)
        .map_err(|_| bad_signature("handshake signature verification failed"))?;

    Ok(Peer { id: peer, name: params.name.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use refsync_sdk::identity::Keypair;

    fn signed_headers(kp: &Keypair, method: &str, path: &str, date: &str, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let sig = kp.sign(&canonical::canonical_request(method, path, date, body));
        headers.insert(canonical::HEADER_SIGNATURE, sig.parse().unwrap());
        headers.insert(canonical::HEADER_PUBLIC_KEY, kp.peer_id().as_str().parse().unwrap());
        headers.insert(canonical::HEADER_DATE, date.parse().unwrap());
        headers
    }

    #[test]
    fn accepts_fresh_signature() {
        let kp = Keypair::generate();
        let now = Utc::now();
        let date = now.to_rfc3339();
        let headers = signed_headers(&kp, "GET", "/api/SKU/get", &date, b"");
        let authed = verify_headers(&headers, "GET", "/api/SKU/get", b"", 300, now).unwrap();
        assert_eq!(authed.peer, kp.peer_id());
    }

    #[test]
    fn rejects_outside_skew_window() {
        let kp = Keypair::generate();
        let now = Utc::now();
        let stale = (now - Duration::seconds(301)).to_rfc3339();
        let headers = signed_headers(&kp, "GET", "/api/SKU/get", &stale, b"");
        let err = verify_headers(&headers, "GET", "/api/SKU/get", b"", 300, now).unwrap_err();
        assert_eq!(err.reason, ErrorReason::BadSignature);

        // Just inside the window is fine.
        let fresh = (now - Duration::seconds(299)).to_rfc3339();
        let headers = signed_headers(&kp, "GET", "/api/SKU/get", &fresh, b"");
        assert!(verify_headers(&headers, "GET", "/api/SKU/get", b"", 300, now).is_ok());
    }

    #[test]
    fn rejects_replayed_signature_on_other_path() {
        let kp = Keypair::generate();
        let now = Utc::now();
        let date = now.to_rfc3339();
        let headers = signed_headers(&kp, "GET", "/api/SKU/get", &date, b"");
        assert!(verify_headers(&headers, "GET", "/api/OTHER/get", b"", 300, now).is_err());
        assert!(verify_headers(&headers, "DELETE", "/api/SKU/get", b"", 300, now).is_err());
    }

    #[test]
    fn rejects_tampered_body() {
        let kp = Keypair::generate();
        let now = Utc::now();
        let date = now.to_rfc3339();
        let headers = signed_headers(&kp, "PUT", "/api/SKU/incident", &date, b"{\"a\":1}");
        assert!(
            verify_headers(&headers, "PUT", "/api/SKU/incident", b"{\"a\":2}", 300, now).is_err()
        );
    }

    #[test]
    fn join_signature_binds_query() {
        let kp = Keypair::generate();
        let now = Utc::now();
        let date = now.to_rfc3339();
        let path = format!(
            "/api/SKU/join?id={}&name=ref&date={}",
            kp.peer_id().as_str(),
            date.replace('+', "%2B"),
        );
        let signature = kp.sign(&canonical::canonical_socket(&path));
        let full = format!("{path}&signature={signature}");
        let params = JoinParams {
            id: kp.peer_id().as_str().to_string(),
            name: "ref".into(),
            date: date.clone(),
            signature,
        };
        let peer = verify_join(&params, &full, 300, now).unwrap();
        assert_eq!(peer.id, kp.peer_id());
        assert_eq!(peer.name, "ref");

        // A different name in the signed path does not verify.
        let tampered = full.replace("name=ref", "name=impostor");
        assert!(verify_join(&params, &tampered, 300, now).is_err());
    }
}
