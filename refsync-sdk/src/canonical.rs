//! Canonical request strings for signing and verification.
//!
//! Both sides of the wire must agree byte-for-byte on what was signed, so
//! the canonical forms live here and the server crate reuses them.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// Header carrying the base64url `r || s` signature.
pub const HEADER_SIGNATURE: &str = "x-referee-signature";
/// Header carrying the signing peer's public key id.
pub const HEADER_PUBLIC_KEY: &str = "x-referee-public-key";
/// Header carrying the ISO-8601 signing date.
pub const HEADER_DATE: &str = "x-referee-date";
/// Header carrying the process-lifetime session UUID (log correlation and
/// rate limiting only; no authority).
pub const HEADER_SESSION: &str = "x-referee-session";

/// base64url SHA-256 of the request body. A missing body hashes the empty
/// string.
pub fn body_hash(body: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(body))
}

/// The canonical string for an HTTP request:
///
/// ```text
/// METHOD \n PATH-WITH-QUERY \n ISO-8601-DATE \n base64url(SHA-256(body))
/// ```
pub fn canonical_request(method: &str, path_and_query: &str, date: &str, body: &[u8]) -> String {
    format!("{method}\n{path_and_query}\n{date}\n{}", body_hash(body))
}

/// The canonical string for a socket handshake: the request path-with-query
/// with the `signature` parameter removed. Signing the path rather than the
/// absolute URL keeps the check stable across ws/wss and reverse proxies.
pub fn canonical_socket(path_and_query: &str) -> String {
    let Some((path, query)) = path_and_query.split_once('?') else {
        return path_and_query.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.starts_with("signature="))
        .collect();
    if kept.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", kept.join("&"))
    }
}
