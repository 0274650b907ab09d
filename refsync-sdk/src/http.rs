//! Signed HTTP client for the instance API.
//!
//! Every request carries the signature, public key, date, and session
//! headers. Transient failures retry with exponential backoff (1 s, doubling
//! to a 30 s cap, ±20 % jitter); a `bad_signature` refusal is retried once
//! with a freshly signed date before being surfaced, which papers over
//! clock drift between sign time and arrival.

use chrono::{SecondsFormat, Utc};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use rand::Rng;
use reqwest::Method;
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::canonical;
use crate::consistency::Envelope;
use crate::error::{Error, Result};
use crate::identity::{Keypair, PeerId};
use crate::protocol::{ApiResponse, Invitation, ShareInfo};
use crate::records::Incident;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const BACKOFF_START: std::time::Duration = std::time::Duration::from_secs(1);
const BACKOFF_CAP: std::time::Duration = std::time::Duration::from_secs(30);

fn encode(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// Sleep duration for the nth retry (0-based), with ±20 % jitter.
pub fn backoff_delay(attempt: u32) -> std::time::Duration {
    let base = BACKOFF_START
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(BACKOFF_CAP)
        .as_secs_f64();
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    std::time::Duration::from_secs_f64(base * jitter)
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    keypair: Keypair,
    /// Random UUID, stable for the process lifetime. Rate limiting and log
    /// correlation only.
    session: Uuid,
}

impl ApiClient {
    pub fn new(base_url: &str, keypair: Keypair) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| Error::Malformed(e.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self { http, base, keypair, session: Uuid::new_v4() })
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// A request builder with the signing headers attached.
    fn signed_request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::RequestBuilder> {
        let url = self
            .base
            .join(path_and_query)
            .map_err(|e| Error::Malformed(e.to_string()))?;
        let body_bytes = match body {
            Some(v) => serde_json::to_vec(v)?,
            None => Vec::new(),
        };
        let date = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let signature = self.keypair.sign(&canonical::canonical_request(
            method.as_str(),
            path_and_query,
            &date,
            &body_bytes,
        ));

        let mut request = self
            .http
            .request(method, url)
            .header(canonical::HEADER_SIGNATURE, signature)
            .header(canonical::HEADER_PUBLIC_KEY, self.keypair.peer_id().as_str())
            .header(canonical::HEADER_DATE, date)
            .header(canonical::HEADER_SESSION, self.session.to_string());
        if body.is_some() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body_bytes);
        }
        Ok(request)
    }

    /// One signed request, no retries.
    async fn send_once(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let response = self.signed_request(method, path_and_query, body)?.send().await?;
        let status = response.status();
        let payload: ApiResponse<Value> = response
            .json()
            .await
            .map_err(|e| {
                if status.is_server_error() {
                    Error::Server(format!("http {status}"))
                } else {
                    Error::Malformed(e.to_string())
                }
            })?;
        payload.into_result()
    }

    /// Signed request with the retry policy applied.
    pub async fn send(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut resigned = false;
        let mut attempt: u32 = 0;
        loop {
            match self.send_once(method.clone(), path_and_query, body).await {
                Ok(v) => return Ok(v),
                Err(Error::BadSignature) if !resigned => {
                    // Re-sign with the current clock and try once more.
                    resigned = true;
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts() => {
                    tracing::debug!(
                        path = path_and_query,
                        attempt,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn max_attempts(&self) -> u32 {
        5
    }

    // ── Membership ─────────────────────────────────────────────────────

    /// Register or update the caller's display name.
    pub async fn register_user(&self, name: &str) -> Result<()> {
        let body = serde_json::json!({ "name": name });
        self.send(Method::POST, "/api/user", Some(&body)).await?;
        Ok(())
    }

    /// Create the instance for an event; the caller becomes its admin and
    /// receives an already-accepted self-invitation.
    pub async fn create_instance(&self, sku: &str) -> Result<Invitation> {
        let v = self.send(Method::POST, &format!("/api/{sku}/create"), None).await?;
        Ok(serde_json::from_value(v)?)
    }

    /// The caller's invitation state for an event, if any.
    pub async fn invitation(&self, sku: &str) -> Result<Option<Invitation>> {
        let v = self.send(Method::GET, &format!("/api/{sku}/invitation"), None).await?;
        Ok(serde_json::from_value(v)?)
    }

    pub async fn accept(&self, sku: &str, invitation_id: &str) -> Result<Invitation> {
        let path = format!("/api/{sku}/accept?invitation={}", encode(invitation_id));
        let v = self.send(Method::PUT, &path, None).await?;
        Ok(serde_json::from_value(v)?)
    }

    pub async fn invite(&self, sku: &str, user: &PeerId, admin: bool) -> Result<Invitation> {
        let mut path = format!("/api/{sku}/invite?user={}", encode(user.as_str()));
        if admin {
            path.push_str("&admin=1");
        }
        let v = self.send(Method::PUT, &path, None).await?;
        Ok(serde_json::from_value(v)?)
    }

    /// Revoke a peer (or leave, when `user` is the caller).
    pub async fn revoke(&self, sku: &str, user: &PeerId) -> Result<()> {
        let path = format!("/api/{sku}/invite?user={}", encode(user.as_str()));
        self.send(Method::DELETE, &path, None).await?;
        Ok(())
    }

    /// Produce a short join code bound to the caller's public key.
    pub async fn request_code(&self, sku: &str) -> Result<String> {
        let v = self.send(Method::PUT, &format!("/api/{sku}/request"), None).await?;
        Ok(serde_json::from_value(v)?)
    }

    /// Resolve a join code (read off the requester's screen) to a peer id.
    pub async fn resolve_code(&self, sku: &str, code: &str) -> Result<PeerId> {
        let path = format!("/api/{sku}/request?code={}", encode(code));
        let v = self.send(Method::GET, &path, None).await?;
        Ok(serde_json::from_value(v)?)
    }

    // ── Incidents ──────────────────────────────────────────────────────

    pub async fn put_incident(&self, sku: &str, incident: &Envelope<Incident>) -> Result<()> {
        let body = serde_json::to_value(incident)?;
        self.send(Method::PUT, &format!("/api/{sku}/incident"), Some(&body)).await?;
        Ok(())
    }

    pub async fn patch_incident(&self, sku: &str, incident: &Envelope<Incident>) -> Result<()> {
        let body = serde_json::to_value(incident)?;
        self.send(Method::PATCH, &format!("/api/{sku}/incident"), Some(&body)).await?;
        Ok(())
    }

    pub async fn delete_incident(&self, sku: &str, id: &str) -> Result<()> {
        let path = format!("/api/{sku}/incident?id={}", encode(id));
        self.send(Method::DELETE, &path, None).await?;
        Ok(())
    }

    /// Out-of-band full snapshot; feeds the same reconciliation pipeline as
    /// a socket join.
    pub async fn snapshot(&self, sku: &str) -> Result<ShareInfo> {
        let v = self.send(Method::GET, &format!("/api/{sku}/get"), None).await?;
        Ok(serde_json::from_value(v)?)
    }

    /// The CSV export view (plain text, not the JSON envelope).
    pub async fn export_csv(&self, sku: &str) -> Result<String> {
        let response = self
            .signed_request(Method::GET, &format!("/api/{sku}/csv"), None)?
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Server(format!("csv export failed: http {status}")));
        }
        Ok(response.text().await?)
    }

    // ── Socket handshake ───────────────────────────────────────────────

    /// The signed `/join` URL for this peer. The signature covers the path
    /// and query with the `signature` parameter itself excluded.
    pub fn join_url(&self, sku: &str, name: &str) -> Result<Url> {
        let date = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let path = format!(
            "/api/{sku}/join?id={}&name={}&date={}",
            encode(self.keypair.peer_id().as_str()),
            encode(name),
            encode(&date),
        );
        let signature = self.keypair.sign(&canonical::canonical_socket(&path));
        let mut url = self
            .base
            .join(&format!("{path}&signature={}", encode(&signature)))
            .map_err(|e| Error::Malformed(e.to_string()))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|_| Error::Malformed("bad base url".into()))?;
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        for _ in 0..32 {
            assert!(backoff_delay(0).as_secs_f64() <= 1.2);
            assert!(backoff_delay(0).as_secs_f64() >= 0.8);
            let d3 = backoff_delay(3).as_secs_f64();
            assert!((6.4..=9.6).contains(&d3), "attempt 3 delay out of range: {d3}");
            // Far attempts stay at the cap.
            assert!(backoff_delay(20).as_secs_f64() <= 36.0);
            assert!(backoff_delay(20).as_secs_f64() >= 24.0);
        }
    }

    #[test]
    fn join_url_is_ws_and_signed() {
        let kp = Keypair::generate();
        let client = ApiClient::new("http://127.0.0.1:9000", kp.clone()).unwrap();
        let url = client.join_url("RE-VRC-25-0001", "head ref").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert!(url.path().ends_with("/join"));

        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["id"], kp.peer_id().as_str());
        assert_eq!(query["name"], "head ref");
        assert!(query.contains_key("date"));
        assert!(query.contains_key("signature"));

        // The signature verifies over the signature-stripped path.
        let path_and_query = format!("{}?{}", url.path(), url.query().unwrap());
        let canonical = crate::canonical::canonical_socket(&path_and_query);
        crate::identity::verify(&kp.peer_id(), &canonical, &query["signature"]).unwrap();
    }
}
