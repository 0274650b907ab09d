//! Wire types: the HTTP response envelope, membership records, the socket
//! frame vocabulary, and the full-state snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consistency::{ConsistentMap, Envelope};
use crate::error::Error;
use crate::identity::{Peer, PeerId};
use crate::records::{Incident, Scratchpad};

/// Machine-readable refusal reasons carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    BadRequest,
    BadSignature,
    IncorrectCode,
    ServerError,
    Stale,
    Forbidden,
}

/// Every JSON response is `{success: true, data}` or
/// `{success: false, reason, details?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiResponse<T> {
    Ok { success: bool, data: T },
    Err {
        success: bool,
        reason: ErrorReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self::Ok { success: true, data }
    }

    pub fn error(reason: ErrorReason, details: Option<String>) -> Self {
        Self::Err { success: false, reason, details }
    }

    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Self::Ok { data, .. } => Ok(data),
            Self::Err { reason, details, .. } => Err(match reason {
                // A refusal for a tombstoned id rides the bad_request reason
                // with a fixed marker in the details.
                ErrorReason::BadRequest if details.as_deref() == Some("tombstoned") => {
                    Error::Tombstoned
                }
                ErrorReason::BadRequest => {
                    Error::Malformed(details.unwrap_or_else(|| "bad request".into()))
                }
                ErrorReason::BadSignature => Error::BadSignature,
                ErrorReason::IncorrectCode => Error::IncorrectCode,
                ErrorReason::ServerError => {
                    Error::Server(details.unwrap_or_else(|| "server error".into()))
                }
                ErrorReason::Stale => Error::Stale,
                ErrorReason::Forbidden => Error::Forbidden,
            }),
        }
    }
}

/// An invitation into an event instance. `instance_secret` is only disclosed
/// once the invitation is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: String,
    pub sku: String,
    pub from: PeerId,
    pub to: PeerId,
    pub admin: bool,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_secret: Option<String>,
}

/// The incident collection as serialized in snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentData {
    pub incidents: Vec<Envelope<Incident>>,
    pub deleted: Vec<String>,
}

impl IncidentData {
    pub fn from_map(map: &ConsistentMap<Incident>) -> Self {
        Self {
            incidents: map.values.values().cloned().collect(),
            deleted: map.deleted.iter().cloned().collect(),
        }
    }

    pub fn into_map(self) -> ConsistentMap<Incident> {
        ConsistentMap {
            values: self.incidents.into_iter().map(|e| (e.data.id.clone(), e)).collect(),
            deleted: self.deleted.into_iter().collect(),
        }
    }
}

/// Full instance snapshot, sent to a joining socket and returned by the
/// snapshot endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShareInfo {
    #[serde(rename = "activeUsers")]
    pub active_users: Vec<Peer>,
    pub invitations: Vec<PeerId>,
    pub data: IncidentData,
    pub scratchpads: BTreeMap<String, Envelope<Scratchpad>>,
}

/// Who a frame came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSender {
    #[serde(rename = "type")]
    pub kind: SenderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    Client,
    Server,
}

impl FrameSender {
    pub fn server() -> Self {
        Self { kind: SenderKind::Server, id: None, name: None }
    }

    pub fn client(peer: &Peer) -> Self {
        Self {
            kind: SenderKind::Client,
            id: Some(peer.id.clone()),
            name: Some(peer.name.clone()),
        }
    }
}

/// Frame payloads, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameBody {
    // Peer → server (echoed back out to the other peers).
    AddIncident { incident: Envelope<Incident> },
    UpdateIncident { incident: Envelope<Incident> },
    RemoveIncident { id: String },
    ScratchpadUpdate { id: String, scratchpad: Envelope<Scratchpad> },
    Message { message: String },

    // Server → peer only.
    ServerShareInfo {
        #[serde(flatten)]
        info: ShareInfo,
    },
    ServerUserAdd {
        user: Peer,
        #[serde(rename = "activeUsers")]
        active_users: Vec<Peer>,
        invitations: Vec<PeerId>,
    },
    ServerUserRemove {
        user: Peer,
        #[serde(rename = "activeUsers")]
        active_users: Vec<Peer>,
        invitations: Vec<PeerId>,
    },
}

/// A complete socket frame: `{type, ...body, sender, date}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(flatten)]
    pub body: FrameBody,
    pub sender: FrameSender,
    pub date: DateTime<Utc>,
}

impl Frame {
    pub fn from_server(body: FrameBody) -> Self {
        Self { body, sender: FrameSender::server(), date: Utc::now() }
    }

    pub fn from_client(body: FrameBody, peer: &Peer) -> Self {
        Self { body, sender: FrameSender::client(peer), date: Utc::now() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Outcome;
    use serde_json::json;

    #[test]
    fn response_envelope_shapes() {
        let ok = ApiResponse::ok(json!({"n": 1}));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"success": true, "data": {"n": 1}})
        );

        let err: ApiResponse<serde_json::Value> =
            ApiResponse::error(ErrorReason::Stale, Some("revision behind".into()));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"success": false, "reason": "stale", "details": "revision behind"})
        );
    }

    #[test]
    fn response_parses_back_to_errors() {
        let parsed: ApiResponse<serde_json::Value> =
            serde_json::from_value(json!({"success": false, "reason": "forbidden"})).unwrap();
        assert!(matches!(parsed.into_result(), Err(Error::Forbidden)));
    }

    #[test]
    fn frame_is_type_tagged_with_sender_and_date() {
        let peer = Peer { id: PeerId::from_encoded("AAA"), name: "head ref".into() };
        let frame = Frame::from_client(FrameBody::RemoveIncident { id: "i1".into() }, &peer);
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "remove_incident");
        assert_eq!(v["id"], "i1");
        assert_eq!(v["sender"]["type"], "client");
        assert_eq!(v["sender"]["name"], "head ref");
        assert!(v["date"].is_string());

        let back: Frame = serde_json::from_value(v).unwrap();
        assert!(matches!(back.body, FrameBody::RemoveIncident { ref id } if id == "i1"));
    }

    #[test]
    fn share_info_frame_flattens_snapshot() {
        let kp = crate::identity::Keypair::generate();
        let peer = Peer { id: kp.peer_id(), name: "ref".into() };
        let mut map = ConsistentMap::new();
        let incident = Incident::new("SKU1", "1234A", Outcome::Major);
        map.upsert(incident.id.clone(), Envelope::new(incident, &peer.id));

        let frame = Frame::from_server(FrameBody::ServerShareInfo {
            info: ShareInfo {
                active_users: vec![peer],
                invitations: vec![],
                data: IncidentData::from_map(&map),
                scratchpads: BTreeMap::new(),
            },
        });
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "server_share_info");
        assert_eq!(v["activeUsers"].as_array().unwrap().len(), 1);
        assert_eq!(v["data"]["incidents"].as_array().unwrap().len(), 1);
    }
}
