//! Client SDK and replication core for collaborative incident logs.
//!
//! Multiple referees record rule-violation incidents for the same event on
//! intermittently connected devices. This crate holds everything both sides
//! of the wire agree on — the per-field LWW consistency envelope, the
//! tombstone set and consistent map built on it, key-based identity and
//! request signing, the JSON protocol — plus the client half: the local
//! replica, the signed HTTP client, and the share-connection socket driver.
//!
//! The authoritative per-event server lives in `refsync-server`.

pub mod canonical;
pub mod connection;
pub mod consistency;
pub mod error;
pub mod http;
pub mod identity;
pub mod protocol;
pub mod records;
pub mod replica;
pub mod storage;
pub mod sync;

pub use connection::{ConnectionState, Event, ShareConnection};
pub use consistency::{Consistent, ConsistentMap, Envelope, GrowSet};
pub use error::{Error, Result};
pub use http::ApiClient;
pub use identity::{Keypair, Peer, PeerId};
pub use protocol::{ApiResponse, ErrorReason, Frame, FrameBody, Invitation, ShareInfo};
pub use records::{Incident, IncidentPatch, MatchRef, Outcome, Scratchpad, SkillsKind};
pub use replica::Replica;
pub use storage::{KvStore, KvStoreExt, MemoryStore};
pub use sync::{SyncClient, SyncEvent};
