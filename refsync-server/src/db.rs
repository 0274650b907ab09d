//! SQLite persistence layer.
//!
//! Stores registered users, instances, invitations, incident envelopes,
//! tombstones, and scratchpads. Uses WAL mode for concurrent reads during
//! writes. Envelopes are stored as JSON columns — the server never looks
//! inside them except to merge.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

use refsync_sdk::consistency::Envelope;
use refsync_sdk::identity::PeerId;
use refsync_sdk::protocol::Invitation;
use refsync_sdk::records::{Incident, Scratchpad};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open(path: &str) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                peer TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instances (
                sku        TEXT PRIMARY KEY,
                secret     TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS invitations (
                id         TEXT PRIMARY KEY,
                sku        TEXT NOT NULL,
                from_peer  TEXT NOT NULL,
                to_peer    TEXT NOT NULL,
                admin      INTEGER NOT NULL DEFAULT 0,
                accepted   INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(sku, to_peer)
            );

            CREATE TABLE IF NOT EXISTS incidents (
                sku           TEXT NOT NULL,
                id            TEXT NOT NULL,
                envelope_json TEXT NOT NULL,
                PRIMARY KEY (sku, id)
            );

            CREATE TABLE IF NOT EXISTS tombstones (
                sku TEXT NOT NULL,
                id  TEXT NOT NULL,
                PRIMARY KEY (sku, id)
            );

            CREATE TABLE IF NOT EXISTS scratchpads (
                sku           TEXT NOT NULL,
                id            TEXT NOT NULL,
                envelope_json TEXT NOT NULL,
                PRIMARY KEY (sku, id)
            );
            ",
        )?;

        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────

    pub fn upsert_user(&self, peer: &PeerId, name: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO users (peer, name) VALUES (?1, ?2)
             ON CONFLICT(peer) DO UPDATE SET name=excluded.name",
            params![peer.as_str(), name],
        )?;
        Ok(())
    }

    pub fn user_name(&self, peer: &PeerId) -> SqlResult<Option<String>> {
        self.conn
            .query_row("SELECT name FROM users WHERE peer = ?1", params![peer.as_str()], |row| {
                row.get(0)
            })
            .optional()
    }

    // ── Instances ──────────────────────────────────────────────────────

    /// Create an instance row. Returns false if the sku already exists.
    pub fn create_instance(&self, sku: &str, secret: &str, created_at: i64) -> SqlResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO instances (sku, secret, created_at) VALUES (?1, ?2, ?3)",
            params![sku, secret, created_at],
        )?;
        Ok(inserted == 1)
    }

    pub fn instance_secret(&self, sku: &str) -> SqlResult<Option<String>> {
        self.conn
            .query_row("SELECT secret FROM instances WHERE sku = ?1", params![sku], |row| {
                row.get(0)
            })
            .optional()
    }

    // ── Invitations ────────────────────────────────────────────────────

    pub fn insert_invitation(&self, inv: &Invitation, created_at: i64) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO invitations (id, sku, from_peer, to_peer, admin, accepted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(sku, to_peer) DO UPDATE SET
                id=excluded.id,
                from_peer=excluded.from_peer,
                admin=excluded.admin,
                accepted=excluded.accepted,
                created_at=excluded.created_at",
            params![
                inv.id,
                inv.sku,
                inv.from.as_str(),
                inv.to.as_str(),
                inv.admin as i32,
                inv.accepted as i32,
                created_at,
            ],
        )?;
        Ok(())
    }

    fn row_to_invitation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Invitation> {
        Ok(Invitation {
            id: row.get(0)?,
            sku: row.get(1)?,
            from: PeerId::from_encoded(row.get::<_, String>(2)?),
            to: PeerId::from_encoded(row.get::<_, String>(3)?),
            admin: row.get::<_, i32>(4)? != 0,
            accepted: row.get::<_, i32>(5)? != 0,
            instance_secret: None,
        })
    }

    pub fn invitation_for(&self, sku: &str, to: &PeerId) -> SqlResult<Option<Invitation>> {
        self.conn
            .query_row(
                "SELECT id, sku, from_peer, to_peer, admin, accepted
                 FROM invitations WHERE sku = ?1 AND to_peer = ?2",
                params![sku, to.as_str()],
                Self::row_to_invitation,
            )
            .optional()
    }

    pub fn invitation_by_id(&self, id: &str) -> SqlResult<Option<Invitation>> {
        self.conn
            .query_row(
                "SELECT id, sku, from_peer, to_peer, admin, accepted
                 FROM invitations WHERE id = ?1",
                params![id],
                Self::row_to_invitation,
            )
            .optional()
    }

    pub fn mark_accepted(&self, id: &str) -> SqlResult<()> {
        self.conn
            .execute("UPDATE invitations SET accepted = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn remove_invitation(&self, sku: &str, peer: &PeerId) -> SqlResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM invitations WHERE sku = ?1 AND to_peer = ?2",
            params![sku, peer.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Peers holding an accepted invitation.
    pub fn invited_peers(&self, sku: &str) -> SqlResult<Vec<PeerId>> {
        let mut stmt = self.conn.prepare(
            "SELECT to_peer FROM invitations WHERE sku = ?1 AND accepted = 1 ORDER BY to_peer",
        )?;
        let rows = stmt.query_map(params![sku], |row| row.get::<_, String>(0))?;
        rows.map(|r| r.map(PeerId::from_encoded)).collect()
    }

    pub fn is_member(&self, sku: &str, peer: &PeerId) -> SqlResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM invitations
             WHERE sku = ?1 AND to_peer = ?2 AND accepted = 1",
            params![sku, peer.as_str()],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn is_admin(&self, sku: &str, peer: &PeerId) -> SqlResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM invitations
             WHERE sku = ?1 AND to_peer = ?2 AND accepted = 1 AND admin = 1",
            params![sku, peer.as_str()],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn admin_count(&self, sku: &str) -> SqlResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM invitations WHERE sku = ?1 AND accepted = 1 AND admin = 1",
            params![sku],
            |row| row.get(0),
        )
    }

    // ── Incidents ──────────────────────────────────────────────────────

    pub fn upsert_incident(&self, sku: &str, envelope: &Envelope<Incident>) -> SqlResult<()> {
        let json = serde_json::to_string(envelope)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn.execute(
            "INSERT INTO incidents (sku, id, envelope_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(sku, id) DO UPDATE SET envelope_json=excluded.envelope_json",
            params![sku, envelope.data.id, json],
        )?;
        Ok(())
    }

    pub fn get_incident(&self, sku: &str, id: &str) -> SqlResult<Option<Envelope<Incident>>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT envelope_json FROM incidents WHERE sku = ?1 AND id = ?2",
                params![sku, id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.and_then(|j| serde_json::from_str(&j).ok()))
    }

    pub fn list_incidents(&self, sku: &str) -> SqlResult<Vec<Envelope<Incident>>> {
        let mut stmt = self.conn.prepare(
            "SELECT envelope_json FROM incidents WHERE sku = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![sku], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            // A row that no longer parses is skipped rather than poisoning
            // the whole snapshot.
            match serde_json::from_str(&row?) {
                Ok(env) => out.push(env),
                Err(e) => tracing::warn!(sku, error = %e, "dropping unparseable incident row"),
            }
        }
        Ok(out)
    }

    pub fn delete_incident(&self, sku: &str, id: &str) -> SqlResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM incidents WHERE sku = ?1 AND id = ?2",
            params![sku, id],
        )?;
        Ok(removed > 0)
    }

    pub fn add_tombstone(&self, sku: &str, id: &str) -> SqlResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO tombstones (sku, id) VALUES (?1, ?2)",
            params![sku, id],
        )?;
        Ok(inserted == 1)
    }

    pub fn is_tombstoned(&self, sku: &str, id: &str) -> SqlResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tombstones WHERE sku = ?1 AND id = ?2",
            params![sku, id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn tombstones(&self, sku: &str) -> SqlResult<Vec<String>> {
        let mut stmt =
            self.conn.prepare("SELECT id FROM tombstones WHERE sku = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![sku], |row| row.get(0))?;
        rows.collect()
    }

    // ── Scratchpads ────────────────────────────────────────────────────

    pub fn upsert_scratchpad(&self, sku: &str, envelope: &Envelope<Scratchpad>) -> SqlResult<()> {
        let json = serde_json::to_string(envelope)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn.execute(
            "INSERT INTO scratchpads (sku, id, envelope_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(sku, id) DO UPDATE SET envelope_json=excluded.envelope_json",
            params![sku, envelope.data.id, json],
        )?;
        Ok(())
    }

    pub fn get_scratchpad(&self, sku: &str, id: &str) -> SqlResult<Option<Envelope<Scratchpad>>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT envelope_json FROM scratchpads WHERE sku = ?1 AND id = ?2",
                params![sku, id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.and_then(|j| serde_json::from_str(&j).ok()))
    }

    pub fn scratchpads(&self, sku: &str) -> SqlResult<BTreeMap<String, Envelope<Scratchpad>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, envelope_json FROM scratchpads WHERE sku = ?1")?;
        let rows = stmt.query_map(params![sku], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (id, json) = row?;
            match serde_json::from_str(&json) {
                Ok(env) => {
                    out.insert(id, env);
                }
                Err(e) => tracing::warn!(sku, error = %e, "dropping unparseable scratchpad row"),
            }
        }
        Ok(out)
    }

    // ── Eviction ───────────────────────────────────────────────────────

    /// Wipe every row belonging to an instance. Fired by the idle alarm.
    pub fn wipe_instance(&self, sku: &str) -> SqlResult<()> {
        self.conn.execute("DELETE FROM incidents WHERE sku = ?1", params![sku])?;
        self.conn.execute("DELETE FROM tombstones WHERE sku = ?1", params![sku])?;
        self.conn.execute("DELETE FROM scratchpads WHERE sku = ?1", params![sku])?;
        self.conn.execute("DELETE FROM invitations WHERE sku = ?1", params![sku])?;
        self.conn.execute("DELETE FROM instances WHERE sku = ?1", params![sku])?;
        Ok(())
    }
}
