//! Application records that ride the envelope: rule-violation incidents and
//! per-match scratchpads.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::consistency::Consistent;
use crate::error::{Error, Result};

/// Reference to the match an incident occurred in. League matches carry
/// their schedule identity; skills runs carry the attempt number. Only
/// value-typed references — match data proper is recomputed by the UI from
/// the event metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchRef {
    Match { division: u32, name: String, id: u64 },
    Skills {
        #[serde(rename = "skillsType")]
        kind: SkillsKind,
        attempt: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillsKind {
    Programming,
    Driver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    General,
    Minor,
    Major,
    Disabled,
}

/// A recorded rule violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    /// Event code; immutable identity alongside `id`.
    pub sku: String,
    pub team: String,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_ref: Option<MatchRef>,
    pub outcome: Outcome,
    /// Rule codes, e.g. `<SG1>`. Opaque to the sync core.
    pub rules: Vec<String>,
    pub notes: String,
    pub time: DateTime<Utc>,
    /// Opaque attachment ids.
    #[serde(default)]
    pub assets: Vec<String>,
}

impl Incident {
    pub fn new(sku: impl Into<String>, team: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            id: format!("incident-{}", uuid::Uuid::new_v4()),
            sku: sku.into(),
            team: team.into(),
            match_ref: None,
            outcome,
            rules: Vec::new(),
            notes: String::new(),
            time: Utc::now(),
            assets: Vec::new(),
        }
    }
}

impl Consistent for Incident {
    fn mutable_keys() -> &'static [&'static str] {
        &["team", "match", "outcome", "rules", "notes", "time", "assets"]
    }

    fn immutable_keys() -> &'static [&'static str] {
        &["id", "sku"]
    }

    fn get(&self, key: &str) -> Value {
        match key {
            "id" => json!(self.id),
            "sku" => json!(self.sku),
            "team" => json!(self.team),
            "match" => json!(self.match_ref),
            "outcome" => json!(self.outcome),
            "rules" => json!(self.rules),
            "notes" => json!(self.notes),
            "time" => json!(self.time),
            "assets" => json!(self.assets),
            _ => Value::Null,
        }
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        match key {
            "team" => self.team = serde_json::from_value(value)?,
            "match" => self.match_ref = serde_json::from_value(value)?,
            "outcome" => self.outcome = serde_json::from_value(value)?,
            "rules" => self.rules = serde_json::from_value(value)?,
            "notes" => self.notes = serde_json::from_value(value)?,
            "time" => self.time = serde_json::from_value(value)?,
            "assets" => self.assets = serde_json::from_value(value)?,
            other => return Err(Error::UnknownField(other.to_string())),
        }
        Ok(())
    }
}

/// A partial edit of an incident: only the present fields are applied, each
/// through the envelope's per-field update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentPatch {
    pub team: Option<String>,
    #[serde(rename = "match")]
    pub match_ref: Option<Option<MatchRef>>,
    pub outcome: Option<Outcome>,
    pub rules: Option<Vec<String>>,
    pub notes: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub assets: Option<Vec<String>>,
}

impl IncidentPatch {
    /// The `(key, value)` pairs this patch touches.
    pub fn entries(&self) -> Vec<(&'static str, Value)> {
        let mut out = Vec::new();
        if let Some(v) = &self.team {
            out.push(("team", json!(v)));
        }
        if let Some(v) = &self.match_ref {
            out.push(("match", json!(v)));
        }
        if let Some(v) = &self.outcome {
            out.push(("outcome", json!(v)));
        }
        if let Some(v) = &self.rules {
            out.push(("rules", json!(v)));
        }
        if let Some(v) = &self.notes {
            out.push(("notes", json!(v)));
        }
        if let Some(v) = &self.time {
            out.push(("time", json!(v)));
        }
        if let Some(v) = &self.assets {
            out.push(("assets", json!(v)));
        }
        out
    }
}

/// Winner of the autonomous period, as tracked on the scratchpad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoWinner {
    #[default]
    None,
    Red,
    Blue,
    Tie,
}

/// Autonomous win point flags per alliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AwpFlags {
    pub red: bool,
    pub blue: bool,
}

/// Per-match referee annotations. One scratchpad exists per
/// `(event, division, match)`, so its id is derived deterministically and
/// every referee lands on the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scratchpad {
    pub id: String,
    pub sku: String,
    /// Season game tag; games differ in which structured fields apply.
    pub game: String,
    #[serde(default)]
    pub awp: AwpFlags,
    #[serde(default)]
    pub auto: AutoWinner,
    #[serde(default)]
    pub notes: String,
}

impl Scratchpad {
    pub fn new(
        sku: impl Into<String>,
        game: impl Into<String>,
        division: u32,
        match_name: &str,
    ) -> Self {
        let sku = sku.into();
        Self {
            id: scratchpad_id(&sku, division, match_name),
            sku,
            game: game.into(),
            awp: AwpFlags::default(),
            auto: AutoWinner::default(),
            notes: String::new(),
        }
    }
}

/// Deterministic scratchpad id for `(sku, division, match)`.
pub fn scratchpad_id(sku: &str, division: u32, match_name: &str) -> String {
    let digest = Sha256::digest(format!("{sku}\n{division}\n{match_name}"));
    format!("scratchpad-{}", URL_SAFE_NO_PAD.encode(digest))
}

impl Consistent for Scratchpad {
    fn mutable_keys() -> &'static [&'static str] {
        &["awp", "auto", "notes"]
    }

    fn immutable_keys() -> &'static [&'static str] {
        &["id", "sku", "game"]
    }

    fn get(&self, key: &str) -> Value {
        match key {
            "id" => json!(self.id),
            "sku" => json!(self.sku),
            "game" => json!(self.game),
            "awp" => json!(self.awp),
            "auto" => json!(self.auto),
            "notes" => json!(self.notes),
            _ => Value::Null,
        }
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        match key {
            "awp" => self.awp = serde_json::from_value(value)?,
            "auto" => self.auto = serde_json::from_value(value)?,
            "notes" => self.notes = serde_json::from_value(value)?,
            other => return Err(Error::UnknownField(other.to_string())),
        }
        Ok(())
    }
}
