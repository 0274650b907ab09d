//! Read-only export views.

use refsync_sdk::protocol::ShareInfo;
use refsync_sdk::records::{Incident, MatchRef, SkillsKind};

/// CSV export: one row per live incident, oldest first.
///
/// Header: `Date,Time,ID,SKU,Division,Match,Team,Outcome,Rules,Notes`.
/// Rules are joined by spaces; whitespace control characters in notes are
/// flattened to spaces.
pub fn csv(info: &ShareInfo) -> String {
    let mut rows: Vec<&Incident> = info.data.incidents.iter().map(|e| &e.data).collect();
    rows.sort_by_key(|i| i.time);

    let mut out = String::from("Date,Time,ID,SKU,Division,Match,Team,Outcome,Rules,Notes\r\n");
    for incident in rows {
        let date = incident.time.format("%Y-%m-%d").to_string();
        let time = incident.time.format("%H:%M:%S").to_string();
        let notes: String = incident
            .notes
            .chars()
            .map(|c| if matches!(c, '\r' | '\n' | '\t') { ' ' } else { c })
            .collect();
        let fields = [
            date,
            time,
            incident.id.clone(),
            incident.sku.clone(),
            division_column(incident.match_ref.as_ref()),
            match_column(incident.match_ref.as_ref()),
            incident.team.clone(),
            format!("{:?}", incident.outcome),
            incident.rules.join(" "),
            notes,
        ];
        let row: Vec<String> = fields.iter().map(|f| escape(f)).collect();
        out.push_str(&row.join(","));
        out.push_str("\r\n");
    }
    out
}

fn division_column(match_ref: Option<&MatchRef>) -> String {
    match match_ref {
        Some(MatchRef::Match { division, .. }) => division.to_string(),
        _ => String::new(),
    }
}

fn match_column(match_ref: Option<&MatchRef>) -> String {
    match match_ref {
        Some(MatchRef::Match { name, .. }) => name.clone(),
        Some(MatchRef::Skills { kind, attempt }) => {
            let label = match kind {
                SkillsKind::Programming => "Auto",
                SkillsKind::Driver => "Driver",
            };
            format!("{label} Skills {attempt}")
        }
        None => String::new(),
    }
}

fn escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// JSON export: the plain incident records, without consistency metadata.
pub fn json(info: &ShareInfo) -> serde_json::Value {
    let mut incidents: Vec<&Incident> = info.data.incidents.iter().map(|e| &e.data).collect();
    incidents.sort_by_key(|i| i.time);
    serde_json::json!({
        "incidents": incidents,
        "deleted": info.data.deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use refsync_sdk::consistency::Envelope;
    use refsync_sdk::identity::Keypair;
    use refsync_sdk::protocol::IncidentData;
    use refsync_sdk::records::Outcome;

    fn share_info(incidents: Vec<Incident>) -> ShareInfo {
        let peer = Keypair::generate().peer_id();
        ShareInfo {
            data: IncidentData {
                incidents: incidents.into_iter().map(|i| Envelope::new(i, &peer)).collect(),
                deleted: vec![],
            },
            ..Default::default()
        }
    }

    fn incident(team: &str) -> Incident {
        let mut i = Incident::new("RE-VRC-25-0001", team, Outcome::Minor);
        i.time = chrono::Utc.with_ymd_and_hms(2026, 3, 1, 14, 30, 5).unwrap();
        i
    }

    #[test]
    fn header_row_shape() {
        let out = csv(&share_info(vec![]));
        assert_eq!(out, "Date,Time,ID,SKU,Division,Match,Team,Outcome,Rules,Notes\r\n");
    }

    #[test]
    fn league_match_row() {
        let mut i = incident("1234A");
        i.match_ref = Some(MatchRef::Match { division: 2, name: "Q12".into(), id: 77 });
        i.rules = vec!["<SG1>".into(), "<SG6>".into()];
        i.notes = "pinned\nfor\tover five".into();

        let out = csv(&share_info(vec![i]));
        let row = out.lines().nth(1).unwrap();
        assert!(row.starts_with("2026-03-01,14:30:05,"));
        assert!(row.contains(",2,Q12,1234A,Minor,<SG1> <SG6>,pinned for over five"));
    }

    #[test]
    fn skills_attempt_naming() {
        let mut auto = incident("1234A");
        auto.match_ref = Some(MatchRef::Skills { kind: SkillsKind::Programming, attempt: 2 });
        let mut driver = incident("1234A");
        driver.match_ref = Some(MatchRef::Skills { kind: SkillsKind::Driver, attempt: 1 });
        let mut none = incident("1234A");
        none.match_ref = None;

        let out = csv(&share_info(vec![auto, driver, none]));
        assert!(out.contains(",,Auto Skills 2,"));
        assert!(out.contains(",,Driver Skills 1,"));
        // Non-match incidents leave Division and Match empty.
        assert!(out.contains(",,,1234A,"));
    }

    #[test]
    fn fields_with_commas_are_quoted() {
        let mut i = incident("1234A");
        i.notes = "ramming, repeatedly".into();
        let out = csv(&share_info(vec![i]));
        assert!(out.contains("\"ramming, repeatedly\""));
    }

    #[test]
    fn json_export_strips_consistency() {
        let out = json(&share_info(vec![incident("1234A")]));
        let first = &out["incidents"][0];
        assert_eq!(first["team"], "1234A");
        assert!(first.get("consistency").is_none());
    }
}
