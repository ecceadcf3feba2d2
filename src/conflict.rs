//! Conflict Resolver (C4): a pure function over `(local, remote, strategy)`
//! that decides a winner and a merged row. Grounded in the HLC-ordered
//! last-writer-wins merge of the client oplog, generalized to the proxy's
//! named strategies and extended with structural conflict detection.

use serde_json::Value;

use crate::types::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    VersionBased,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
    /// `VersionBased` produced no ordering (missing/equal version columns);
    /// the caller must escalate, same as `Manual`.
    Undecided,
}

#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub winner: Winner,
    pub resolved: Row,
    /// Field names present in both rows with differing values.
    pub conflicting_fields: Vec<String>,
}

const IGNORED_FIELDS: [&str; 3] = ["createdAt", "updatedAt", "version"];

/// Detects whether `local` and `remote` actually disagree on any field that
/// matters for conflict purposes. A conflict exists when `version` columns
/// differ, `remote.updatedAt` is strictly newer than `local.updatedAt`, or
/// a field-by-field diff (ignoring `createdAt`/`updatedAt`/`version`) finds
/// a difference. Two rows that differ only in fields absent from one side
/// are not in conflict — that is a partial update, not a collision.
pub fn detect_conflict(local: &Row, remote: &Row) -> Vec<String> {
    let mut fields = Vec::new();

    if extract_version(local).zip(extract_version(remote)).map(|(l, r)| l != r).unwrap_or(false) {
        fields.push("version".to_string());
    }
    if let (Some(l), Some(r)) = (local.get("updatedAt").and_then(Value::as_str), remote.get("updatedAt").and_then(Value::as_str)) {
        if r > l {
            fields.push("updatedAt".to_string());
        }
    }

    for (k, local_v) in local.iter() {
        if IGNORED_FIELDS.contains(&k.as_str()) {
            continue;
        }
        if let Some(remote_v) = remote.get(k) {
            if local_v != remote_v {
                fields.push(k.clone());
            }
        }
    }
    fields.sort();
    fields.dedup();
    fields
}

/// Parses an HLC-style monotonic clock token of the form `"<ms>-<ctr>-<origin>"`.
/// Unparsable segments default to zero/empty so the comparison stays total.
pub fn parse_hlc(s: &str) -> (i128, i64, String) {
    let mut parts = s.splitn(3, '-');
    let ms = parts.next().unwrap_or("0").parse::<i128>().unwrap_or(0);
    let ctr = parts.next().unwrap_or("0").parse::<i64>().unwrap_or(0);
    let origin = parts.next().unwrap_or("").to_string();
    (ms, ctr, origin)
}

pub fn should_overwrite(local_hlc: &str, remote_hlc: &str) -> bool {
    parse_hlc(local_hlc) > parse_hlc(remote_hlc)
}

/// Resolves a detected conflict into a single final row plus the declared
/// winner. This is a pure function: it never touches the database, and the
/// same inputs always produce the same output.
pub fn resolve(local: &Row, remote: &Row, strategy: ConflictStrategy) -> ConflictRecord {
    let conflicting_fields = detect_conflict(local, remote);

    if conflicting_fields.is_empty() {
        return ConflictRecord { winner: Winner::Remote, resolved: remote.clone(), conflicting_fields };
    }

    match strategy {
        ConflictStrategy::LocalWins => {
            let mut resolved = local.clone();
            if !resolved.contains_key("createdAt") {
                if let Some(created_at) = remote.get("createdAt") {
                    resolved.insert("createdAt".to_string(), created_at.clone());
                }
            }
            if let (Some(l), Some(r)) = (extract_version(local), extract_version(remote)) {
                resolved.insert("version".to_string(), Value::from(l.max(r) + 1));
            }
            ConflictRecord { winner: Winner::Local, resolved, conflicting_fields }
        }
        ConflictStrategy::RemoteWins => {
            ConflictRecord { winner: Winner::Remote, resolved: remote.clone(), conflicting_fields }
        }
        ConflictStrategy::VersionBased => resolve_version_based(local, remote, conflicting_fields),
        ConflictStrategy::Manual => {
            ConflictRecord { winner: Winner::Undecided, resolved: local.clone(), conflicting_fields }
        }
    }
}

fn resolve_version_based(local: &Row, remote: &Row, conflicting_fields: Vec<String>) -> ConflictRecord {
    let local_version = extract_version(local);
    let remote_version = extract_version(remote);

    match (local_version, remote_version) {
        (Some(l), Some(r)) if l > r => {
            ConflictRecord { winner: Winner::Local, resolved: local.clone(), conflicting_fields }
        }
        (Some(l), Some(r)) if r > l => {
            ConflictRecord { winner: Winner::Remote, resolved: remote.clone(), conflicting_fields }
        }
        (Some(_), Some(_)) => {
            // Equal versions tie-break local-wins, per strategy contract.
            ConflictRecord { winner: Winner::Local, resolved: local.clone(), conflicting_fields }
        }
        _ => {
            // Both sides must carry `version` for this strategy; missing it
            // on either side is not decidable automatically.
            ConflictRecord { winner: Winner::Undecided, resolved: local.clone(), conflicting_fields }
        }
    }
}

fn extract_version(row: &Row) -> Option<i64> {
    row.get("version").and_then(Value::as_i64)
}

/// Last-writer-wins merge at the field level: for each `changed_field`,
/// take the remote value if present, otherwise keep local. `None` means
/// "whole row", i.e. a plain overwrite.
pub fn lww_merge_row(local: &Row, remote: &Row, changed_fields: Option<&[String]>) -> Row {
    match changed_fields {
        None => remote.clone(),
        Some(fields) => {
            let mut out = local.clone();
            for k in fields {
                if let Some(v) = remote.get(k) {
                    out.insert(k.clone(), v.clone());
                }
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        let mut r = Row::new();
        for (k, v) in pairs {
            r.insert((*k).to_string(), v.clone());
        }
        r
    }

    #[test]
    fn no_conflict_when_fields_dont_overlap() {
        let local = row(&[("id", json!("1")), ("name", json!("a"))]);
        let remote = row(&[("id", json!("1")), ("email", json!("x@example.com"))]);
        assert!(detect_conflict(&local, &remote).is_empty());
    }

    #[test]
    fn local_wins_strategy_keeps_local_row() {
        let local = row(&[("id", json!("1")), ("name", json!("local"))]);
        let remote = row(&[("id", json!("1")), ("name", json!("remote"))]);
        let record = resolve(&local, &remote, ConflictStrategy::LocalWins);
        assert_eq!(record.winner, Winner::Local);
        assert_eq!(record.resolved.get("name"), Some(&json!("local")));
    }

    #[test]
    fn version_based_picks_higher_version() {
        let local = row(&[("id", json!("1")), ("version", json!(2)), ("name", json!("local"))]);
        let remote = row(&[("id", json!("1")), ("version", json!(5)), ("name", json!("remote"))]);
        let record = resolve(&local, &remote, ConflictStrategy::VersionBased);
        assert_eq!(record.winner, Winner::Remote);
    }

    #[test]
    fn manual_strategy_is_undecided() {
        let local = row(&[("id", json!("1")), ("name", json!("local"))]);
        let remote = row(&[("id", json!("1")), ("name", json!("remote"))]);
        let record = resolve(&local, &remote, ConflictStrategy::Manual);
        assert_eq!(record.winner, Winner::Undecided);
    }

    #[test]
    fn conflicting_fields_ignore_timestamps_and_version_bookkeeping() {
        let local = row(&[("id", json!("1")), ("name", json!("same")), ("updatedAt", json!("2024-01-01"))]);
        let remote = row(&[("id", json!("1")), ("name", json!("same")), ("updatedAt", json!("2024-01-02"))]);
        assert_eq!(detect_conflict(&local, &remote), vec!["updatedAt".to_string()]);
    }

    #[test]
    fn local_wins_carries_remote_created_at_and_bumps_version() {
        let local = row(&[("id", json!("1")), ("title", json!("B")), ("version", json!(2))]);
        let remote = row(&[("id", json!("1")), ("title", json!("C")), ("version", json!(3)), ("createdAt", json!("2024-01-01"))]);
        let record = resolve(&local, &remote, ConflictStrategy::LocalWins);
        assert_eq!(record.winner, Winner::Local);
        assert_eq!(record.resolved.get("title"), Some(&json!("B")));
        assert_eq!(record.resolved.get("createdAt"), Some(&json!("2024-01-01")));
        assert_eq!(record.resolved.get("version"), Some(&json!(4)));
    }

    #[test]
    fn version_based_tie_breaks_local_wins() {
        let local = row(&[("id", json!("1")), ("version", json!(2)), ("name", json!("local"))]);
        let remote = row(&[("id", json!("1")), ("version", json!(2)), ("name", json!("remote"))]);
        let record = resolve(&local, &remote, ConflictStrategy::VersionBased);
        assert_eq!(record.winner, Winner::Local);
    }

    #[test]
    fn should_overwrite_compares_hlc_tuples() {
        assert!(should_overwrite("100-1-a", "100-0-a"));
        assert!(!should_overwrite("100-0-a", "100-1-a"));
    }

    #[test]
    fn lww_merge_applies_only_changed_fields() {
        let local = row(&[("id", json!("1")), ("name", json!("local")), ("age", json!(30))]);
        let remote = row(&[("id", json!("1")), ("name", json!("remote")), ("age", json!(99))]);
        let merged = lww_merge_row(&local, &remote, Some(&["name".to_string()]));
        assert_eq!(merged.get("name"), Some(&json!("remote")));
        assert_eq!(merged.get("age"), Some(&json!(30)));
    }
}
