//! Singleton pairing.
//!
//! A subject with a single volume cannot be processed on its own. When two
//! or more such singletons come from the same scanner series, and no
//! multi-volume subject already owns that series, their volumes are merged
//! into one synthetic subject keyed by the first member.

use std::collections::BTreeMap;
use std::fs;

use serde_json::Value;

use crate::index::{SourceEntry, SourceIndex};
use crate::types::{GlobalManifest, SplitDiffusionIndex};

pub(crate) const DEFAULT_UID_FIELD: &str = "SeriesInstanceUID";
const SERIES_UID_TAG: &str = "0020000E";

/// Canonical key of a merged subject to the member keys it stands for.
pub(crate) type PairingMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Default)]
pub(crate) struct PairingResult {
    pub(crate) index: SplitDiffusionIndex,
    pub(crate) groups: PairingMap,
}

// ── Series UID lookup ───────────────────────────────────────────────────

/// First value of a possibly multi-valued metadata field.
///
/// Accepts a plain string, a list, or a DICOM JSON attribute
/// `{"vr": "UI", "Value": [...]}`.
fn first_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() { None } else { Some(s.to_string()) }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items.first().and_then(first_value),
        Value::Object(map) => map.get("Value").and_then(first_value),
        _ => None,
    }
}

fn uid_from_map(map: &serde_json::Map<String, Value>, field: &str) -> Option<String> {
    map.get(field)
        .or_else(|| {
            if field == DEFAULT_UID_FIELD {
                map.get(SERIES_UID_TAG)
            } else {
                None
            }
        })
        .and_then(first_value)
}

pub(crate) fn series_uid(entry: &SourceEntry, field: &str) -> Option<String> {
    if let Some(uid) = uid_from_map(&entry.extra, field) {
        return Some(uid);
    }
    let metadata_path = entry.metadata.as_ref()?;
    let data = match fs::read_to_string(metadata_path) {
        Ok(data) => data,
        Err(err) => {
            tracing::debug!(path = %metadata_path.display(), error = %err, "metadata unreadable");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&data) {
        Ok(Value::Object(map)) => uid_from_map(&map, field),
        _ => {
            tracing::debug!(path = %metadata_path.display(), "metadata is not a JSON object");
            None
        }
    }
}

// ── Resolution ──────────────────────────────────────────────────────────

pub(crate) fn resolve_singletons(
    index: &SplitDiffusionIndex,
    source: &SourceIndex,
    uid_field: &str,
) -> PairingResult {
    let lookup = |key: &str| source.get(key).and_then(|entry| series_uid(entry, uid_field));

    let mut claimed: BTreeMap<String, String> = BTreeMap::new();
    for (key, volumes) in index {
        if volumes.len() < 2 {
            continue;
        }
        let Some(uid) = lookup(key) else { continue };
        match claimed.get(&uid) {
            Some(first) => {
                tracing::warn!(
                    series_uid = %uid,
                    kept = %first,
                    ignored = %key,
                    "multiple multi-volume subjects share a series UID"
                );
            }
            None => {
                claimed.insert(uid, key.clone());
            }
        }
    }

    let mut candidates: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, volumes) in index {
        if volumes.len() != 1 {
            continue;
        }
        let Some(uid) = lookup(key) else {
            tracing::debug!(subject = %key, "singleton without series UID");
            continue;
        };
        if let Some(owner) = claimed.get(&uid) {
            tracing::debug!(subject = %key, owner = %owner, "series already owned by a multi-volume subject");
            continue;
        }
        candidates.entry(uid).or_default().push(key.clone());
    }

    let mut result = PairingResult {
        index: index.clone(),
        groups: PairingMap::new(),
    };
    for (uid, members) in candidates {
        if members.len() < 2 {
            continue;
        }
        let canonical = members[0].clone();
        let mut merged = BTreeMap::new();
        for member in &members {
            if let Some(volumes) = result.index.remove(member) {
                merged.extend(volumes);
            }
        }
        tracing::info!(
            series_uid = %uid,
            subject = %canonical,
            members = members.len(),
            "merged singleton subjects"
        );
        result.index.insert(canonical.clone(), merged);
        result.groups.insert(canonical, members);
    }
    result
}

/// Copy each merged subject's result back onto all of its member keys.
pub(crate) fn propagate_results(results: &mut GlobalManifest, groups: &PairingMap) {
    for (canonical, members) in groups {
        let Some(manifest) = results.remove(canonical) else {
            continue;
        };
        for member in members {
            results.insert(member.clone(), manifest.clone());
        }
    }
}
