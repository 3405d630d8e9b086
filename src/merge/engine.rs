//! Merge strategies for concurrent edits
//!
//! All functions here are pure: they take explicit field maps and return
//! merged maps. Store access and conflict logging stay with the callers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::entities::FieldMap;

/// How a resolution attempt reconciled two change sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    /// The second party's full change set wins outright
    LastWriteWins,
    /// Both change sets applied over the original, second party wins overlaps
    FieldLevelMerge,
    /// Common-ancestor merge that only flags genuine double-edits
    ThreeWayMerge,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::LastWriteWins => "LAST_WRITE_WINS",
            MergeStrategy::FieldLevelMerge => "FIELD_LEVEL_MERGE",
            MergeStrategy::ThreeWayMerge => "THREE_WAY_MERGE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LAST_WRITE_WINS" => Some(MergeStrategy::LastWriteWins),
            "FIELD_LEVEL_MERGE" => Some(MergeStrategy::FieldLevelMerge),
            "THREE_WAY_MERGE" => Some(MergeStrategy::ThreeWayMerge),
            _ => None,
        }
    }
}

/// Take the second party's change set wholesale. No field comparison, no
/// conflicts reported.
pub fn last_write_wins(theirs: &FieldMap) -> FieldMap {
    theirs.clone()
}

/// Apply both change sets over a copy of the original data, second party
/// winning any field overlap. Overlaps are resolved silently.
pub fn field_level_merge(original: &FieldMap, changes_a: &FieldMap, changes_b: &FieldMap) -> FieldMap {
    let mut merged = original.clone();

    for (key, value) in changes_a {
        merged.insert(key.clone(), value.clone());
    }

    for (key, value) in changes_b {
        merged.insert(key.clone(), value.clone());
    }

    merged
}

/// Three-way merge over a common ancestor, like a Git merge.
///
/// For each field appearing in any of the three maps: identical edits and
/// one-sided edits resolve automatically; a field both sides changed to
/// different values is a true conflict. Conflicting fields resolve to
/// `theirs` (the incoming party wins the tie-break) and are reported back
/// so the caller can surface them for manual resolution.
///
/// Returns `(merged_fields, conflicting_field_names)`.
pub fn three_way_merge(
    base: &FieldMap,
    ours: &FieldMap,
    theirs: &FieldMap,
) -> (FieldMap, Vec<String>) {
    let mut merged = FieldMap::new();
    let mut conflicts = Vec::new();

    let keys: BTreeSet<&String> = base.keys().chain(ours.keys()).chain(theirs.keys()).collect();

    for key in keys {
        let base_val = base.get(key.as_str());
        let a_val = ours.get(key.as_str());
        let b_val = theirs.get(key.as_str());

        // Both sides agree (same edit, or neither touched it)
        if a_val == b_val {
            if let Some(value) = a_val {
                merged.insert(key.clone(), value.clone());
            }
        }
        // Only ours changed it
        else if a_val != base_val && b_val == base_val {
            if let Some(value) = a_val {
                merged.insert(key.clone(), value.clone());
            }
        }
        // Only theirs changed it
        else if b_val != base_val && a_val == base_val {
            if let Some(value) = b_val {
                merged.insert(key.clone(), value.clone());
            }
        }
        // True conflict: both sides changed the same field differently.
        // Tie-break toward theirs, but surface the field name.
        else if a_val != b_val && a_val != base_val && b_val != base_val {
            conflicts.push(key.clone());
            if let Some(value) = b_val {
                merged.insert(key.clone(), value.clone());
            }
        }
        // Unreachable with the branches above; keep the ancestor value
        else if let Some(value) = base_val {
            merged.insert(key.clone(), value.clone());
        }
    }

    (merged, conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> FieldMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn merge_is_idempotent() {
        let x = fields(json!({"name": "A", "floor_number": 1, "is_active": true}));

        let (merged, conflicts) = three_way_merge(&x, &x, &x);

        assert_eq!(merged, x);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn identical_edits_never_conflict() {
        let base = fields(json!({"name": "A"}));
        let both = fields(json!({"name": "B"}));

        let (merged, conflicts) = three_way_merge(&base, &both, &both);

        assert_eq!(merged["name"], json!("B"));
        assert!(conflicts.is_empty());
    }

    #[test]
    fn one_sided_edit_wins_without_conflict() {
        let base = fields(json!({"name": "A", "floor_number": 1}));
        let ours = fields(json!({"name": "X", "floor_number": 1}));
        let theirs = base.clone();

        let (merged, conflicts) = three_way_merge(&base, &ours, &theirs);
        assert_eq!(merged["name"], json!("X"));
        assert!(conflicts.is_empty());

        let (merged, conflicts) = three_way_merge(&base, &theirs, &ours);
        assert_eq!(merged["name"], json!("X"));
        assert!(conflicts.is_empty());
    }

    #[test]
    fn non_overlapping_edits_merge_cleanly() {
        let base = fields(json!({"name": "A", "floor_number": 1}));
        let ours = fields(json!({"name": "X", "floor_number": 1}));
        let theirs = fields(json!({"name": "A", "floor_number": 2}));

        let (merged, conflicts) = three_way_merge(&base, &ours, &theirs);

        assert_eq!(merged, fields(json!({"name": "X", "floor_number": 2})));
        assert!(conflicts.is_empty());
    }

    #[test]
    fn double_edit_conflicts_and_theirs_wins() {
        let base = fields(json!({"name": "A"}));
        let ours = fields(json!({"name": "X"}));
        let theirs = fields(json!({"name": "Y"}));

        let (merged, conflicts) = three_way_merge(&base, &ours, &theirs);

        assert_eq!(conflicts, vec!["name".to_string()]);
        assert_eq!(merged["name"], json!("Y"));
    }

    #[test]
    fn field_added_by_one_side_is_kept() {
        let base = fields(json!({"name": "A"}));
        let ours = base.clone();
        let theirs = fields(json!({"name": "A", "is_active": false}));

        let (merged, conflicts) = three_way_merge(&base, &ours, &theirs);

        assert_eq!(merged["is_active"], json!(false));
        assert!(conflicts.is_empty());
    }

    #[test]
    fn field_level_merge_second_party_wins_overlap() {
        let original = fields(json!({"name": "A", "floor_number": 1}));
        let changes_a = fields(json!({"name": "X"}));
        let changes_b = fields(json!({"name": "Y", "is_active": true}));

        let merged = field_level_merge(&original, &changes_a, &changes_b);

        assert_eq!(merged["name"], json!("Y"));
        assert_eq!(merged["floor_number"], json!(1));
        assert_eq!(merged["is_active"], json!(true));
    }

    #[test]
    fn last_write_wins_returns_theirs() {
        let theirs = fields(json!({"name": "Y"}));
        assert_eq!(last_write_wins(&theirs), theirs);
    }
}
