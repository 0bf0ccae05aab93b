//! Diff between the units derived from a source tree and the records
//! already stored in its collection.
//!
//! The plan partitions identities into four disjoint sets. Only `insert`
//! and `update` need embedding; `delete` removes identities that no
//! longer exist in any retained document.

use std::collections::{HashMap, HashSet};

use crate::models::ContentUnit;

/// What the store knows about one stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub content_hash: String,
    pub source_path: String,
    pub document_hash: String,
    /// Units the source document had when this record was written.
    pub fragment_count: usize,
}

/// Partition of identities produced by [`plan`].
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub insert: Vec<ContentUnit>,
    pub update: Vec<ContentUnit>,
    pub unchanged: Vec<String>,
    pub delete: Vec<String>,
}

/// Compute the reconciliation plan.
///
/// `retained_paths` lists source paths that still exist but were not
/// (re)planned this run, for example unchanged or unreadable documents.
/// Their stored identities are never deleted.
pub fn plan(
    existing: &HashMap<String, Fingerprint>,
    units: Vec<ContentUnit>,
    retained_paths: &HashSet<String>,
) -> ReconcilePlan {
    let mut out = ReconcilePlan::default();
    let mut seen: HashSet<String> = HashSet::with_capacity(units.len());

    for unit in units {
        if !seen.insert(unit.identity.clone()) {
            continue;
        }
        match existing.get(&unit.identity) {
            None => out.insert.push(unit),
            Some(fp) if fp.content_hash != unit.content_hash => out.update.push(unit),
            Some(_) => out.unchanged.push(unit.identity),
        }
    }

    let mut stale: Vec<String> = existing
        .iter()
        .filter(|(id, fp)| !seen.contains(*id) && !retained_paths.contains(&fp.source_path))
        .map(|(id, _)| id.clone())
        .collect();
    stale.sort();
    out.delete = stale;

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{hash_text, unit_identity};

    fn unit(path: &str, fragment: usize, text: &str) -> ContentUnit {
        ContentUnit {
            identity: unit_identity(path, fragment),
            source_path: path.to_string(),
            fragment,
            line_start: 1,
            line_end: 1,
            text: text.to_string(),
            content_hash: hash_text(text),
            document_hash: hash_text(text),
            fragment_count: 1,
        }
    }

    fn fingerprint(u: &ContentUnit) -> (String, Fingerprint) {
        (
            u.identity.clone(),
            Fingerprint {
                content_hash: u.content_hash.clone(),
                source_path: u.source_path.clone(),
                document_hash: u.document_hash.clone(),
                fragment_count: u.fragment_count,
            },
        )
    }

    #[test]
    fn test_plan_partitions_identities() {
        let kept = unit("a.md", 0, "same");
        let old_b = unit("b.md", 0, "before");
        let gone = unit("c.md", 0, "removed");
        let existing: HashMap<_, _> = [&kept, &old_b, &gone].into_iter().map(fingerprint).collect();

        let new_b = unit("b.md", 0, "after");
        let added = unit("d.md", 0, "new");
        let plan = plan(
            &existing,
            vec![kept.clone(), new_b.clone(), added.clone()],
            &HashSet::new(),
        );

        assert_eq!(plan.insert, vec![added]);
        assert_eq!(plan.update, vec![new_b]);
        assert_eq!(plan.unchanged, vec![kept.identity]);
        assert_eq!(plan.delete, vec![gone.identity]);
    }

    #[test]
    fn test_identical_input_is_unchanged() {
        let units = vec![unit("a.md", 0, "x"), unit("a.md", 1, "y")];
        let existing: HashMap<_, _> = units.iter().map(fingerprint).collect();
        let plan = plan(&existing, units, &HashSet::new());
        assert!(plan.insert.is_empty() && plan.update.is_empty() && plan.delete.is_empty());
        assert_eq!(plan.unchanged.len(), 2);
    }

    #[test]
    fn test_retained_paths_are_not_deleted() {
        let binary = unit("logo.bin", 0, "old");
        let existing: HashMap<_, _> = [fingerprint(&binary)].into_iter().collect();
        let retained: HashSet<String> = ["logo.bin".to_string()].into_iter().collect();
        let plan = plan(&existing, Vec::new(), &retained);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_shrinking_document_deletes_trailing_fragments() {
        let f0 = unit("big.rs", 0, "part one");
        let f1 = unit("big.rs", 1, "part two");
        let existing: HashMap<_, _> = [&f0, &f1].into_iter().map(fingerprint).collect();
        let whole = unit("big.rs", 0, "everything");
        let plan = plan(&existing, vec![whole], &HashSet::new());
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.delete, vec![f1.identity]);
    }
}
