//! Batch splitting and primary-key merging.
//!
//! Merging rewrites a sequence of same-key operations into one equivalent
//! operation, so that a merged bucket never carries two statements for the
//! same row. Deletes are then applied before replaces, which keeps unique
//! index values from colliding inside one batch.

use std::collections::HashMap;

use crate::dml::{Dml, DmlKind};
use crate::error::LoaderError;

/// Partition `dmls` into contiguous chunks of at most `n` items, preserving
/// input order. `n` is clamped to at least 1.
pub fn split_dmls(dmls: Vec<Dml>, n: usize) -> Vec<Vec<Dml>> {
    let n = n.max(1);
    let mut out = Vec::with_capacity(dmls.len().div_ceil(n));
    let mut chunk = Vec::with_capacity(n.min(dmls.len()));
    for dml in dmls {
        chunk.push(dml);
        if chunk.len() == n {
            out.push(std::mem::take(&mut chunk));
        }
    }
    if !chunk.is_empty() {
        out.push(chunk);
    }
    out
}

/// Result of [`merge_by_primary_key`]: per-kind survivor lists in which
/// every `(schema, table, pk)` appears at most once.
#[derive(Debug, Default)]
pub struct MergedDmls {
    pub deletes: Vec<Dml>,
    pub inserts: Vec<Dml>,
    pub updates: Vec<Dml>,
}

impl MergedDmls {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deletes.len() + self.inserts.len() + self.updates.len()
    }
}

/// Collapse successive operations on the same key, last writer wins.
///
/// Replaying only the final effective operation yields the same row state as
/// replaying the whole sequence, because rows are addressed purely by
/// primary key and replaces overwrite whole row images. Combinations that
/// cannot arise from an ordered change stream surface as
/// [`LoaderError::MergeConflict`].
pub fn merge_by_primary_key(dmls: Vec<Dml>) -> Result<MergedDmls, LoaderError> {
    // Slot per first arrival keeps the original ordering of survivors.
    let mut slots: Vec<Dml> = Vec::with_capacity(dmls.len());
    let mut by_key: HashMap<String, usize> = HashMap::with_capacity(dmls.len());

    for next in dmls {
        let key = next.merge_key()?;
        match by_key.get(&key) {
            None => {
                by_key.insert(key, slots.len());
                slots.push(next);
            }
            Some(&idx) => collapse(&mut slots[idx], next, &key)?,
        }
    }

    let mut merged = MergedDmls::default();
    for dml in slots {
        match dml.kind {
            DmlKind::Delete => merged.deletes.push(dml),
            DmlKind::Insert => merged.inserts.push(dml),
            DmlKind::Update => merged.updates.push(dml),
        }
    }
    Ok(merged)
}

/// Fold `next` into the surviving operation for its key.
fn collapse(slot: &mut Dml, next: Dml, key: &str) -> Result<(), LoaderError> {
    match (slot.kind, next.kind) {
        // The row was inserted in this batch; fold the update into it.
        (DmlKind::Insert, DmlKind::Update) => slot.values = next.values,
        // The delete survives: under at-least-once delivery the row may
        // already exist downstream from an earlier partial apply, so the
        // pair must still clear it rather than cancel out.
        (DmlKind::Insert, DmlKind::Delete) => *slot = next,
        // Keep the earliest pre-image and the latest post-image.
        (DmlKind::Update, DmlKind::Update) => slot.values = next.values,
        (DmlKind::Update, DmlKind::Delete) => *slot = next,
        // Delete then re-insert: one update whose pre-image is the deleted
        // row, applied downstream as a whole-row replace.
        (DmlKind::Delete, DmlKind::Insert) => {
            let old = std::mem::take(&mut slot.values);
            *slot = next;
            slot.kind = DmlKind::Update;
            slot.old_values = Some(old);
        }
        (prior_kind, next_kind) => {
            return Err(LoaderError::MergeConflict {
                key: key.to_string(),
                prior: prior_kind,
                next: next_kind,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use mysql_async::Value;
    use proptest::prelude::*;

    use super::*;
    use crate::dml::TableInfo;

    fn info() -> Arc<TableInfo> {
        Arc::new(TableInfo::new(
            vec!["id".into(), "a".into()],
            vec!["id".into()],
        ))
    }

    fn dml(kind: DmlKind, id: i64, a: i64) -> Dml {
        let values = HashMap::from([
            ("id".to_string(), Value::from(id)),
            ("a".to_string(), Value::from(a)),
        ]);
        let mut dml = Dml::new(kind, "db", "t", values, info());
        if kind == DmlKind::Update {
            dml = dml.with_old_values(HashMap::from([
                ("id".to_string(), Value::from(id)),
                ("a".to_string(), Value::from(a - 1)),
            ]));
        }
        dml
    }

    #[test]
    fn split_preserves_order_and_bounds() {
        let input: Vec<Dml> = (0..10).map(|i| dml(DmlKind::Insert, i, i)).collect();
        let chunks = split_dmls(input, 3);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() <= 3));
        let ids: Vec<i64> = chunks
            .iter()
            .flatten()
            .map(|d| match d.values["id"] {
                Value::Int(v) => v,
                _ => panic!("unexpected value"),
            })
            .collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn split_clamps_zero_chunk_size() {
        let input: Vec<Dml> = (0..3).map(|i| dml(DmlKind::Insert, i, i)).collect();
        let chunks = split_dmls(input, 0);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn insert_update_delete_collapses_to_one_delete() {
        let merged = merge_by_primary_key(vec![
            dml(DmlKind::Insert, 7, 1),
            dml(DmlKind::Update, 7, 2),
            dml(DmlKind::Delete, 7, 2),
        ])
        .unwrap();
        assert!(merged.inserts.is_empty());
        assert!(merged.updates.is_empty());
        assert_eq!(merged.deletes.len(), 1);
    }

    #[test]
    fn insert_then_update_stays_insert_with_new_values() {
        let merged = merge_by_primary_key(vec![
            dml(DmlKind::Insert, 1, 1),
            dml(DmlKind::Update, 1, 9),
        ])
        .unwrap();
        assert_eq!(merged.inserts.len(), 1);
        assert_eq!(merged.inserts[0].values["a"], Value::from(9i64));
    }

    #[test]
    fn update_then_update_keeps_first_pre_image() {
        let merged = merge_by_primary_key(vec![
            dml(DmlKind::Update, 1, 5),
            dml(DmlKind::Update, 1, 6),
        ])
        .unwrap();
        assert_eq!(merged.updates.len(), 1);
        let survivor = &merged.updates[0];
        assert_eq!(survivor.values["a"], Value::from(6i64));
        assert_eq!(
            survivor.old_values.as_ref().unwrap()["a"],
            Value::from(4i64)
        );
    }

    #[test]
    fn update_then_delete_becomes_delete() {
        let merged = merge_by_primary_key(vec![
            dml(DmlKind::Update, 1, 5),
            dml(DmlKind::Delete, 1, 5),
        ])
        .unwrap();
        assert_eq!(merged.deletes.len(), 1);
        assert!(merged.updates.is_empty());
    }

    #[test]
    fn delete_then_insert_becomes_update() {
        let merged = merge_by_primary_key(vec![
            dml(DmlKind::Delete, 1, 5),
            dml(DmlKind::Insert, 1, 8),
        ])
        .unwrap();
        assert_eq!(merged.updates.len(), 1);
        let survivor = &merged.updates[0];
        assert_eq!(survivor.kind, DmlKind::Update);
        assert_eq!(survivor.values["a"], Value::from(8i64));
        assert_eq!(
            survivor.old_values.as_ref().unwrap()["a"],
            Value::from(5i64)
        );
    }

    #[test]
    fn delete_then_update_is_a_conflict() {
        let err = merge_by_primary_key(vec![
            dml(DmlKind::Delete, 1, 5),
            dml(DmlKind::Update, 1, 6),
        ])
        .unwrap_err();
        assert!(matches!(err, LoaderError::MergeConflict { .. }));
    }

    #[test]
    fn duplicate_insert_is_a_conflict() {
        let err = merge_by_primary_key(vec![
            dml(DmlKind::Insert, 1, 5),
            dml(DmlKind::Insert, 1, 6),
        ])
        .unwrap_err();
        assert!(matches!(err, LoaderError::MergeConflict { .. }));
    }

    #[test]
    fn insert_delete_insert_folds_to_an_update() {
        let merged = merge_by_primary_key(vec![
            dml(DmlKind::Insert, 1, 1),
            dml(DmlKind::Delete, 1, 1),
            dml(DmlKind::Insert, 1, 2),
        ])
        .unwrap();
        assert!(merged.inserts.is_empty());
        assert!(merged.deletes.is_empty());
        assert_eq!(merged.updates.len(), 1);
        assert_eq!(merged.updates[0].values["a"], Value::from(2i64));
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let merged = merge_by_primary_key(vec![
            dml(DmlKind::Insert, 1, 1),
            dml(DmlKind::Delete, 2, 2),
            dml(DmlKind::Update, 3, 3),
        ])
        .unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.deletes.len(), 1);
        assert_eq!(merged.inserts.len(), 1);
        assert_eq!(merged.updates.len(), 1);
    }

    proptest! {
        #[test]
        fn split_concat_is_identity(ids in prop::collection::vec(0i64..1000, 0..64), n in 1usize..16) {
            let input: Vec<Dml> = ids.iter().map(|&i| dml(DmlKind::Insert, i, i)).collect();
            let chunks = split_dmls(input, n);
            prop_assert!(chunks.iter().all(|c| c.len() <= n && !c.is_empty()));
            let flat: Vec<i64> = chunks
                .iter()
                .flatten()
                .map(|d| match d.values["id"] {
                    Value::Int(v) => v,
                    _ => unreachable!(),
                })
                .collect();
            prop_assert_eq!(flat, ids);
        }

        #[test]
        fn merged_buckets_have_unique_keys(ids in prop::collection::vec(0i64..8, 0..40)) {
            // Build a per-key-legal stream: the op chosen for each arrival
            // depends on the key's collapse state so far.
            let mut state: HashMap<i64, DmlKind> = HashMap::new();
            let mut input = Vec::new();
            for (i, &id) in ids.iter().enumerate() {
                let kind = match state.get(&id) {
                    None => [DmlKind::Insert, DmlKind::Update, DmlKind::Delete][i % 3],
                    Some(DmlKind::Insert) => [DmlKind::Update, DmlKind::Delete][i % 2],
                    Some(DmlKind::Update) => [DmlKind::Update, DmlKind::Delete][i % 2],
                    Some(DmlKind::Delete) => DmlKind::Insert,
                };
                input.push(dml(kind, id, i as i64));
                // Track the collapse result the merger will hold for the key.
                let folded = match (state.get(&id), kind) {
                    (None, k) => k,
                    (Some(DmlKind::Insert), DmlKind::Delete) => DmlKind::Delete,
                    (Some(DmlKind::Insert), _) => DmlKind::Insert,
                    (Some(DmlKind::Update), DmlKind::Delete) => DmlKind::Delete,
                    (Some(DmlKind::Update), _) => DmlKind::Update,
                    (Some(DmlKind::Delete), _) => DmlKind::Update,
                };
                state.insert(id, folded);
            }

            let merged = merge_by_primary_key(input).unwrap();
            for bucket in [&merged.deletes, &merged.inserts, &merged.updates] {
                let mut seen = std::collections::HashSet::new();
                for d in bucket.iter() {
                    prop_assert!(seen.insert(d.merge_key().unwrap()));
                }
            }
            // A key survives in exactly one bucket.
            let mut all = std::collections::HashSet::new();
            for d in merged.deletes.iter().chain(&merged.inserts).chain(&merged.updates) {
                prop_assert!(all.insert(d.merge_key().unwrap()));
            }
        }
    }
}
