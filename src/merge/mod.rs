//! Deterministic merge conflict resolution.
//!
//! The resolver is a pure function over `(existing value, existing RMD,
//! incoming operation)`: every replica that feeds it the same inputs reaches
//! the same decision, which is what lets concurrently-written regions
//! converge without coordination.
//!
//! Decision order for an incoming write with timestamp `t`:
//!
//! 1. No existing RMD ⇒ prior timestamps are zero, prior offset vector is
//!    zeros.
//! 2. `t` strictly greater than every affected prior timestamp ⇒ applied.
//! 3. `t` strictly less than every affected prior timestamp ⇒ ignored.
//! 4. Ties break on the raw bytes: the lexicographically larger value wins;
//!    a delete beats a put at equal timestamps; a second delete at an equal
//!    timestamp is ignored (which also makes replays idempotent).
//! 5. Partial updates and full puts over field-level RMD merge per field,
//!    with the same tie rule applied field-wise.
//!
//! On an applied result the new offset vector is the pointwise max of the
//! prior vector and a vector carrying the source offset in the source
//! region's slot.

pub mod fields;

use bytes::Bytes;

use crate::error::{IngestionError, IngestionResult};
use crate::rmd::{ReplicationMetadata, RmdTimestamp, RmdWithSchemaId};
use crate::schema::{RmdLayout, SchemaCache};
use crate::types::{RegionId, UpdateOp, ValueAndSchema};

use fields::{decode_fields, decode_update_entries, encode_fields};

/// Outcome of one conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// The incoming operation lost; state is untouched.
    Ignored,
    /// The incoming operation (possibly merged) won.
    Applied(AppliedMerge),
}

impl MergeResult {
    #[inline]
    pub fn is_ignored(&self) -> bool {
        matches!(self, MergeResult::Ignored)
    }
}

/// The winning state produced by an applied resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMerge {
    /// `None` is a tombstone.
    pub new_value: Option<Bytes>,
    pub new_rmd: ReplicationMetadata,
    pub value_schema_id: i32,
    /// The resolver handed back the byte slice it was given. Callers must
    /// prepend headers non-destructively or copy before mutating, since the
    /// buffer is typically owned by the broker consumer.
    pub reuses_input: bool,
}

/// Pure, deterministic last-writer-wins resolver over RMD.
#[derive(Debug, Clone)]
pub struct MergeConflictResolver {
    schemas: SchemaCache,
    region_count: usize,
}

impl MergeConflictResolver {
    pub fn new(schemas: SchemaCache, region_count: usize) -> Self {
        MergeConflictResolver {
            schemas,
            region_count,
        }
    }

    /// Resolve a full-value put.
    pub fn put(
        &self,
        old_value: Option<&ValueAndSchema>,
        old_rmd: Option<&RmdWithSchemaId>,
        new_value: Bytes,
        value_schema_id: i32,
        write_ts: u64,
        source_region: RegionId,
        source_offset: u64,
    ) -> IngestionResult<MergeResult> {
        let layout = self.schemas.rmd_layout(value_schema_id)?;
        match layout {
            RmdLayout::RecordLevel => {
                let prior_ts = prior_scalar_ts(old_rmd);
                if write_ts > prior_ts {
                    return Ok(self.applied_full_put(
                        new_value,
                        value_schema_id,
                        write_ts,
                        old_rmd,
                        source_region,
                        source_offset,
                        layout,
                    ));
                }
                if write_ts < prior_ts {
                    return Ok(MergeResult::Ignored);
                }
                // Equal timestamps: a standing tombstone wins over a put;
                // otherwise the lexicographically larger bytes win.
                if is_tombstone(old_value, old_rmd) {
                    return Ok(MergeResult::Ignored);
                }
                let old_bytes = old_value.map(|v| v.value.as_ref()).unwrap_or(&[]);
                if new_value.as_ref() > old_bytes {
                    Ok(self.applied_full_put(
                        new_value,
                        value_schema_id,
                        write_ts,
                        old_rmd,
                        source_region,
                        source_offset,
                        layout,
                    ))
                } else {
                    Ok(MergeResult::Ignored)
                }
            }
            RmdLayout::FieldLevel { field_count } => self.put_field_level(
                old_value,
                old_rmd,
                new_value,
                value_schema_id,
                field_count,
                write_ts,
                source_region,
                source_offset,
            ),
        }
    }

    /// Resolve a delete. A delete affects every field, so it is compared
    /// against the highest prior timestamp.
    pub fn delete(
        &self,
        old_value: Option<&ValueAndSchema>,
        old_rmd: Option<&RmdWithSchemaId>,
        delete_schema_id: i32,
        write_ts: u64,
        source_region: RegionId,
        source_offset: u64,
    ) -> IngestionResult<MergeResult> {
        let prior_max = old_rmd.map(|r| r.rmd.timestamp.max()).unwrap_or(0);
        if write_ts < prior_max {
            return Ok(MergeResult::Ignored);
        }
        if write_ts == prior_max && is_tombstone(old_value, old_rmd) {
            // A second delete at the same timestamp is a replay.
            return Ok(MergeResult::Ignored);
        }
        // The tombstone RMD keeps the schema id (and therefore the layout)
        // of the value it erased, so a later decode stays consistent.
        let schema_id = old_value
            .map(|v| v.schema_id)
            .or_else(|| old_rmd.map(|r| r.value_schema_id))
            .unwrap_or(delete_schema_id);
        let timestamp = match self.schemas.rmd_layout(schema_id)? {
            RmdLayout::RecordLevel => RmdTimestamp::Record(write_ts),
            RmdLayout::FieldLevel { field_count } => {
                RmdTimestamp::PerField(vec![write_ts; field_count])
            }
        };
        let new_rmd = ReplicationMetadata {
            timestamp,
            offset_vector: self.advanced_vector(old_rmd, source_region, source_offset),
        };
        Ok(MergeResult::Applied(AppliedMerge {
            new_value: None,
            new_rmd,
            value_schema_id: schema_id,
            reuses_input: false,
        }))
    }

    /// Resolve a partial update (write-compute).
    pub fn update(
        &self,
        old_value: Option<&ValueAndSchema>,
        old_rmd: Option<&RmdWithSchemaId>,
        update: &UpdateOp,
        write_ts: u64,
        source_region: RegionId,
        source_offset: u64,
    ) -> IngestionResult<MergeResult> {
        self.schemas
            .check_update_applies(update.update_schema_id, update.schema_id)?;
        let field_count = match self.schemas.rmd_layout(update.schema_id)? {
            RmdLayout::FieldLevel { field_count } => field_count,
            RmdLayout::RecordLevel => {
                // Partial updates require per-field timestamps.
                return Err(IngestionError::SchemaIncompatible {
                    update_schema_id: update.update_schema_id,
                    value_schema_id: update.schema_id,
                });
            }
        };

        let entries = decode_update_entries(&update.payload)?;
        for entry in &entries {
            if entry.field_index >= field_count {
                return Err(IngestionError::SchemaIncompatible {
                    update_schema_id: update.update_schema_id,
                    value_schema_id: update.schema_id,
                });
            }
        }

        let mut field_ts = prior_field_ts(old_rmd, field_count);
        let mut field_values = prior_field_values(old_value, field_count)?;
        let mut any_applied = false;
        for entry in entries {
            let idx = entry.field_index;
            let applied = match write_ts.cmp(&field_ts[idx]) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => entry.value.as_ref() > field_values[idx].as_ref(),
            };
            if applied {
                field_values[idx] = entry.value;
                field_ts[idx] = write_ts;
                any_applied = true;
            }
        }
        if !any_applied {
            return Ok(MergeResult::Ignored);
        }
        Ok(MergeResult::Applied(AppliedMerge {
            new_value: Some(encode_fields(&field_values)),
            new_rmd: ReplicationMetadata {
                timestamp: RmdTimestamp::PerField(field_ts),
                offset_vector: self.advanced_vector(old_rmd, source_region, source_offset),
            },
            value_schema_id: update.schema_id,
            reuses_input: false,
        }))
    }

    /// Full put over field-level RMD: applied wholesale when it dominates,
    /// merged field-wise when timestamps interleave.
    #[allow(clippy::too_many_arguments)]
    fn put_field_level(
        &self,
        old_value: Option<&ValueAndSchema>,
        old_rmd: Option<&RmdWithSchemaId>,
        new_value: Bytes,
        value_schema_id: i32,
        field_count: usize,
        write_ts: u64,
        source_region: RegionId,
        source_offset: u64,
    ) -> IngestionResult<MergeResult> {
        let prior_ts = prior_field_ts(old_rmd, field_count);
        if prior_ts.iter().all(|&t| write_ts > t) {
            return Ok(self.applied_full_put(
                new_value,
                value_schema_id,
                write_ts,
                old_rmd,
                source_region,
                source_offset,
                RmdLayout::FieldLevel { field_count },
            ));
        }
        if prior_ts.iter().all(|&t| write_ts < t) {
            return Ok(MergeResult::Ignored);
        }

        let new_fields = decode_fields(&new_value)?;
        if new_fields.len() != field_count {
            return Err(IngestionError::InvalidOperation(format!(
                "put carries {} fields, schema {} has {}",
                new_fields.len(),
                value_schema_id,
                field_count
            )));
        }
        let mut field_ts = prior_ts;
        let mut field_values = prior_field_values(old_value, field_count)?;
        let mut any_applied = false;
        for (idx, new_field) in new_fields.into_iter().enumerate() {
            let applied = match write_ts.cmp(&field_ts[idx]) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => new_field.as_ref() > field_values[idx].as_ref(),
            };
            if applied {
                field_values[idx] = new_field;
                field_ts[idx] = write_ts;
                any_applied = true;
            }
        }
        if !any_applied {
            return Ok(MergeResult::Ignored);
        }
        Ok(MergeResult::Applied(AppliedMerge {
            new_value: Some(encode_fields(&field_values)),
            new_rmd: ReplicationMetadata {
                timestamp: RmdTimestamp::PerField(field_ts),
                offset_vector: self.advanced_vector(old_rmd, source_region, source_offset),
            },
            value_schema_id,
            reuses_input: false,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn applied_full_put(
        &self,
        new_value: Bytes,
        value_schema_id: i32,
        write_ts: u64,
        old_rmd: Option<&RmdWithSchemaId>,
        source_region: RegionId,
        source_offset: u64,
        layout: RmdLayout,
    ) -> MergeResult {
        let timestamp = match layout {
            RmdLayout::RecordLevel => RmdTimestamp::Record(write_ts),
            RmdLayout::FieldLevel { field_count } => {
                RmdTimestamp::PerField(vec![write_ts; field_count])
            }
        };
        MergeResult::Applied(AppliedMerge {
            new_value: Some(new_value),
            new_rmd: ReplicationMetadata {
                timestamp,
                offset_vector: self.advanced_vector(old_rmd, source_region, source_offset),
            },
            value_schema_id,
            reuses_input: true,
        })
    }

    fn advanced_vector(
        &self,
        old_rmd: Option<&RmdWithSchemaId>,
        source_region: RegionId,
        source_offset: u64,
    ) -> Vec<u64> {
        let mut rmd = match old_rmd {
            Some(existing) => ReplicationMetadata {
                timestamp: RmdTimestamp::Record(0),
                offset_vector: existing.rmd.offset_vector.clone(),
            },
            None => ReplicationMetadata::record_level(0, vec![0; self.region_count]),
        };
        if rmd.offset_vector.len() < self.region_count {
            rmd.offset_vector.resize(self.region_count, 0);
        }
        rmd.advance_region(source_region, source_offset);
        rmd.offset_vector
    }
}

fn prior_scalar_ts(old_rmd: Option<&RmdWithSchemaId>) -> u64 {
    old_rmd.map(|r| r.rmd.timestamp.max()).unwrap_or(0)
}

/// Prior per-field timestamps, expanding a record-level scalar when a store
/// migrated to field-level RMD.
fn prior_field_ts(old_rmd: Option<&RmdWithSchemaId>, field_count: usize) -> Vec<u64> {
    match old_rmd.map(|r| &r.rmd.timestamp) {
        Some(RmdTimestamp::PerField(ts)) => {
            let mut ts = ts.clone();
            ts.resize(field_count, 0);
            ts
        }
        Some(RmdTimestamp::Record(ts)) => vec![*ts; field_count],
        None => vec![0; field_count],
    }
}

fn prior_field_values(
    old_value: Option<&ValueAndSchema>,
    field_count: usize,
) -> IngestionResult<Vec<Bytes>> {
    match old_value {
        Some(existing) => {
            let mut fields = decode_fields(&existing.value)?;
            fields.resize(field_count, Bytes::new());
            Ok(fields)
        }
        None => Ok(vec![Bytes::new(); field_count]),
    }
}

fn is_tombstone(old_value: Option<&ValueAndSchema>, old_rmd: Option<&RmdWithSchemaId>) -> bool {
    old_value.is_none() && old_rmd.is_some()
}

#[cfg(test)]
mod tests {
    use super::fields::{encode_update_entries, UpdateEntry};
    use super::*;
    use crate::schema::StaticSchemaRepository;
    use std::sync::Arc;

    const SCHEMA: i32 = 1;
    const FIELD_SCHEMA: i32 = 2;
    const UPDATE_SCHEMA: i32 = 100;

    fn resolver() -> MergeConflictResolver {
        let repo = StaticSchemaRepository::new()
            .with_record_level(SCHEMA)
            .with_field_level(FIELD_SCHEMA, 3)
            .with_update_schema(UPDATE_SCHEMA, FIELD_SCHEMA);
        MergeConflictResolver::new(SchemaCache::new(Arc::new(repo)), 2)
    }

    fn applied(result: MergeResult) -> AppliedMerge {
        match result {
            MergeResult::Applied(applied) => applied,
            MergeResult::Ignored => panic!("expected Applied, got Ignored"),
        }
    }

    fn value(bytes: &AppliedMerge) -> &[u8] {
        bytes.new_value.as_ref().unwrap().as_ref()
    }

    fn as_state(applied: &AppliedMerge) -> (Option<ValueAndSchema>, RmdWithSchemaId) {
        (
            applied.new_value.clone().map(|v| ValueAndSchema {
                value: v,
                schema_id: applied.value_schema_id,
            }),
            RmdWithSchemaId {
                value_schema_id: applied.value_schema_id,
                rmd: applied.new_rmd.clone(),
            },
        )
    }

    #[test]
    fn last_writer_wins_across_regions() {
        let resolver = resolver();

        // Event A: first write applies.
        let a = applied(
            resolver
                .put(None, None, Bytes::from_static(b"v1"), SCHEMA, 100, 0, 10)
                .unwrap(),
        );
        assert_eq!(value(&a), b"v1");
        assert_eq!(a.new_rmd.timestamp, RmdTimestamp::Record(100));
        assert_eq!(a.new_rmd.offset_vector, vec![10, 0]);
        assert!(a.reuses_input);

        // Event B: older timestamp loses.
        let (old_value, old_rmd) = as_state(&a);
        let b = resolver
            .put(
                old_value.as_ref(),
                Some(&old_rmd),
                Bytes::from_static(b"v2"),
                SCHEMA,
                50,
                1,
                5,
            )
            .unwrap();
        assert!(b.is_ignored());

        // Event C: newer timestamp from the other region wins and merges
        // the offset vector.
        let c = applied(
            resolver
                .put(
                    old_value.as_ref(),
                    Some(&old_rmd),
                    Bytes::from_static(b"v3"),
                    SCHEMA,
                    200,
                    1,
                    7,
                )
                .unwrap(),
        );
        assert_eq!(value(&c), b"v3");
        assert_eq!(c.new_rmd.timestamp, RmdTimestamp::Record(200));
        assert_eq!(c.new_rmd.offset_vector, vec![10, 7]);
    }

    #[test]
    fn tie_breaks_on_lexicographically_larger_bytes() {
        let resolver = resolver();
        let a = applied(
            resolver
                .put(None, None, Bytes::from_static(b"\x01"), SCHEMA, 100, 0, 1)
                .unwrap(),
        );
        let (old_value, old_rmd) = as_state(&a);
        let b = applied(
            resolver
                .put(
                    old_value.as_ref(),
                    Some(&old_rmd),
                    Bytes::from_static(b"\x02"),
                    SCHEMA,
                    100,
                    1,
                    1,
                )
                .unwrap(),
        );
        assert_eq!(value(&b), b"\x02");
        assert_eq!(b.new_rmd.offset_vector, vec![1, 1]);

        // The mirror image loses.
        let (old_value, old_rmd) = as_state(&b);
        let c = resolver
            .put(
                old_value.as_ref(),
                Some(&old_rmd),
                Bytes::from_static(b"\x01"),
                SCHEMA,
                100,
                0,
                2,
            )
            .unwrap();
        assert!(c.is_ignored());
    }

    #[test]
    fn delete_beats_put_at_equal_timestamp() {
        let resolver = resolver();
        let a = applied(
            resolver
                .put(None, None, Bytes::from_static(b"x"), SCHEMA, 100, 0, 1)
                .unwrap(),
        );
        let (old_value, old_rmd) = as_state(&a);
        let tombstone = applied(
            resolver
                .delete(old_value.as_ref(), Some(&old_rmd), SCHEMA, 100, 1, 1)
                .unwrap(),
        );
        assert!(tombstone.new_value.is_none());
        assert_eq!(tombstone.new_rmd.timestamp, RmdTimestamp::Record(100));
        assert_eq!(tombstone.new_rmd.offset_vector, vec![1, 1]);

        // A put at the same timestamp against the standing tombstone loses.
        let (old_value, old_rmd) = as_state(&tombstone);
        let put = resolver
            .put(
                old_value.as_ref(),
                Some(&old_rmd),
                Bytes::from_static(b"y"),
                SCHEMA,
                100,
                0,
                2,
            )
            .unwrap();
        assert!(put.is_ignored());

        // So does a second delete (idempotent replay).
        let second = resolver
            .delete(old_value.as_ref(), Some(&old_rmd), SCHEMA, 100, 1, 1)
            .unwrap();
        assert!(second.is_ignored());
    }

    #[test]
    fn replaying_an_applied_put_is_ignored() {
        let resolver = resolver();
        let a = applied(
            resolver
                .put(None, None, Bytes::from_static(b"v"), SCHEMA, 77, 0, 4)
                .unwrap(),
        );
        let (old_value, old_rmd) = as_state(&a);
        let replay = resolver
            .put(
                old_value.as_ref(),
                Some(&old_rmd),
                Bytes::from_static(b"v"),
                SCHEMA,
                77,
                0,
                4,
            )
            .unwrap();
        assert!(replay.is_ignored());
    }

    #[test]
    fn offset_vector_sum_never_decreases() {
        let resolver = resolver();
        let mut old_value = None;
        let mut old_rmd: Option<RmdWithSchemaId> = None;
        let mut last_sum = 0u128;
        let events: &[(u64, RegionId, u64, &[u8])] = &[
            (10, 0, 5, b"a"),
            (20, 1, 3, b"b"),
            (15, 0, 9, b"c"),
            (30, 1, 11, b"d"),
        ];
        for &(ts, region, offset, payload) in events {
            let result = resolver
                .put(
                    old_value.as_ref(),
                    old_rmd.as_ref(),
                    Bytes::copy_from_slice(payload),
                    SCHEMA,
                    ts,
                    region,
                    offset,
                )
                .unwrap();
            if let MergeResult::Applied(ref merged) = result {
                let sum = merged.new_rmd.offset_vector_sum();
                assert!(sum >= last_sum, "sum regressed: {last_sum} -> {sum}");
                last_sum = sum;
                let (v, r) = as_state(merged);
                old_value = v;
                old_rmd = Some(r);
            }
        }
    }

    #[test]
    fn resolution_is_deterministic_over_replays() {
        let resolver = resolver();
        let events: &[(u64, RegionId, u64, &[u8])] = &[
            (100, 0, 1, b"aa"),
            (100, 1, 1, b"ab"),
            (90, 1, 2, b"zz"),
            (110, 0, 2, b"b"),
        ];
        let run = || {
            let mut old_value = None;
            let mut old_rmd: Option<RmdWithSchemaId> = None;
            let mut decisions = Vec::new();
            for &(ts, region, offset, payload) in events {
                let result = resolver
                    .put(
                        old_value.as_ref(),
                        old_rmd.as_ref(),
                        Bytes::copy_from_slice(payload),
                        SCHEMA,
                        ts,
                        region,
                        offset,
                    )
                    .unwrap();
                decisions.push(result.is_ignored());
                if let MergeResult::Applied(ref merged) = result {
                    let (v, r) = as_state(merged);
                    old_value = v;
                    old_rmd = Some(r);
                }
            }
            (decisions, old_value, old_rmd)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn partial_update_merges_only_newer_fields() {
        let resolver = resolver();
        let initial = encode_fields(&[
            Bytes::from_static(b"f0"),
            Bytes::from_static(b"f1"),
            Bytes::from_static(b"f2"),
        ]);
        let a = applied(
            resolver
                .put(None, None, initial, FIELD_SCHEMA, 100, 0, 1)
                .unwrap(),
        );
        let (old_value, old_rmd) = as_state(&a);

        // Field 1 updated at a newer timestamp, field 2 at an older one.
        let update = UpdateOp {
            payload: encode_update_entries(&[
                UpdateEntry {
                    field_index: 1,
                    value: Bytes::from_static(b"new1"),
                },
                UpdateEntry {
                    field_index: 2,
                    value: Bytes::from_static(b"stale"),
                },
            ]),
            schema_id: FIELD_SCHEMA,
            update_schema_id: UPDATE_SCHEMA,
        };
        // write_ts 150 > 100 applies both entries.
        let merged = applied(
            resolver
                .update(old_value.as_ref(), Some(&old_rmd), &update, 150, 1, 8)
                .unwrap(),
        );
        let fields = decode_fields(merged.new_value.as_ref().unwrap()).unwrap();
        assert_eq!(fields[0].as_ref(), b"f0");
        assert_eq!(fields[1].as_ref(), b"new1");
        assert_eq!(fields[2].as_ref(), b"stale");
        assert_eq!(
            merged.new_rmd.timestamp,
            RmdTimestamp::PerField(vec![100, 150, 150])
        );
        assert_eq!(merged.new_rmd.offset_vector, vec![1, 8]);

        // Now a stale update (ts 120 < 150) to the same fields is ignored.
        let (old_value, old_rmd) = as_state(&merged);
        let stale = resolver
            .update(old_value.as_ref(), Some(&old_rmd), &update, 120, 0, 9)
            .unwrap();
        assert!(stale.is_ignored());
    }

    #[test]
    fn full_put_over_field_level_rmd_merges_per_field() {
        let resolver = resolver();
        let initial = encode_fields(&[
            Bytes::from_static(b"a0"),
            Bytes::from_static(b"a1"),
            Bytes::from_static(b"a2"),
        ]);
        let a = applied(
            resolver
                .put(None, None, initial, FIELD_SCHEMA, 100, 0, 1)
                .unwrap(),
        );
        // Bump field 2 to ts 200 via an update.
        let (old_value, old_rmd) = as_state(&a);
        let bump = UpdateOp {
            payload: encode_update_entries(&[UpdateEntry {
                field_index: 2,
                value: Bytes::from_static(b"hot"),
            }]),
            schema_id: FIELD_SCHEMA,
            update_schema_id: UPDATE_SCHEMA,
        };
        let bumped = applied(
            resolver
                .update(old_value.as_ref(), Some(&old_rmd), &bump, 200, 1, 2)
                .unwrap(),
        );

        // A full put at ts 150 lands between the field timestamps: fields 0
        // and 1 take the put, field 2 keeps the hotter update.
        let (old_value, old_rmd) = as_state(&bumped);
        let put_value = encode_fields(&[
            Bytes::from_static(b"b0"),
            Bytes::from_static(b"b1"),
            Bytes::from_static(b"cold"),
        ]);
        let merged = applied(
            resolver
                .put(
                    old_value.as_ref(),
                    Some(&old_rmd),
                    put_value,
                    FIELD_SCHEMA,
                    150,
                    0,
                    5,
                )
                .unwrap(),
        );
        assert!(!merged.reuses_input);
        let fields = decode_fields(merged.new_value.as_ref().unwrap()).unwrap();
        assert_eq!(fields[0].as_ref(), b"b0");
        assert_eq!(fields[1].as_ref(), b"b1");
        assert_eq!(fields[2].as_ref(), b"hot");
        assert_eq!(
            merged.new_rmd.timestamp,
            RmdTimestamp::PerField(vec![150, 150, 200])
        );
    }

    #[test]
    fn update_with_bad_field_index_is_schema_incompatible() {
        let resolver = resolver();
        let update = UpdateOp {
            payload: encode_update_entries(&[UpdateEntry {
                field_index: 7,
                value: Bytes::from_static(b"x"),
            }]),
            schema_id: FIELD_SCHEMA,
            update_schema_id: UPDATE_SCHEMA,
        };
        let err = resolver.update(None, None, &update, 100, 0, 1).unwrap_err();
        assert!(matches!(err, IngestionError::SchemaIncompatible { .. }));
    }

    #[test]
    fn update_against_record_level_store_is_schema_incompatible() {
        let repo = StaticSchemaRepository::new()
            .with_record_level(SCHEMA)
            .with_update_schema(UPDATE_SCHEMA, SCHEMA);
        let resolver = MergeConflictResolver::new(SchemaCache::new(Arc::new(repo)), 2);
        let update = UpdateOp {
            payload: encode_update_entries(&[]),
            schema_id: SCHEMA,
            update_schema_id: UPDATE_SCHEMA,
        };
        let err = resolver.update(None, None, &update, 100, 0, 1).unwrap_err();
        assert!(err.is_poison());
    }

    #[test]
    fn update_on_absent_key_fills_remaining_fields_with_empties() {
        let resolver = resolver();
        let update = UpdateOp {
            payload: encode_update_entries(&[UpdateEntry {
                field_index: 0,
                value: Bytes::from_static(b"only"),
            }]),
            schema_id: FIELD_SCHEMA,
            update_schema_id: UPDATE_SCHEMA,
        };
        let merged = applied(resolver.update(None, None, &update, 50, 1, 3).unwrap());
        let fields = decode_fields(merged.new_value.as_ref().unwrap()).unwrap();
        assert_eq!(fields[0].as_ref(), b"only");
        assert!(fields[1].is_empty());
        assert!(fields[2].is_empty());
        assert_eq!(
            merged.new_rmd.timestamp,
            RmdTimestamp::PerField(vec![50, 0, 0])
        );
    }

    #[test]
    fn delete_on_empty_state_creates_a_tombstone() {
        let resolver = resolver();
        let tombstone = applied(resolver.delete(None, None, SCHEMA, 10, 0, 2).unwrap());
        assert!(tombstone.new_value.is_none());
        assert_eq!(tombstone.new_rmd.offset_vector, vec![2, 0]);
    }
}
