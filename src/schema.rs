//! Value-schema to RMD-layout resolution.
//!
//! The schema registry itself is an external collaborator; this module keeps
//! only what the ingestion engine needs from it: which replication-metadata
//! layout a value schema id selects, and whether a partial-update schema can
//! be applied to a value schema. Lookups go through a lookaside cache; a miss
//! triggers exactly one registry refresh before the id is declared unknown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use moka::sync::Cache;
use tracing::debug;

use crate::error::{IngestionError, IngestionResult};

/// Shape of the replication metadata tied to a value schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmdLayout {
    /// One scalar timestamp covers the whole record.
    RecordLevel,
    /// One timestamp per value field; required for partial-update stores.
    FieldLevel { field_count: usize },
}

/// Read-only view of the external schema registry.
pub trait SchemaRepository: Send + Sync {
    /// RMD layout selected by a value schema id, or `None` if the id is
    /// unknown to the registry.
    fn rmd_layout(&self, value_schema_id: i32) -> Option<RmdLayout>;

    /// Whether `update_schema_id` produces partial updates applicable to
    /// values written under `value_schema_id`.
    fn update_applies_to(&self, update_schema_id: i32, value_schema_id: i32) -> bool;

    /// Ask the registry to re-fetch its view. Called at most once per failed
    /// lookup.
    fn refresh(&self) {}
}

/// In-memory repository used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct StaticSchemaRepository {
    layouts: HashMap<i32, RmdLayout>,
    update_pairs: HashSet<(i32, i32)>,
}

impl StaticSchemaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record_level(mut self, value_schema_id: i32) -> Self {
        self.layouts.insert(value_schema_id, RmdLayout::RecordLevel);
        self
    }

    pub fn with_field_level(mut self, value_schema_id: i32, field_count: usize) -> Self {
        self.layouts
            .insert(value_schema_id, RmdLayout::FieldLevel { field_count });
        self
    }

    pub fn with_update_schema(mut self, update_schema_id: i32, value_schema_id: i32) -> Self {
        self.update_pairs.insert((update_schema_id, value_schema_id));
        self
    }
}

impl SchemaRepository for StaticSchemaRepository {
    fn rmd_layout(&self, value_schema_id: i32) -> Option<RmdLayout> {
        self.layouts.get(&value_schema_id).copied()
    }

    fn update_applies_to(&self, update_schema_id: i32, value_schema_id: i32) -> bool {
        self.update_pairs.contains(&(update_schema_id, value_schema_id))
    }
}

/// Caching front of a [`SchemaRepository`] with refresh-once semantics.
#[derive(Clone)]
pub struct SchemaCache {
    inner: Arc<dyn SchemaRepository>,
    layouts: Cache<i32, RmdLayout>,
}

impl SchemaCache {
    pub fn new(inner: Arc<dyn SchemaRepository>) -> Self {
        SchemaCache {
            inner,
            layouts: Cache::new(10_000),
        }
    }

    /// Resolve the RMD layout for a value schema id.
    ///
    /// Misses trigger one registry refresh; a second miss is an
    /// [`IngestionError::UnknownRmdSchema`], which is fatal to the version.
    pub fn rmd_layout(&self, value_schema_id: i32) -> IngestionResult<RmdLayout> {
        if let Some(layout) = self.layouts.get(&value_schema_id) {
            return Ok(layout);
        }
        if let Some(layout) = self.inner.rmd_layout(value_schema_id) {
            self.layouts.insert(value_schema_id, layout);
            return Ok(layout);
        }
        debug!(value_schema_id, "schema cache miss, refreshing registry");
        self.inner.refresh();
        match self.inner.rmd_layout(value_schema_id) {
            Some(layout) => {
                self.layouts.insert(value_schema_id, layout);
                Ok(layout)
            }
            None => Err(IngestionError::UnknownRmdSchema { value_schema_id }),
        }
    }

    /// Validate that an update schema applies to a value schema.
    pub fn check_update_applies(
        &self,
        update_schema_id: i32,
        value_schema_id: i32,
    ) -> IngestionResult<()> {
        if self.inner.update_applies_to(update_schema_id, value_schema_id) {
            Ok(())
        } else {
            Err(IngestionError::SchemaIncompatible {
                update_schema_id,
                value_schema_id,
            })
        }
    }
}

impl std::fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCache")
            .field("cached_layouts", &self.layouts.entry_count())
            .finish()
    }
}
