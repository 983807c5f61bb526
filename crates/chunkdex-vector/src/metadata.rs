//! Attribute rows keyed by chunk id.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chunkdex_core::error::{ChunkdexError, Result};
use chunkdex_core::filter::Filter;
use chunkdex_core::types::{ChunkId, Metadata, Schema, RESERVED_ID_FIELD};

/// Schema-validated attribute rows, iterated in id order.
#[derive(Debug)]
pub struct MetadataStore {
    schema: Schema,
    rows: RwLock<BTreeMap<ChunkId, Metadata>>,
}

impl MetadataStore {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Validate and store `metadata` under `id`, replacing any previous row.
    pub fn put(&self, id: ChunkId, metadata: Metadata) -> Result<()> {
        let row = self.schema.validate(metadata)?;
        self.write()?.insert(id, row);
        Ok(())
    }

    pub fn get(&self, id: ChunkId) -> Option<Metadata> {
        self.rows.read().ok().and_then(|rows| rows.get(&id).cloned())
    }

    /// Parse a filter string against this store's schema.
    pub fn parse_filter(&self, expr: &str) -> Result<Filter> {
        Filter::parse(expr, &self.schema)
    }

    /// Resolve a projection. An empty list selects every declared field.
    /// `id` is accepted but never projected.
    pub fn projection(&self, fields: &[&str]) -> Result<Vec<String>> {
        if fields.is_empty() {
            return Ok(self.schema.field_names().map(String::from).collect());
        }
        fields
            .iter()
            .filter(|f| **f != RESERVED_ID_FIELD)
            .map(|f| {
                if self.schema.field(f).is_some() {
                    Ok(f.to_string())
                } else {
                    Err(ChunkdexError::InvalidFilter(format!(
                        "Unknown attribute '{}' in field list",
                        f
                    )))
                }
            })
            .collect()
    }

    /// Rows matching `expr`, projected onto `fields`.
    pub fn query(&self, expr: &str, fields: &[&str]) -> Result<Vec<Metadata>> {
        let filter = self.parse_filter(expr)?;
        let fields = self.projection(fields)?;
        self.select(&filter, &fields, |_| true)
    }

    /// Rows whose id passes `visible` and whose attributes match `filter`.
    pub fn select(
        &self,
        filter: &Filter,
        fields: &[String],
        visible: impl Fn(ChunkId) -> bool,
    ) -> Result<Vec<Metadata>> {
        let rows = self.read()?;
        Ok(rows
            .iter()
            .filter(|(id, row)| visible(**id) && filter.matches(row))
            .map(|(_, row)| {
                fields
                    .iter()
                    .filter_map(|f| row.get(f).map(|v| (f.clone(), v.clone())))
                    .collect()
            })
            .collect())
    }

    /// Ids of rows matching `filter`, ascending.
    pub fn matching_ids(&self, filter: &Filter) -> Result<Vec<ChunkId>> {
        let rows = self.read()?;
        Ok(rows
            .iter()
            .filter(|(_, row)| filter.matches(row))
            .map(|(id, _)| *id)
            .collect())
    }

    /// Remove every row the predicate selects, as one step under the write
    /// lock. Returns the removed ids; on error nothing is removed.
    pub fn delete<F>(&self, predicate: F) -> Result<Vec<ChunkId>>
    where
        F: Fn(ChunkId, &Metadata) -> bool,
    {
        let mut rows = self.write()?;
        let doomed: Vec<ChunkId> = rows
            .iter()
            .filter(|(id, row)| predicate(**id, *row))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            rows.remove(id);
        }
        Ok(doomed)
    }

    pub fn remove(&self, id: ChunkId) -> Result<Option<Metadata>> {
        Ok(self.write()?.remove(&id))
    }

    pub fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.rows.read().map(|r| r.contains_key(&id)).unwrap_or(false)
    }

    /// Rows whose id passes `visible`.
    pub fn count(&self, visible: impl Fn(ChunkId) -> bool) -> usize {
        self.rows
            .read()
            .map(|r| r.keys().filter(|id| visible(**id)).count())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ChunkId> {
        self.rows
            .read()
            .map(|r| r.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Poison the row lock so every fallible accessor fails.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = self.rows.write();
                panic!("poisoning metadata lock");
            })
            .join()
        });
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<ChunkId, Metadata>>> {
        self.rows
            .read()
            .map_err(|e| ChunkdexError::Storage(format!("Lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<ChunkId, Metadata>>> {
        self.rows
            .write()
            .map_err(|e| ChunkdexError::Storage(format!("Lock poisoned: {}", e)))
    }
}
