//! Physical units of storage: a `BlockMeta` is one stored column/row slice
//! with its own boundary and schema; a `PartitionMeta` is the ordered list
//! of blocks backing a single file.

use super::{Boundary, ComplexBoundary, SetRelation};
use crate::errors::{MetadataResult, PlanError, PlanResult};
use crate::schema::Schema;
use crate::value::Value;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BlockMeta {
    block_id: usize,
    boundary: Arc<Boundary>,
    schema: Arc<Schema>,
    /// `None` until the row count is known (measured, or propagated from a
    /// parent block during a partitioner split).
    row_num: Option<u64>,
    /// Path of the partition file this block belongs to, set once the
    /// block is added to a `PartitionMeta`. `None` for a block still being
    /// constructed by the partitioner.
    partition_path: Option<String>,
}

impl BlockMeta {
    pub fn new(block_id: usize, boundary: Boundary, schema: Schema, row_num: Option<u64>) -> Self {
        Self {
            block_id,
            boundary: Arc::new(boundary),
            schema: Arc::new(schema),
            row_num,
            partition_path: None,
        }
    }

    pub fn block_id(&self) -> usize {
        self.block_id
    }

    pub fn partition_path(&self) -> Option<&str> {
        self.partition_path.as_deref()
    }

    /// Globally unique key across partitions: `{path}#{block_id}`.
    pub fn key(&self) -> String {
        format!("{}#{}", self.partition_path.as_deref().unwrap_or(""), self.block_id)
    }

    pub fn boundary(&self) -> &Boundary {
        &self.boundary
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn set_boundary(&mut self, boundary: Boundary) {
        self.boundary = Arc::new(boundary);
    }

    pub fn set_schema(&mut self, schema: Schema) {
        self.schema = Arc::new(schema);
    }

    pub fn row_num(&self) -> PlanResult<u64> {
        self.row_num.ok_or(PlanError::UnknownRowCount)
    }

    pub fn row_num_opt(&self) -> Option<u64> {
        self.row_num
    }

    /// Superset/subset/etc. of this block against the synthetic block
    /// `{boundary, attributes}`: both the boundary relation and the
    /// schema's attribute-set relation must fold together without ever
    /// hitting a mismatched pair.
    pub fn relationship(
        &self,
        boundary: &Boundary,
        attributes: &HashSet<String>,
        registry: &crate::registry::Registry,
    ) -> MetadataResult<SetRelation> {
        let boundary_rel = self.boundary.relationship(boundary, registry)?;
        let schema_rel = self.schema.relationship(attributes);
        Ok(boundary_rel.fold(schema_rel))
    }

    pub fn estimate_row_num(&self, boundary: &Boundary) -> MetadataResult<Option<u64>> {
        let Some(row_num) = self.row_num else {
            return Ok(None);
        };
        let ratio = self.boundary.intersection_ratio(boundary)?;
        Ok(Some((row_num as f64 * ratio) as u64))
    }

    pub fn estimate_row_num_complex(&self, boundary: &ComplexBoundary, registry: &crate::registry::Registry) -> MetadataResult<Option<u64>> {
        let Some(row_num) = self.row_num else {
            return Ok(None);
        };
        // ratio of self.boundary covered by the complex boundary, attribute by attribute
        let mut ratio = 1.0;
        for (attr, this_interval) in self.boundary.intervals() {
            if let Some(ivs) = boundary.get(attr) {
                let mut attr_ratio = 0.0;
                for iv in ivs {
                    if let Ok(r) = this_interval.intersection_ratio(iv) {
                        attr_ratio += r;
                    }
                }
                ratio *= attr_ratio.min(1.0);
            }
        }
        let _ = registry;
        Ok(Some((row_num as f64 * ratio) as u64))
    }

    /// Estimated bytes to read `attributes` out of this block, using each
    /// attribute's schema size hint (falling back to a conservative
    /// default for unsized kinds such as variable-length strings).
    /// Attributes this block's schema never stored are skipped rather than
    /// rejected, since callers routinely estimate cost against a query's
    /// full referred-attribute set against one column-group block at a
    /// time.
    pub fn estimate_io_size(&self, attributes: &HashSet<String>) -> MetadataResult<u64> {
        let row_num = self.row_num()?;
        let mut bytes_per_row: u64 = 0;
        for name in attributes {
            let Ok(attr) = self.schema.get(name) else {
                continue;
            };
            bytes_per_row += attr.size_hint.unwrap_or(8) as u64;
        }
        Ok(bytes_per_row * row_num)
    }

    /// Splits this block in two at `point` along `attribute`, assigning
    /// child row counts proportionally to the boundary split's ratio. The
    /// two children's row counts always sum back to the parent's.
    pub fn split(&self, attribute: &str, point: &Value, point_goes_left: bool) -> MetadataResult<Vec<BlockMeta>> {
        let parts = self.boundary.split(attribute, point, point_goes_left)?;
        if parts.is_empty() {
            return Ok(Vec::new());
        }
        let row_nums: Vec<Option<u64>> = match self.row_num {
            None => vec![None, None],
            Some(total) => {
                let ratio0 = parts[0].intersection_ratio(&self.boundary)?;
                let first = ((total as f64) * ratio0).round() as u64;
                let first = first.min(total);
                vec![Some(first), Some(total - first)]
            }
        };
        Ok(parts
            .into_iter()
            .zip(row_nums)
            .enumerate()
            .map(|(i, (boundary, row_num))| {
                let mut b = BlockMeta::new(self.block_id + i, boundary, (*self.schema).clone(), row_num);
                b.partition_path = self.partition_path.clone();
                b
            })
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartitionMeta {
    file_path: String,
    blocks: Vec<BlockMeta>,
}

impl PartitionMeta {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            blocks: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.file_path
    }

    pub fn blocks(&self) -> &[BlockMeta] {
        &self.blocks
    }

    /// Appends `block`, assigning it the next sequential block id and
    /// stamping it with this partition's file path.
    pub fn add_block(&mut self, mut block: BlockMeta) {
        block.block_id = self.blocks.len();
        block.partition_path = Some(self.file_path.clone());
        self.blocks.push(block);
    }
}

impl std::fmt::Display for BlockMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block#{} rows={:?} attrs={}",
            self.block_id,
            self.row_num,
            self.schema.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Interval;
    use crate::schema::AttributeDef;
    use crate::value::DataType;
    use std::collections::HashMap;

    fn int(v: i64) -> Value {
        Value::Integer { value: v, bits: 32 }
    }

    fn block(lo: i64, hi: i64, row_num: Option<u64>) -> BlockMeta {
        let mut m = HashMap::new();
        m.insert("a".to_string(), Interval::new(int(lo), false, int(hi), false).unwrap());
        let mut schema = Schema::new();
        schema.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        BlockMeta::new(0, Boundary::new(m), schema, row_num)
    }

    #[test]
    fn split_conserves_row_count() {
        let b = block(0, 99, Some(1000));
        let children = b.split("a", &int(49), true).unwrap();
        assert_eq!(children.len(), 2);
        let total: u64 = children.iter().map(|c| c.row_num().unwrap()).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn unknown_row_num_is_an_error() {
        let b = block(0, 99, None);
        assert!(b.row_num().is_err());
        assert!(b.estimate_io_size(&["a".to_string()].into_iter().collect()).is_err());
    }

    #[test]
    fn partition_meta_assigns_sequential_ids() {
        let mut p = PartitionMeta::new("f.parquet");
        p.add_block(block(0, 10, Some(5)));
        p.add_block(block(10, 20, Some(5)));
        assert_eq!(p.blocks()[0].block_id(), 0);
        assert_eq!(p.blocks()[1].block_id(), 1);
    }
}
