//! Shared partitioning helpers: the stop condition every recursive
//! splitter consults, adapters that let either reconstruction strategy
//! feed the cost model, and the whole-workload cost estimator the CLI's
//! test-query reporting uses. Grounded on
//! `original_source/.../partitioner/common.{h,cpp}`.

use super::model::{CostModel, ReconstructionTiming};
use crate::errors::{MetadataError, PartitionError, PartitionResult, PlanResult, SchemaError};
use crate::metadata::{BlockMeta, PartitionMeta, Query};
use crate::produce_plan::ScanParameter;
use crate::registry::Registry;
use crate::schema::Schema;
use std::sync::Arc;

/// A block is small enough to stop recursing once its row count drops to
/// or below `min_row_num` (spec.md §4.7, default 1 Mi rows per the
/// original's `BLOCK_MIN_ROW_NUM`). A block with an unknown row count is
/// treated as already small, since there is nothing left to estimate a
/// split against.
pub fn stop_by_row_num(block: &BlockMeta, min_row_num: u64) -> bool {
    block.row_num_opt().map_or(true, |n| n <= min_row_num)
}

/// Converts a schema lookup/merge failure into a [`PartitionError`],
/// since [`crate::schema::Schema`]'s own errors aren't directly in its
/// `#[from]` chain.
pub(crate) fn schema_err(e: SchemaError) -> PartitionError {
    MetadataError::from(e).into()
}

/// Adapts the aggregation-reconstruction producer to the `(direct,
/// reconstruct)` shape the cost model consumes.
pub fn aggregation_params(
    query: &Arc<Query>,
    table_schema: &Schema,
    partitions: &[PartitionMeta],
    registry: &Registry,
) -> PlanResult<(Vec<ScanParameter>, Vec<ScanParameter>)> {
    crate::produce_plan::aggregation::produce_scan_parameters_aggregation(query, table_schema, partitions, registry)
}

/// Adapts the cheap whole-query baseline producer (spec.md §9 "early"
/// regime) to the same `(direct, reconstruct)` shape, for the
/// hierarchical partitioner's inner search loop.
pub fn early_params(
    query: &Arc<Query>,
    table_schema: &Schema,
    partitions: &[PartitionMeta],
    registry: &Registry,
) -> PlanResult<(Vec<ScanParameter>, Vec<ScanParameter>)> {
    crate::produce_plan::baseline::produce_scan_parameters_early(query, table_schema, partitions, registry)
}

/// Adapts the join-reconstruction producer, flattening its filter-only
/// and per-connected-component measure groups into one reconstruct list
/// (the cost model only distinguishes direct vs. reconstruct, not the
/// join path's further grouping).
pub fn join_params(
    query: &Arc<Query>,
    table_schema: &Schema,
    partitions: &[PartitionMeta],
    registry: &Registry,
) -> PlanResult<(Vec<ScanParameter>, Vec<ScanParameter>)> {
    let (direct, filter_only, measure_groups) =
        crate::produce_plan::join::produce_scan_parameters_join(query, table_schema, partitions, registry)?;
    let mut reconstruct = filter_only;
    for group in measure_groups {
        reconstruct.extend(group);
    }
    Ok((direct, reconstruct))
}

/// Sums the predicted cost of evaluating every query in `queries`
/// against `blocks`, each wrapped in its own single-block partition.
/// Ported from the second `estimateCost(blocks, queries, ...)` overload,
/// used for ad hoc "how would this layout perform against a held-out
/// query set" reporting.
pub fn estimate_workload_cost(
    cost_model: &CostModel,
    blocks: &[BlockMeta],
    queries: &[Arc<Query>],
    table_schema: &Schema,
    registry: &Registry,
    timing: ReconstructionTiming,
    produce_params: impl Fn(&Arc<Query>, &Schema, &[PartitionMeta], &Registry) -> PlanResult<(Vec<ScanParameter>, Vec<ScanParameter>)>,
) -> PartitionResult<f64> {
    let partitions: Vec<PartitionMeta> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| {
            let mut p = PartitionMeta::new(format!("{i}.parquet"));
            p.add_block(b.clone());
            p
        })
        .collect();

    let mut total = 0.0;
    for q in queries {
        let (direct, reconstruct) = produce_params(q, table_schema, &partitions, registry)?;
        total += cost_model
            .estimate_query_cost(&reconstruct, &direct, table_schema, registry, timing)
            .total_time();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Boundary;
    use std::collections::HashMap;

    #[test]
    fn stop_by_row_num_true_at_and_below_threshold() {
        let schema = Schema::new();
        let block = BlockMeta::new(0, Boundary::new(HashMap::new()), schema, Some(1024));
        assert!(stop_by_row_num(&block, 1024));
        assert!(stop_by_row_num(&block, 2000));
    }

    #[test]
    fn stop_by_row_num_false_above_threshold() {
        let schema = Schema::new();
        let block = BlockMeta::new(0, Boundary::new(HashMap::new()), schema, Some(5_000_000));
        assert!(!stop_by_row_num(&block, 1024 * 1024));
    }

    #[test]
    fn unknown_row_count_stops_conservatively() {
        let schema = Schema::new();
        let block = BlockMeta::new(0, Boundary::new(HashMap::new()), schema, None);
        assert!(stop_by_row_num(&block, 10));
    }
}
