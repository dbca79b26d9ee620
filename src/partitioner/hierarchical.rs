//! Column-group discovery plus a greedy pairwise merge search (spec.md
//! §4.8), grounded on
//! `original_source/.../partitioner/hierarchical_partitioner.cpp`. Starts
//! from one column group per distinct query-access pattern, horizontally
//! partitions each group, then repeatedly tries merging the most promising
//! pairs and keeps whichever of {current groups, best merge} costs less —
//! recursing on the merged set until no merge helps.

use super::common::schema_err;
#[cfg(test)]
use super::common::early_params;
use super::horizontal::horizontal_partition;
use super::model::{CostModel, ReconstructionTiming};
use crate::config::PartitionerConfig;
use crate::errors::{PartitionError, PartitionResult, PlanResult};
use crate::metadata::{BlockMeta, PartitionMeta, Query, SetRelation};
use crate::produce_plan::ScanParameter;
use crate::registry::{Registry, TUPLE_ID};
use crate::schema::Schema;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One candidate vertical slice: the block that would be stored for it,
/// and a bitmap over `train_queries` recording which ones touch it
/// (`Block_Pattern` in the original).
#[derive(Debug, Clone)]
pub struct ColumnGroup {
    pub block: BlockMeta,
    pub pattern: Vec<bool>,
}

type PartitionCache = Mutex<HashMap<Vec<String>, Vec<BlockMeta>>>;

/// A column group's identity for caching purposes: its schema's attribute
/// names, sorted. Two groups with the same attribute set are treated as
/// the same partitioning subproblem, standing in for the original's
/// pointer-identity cache key (a stable object identity isn't available
/// once groups are rebuilt across merge candidates).
fn group_key(block: &BlockMeta) -> Vec<String> {
    let mut v: Vec<String> = block.schema().attribute_names().into_iter().collect();
    v.sort();
    v
}

fn bitmap_or(a: &[bool], b: &[bool]) -> Vec<bool> {
    a.iter().zip(b.iter()).map(|(x, y)| *x || *y).collect()
}

fn bitmap_overlaps(a: &[bool], b: &[bool]) -> bool {
    a.iter().zip(b.iter()).any(|(x, y)| *x && *y)
}

fn bitmap_and_count(a: &[bool], b: &[bool]) -> usize {
    a.iter().zip(b.iter()).filter(|(x, y)| **x && **y).count()
}

fn bitmap_or_count(a: &[bool], b: &[bool]) -> usize {
    a.iter().zip(b.iter()).filter(|(x, y)| **x || **y).count()
}

/// Worker pool size: `min(worker_pool_cap, max(1, floor(available_parallelism * worker_pool_fraction)))`.
fn worker_pool_size(config: &PartitionerConfig) -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let scaled = ((cores as f64) * config.worker_pool_fraction).floor() as usize;
    config.worker_pool_cap.min(scaled.max(1))
}

fn build_pool(config: &PartitionerConfig) -> PartitionResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(worker_pool_size(config))
        .build()
        .map_err(|e| PartitionError::WorkerPool(e.to_string()))
}

/// Splits `table`'s attributes into unit column groups by query-access
/// pattern: two attributes land in the same group iff every training
/// query touches them identically, and an attribute used only as a
/// filter is kept in a separate pattern family from one used only as a
/// projection (`columnBlocks`).
pub fn column_blocks(table: &BlockMeta, queries: &[Arc<Query>]) -> Vec<ColumnGroup> {
    let table_schema = table.schema();
    let mut attribute_names: Vec<String> = table_schema
        .attribute_names()
        .into_iter()
        .filter(|a| a != TUPLE_ID)
        .collect();
    attribute_names.sort();

    let mut filter_attr_sets: Vec<HashSet<String>> = Vec::with_capacity(queries.len());
    let mut project_attr_sets: Vec<HashSet<String>> = Vec::with_capacity(queries.len());
    let mut filter_attributes: HashSet<String> = HashSet::new();

    for q in queries {
        let filter_attr = q.filter_boundary().attributes();
        let mut project_attr = q.all_referred_attributes();
        for a in &filter_attr {
            project_attr.remove(a);
        }
        filter_attributes.extend(filter_attr.iter().cloned());
        filter_attr_sets.push(filter_attr);
        project_attr_sets.push(project_attr);
    }

    // patterns[0]: attributes used (at least once) as a filter.
    // patterns[1]: attributes used only in projections/measures.
    let mut patterns: [Vec<(HashSet<String>, Vec<bool>)>; 2] = [Vec::new(), Vec::new()];

    for a in &attribute_names {
        let role = usize::from(!filter_attributes.contains(a));
        let mut single = Schema::new();
        if let Ok(def) = table_schema.get(a) {
            let _ = single.add(def.clone());
        }
        let bitmap: Vec<bool> = (0..queries.len())
            .map(|i| {
                let attrs = if role == 0 { &filter_attr_sets[i] } else { &project_attr_sets[i] };
                single.relationship(attrs) != SetRelation::Disjoint
            })
            .collect();

        if let Some(entry) = patterns[role].iter_mut().find(|(_, b)| *b == bitmap) {
            entry.0.insert(a.clone());
        } else {
            patterns[role].push((std::iter::once(a.clone()).collect(), bitmap));
        }
    }

    let tid = table_schema.get(TUPLE_ID).ok().cloned();
    let mut groups = Vec::new();
    for pattern_family in patterns {
        for (names, bitmap) in pattern_family {
            let mut schema = Schema::new();
            if let Some(tid_attr) = &tid {
                let _ = schema.add(tid_attr.clone());
            }
            let mut sorted_names: Vec<&String> = names.iter().collect();
            sorted_names.sort();
            for name in sorted_names {
                if let Ok(def) = table_schema.get(name) {
                    let _ = schema.add(def.clone());
                }
            }
            let block = BlockMeta::new(0, table.boundary().clone(), schema, table.row_num_opt());
            groups.push(ColumnGroup { block, pattern: bitmap });
        }
    }
    groups
}

/// Horizontally partitions every column group (reusing `cache` for groups
/// that were already solved under an earlier merge candidate), then
/// estimates the summed predicted cost of `validate_queries` against the
/// resulting layout (`partitionColumnGroups`).
#[allow(clippy::too_many_arguments)]
fn partition_column_groups(
    column_groups: &[ColumnGroup],
    train_queries: &[Arc<Query>],
    validate_queries: &[Arc<Query>],
    config: &PartitionerConfig,
    registry: &Registry,
    table_schema: &Schema,
    timing: ReconstructionTiming,
    produce_params: &(impl Fn(&Arc<Query>, &Schema, &[PartitionMeta], &Registry) -> PlanResult<(Vec<ScanParameter>, Vec<ScanParameter>)> + Sync),
    cost_model: &CostModel,
    cache: &PartitionCache,
    pool: &rayon::ThreadPool,
) -> PartitionResult<(Vec<BlockMeta>, f64)> {
    let results: Vec<PartitionResult<Vec<BlockMeta>>> = pool.install(|| {
        column_groups
            .par_iter()
            .map(|group| -> PartitionResult<Vec<BlockMeta>> {
                let key = group_key(&group.block);
                if let Some(cached) = cache.lock().get(&key) {
                    return Ok(cached.clone());
                }
                let group_queries: Vec<Arc<Query>> = group
                    .pattern
                    .iter()
                    .enumerate()
                    .filter(|(_, touched)| **touched)
                    .map(|(i, _)| train_queries[i].clone())
                    .collect();
                let mut rng = rand::thread_rng();
                let blocks = horizontal_partition(
                    group.block.clone(),
                    &group_queries,
                    config.min_row_num,
                    config.sample_query_count,
                    HashMap::new(),
                    registry,
                    &mut rng,
                )?;
                cache.lock().insert(key, blocks.clone());
                Ok(blocks)
            })
            .collect()
    });

    let mut partitions = Vec::new();
    let mut blocks_out = Vec::new();
    let mut next_id = 0usize;
    for r in results {
        let blocks = r?;
        for b in &blocks {
            let mut p = PartitionMeta::new(format!("{next_id}.parquet"));
            next_id += 1;
            p.add_block(b.clone());
            partitions.push(p);
        }
        blocks_out.extend(blocks);
    }

    let cost_results: Vec<PartitionResult<f64>> = pool.install(|| {
        validate_queries
            .par_iter()
            .map(|q| -> PartitionResult<f64> {
                let (direct, reconstruct) = produce_params(q, table_schema, &partitions, registry)?;
                Ok(cost_model
                    .estimate_query_cost(&reconstruct, &direct, table_schema, registry, timing)
                    .total_time())
            })
            .collect()
    });

    let mut total_cost = 0.0;
    for r in cost_results {
        total_cost += r?;
    }

    Ok((blocks_out, total_cost))
}

/// Pairs worth evaluating as merge candidates: a pair survives if its two
/// groups share at least one query (`bitmap_overlaps`), restricted first
/// to groups that either serve more than one query template or touch a
/// filter attribute. Falls back to every overlapping pair when that
/// restriction leaves nothing (`pairColumnGroupsWOUnique`).
fn pair_column_groups_wo_unique(column_groups: &[ColumnGroup], queries: &[Arc<Query>]) -> Vec<(usize, usize)> {
    let mut filter_attrs: HashSet<String> = HashSet::new();
    let mut query_attribute_sets: Vec<HashSet<String>> = Vec::new();
    for q in queries {
        filter_attrs.extend(q.filter_boundary().attributes());
        let all = q.all_referred_attributes();
        if !query_attribute_sets.contains(&all) {
            query_attribute_sets.push(all);
        }
    }

    let make_pairs = |indices: &[usize]| -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (pos, &i) in indices.iter().enumerate() {
            for &j in &indices[pos + 1..] {
                if bitmap_overlaps(&column_groups[i].pattern, &column_groups[j].pattern) {
                    out.push((i.min(j), i.max(j)));
                }
            }
        }
        out
    };

    let mut eligible = Vec::new();
    for (i, group) in column_groups.iter().enumerate() {
        let schema = group.block.schema();
        let touched_by = query_attribute_sets
            .iter()
            .filter(|attrs| schema.relationship(attrs) != SetRelation::Disjoint)
            .count();
        if touched_by > 1 || schema.relationship(&filter_attrs) != SetRelation::Disjoint {
            eligible.push(i);
        }
    }

    let pairs = make_pairs(&eligible);
    if !pairs.is_empty() {
        return pairs;
    }
    make_pairs(&(0..column_groups.len()).collect::<Vec<_>>())
}

/// A sampled candidate-pair set for when `pair_column_groups_wo_unique`
/// returns too many pairs: the exact set of pairs jointly referenced by a
/// single query's filter and projection attributes, unioned with the
/// `num` highest-Jaccard-similarity pairs among the rest
/// (`pairColumnGroupsSample`).
fn pair_column_groups_sample(column_groups: &[ColumnGroup], num: usize, queries: &[Arc<Query>]) -> Vec<(usize, usize)> {
    let mut group_of_attribute: HashMap<String, usize> = HashMap::new();
    for (i, g) in column_groups.iter().enumerate() {
        for name in g.block.schema().attribute_names() {
            group_of_attribute.insert(name, i);
        }
    }

    let mut exact: HashSet<(usize, usize)> = HashSet::new();
    for q in queries {
        let filter_attrs = q.filter_boundary().attributes();
        let proj_attrs = q.all_referred_attributes();
        for fa in &filter_attrs {
            let Some(&i) = group_of_attribute.get(fa) else { continue };
            for pa in &proj_attrs {
                let Some(&j) = group_of_attribute.get(pa) else { continue };
                if i != j {
                    exact.insert((i.min(j), i.max(j)));
                }
            }
        }
    }

    let mut scored: Vec<(f64, usize, usize)> = Vec::new();
    for i in 0..column_groups.len() {
        for j in (i + 1)..column_groups.len() {
            if exact.contains(&(i, j)) {
                continue;
            }
            let union = bitmap_or_count(&column_groups[i].pattern, &column_groups[j].pattern);
            if union == 0 {
                continue;
            }
            let inter = bitmap_and_count(&column_groups[i].pattern, &column_groups[j].pattern);
            scored.push((inter as f64 / union as f64, i, j));
        }
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(num);

    let mut ans = exact;
    for (_, i, j) in scored {
        ans.insert((i, j));
    }
    ans.into_iter().collect()
}

/// The recursive merge search: partitions the current groups, evaluates
/// every candidate pair's merge in parallel, recurses into whichever
/// merge scored lowest, and returns whichever of {current, best merge
/// (recursed)} costs less overall (`hierarchicalPartition(column_groups, ...)`).
#[allow(clippy::too_many_arguments)]
fn hierarchical_step(
    column_groups: Vec<ColumnGroup>,
    train_queries: &[Arc<Query>],
    validate_queries: &[Arc<Query>],
    config: &PartitionerConfig,
    registry: &Registry,
    table_schema: &Schema,
    timing: ReconstructionTiming,
    produce_params: &(impl Fn(&Arc<Query>, &Schema, &[PartitionMeta], &Registry) -> PlanResult<(Vec<ScanParameter>, Vec<ScanParameter>)> + Sync),
    cost_model: &CostModel,
    cache: &PartitionCache,
    pool: &rayon::ThreadPool,
) -> PartitionResult<(Vec<BlockMeta>, f64)> {
    let (blocks, cost) = partition_column_groups(
        &column_groups,
        train_queries,
        validate_queries,
        config,
        registry,
        table_schema,
        timing,
        produce_params,
        cost_model,
        cache,
        pool,
    )?;

    tracing::info!(cost, groups = column_groups.len(), "evaluated column-group layout");

    if column_groups.len() < 2 {
        return Ok((blocks, cost));
    }

    let mut pairs = pair_column_groups_wo_unique(&column_groups, train_queries);
    if pairs.len() > config.max_merge_candidates {
        pairs = pair_column_groups_sample(&column_groups, config.max_merge_candidates, train_queries);
    }
    if pairs.is_empty() {
        return Ok((blocks, cost));
    }

    let merge_results: Vec<PartitionResult<(f64, Vec<ColumnGroup>)>> = pool.install(|| {
        pairs
            .par_iter()
            .map(|&(i, j)| -> PartitionResult<(f64, Vec<ColumnGroup>)> {
                let mut merged: Vec<ColumnGroup> = column_groups
                    .iter()
                    .enumerate()
                    .filter(|(k, _)| *k != i && *k != j)
                    .map(|(_, g)| g.clone())
                    .collect();

                let mut merged_schema = column_groups[i].block.schema().clone();
                merged_schema.append(column_groups[j].block.schema()).map_err(schema_err)?;
                let mut merged_block = column_groups[i].block.clone();
                merged_block.set_schema(merged_schema);
                let merged_pattern = bitmap_or(&column_groups[i].pattern, &column_groups[j].pattern);
                merged.push(ColumnGroup {
                    block: merged_block,
                    pattern: merged_pattern,
                });

                // the pool is already saturated by the outer par_iter; evaluate this
                // candidate's own partitioning single-threaded
                let solo_pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(1)
                    .build()
                    .map_err(|e| PartitionError::WorkerPool(e.to_string()))?;
                let (_, merged_cost) = partition_column_groups(
                    &merged,
                    train_queries,
                    validate_queries,
                    config,
                    registry,
                    table_schema,
                    timing,
                    produce_params,
                    cost_model,
                    cache,
                    &solo_pool,
                )?;
                Ok((merged_cost, merged))
            })
            .collect()
    });

    let mut best: Option<(f64, Vec<ColumnGroup>)> = None;
    for r in merge_results {
        let (c, groups) = r?;
        if best.as_ref().map_or(true, |(bc, _)| c < *bc) {
            best = Some((c, groups));
        }
    }

    let Some((_, merged_groups)) = best else {
        return Ok((blocks, cost));
    };

    let (merged_blocks, merged_cost) = hierarchical_step(
        merged_groups,
        train_queries,
        validate_queries,
        config,
        registry,
        table_schema,
        timing,
        produce_params,
        cost_model,
        cache,
        pool,
    )?;

    if merged_cost < cost {
        Ok((merged_blocks, merged_cost))
    } else {
        Ok((blocks, cost))
    }
}

/// Discovers a table's unit column groups, then runs the merge search
/// against them, using a worker pool bounded at
/// `min(config.worker_pool_cap, floor(available_parallelism * config.worker_pool_fraction))`
/// (`hierarchicalPartition(table, ...)`).
#[allow(clippy::too_many_arguments)]
pub fn hierarchical_partition(
    table: BlockMeta,
    train_queries: &[Arc<Query>],
    validate_queries: &[Arc<Query>],
    config: &PartitionerConfig,
    registry: &Registry,
    timing: ReconstructionTiming,
    produce_params: impl Fn(&Arc<Query>, &Schema, &[PartitionMeta], &Registry) -> PlanResult<(Vec<ScanParameter>, Vec<ScanParameter>)> + Sync,
    cost_model: &CostModel,
) -> PartitionResult<Vec<BlockMeta>> {
    let table_schema = table.schema().clone();
    let column_groups = column_blocks(&table, train_queries);
    let pool = build_pool(config)?;
    let cache: PartitionCache = Mutex::new(HashMap::new());

    let (blocks, _cost) = hierarchical_step(
        column_groups,
        train_queries,
        validate_queries,
        config,
        registry,
        &table_schema,
        timing,
        &produce_params,
        cost_model,
        &cache,
        &pool,
    )?;
    Ok(blocks)
}

/// Drops any block whose schema has gone unreachable: a first pass grows
/// the accessed-attribute set from `validate_queries` outward through
/// every block whose schema already intersects it (in `blocks`' order),
/// then a second pass keeps only blocks whose schema intersects the
/// fully-grown set (mirrors `partitioner.cpp`'s post-partition pruning).
pub fn prune_unreachable_blocks(blocks: Vec<BlockMeta>, validate_queries: &[Arc<Query>]) -> Vec<BlockMeta> {
    let mut accessed: HashSet<String> = HashSet::new();
    for q in validate_queries {
        accessed.extend(q.all_referred_attributes());
    }
    for b in &blocks {
        let schema_attrs = b.schema().attribute_names();
        if schema_attrs.is_disjoint(&accessed) {
            continue;
        }
        accessed.extend(b.boundary().attributes());
    }
    blocks
        .into_iter()
        .filter(|b| !b.schema().attribute_names().is_disjoint(&accessed))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CostModelConfig;
    use crate::expression::{Expression, LiteralValue};
    use crate::metadata::Boundary;
    use crate::schema::AttributeDef;
    use crate::value::{DataType, Value};

    fn int(v: i64) -> Value {
        Value::Integer { value: v, bits: 32 }
    }

    fn attr(name: &str) -> Expression {
        Expression::Attribute {
            name: name.to_string(),
            data_type: DataType::Integer,
            size_hint: None,
        }
    }

    fn lit(name: &str, v: i64) -> Expression {
        Expression::Literal {
            name: name.to_string(),
            value: LiteralValue::Value(int(v)),
        }
    }

    fn cmp(op: &str, left: Expression, right: Expression) -> Expression {
        Expression::Function {
            name: format!("{op}_cmp"),
            op: op.to_string(),
            children: vec![left, right],
            data_type: DataType::Boolean,
            nullable: false,
        }
    }

    fn table_schema() -> Schema {
        let mut s = Schema::new();
        s.add(AttributeDef::new(TUPLE_ID, DataType::Integer)).unwrap();
        s.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        s.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        s.add(AttributeDef::new("c", DataType::Integer)).unwrap();
        s
    }

    fn registry() -> Registry {
        let mut reg = Registry::new();
        reg.set_min_max("a", int(0), int(999));
        reg.set_min_max("b", int(0), int(999));
        reg.set_min_max("c", int(0), int(999));
        reg
    }

    fn table_block(rows: u64) -> BlockMeta {
        BlockMeta::new(0, Boundary::default(), table_schema(), Some(rows))
    }

    #[test]
    fn column_blocks_splits_filter_and_projection_roles() {
        let reg = registry();
        let filter_q = Arc::new(Query::new(table_schema(), cmp("gte", attr("a"), lit("l", 1)), vec![], "q1", &reg).unwrap());
        let measure = Expression::Aggregate {
            name: "m".to_string(),
            op: "sum".to_string(),
            children: vec![attr("b")],
            data_type: DataType::Integer,
            nullable: false,
        };
        let proj_q = Arc::new(Query::new(table_schema(), cmp("gte", attr("c"), lit("l2", 1)), vec![measure], "q2", &reg).unwrap());

        let groups = column_blocks(&table_block(1000), &[filter_q, proj_q]);
        // a: filter-only role; b: projection-only role (measure) for q2;
        // c: filter role for q2. None of a/b/c share an identical access
        // pattern, so each becomes its own unit group (plus tid riding
        // along in every group's schema).
        let names: HashSet<String> = groups
            .iter()
            .flat_map(|g| g.block.schema().attribute_names())
            .filter(|n| n != TUPLE_ID)
            .collect();
        assert_eq!(names, ["a", "b", "c"].into_iter().map(String::from).collect());
        for g in &groups {
            assert!(g.block.schema().contains(TUPLE_ID));
        }
    }

    #[test]
    fn prune_unreachable_drops_blocks_no_query_can_reach() {
        let reg = registry();
        let q = Arc::new(Query::new(table_schema(), cmp("gte", attr("a"), lit("l", 1)), vec![], "q1", &reg).unwrap());

        let mut schema_a = Schema::new();
        schema_a.add(AttributeDef::new(TUPLE_ID, DataType::Integer)).unwrap();
        schema_a.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        let reachable = BlockMeta::new(0, Boundary::default(), schema_a, Some(100));

        let mut schema_c = Schema::new();
        schema_c.add(AttributeDef::new(TUPLE_ID, DataType::Integer)).unwrap();
        schema_c.add(AttributeDef::new("c", DataType::Integer)).unwrap();
        let unreachable = BlockMeta::new(1, Boundary::default(), schema_c, Some(100));

        let kept = prune_unreachable_blocks(vec![reachable, unreachable], &[q]);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].schema().contains("a"));
    }

    #[test]
    fn hierarchical_partition_returns_a_covering_layout() {
        let reg = registry();
        let q = Arc::new(Query::new(table_schema(), cmp("gte", attr("a"), lit("l", 1)), vec![], "q1", &reg).unwrap());
        let config = PartitionerConfig {
            min_row_num: 500,
            worker_pool_cap: 2,
            ..PartitionerConfig::default()
        };
        let cost_model = CostModel::new(CostModelConfig::default());

        let blocks = hierarchical_partition(table_block(1000), &[q.clone()], &[q], &config, &reg, ReconstructionTiming::Early, early_params, &cost_model).unwrap();

        assert!(!blocks.is_empty());
        let covered: HashSet<String> = blocks.iter().flat_map(|b| b.schema().attribute_names()).collect();
        assert!(covered.contains("a"));
    }
}
