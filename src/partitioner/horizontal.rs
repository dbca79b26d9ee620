//! Recursive binary block splitter (spec.md §4.7), grounded on
//! `original_source/.../partitioner/horizontal_partitioner.cpp`: at every
//! level, try splitting at each sampled query's filter endpoints and keep
//! the split with the least combined estimated I/O; if nothing usable
//! turns up, fall back to a weighted-random resize.

use super::common::{schema_err, stop_by_row_num};
use crate::errors::{MetadataError, PartitionError, PartitionResult, PlanResult, ValueError};
use crate::metadata::{BlockMeta, Query, SetRelation};
use crate::registry::Registry;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn value_err(e: ValueError) -> PartitionError {
    MetadataError::from(e).into()
}

/// Sum of estimated I/O bytes `block` pays across every query in
/// `queries` that isn't disjoint from it, plus the subset of queries that
/// actually intersect (`estimateIOSize`).
fn estimate_io_size(block: &BlockMeta, queries: &[Arc<Query>], registry: &Registry) -> PlanResult<(u64, Vec<Arc<Query>>)> {
    let mut size = 0u64;
    let mut intersecting = Vec::new();
    for q in queries {
        let attrs = q.all_referred_attributes();
        let rel = block.relationship(q.filter_boundary(), &attrs, registry)?;
        if rel == SetRelation::Disjoint {
            continue;
        }
        intersecting.push(q.clone());
        size += block.estimate_io_size(&attrs).unwrap_or(0);
    }
    Ok((size, intersecting))
}

/// Up to `max_num` of the queries that intersect `block`, drawn without
/// replacement (`sampleQueries`). Returns every intersecting query
/// unchanged when there are `max_num` or fewer of them.
fn sample_queries(queries: &[Arc<Query>], max_num: usize, block: &BlockMeta, registry: &Registry, rng: &mut impl rand::RngCore) -> PlanResult<Vec<Arc<Query>>> {
    let (_, intersecting) = estimate_io_size(block, queries, registry)?;
    if intersecting.len() <= max_num {
        return Ok(intersecting);
    }
    let mut chosen: HashSet<usize> = HashSet::new();
    while chosen.len() < max_num {
        chosen.insert(rng.gen_range(0..intersecting.len()));
    }
    Ok(chosen.into_iter().map(|i| intersecting[i].clone()).collect())
}

/// Weight-proportional draw of one attribute out of `ratio`'s keys
/// (spec.md §9 Open Question 1): a single cumulative-weight pass over
/// every attribute, no early exit on the first negative remainder, so
/// every attribute (including the last) is reachable in proportion to its
/// weight.
fn weighted_attribute(ratio: &HashMap<String, i32>, rng: &mut impl rand::RngCore) -> String {
    let sum: i32 = ratio.values().sum();
    let mut r = rng.gen_range(0..sum.max(1));
    for (name, weight) in ratio {
        if r < *weight {
            return name.clone();
        }
        r -= weight;
    }
    // sum overshoot (shouldn't happen once r < sum) falls back to the last
    // attribute seen, matching "weight-proportional sampling over all
    // attributes" rather than leaving the draw undefined.
    ratio.keys().next().cloned().expect("ratio is non-empty")
}

/// Recursively resizes `block` by splitting at a weighted-random
/// attribute's midpoint until the stop condition holds, falling back to
/// iterating every registry-known attribute when no weighted draw
/// produces an acceptable split (`resizeBlock`).
fn resize_block(block: BlockMeta, ratio: &HashMap<String, i32>, min_row_num: u64, registry: &Registry, rng: &mut impl rand::RngCore) -> PartitionResult<Vec<BlockMeta>> {
    if stop_by_row_num(&block, min_row_num) {
        return Ok(vec![block]);
    }
    if ratio.is_empty() {
        return Err(PartitionError::EmptyRatioMap);
    }

    let mut checked: HashSet<String> = HashSet::new();
    let mut candidates: Vec<BlockMeta> = Vec::new();
    let mut has_produced = false;

    while checked.len() < ratio.len() && candidates.is_empty() {
        let attr = weighted_attribute(ratio, rng);
        if checked.contains(&attr) {
            continue;
        }
        checked.insert(attr.clone());

        let Some(interval) = block.boundary().get(&attr) else {
            continue;
        };
        let point = interval.low().middle(interval.high(), 0.5).map_err(value_err)?;
        let split = block.split(&attr, &point, true)?;

        if !split.is_empty() {
            has_produced = true;
        }
        if split.iter().any(|c| stop_by_row_num(c, min_row_num)) {
            candidates.clear();
        } else {
            candidates = split;
        }
    }

    if !has_produced && candidates.is_empty() {
        let mut attrs: Vec<String> = registry.attributes().into_iter().collect();
        attrs.sort();
        for attr in attrs {
            let point = match block.boundary().get(&attr) {
                Some(interval) => interval.low().middle(interval.high(), 0.5).map_err(value_err)?,
                None => {
                    let min = registry.min(&attr).map_err(schema_err)?;
                    let max = registry.max(&attr).map_err(schema_err)?;
                    min.middle(max, 0.5).map_err(value_err)?
                }
            };
            let split = block.split(&attr, &point, true)?;
            if split.is_empty() || split.iter().any(|c| stop_by_row_num(c, min_row_num)) {
                continue;
            }
            candidates = split;
            break;
        }
    }

    if candidates.is_empty() {
        return Ok(vec![block]);
    }
    let mut out = Vec::new();
    for c in candidates {
        out.extend(resize_block(c, ratio, min_row_num, registry, rng)?);
    }
    Ok(out)
}

/// Folds one split candidate into the running best: the candidate with
/// the lowest combined I/O wins regardless of whether it is usable, but
/// `best` is only overwritten by a usable (non-too-small) candidate —
/// mirroring the original's quirk where a cheap-but-too-small split can
/// still block a more expensive, valid one from being recorded later
/// (`horizontalPartition`'s inner loop).
#[allow(clippy::too_many_arguments)]
fn consider_split(
    candidate: Vec<BlockMeta>,
    attr: &str,
    queries: &[Arc<Query>],
    registry: &Registry,
    split_num: &HashMap<String, i32>,
    min_row_num: u64,
    min_cost: &mut u64,
    best: &mut Option<[(BlockMeta, Vec<Arc<Query>>, HashMap<String, i32>); 2]>,
) -> PlanResult<()> {
    if candidate.len() != 2 {
        return Ok(());
    }
    let (cost0, q0) = estimate_io_size(&candidate[0], queries, registry)?;
    let (cost1, q1) = estimate_io_size(&candidate[1], queries, registry)?;
    let cost = cost0 + cost1;
    if cost >= *min_cost {
        return Ok(());
    }
    *min_cost = cost;

    let mut snum = split_num.clone();
    *snum.entry(attr.to_string()).or_insert(0) += 1;

    if !stop_by_row_num(&candidate[0], min_row_num) && !stop_by_row_num(&candidate[1], min_row_num) {
        let mut it = candidate.into_iter();
        let c0 = it.next().expect("len == 2");
        let c1 = it.next().expect("len == 2");
        *best = Some([(c0, q0, snum.clone()), (c1, q1, snum)]);
    }
    Ok(())
}

/// Recursively splits `block` until every leaf drops at or below
/// `min_row_num`, trying each sampled query's filter endpoints at every
/// level before falling back to [`resize_block`] (`horizontalPartition`).
pub fn horizontal_partition(
    block: BlockMeta,
    queries: &[Arc<Query>],
    min_row_num: u64,
    sample_query_count: usize,
    split_num: HashMap<String, i32>,
    registry: &Registry,
    rng: &mut impl rand::RngCore,
) -> PartitionResult<Vec<BlockMeta>> {
    if stop_by_row_num(&block, min_row_num) {
        return Ok(vec![block]);
    }

    let sampled = sample_queries(queries, sample_query_count, &block, registry, rng)?;

    let mut min_cost = u64::MAX;
    let mut best: Option<[(BlockMeta, Vec<Arc<Query>>, HashMap<String, i32>); 2]> = None;

    for q in &sampled {
        for (attr, interval) in q.filter_boundary().intervals() {
            let min_val = interval.low().clone();
            let max_val = interval.high().clone();

            if let Ok(candidate) = block.split(attr, &min_val, false) {
                consider_split(candidate, attr, queries, registry, &split_num, min_row_num, &mut min_cost, &mut best)?;
            }
            if let Ok(candidate) = block.split(attr, &max_val, true) {
                consider_split(candidate, attr, queries, registry, &split_num, min_row_num, &mut min_cost, &mut best)?;
            }
        }
    }

    match best {
        Some([(b0, q0, s0), (b1, q1, s1)]) => {
            let mut out = horizontal_partition(b0, &q0, min_row_num, sample_query_count, s0, registry, rng)?;
            out.extend(horizontal_partition(b1, &q1, min_row_num, sample_query_count, s1, registry, rng)?);
            Ok(out)
        }
        None => resize_block(block, &split_num, min_row_num, registry, rng),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Expression, LiteralValue};
    use crate::metadata::{Boundary, Interval};
    use crate::schema::{AttributeDef, Schema};
    use crate::value::{DataType, Value};
    use rand::SeedableRng;
    use std::collections::HashMap as Map;

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

    fn schema() -> Schema {
        let mut s = Schema::new();
        s.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        s
    }

    fn block(lo: i64, hi: i64, rows: u64) -> BlockMeta {
        let mut m = Map::new();
        m.insert("a".to_string(), Interval::new(int(lo), false, int(hi), false).unwrap());
        BlockMeta::new(0, Boundary::new(m), schema(), Some(rows))
    }

    fn query(lo: i64, hi: i64, reg: &Registry) -> Arc<Query> {
        let filter = cmp("gte", attr("a"), lit("lo", lo));
        let filter = Expression::connect_expression("f", vec![filter, cmp("lte", attr("a"), lit("hi", hi))], false, true);
        Arc::new(Query::new(schema(), filter, vec![], "q", reg).unwrap())
    }

    #[test]
    fn stops_immediately_below_min_row_num() {
        let reg = Registry::new();
        let b = block(0, 999, 100);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let out = horizontal_partition(b, &[], 1000, 30, HashMap::new(), &reg, &mut rng).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn splits_at_query_endpoint_and_conserves_rows() {
        let mut reg = Registry::new();
        reg.set_min_max("a", int(0), int(999999));
        let b = block(0, 999999, 1_000_000);
        let q = query(100, 200, &reg);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let out = horizontal_partition(b, &[q], 400_000, 30, HashMap::new(), &reg, &mut rng).unwrap();
        assert!(out.len() >= 2);
        let total: u64 = out.iter().map(|b| b.row_num_opt().unwrap()).sum();
        assert_eq!(total, 1_000_000);
    }

    #[test]
    fn resize_fallback_splits_at_midpoint_when_no_endpoint_falls_inside() {
        let mut reg = Registry::new();
        reg.set_min_max("a", int(0), int(999_999));
        let b = block(0, 999_999, 2_000_000);
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        // no queries at all: the sampled-endpoint loop can't find a candidate, forcing resize
        let out = horizontal_partition(b, &[], 900_000, 30, HashMap::new(), &reg, &mut rng).unwrap();
        assert!(out.len() >= 2);
        let total: u64 = out.iter().map(|b| b.row_num_opt().unwrap()).sum();
        assert_eq!(total, 2_000_000);
        for leaf in &out {
            assert!(leaf.row_num_opt().unwrap() <= 900_000);
        }
    }
}
