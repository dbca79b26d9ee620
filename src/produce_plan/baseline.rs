//! A cheap, whole-query scan-parameter estimate used only by the
//! hierarchical partitioner's inner cost-search loop for the "early"
//! (join) reconstruction regime, grounded on
//! `original_source/.../baselines/produce_scan_parameter.cpp`. Unlike
//! [`super::join::produce_scan_parameters_join`] this never builds a join
//! graph: it emits one scan parameter per candidate block reading every
//! attribute the query references, then decides once, globally, whether
//! any block is actually missing data — if none are, every parameter is
//! direct; if any is, every parameter goes through reconstruction. This
//! coarser estimate is what the original traded for search-loop speed
//! across the many candidate layouts the partitioner evaluates; actual
//! plan emission still goes through the precise join/aggregation lowering
//! in [`super::plan::produce_plan`].

use super::scan_parameter::ScanParameter;
use crate::errors::PlanResult;
use crate::metadata::{BlockMeta, ComplexBoundary, PartitionMeta, Query, SetRelation};
use crate::registry::{Registry, TUPLE_ID};
use crate::schema::Schema;
use std::collections::HashMap;
use std::sync::Arc;

fn produce_for_block(block: &BlockMeta, query: &Query, table_schema: &Schema) -> PlanResult<ScanParameter> {
    let mut p = ScanParameter::new(
        block.partition_path().unwrap_or_default(),
        table_schema.len(),
        query.num_measures(),
        0,
    );
    p.block_ids.insert(block.block_id());
    p.blocks = vec![block.clone()];

    let mut query_boundary = query.filter_boundary().clone();
    query_boundary.keep_attributes(&block.schema().attribute_names());
    let map: HashMap<String, Vec<_>> = query_boundary
        .intervals()
        .iter()
        .map(|(k, v)| (k.clone(), vec![v.clone()]))
        .collect();
    let complex = ComplexBoundary::new(map);
    p.filter = Some(query_boundary.make_expression());
    p.filter_boundary = Some(complex);

    let mut requested_attributes = query.all_referred_attributes();
    requested_attributes.insert(TUPLE_ID.to_string());

    for name in &requested_attributes {
        if !block.schema().contains(name) {
            continue;
        }
        let off = table_schema.offset(name)?;
        p.read_attributes[off] = true;
    }
    p.project_attributes = p.read_attributes.clone();
    Ok(p)
}

/// Returns `(direct, reconstruct)` exactly like
/// [`super::aggregation::produce_scan_parameters_aggregation`] so both can
/// be used interchangeably as the partitioner's cost-estimate callback:
/// every candidate block becomes one parameter, then all of them land in
/// whichever bucket matches the query-wide verdict (no per-block mixing).
pub fn produce_scan_parameters_early(
    query: &Arc<Query>,
    table_schema: &Schema,
    partitions: &[PartitionMeta],
    registry: &Registry,
) -> PlanResult<(Vec<ScanParameter>, Vec<ScanParameter>)> {
    let requested_attributes = query.all_referred_attributes();
    let query_boundary = query.filter_boundary();

    let mut result = Vec::new();
    let mut all_skipping = true;

    for partition in partitions {
        for block in partition.blocks() {
            let relation = block.relationship(query_boundary, &requested_attributes, registry)?;
            if relation == SetRelation::Disjoint {
                continue;
            }

            let schema_relation = block.schema().relationship(&requested_attributes);
            if matches!(schema_relation, SetRelation::Subset | SetRelation::Intersect) {
                all_skipping = false;
            }

            result.push(produce_for_block(block, query, table_schema)?);
        }
    }

    if all_skipping {
        let idx = table_schema.offset(TUPLE_ID).ok();
        for p in &mut result {
            if let Some(idx) = idx {
                p.read_attributes[idx] = false;
                p.project_attributes[idx] = false;
            }
        }
        Ok((result, Vec::new()))
    } else {
        Ok((Vec::new(), result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Expression, LiteralValue};
    use crate::metadata::Boundary;
    use crate::schema::AttributeDef;
    use crate::value::{DataType, Value};

    fn int(v: i64) -> Value {
        Value::Integer { value: v, bits: 32 }
    }

    fn table_schema() -> Schema {
        let mut s = Schema::new();
        s.add(AttributeDef::new(TUPLE_ID, DataType::Integer)).unwrap();
        s.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        s.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        s
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

    #[test]
    fn fully_covering_blocks_are_all_direct() {
        let mut reg = Registry::new();
        reg.set_min_max("a", int(0), int(1000));
        let filter = cmp("gte", attr("a"), lit("l", 10));
        let measure = Expression::Aggregate {
            name: "m".to_string(),
            op: "sum".to_string(),
            children: vec![attr("b")],
            data_type: DataType::Integer,
            nullable: false,
        };
        let query = Arc::new(Query::new(table_schema(), filter, vec![measure], "q", &reg).unwrap());

        let mut part = PartitionMeta::new("p0");
        part.add_block(BlockMeta::new(0, Boundary::default(), {
            let mut s = Schema::new();
            s.add(AttributeDef::new(TUPLE_ID, DataType::Integer)).unwrap();
            s.add(AttributeDef::new("a", DataType::Integer)).unwrap();
            s.add(AttributeDef::new("b", DataType::Integer)).unwrap();
            s
        }, Some(1000)));

        let (direct, reconstruct) = produce_scan_parameters_early(&query, &table_schema(), &[part], &reg).unwrap();
        assert_eq!(direct.len(), 1);
        assert!(reconstruct.is_empty());
        // tuple-id is not needed once nothing needs reconstruction
        let tid_off = table_schema().offset(TUPLE_ID).unwrap();
        assert!(!direct[0].read_attributes[tid_off]);
    }

    #[test]
    fn missing_attribute_forces_reconstruction_for_every_block() {
        let mut reg = Registry::new();
        reg.set_min_max("a", int(0), int(1000));
        let filter = cmp("gte", attr("a"), lit("l", 10));
        let measure = Expression::Aggregate {
            name: "m".to_string(),
            op: "sum".to_string(),
            children: vec![attr("b")],
            data_type: DataType::Integer,
            nullable: false,
        };
        let query = Arc::new(Query::new(table_schema(), filter, vec![measure], "q", &reg).unwrap());

        let mut part1 = PartitionMeta::new("p0");
        let mut schema_a = Schema::new();
        schema_a.add(AttributeDef::new(TUPLE_ID, DataType::Integer)).unwrap();
        schema_a.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        part1.add_block(BlockMeta::new(0, Boundary::default(), schema_a, Some(1000)));

        let mut part2 = PartitionMeta::new("p1");
        let mut schema_b = Schema::new();
        schema_b.add(AttributeDef::new(TUPLE_ID, DataType::Integer)).unwrap();
        schema_b.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        part2.add_block(BlockMeta::new(0, Boundary::default(), schema_b, Some(1000)));

        let (direct, reconstruct) = produce_scan_parameters_early(&query, &table_schema(), &[part1, part2], &reg).unwrap();
        assert!(direct.is_empty());
        assert_eq!(reconstruct.len(), 2);
    }
}
