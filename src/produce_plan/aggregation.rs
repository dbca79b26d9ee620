//! Aggregation-reconstruction lowering (spec.md §4.3/§4.5): each block that
//! cannot pass every query predicate on its own becomes a reconstruct
//! scan parameter; a block that can, and that nothing else needs to
//! complete its measures, becomes a direct scan parameter instead.

use super::produce_scan_parameter::{
    converge_boundary_complex, filter_blocks, post_requests, RawRequest, RawScanParameter, RequestKind,
};
use super::scan_parameter::ScanParameter;
use crate::errors::{PlanError, PlanResult};
use crate::metadata::{BlockMeta, ComplexBoundary, PartitionMeta, Query, SetRelation};
use crate::registry::{Registry, TUPLE_ID};
use crate::schema::Schema;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn set_difference(a: &HashSet<String>, b: &HashSet<String>) -> HashSet<String> {
    a.difference(b).cloned().collect()
}

/// A block that passes every predicate on its own: read whatever other
/// blocks still need checked locally, plus any measure this block can
/// evaluate outright (its attributes aren't fully covered by a sibling
/// reconstruction, or reconstruction doesn't cover every tuple in the
/// block region).
fn produce_direct(
    request: &RawRequest,
    reconstruct: Option<&RawScanParameter>,
    registry: &Registry,
) -> PlanResult<RawScanParameter> {
    let query = &request.query;
    let block = &request.block;
    let measure_num = query.num_measures();

    let mut p = RawScanParameter {
        direct_measures: vec![false; measure_num],
        read_attributes: request.extra_check_filter_attributes.clone(),
        passed_attributes: request.passed_filter_attributes.clone(),
        ..Default::default()
    };

    if p.passed_attributes != query.filter_boundary().attributes() {
        return Err(PlanError::InvariantViolation(
            "produce_direct: block must pass all query predicates".to_string(),
        ));
    }

    let (reconstruct_attributes, reconstruct_all_tuples) = match reconstruct {
        None => (HashSet::new(), false),
        Some(r) => {
            let region = query.filter_boundary().intersect(block.boundary())?;
            let rel = r.filters.relationship(&region, registry)?;
            (r.project_attributes.clone(), matches!(rel, SetRelation::Equal | SetRelation::Superset))
        }
    };

    let block_attributes = block.schema().attribute_names();
    for i in 0..measure_num {
        let measure_attrs = query.attributes_in_measure(i);
        if !set_difference(measure_attrs, &block_attributes).is_empty() {
            continue;
        }
        let contained_in_reconstruct = set_difference(measure_attrs, &reconstruct_attributes).is_empty();
        if contained_in_reconstruct && reconstruct_all_tuples {
            continue;
        }
        p.direct_measures[i] = true;
        p.read_attributes.extend(measure_attrs.iter().cloned());
        p.project_attributes.extend(measure_attrs.iter().cloned());
    }

    let mut filters = query.filter_boundary().clone();
    filters.keep_attributes(&request.extra_check_filter_attributes);
    p.filters = ComplexBoundary::from_boundaries(&[filters], 5)?;
    Ok(p)
}

/// A block whose partial tuples must flow through the `tuple_id`-keyed
/// reconstruction path: reads its own requested attributes plus whatever
/// other blocks asked it to keep on hand for predicate evaluation.
fn produce_reconstruct(request: &RawRequest) -> PlanResult<RawScanParameter> {
    let mut p = RawScanParameter::default();
    p.project_attributes = request
        .filter_requested_attributes
        .union(&request.measure_requested_attributes)
        .cloned()
        .collect();
    p.project_attributes.insert(TUPLE_ID.to_string());

    p.read_attributes = p.project_attributes.clone();
    p.read_attributes.extend(request.extra_check_filter_attributes.iter().cloned());

    p.passed_attributes = request.passed_filter_attributes.clone();

    let mut filters: Vec<_> = request.filter_requested_filters.clone();
    filters.extend(request.measure_requested_filters.clone());
    p.filters = ComplexBoundary::from_boundaries(&filters, 5)?;
    p.filters.keep_attributes(&p.read_attributes);
    p.filters = converge_boundary_complex(request.block.boundary(), &p.filters)?;
    Ok(p)
}

/// Derives the aggregation-reconstruction scan parameters for `query`
/// against every block across `partitions`. Returns `(direct, reconstruct)`.
pub fn produce_scan_parameters_aggregation(
    query: &Arc<Query>,
    table_schema: &Schema,
    partitions: &[PartitionMeta],
    registry: &Registry,
) -> PlanResult<(Vec<ScanParameter>, Vec<ScanParameter>)> {
    let all_blocks: Vec<BlockMeta> = partitions.iter().flat_map(|p| p.blocks().iter().cloned()).collect();

    let boundary_query = query.filter_boundary();
    let measure_num = query.num_measures();
    let mut attributes_all_measures = HashSet::new();
    for i in 0..measure_num {
        attributes_all_measures.extend(query.attributes_in_measure(i).iter().cloned());
    }
    let attributes_query_filters = boundary_query.attributes();

    let block_measures = filter_blocks(&all_blocks, boundary_query, &attributes_all_measures, registry)?;
    let block_filters = filter_blocks(&all_blocks, boundary_query, &attributes_query_filters, registry)?;

    let requests = post_requests(query, &block_measures, &block_filters, registry)?;

    let mut direct_parameters: HashMap<String, RawScanParameter> = HashMap::new();
    let mut reconstruct_parameters: HashMap<String, RawScanParameter> = HashMap::new();

    for b in &block_measures {
        let request = requests
            .get(&b.key())
            .ok_or_else(|| PlanError::InvariantViolation("missing request for measure block".to_string()))?;

        if request.passed_filter_attributes.len() == attributes_query_filters.len() {
            let needs_reconstruct = !request.filter_requested_attributes.is_empty()
                || !request.measure_requested_attributes.is_empty();
            if needs_reconstruct {
                reconstruct_parameters.insert(b.key(), produce_reconstruct(request)?);
            }

            let direct = match reconstruct_parameters.get(&b.key()) {
                Some(r) => produce_direct(request, Some(r), registry)?,
                None => produce_direct(request, None, registry)?,
            };
            if let Some(r) = reconstruct_parameters.get_mut(&b.key()) {
                r.direct_measures = direct.direct_measures.clone();
            }
            if direct.direct_measures.iter().any(|m| *m) {
                direct_parameters.insert(b.key(), direct);
            }
        } else {
            let mut request = request.clone();
            request.request(&attributes_all_measures, Some(boundary_query), RequestKind::Filter);
            request.finalize()?;
            let mut r = produce_reconstruct(&request)?;
            r.direct_measures = vec![false; measure_num];
            reconstruct_parameters.insert(b.key(), r);
        }
    }

    let measure_keys: HashSet<String> = block_measures.iter().map(BlockMeta::key).collect();
    for (key, request) in &requests {
        if !measure_keys.contains(key) {
            let mut r = produce_reconstruct(request)?;
            r.direct_measures = vec![false; measure_num];
            reconstruct_parameters.insert(key.clone(), r);
        }
    }

    let sub_filters = query.filter().sub_expressions("and")?;
    let block_by_key: HashMap<String, BlockMeta> = all_blocks.iter().map(|b| (b.key(), b.clone())).collect();

    let mut reconstruct_result = Vec::new();
    for (key, p) in &reconstruct_parameters {
        let block = &block_by_key[key];
        reconstruct_result.push(p.produce_scan_parameter(table_schema, &sub_filters, block)?);
    }
    let mut direct_result = Vec::new();
    for (key, p) in &direct_parameters {
        let block = &block_by_key[key];
        direct_result.push(p.produce_scan_parameter(table_schema, &sub_filters, block)?);
    }

    Ok((direct_result, reconstruct_result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Expression, LiteralValue};
    use crate::metadata::Interval;
    use crate::schema::AttributeDef;
    use crate::value::{DataType, Value};

    fn int(v: i64) -> Value {
        Value::Integer { value: v, bits: 32 }
    }

    fn table_schema() -> Schema {
        let mut s = Schema::new();
        s.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        s.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        s.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        s
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

    fn one_block_one_partition(schema_cols: &[&str], lo: i64, hi: i64, rows: u64) -> Vec<PartitionMeta> {
        let mut schema = Schema::new();
        for c in schema_cols {
            schema.add(AttributeDef::new(*c, DataType::Integer)).unwrap();
        }
        let mut m = HashMap::new();
        m.insert(
            "a".to_string(),
            Interval::new(int(lo), false, int(hi), false).unwrap(),
        );
        let block = BlockMeta::new(0, crate::metadata::Boundary::new(m), schema, Some(rows));
        let mut part = PartitionMeta::new("p0");
        part.add_block(block);
        vec![part]
    }

    #[test]
    fn single_block_covering_query_is_direct_only() {
        let mut reg = Registry::new();
        reg.set_min_max("a", int(0), int(99));
        reg.set_min_max("b", int(0), int(99));
        let filter = cmp(
            "gte",
            attr("a"),
            lit("l", 10),
        );
        let measure = Expression::Aggregate {
            name: "m".into(),
            op: "sum".into(),
            children: vec![attr("b")],
            data_type: DataType::Integer,
            nullable: false,
        };
        let query = Arc::new(Query::new(table_schema(), filter, vec![measure], "t", &reg).unwrap());
        let partitions = one_block_one_partition(&["tid", "a", "b"], 0, 99, 1000);

        let (direct, reconstruct) =
            produce_scan_parameters_aggregation(&query, &table_schema(), &partitions, &reg).unwrap();
        assert_eq!(direct.len(), 1);
        assert!(reconstruct.is_empty());
        assert!(direct[0].direct_measures[0]);
    }

    #[test]
    fn two_disjoint_column_blocks_reconstruct() {
        let mut reg = Registry::new();
        reg.set_min_max("a", int(0), int(999));
        reg.set_min_max("b", int(0), int(999));
        let mut schema_a = Schema::new();
        schema_a.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        schema_a.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        let mut schema_b = Schema::new();
        schema_b.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        schema_b.add(AttributeDef::new("b", DataType::Integer)).unwrap();

        let mut m = HashMap::new();
        m.insert("tid".to_string(), Interval::new(int(0), false, int(999), false).unwrap());
        let block_a = BlockMeta::new(0, crate::metadata::Boundary::new(m.clone()), schema_a, Some(1000));
        let block_b = BlockMeta::new(1, crate::metadata::Boundary::new(m), schema_b, Some(1000));
        let mut part = PartitionMeta::new("p0");
        part.add_block(block_a);
        part.add_block(block_b);

        let filter = cmp("lt", attr("a"), lit("l", 50));
        let measure = Expression::Aggregate {
            name: "m".into(),
            op: "sum".into(),
            children: vec![attr("a"), attr("b")],
            data_type: DataType::Integer,
            nullable: false,
        };
        let mut table = Schema::new();
        table.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        table.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        table.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        let query = Arc::new(Query::new(table.clone(), filter, vec![measure], "t", &reg).unwrap());

        let (direct, reconstruct) =
            produce_scan_parameters_aggregation(&query, &table, &[part], &reg).unwrap();
        assert!(direct.is_empty());
        assert_eq!(reconstruct.len(), 2);
    }
}
