//! Join-reconstruction lowering (spec.md §4.3/§4.6): splits a query's
//! candidate blocks into direct-evaluation parameters, filter-only
//! reconstruction parameters, and connected groups of measure-providing
//! blocks whose tuples must be joined together on tuple id before their
//! measures can be reconstructed.
//!
//! Block connectivity (which measure-providing blocks overlap and so must
//! land in the same join group) is computed with a union-find pass over
//! the per-measure candidate lists instead of the original's recursive
//! graph build plus DFS partition (`buildGraph`/`partitionGraph`): the
//! connected components come out identical without recursion.

use super::helper::union_all;
use super::join_sequence::join_sequence;
use super::plan::{direct_eval_path, merge_before_read, reconstruct_join, PlanNode};
use super::produce_scan_parameter::{
    converge_boundary_complex, filter_blocks, post_requests, RawRequest, RawScanParameter, RequestKind,
};
use super::scan_parameter::ScanParameter;
use crate::errors::{PlanError, PlanResult};
use crate::metadata::{BlockMeta, ComplexBoundary, PartitionMeta, Query, SetRelation};
use crate::registry::{Engine, Registry, TUPLE_ID};
use crate::schema::Schema;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A block that asked to keep other blocks' attributes on hand purely to
/// re-check predicates: reads just `tid` plus whatever predicate
/// attributes were requested, nothing measure-bearing.
fn produce_reconstruct_filter(request: &RawRequest) -> PlanResult<RawScanParameter> {
    if request.filter_requested_attributes.is_empty() {
        return Err(PlanError::InvariantViolation(
            "produce_reconstruct_filter: filter_requested_attributes must be non-empty".to_string(),
        ));
    }
    let mut p = RawScanParameter::default();
    p.project_attributes.insert(TUPLE_ID.to_string());

    p.read_attributes = request.filter_requested_attributes.clone();
    p.read_attributes.insert(TUPLE_ID.to_string());
    p.read_attributes.extend(request.extra_check_filter_attributes.iter().cloned());

    p.passed_attributes = request.passed_filter_attributes.clone();

    p.filters = ComplexBoundary::from_boundaries(&request.filter_requested_filters, 5)?;
    p.filters.keep_attributes(&p.read_attributes);
    p.filters = converge_boundary_complex(request.block.boundary(), &p.filters)?;

    p.direct_measures = vec![false; request.query.num_measures()];
    Ok(p)
}

/// A block that carries measure attributes another block's measure needs:
/// reads and projects them keyed by `tid`, ready to be joined together.
fn produce_reconstruct_measure(request: &RawRequest) -> PlanResult<RawScanParameter> {
    let mut p = RawScanParameter::default();
    p.project_attributes = request.measure_requested_attributes.clone();
    p.project_attributes.insert(TUPLE_ID.to_string());

    p.read_attributes = p.project_attributes.clone();
    p.read_attributes.extend(request.extra_check_filter_attributes.iter().cloned());

    p.passed_attributes = request.passed_filter_attributes.clone();
    p.filters = ComplexBoundary::from_boundaries(&request.measure_requested_filters, 5)?;
    p.filters.keep_attributes(&p.read_attributes);
    p.filters = converge_boundary_complex(request.block.boundary(), &p.filters)?;
    Ok(p)
}

/// A block that passes every query predicate on its own: evaluates
/// whichever measures it can without reconstruction, skipping measures
/// the block's own `recons_measure_param` already covers for every tuple
/// in its region.
fn produce_direct_join(
    request: &RawRequest,
    recons_measure_param: Option<&RawScanParameter>,
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
            "produce_direct_join: block must pass all query predicates".to_string(),
        ));
    }

    let reconstruct_attributes = match recons_measure_param {
        None => HashSet::new(),
        Some(r) => {
            let region = query.filter_boundary().intersect(block.boundary())?;
            let rel = r.filters.relationship(&region, registry)?;
            if !matches!(rel, SetRelation::Equal | SetRelation::Superset) {
                return Err(PlanError::InvariantViolation(
                    "produce_direct_join: expected this scan to reconstruct every tuple in the block".to_string(),
                ));
            }
            r.project_attributes.clone()
        }
    };

    let block_attributes = block.schema().attribute_names();
    for i in 0..measure_num {
        let measure_attrs = query.attributes_in_measure(i);
        if !measure_attrs.is_subset(&block_attributes) {
            continue;
        }
        if measure_attrs.is_subset(&reconstruct_attributes) {
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

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// Groups `keys` (every block with a request) into connected components:
/// two blocks land in the same component if some measure's candidate list
/// contains both and their boundaries are non-disjoint.
fn partition_connected(
    query: &Query,
    requests: &HashMap<String, RawRequest>,
    registry: &Registry,
) -> PlanResult<Vec<Vec<String>>> {
    let keys: Vec<String> = requests.keys().cloned().collect();
    let index: HashMap<&str, usize> = keys.iter().enumerate().map(|(i, k)| (k.as_str(), i)).collect();
    let mut uf = UnionFind::new(keys.len());

    let all_blocks: Vec<BlockMeta> = requests.values().map(|r| r.block.clone()).collect();
    let boundary_query = query.filter_boundary();

    for i in 0..query.num_measures() {
        let candidates = filter_blocks(&all_blocks, boundary_query, query.attributes_in_measure(i), registry)?;
        for a in 0..candidates.len() {
            for b in (a + 1)..candidates.len() {
                if candidates[a].boundary().relationship(candidates[b].boundary(), registry)? != SetRelation::Disjoint {
                    let ia = index[candidates[a].key().as_str()];
                    let ib = index[candidates[b].key().as_str()];
                    uf.union(ia, ib);
                }
            }
        }
    }

    let mut groups: HashMap<usize, Vec<String>> = HashMap::new();
    for (i, key) in keys.iter().enumerate() {
        let root = uf.find(i);
        groups.entry(root).or_default().push(key.clone());
    }
    Ok(groups.into_values().collect())
}

/// Derives the join-reconstruction scan parameters for `query` against
/// every block across `partitions`: direct-evaluation parameters,
/// filter-only reconstruction parameters, and one group of
/// measure-bearing parameters per connected component.
pub(crate) fn produce_scan_parameters_join(
    query: &Arc<Query>,
    table_schema: &Schema,
    partitions: &[PartitionMeta],
    registry: &Registry,
) -> PlanResult<(Vec<ScanParameter>, Vec<ScanParameter>, Vec<Vec<ScanParameter>>)> {
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

    let mut filter_parameters: HashMap<String, RawScanParameter> = HashMap::new();
    for (key, request) in &requests {
        if !request.filter_requested_attributes.is_empty() {
            filter_parameters.insert(key.clone(), produce_reconstruct_filter(request)?);
        }
    }

    let mut measure_parameters: HashMap<String, RawScanParameter> = HashMap::new();
    let mut direct_parameters: HashMap<String, RawScanParameter> = HashMap::new();

    for b in &block_measures {
        let key = b.key();
        let request = requests
            .get(&key)
            .ok_or_else(|| PlanError::InvariantViolation("produce_scan_parameters_join: missing request for measure block".to_string()))?;

        if request.passed_filter_attributes.len() == attributes_query_filters.len() {
            if !request.measure_requested_attributes.is_empty() {
                measure_parameters.insert(key.clone(), produce_reconstruct_measure(request)?);
            }

            let direct = match measure_parameters.get(&key) {
                Some(r) => produce_direct_join(request, Some(r), registry)?,
                None => produce_direct_join(request, None, registry)?,
            };
            if let Some(r) = measure_parameters.get_mut(&key) {
                r.direct_measures = direct.direct_measures.clone();
            }
            if direct.direct_measures.iter().any(|m| *m) {
                direct_parameters.insert(key.clone(), direct);
            }
        } else {
            let mut t_request = request.clone();
            t_request.request(&attributes_all_measures, Some(boundary_query), RequestKind::Measure);
            t_request.finalize()?;
            let mut r = produce_reconstruct_measure(&t_request)?;
            r.direct_measures = vec![false; measure_num];
            measure_parameters.insert(key.clone(), r);
        }
    }

    let groups = partition_connected(query, &requests, registry)?;

    let sub_filters = query.filter().sub_expressions("and")?;
    let block_by_key: HashMap<String, BlockMeta> = all_blocks.iter().map(|b| (b.key(), b.clone())).collect();

    let mut direct_result = Vec::new();
    for (key, p) in &direct_parameters {
        direct_result.push(p.produce_scan_parameter(table_schema, &sub_filters, &block_by_key[key])?);
    }

    let mut filter_result = Vec::new();
    for (key, p) in &filter_parameters {
        filter_result.push(p.produce_scan_parameter(table_schema, &sub_filters, &block_by_key[key])?);
    }

    let mut measure_groups = Vec::new();
    for group in groups {
        let mut members = Vec::new();
        for key in group {
            if let Some(p) = measure_parameters.get(&key) {
                members.push(p.produce_scan_parameter(table_schema, &sub_filters, &block_by_key[&key])?);
            }
        }
        if !members.is_empty() {
            measure_groups.push(members);
        }
    }

    Ok((direct_result, filter_result, measure_groups))
}

/// Assembles the full join-reconstruction plan: each connected group of
/// measure-bearing blocks joined into one wide row per tuple id
/// (`join_sequence`), unioned with the filter-only reconstruction blocks,
/// reconstructed together, then unioned with the direct-evaluation path
/// and re-aggregated — the same tail `evaluate_aggregate_plan` uses on the
/// aggregation-reconstruction side.
pub(crate) fn produce_join_plan(
    query: &Arc<Query>,
    table_schema: &Schema,
    partitions: &[PartitionMeta],
    registry: &Registry,
    engine: Engine,
) -> PlanResult<PlanNode> {
    let (unmerged_direct, unmerged_filter, unmerged_groups) =
        produce_scan_parameters_join(query, table_schema, partitions, registry)?;

    let direct_params = merge_before_read(unmerged_direct, engine);
    let filter_params = merge_before_read(unmerged_filter, engine);
    let groups: Vec<Vec<ScanParameter>> = unmerged_groups.into_iter().map(|g| merge_before_read(g, engine)).collect();

    let mut reconstruct_attributes = vec![false; table_schema.len()];
    for p in filter_params.iter().chain(groups.iter().flatten()) {
        for (i, b) in p.project_attributes.iter().enumerate() {
            reconstruct_attributes[i] |= *b;
        }
    }

    let mut member_nodes = Vec::new();
    let mut member_schema: Option<Schema> = None;
    for p in &filter_params {
        let (node, schema) = super::plan::read_for_reconstruction(p, table_schema, &reconstruct_attributes)?;
        check_matching_schema(&mut member_schema, schema)?;
        member_nodes.push(node);
    }
    for group in groups {
        let (node, schema) = join_sequence(group, table_schema, &reconstruct_attributes)?;
        check_matching_schema(&mut member_schema, schema)?;
        member_nodes.push(node);
    }

    let all_measures = query.measures();
    let reconstruct_output = match member_schema {
        None => None,
        Some(schema) => {
            let (union_node, union_schema) = union_all(member_nodes, schema);
            let num_conjuncts = query.filter().sub_expressions("and")?.len();
            let (node, out_schema) = reconstruct_join(union_node, &union_schema, table_schema, num_conjuncts, all_measures)?;
            if out_schema.len() != all_measures.len() {
                return Err(PlanError::InvariantViolation(
                    "produce_join_plan: reconstruction output arity must match query measures".to_string(),
                ));
            }
            Some((node, out_schema))
        }
    };

    let direct_output = if direct_params.is_empty() {
        None
    } else {
        let (node, schema) = direct_eval_path(table_schema, &direct_params, query)?;
        if schema.len() != all_measures.len() {
            return Err(PlanError::InvariantViolation(
                "produce_join_plan: direct path output arity must match query measures".to_string(),
            ));
        }
        Some((node, schema))
    };

    let out_schema = match (&reconstruct_output, &direct_output) {
        (Some((_, s)), Some((_, d))) if s != d => {
            return Err(PlanError::InvariantViolation(
                "produce_join_plan: reconstruction path and direct path must have the same output schema".to_string(),
            ))
        }
        (Some((_, s)), _) => s.clone(),
        (_, Some((_, d))) => d.clone(),
        (None, None) => {
            return Err(PlanError::InvariantViolation(
                "produce_join_plan: no blocks produced a scan parameter for this query".to_string(),
            ))
        }
    };

    let mut inputs = Vec::new();
    if let Some((n, _)) = reconstruct_output {
        inputs.push(n);
    }
    if let Some((n, _)) = direct_output {
        inputs.push(n);
    }
    let (union_node, schema_after_union) = union_all(inputs, out_schema);

    let (exchanged_node, schema_after_exchange) = if engine == Engine::Velox {
        super::helper::exchange(union_node, &schema_after_union, Vec::new())
    } else {
        (union_node, schema_after_union)
    };

    let final_measures: Vec<crate::expression::Expression> = all_measures
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let attr = schema_after_exchange.get_at(i).expect("arity checked above");
            crate::expression::Expression::Aggregate {
                name: m.name().to_string(),
                op: match m {
                    crate::expression::Expression::Aggregate { op, .. } => op.clone(),
                    _ => "sum".to_string(),
                },
                children: vec![crate::expression::Expression::Attribute {
                    name: attr.name.clone(),
                    data_type: attr.data_type,
                    size_hint: attr.size_hint,
                }],
                data_type: m.data_type(),
                nullable: matches!(m, crate::expression::Expression::Aggregate { nullable, .. } if *nullable),
            }
        })
        .collect();
    Ok(super::helper::aggregate(exchanged_node, &schema_after_exchange, final_measures, None)?.0)
}

fn check_matching_schema(existing: &mut Option<Schema>, schema: Schema) -> PlanResult<()> {
    match existing {
        None => {
            *existing = Some(schema);
            Ok(())
        }
        Some(s) if *s != schema => Err(PlanError::InvariantViolation(
            "produce_join_plan: inputs of union have different schemas".to_string(),
        )),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Expression, LiteralValue};
    use crate::metadata::Interval;
    use crate::registry::{DIRECT_MEASURES, PASSED_PREDS, VALID_ATTRIBUTES};
    use crate::schema::AttributeDef;
    use crate::value::{DataType, Value};
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

    fn table_schema() -> Schema {
        let mut s = Schema::new();
        s.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        s.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        s.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        s
    }

    #[test]
    fn single_block_covering_query_produces_a_direct_only_plan() {
        let mut reg = Registry::new();
        reg.set_min_max("a", int(0), int(99));
        reg.set_min_max("b", int(0), int(99));
        let filter = cmp("gte", attr("a"), lit("l", 10));
        let measure = Expression::Aggregate {
            name: "m".into(),
            op: "sum".into(),
            children: vec![attr("b")],
            data_type: DataType::Integer,
            nullable: false,
        };
        let query = Arc::new(Query::new(table_schema(), filter, vec![measure], "t", &reg).unwrap());

        let mut schema = Schema::new();
        schema.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        schema.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        schema.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        let mut m = Map::new();
        m.insert("a".to_string(), Interval::new(int(0), false, int(99), false).unwrap());
        let block = BlockMeta::new(0, crate::metadata::Boundary::new(m), schema, Some(1000));
        let mut part = PartitionMeta::new("p0");
        part.add_block(block);

        let plan = produce_join_plan(&query, &table_schema(), &[part], &reg, Engine::Arrow).unwrap();
        match plan {
            PlanNode::Aggregate { input, .. } => match *input {
                PlanNode::UnionAll { inputs, .. } => assert_eq!(inputs.len(), 1),
                other => panic!("expected a union under the final aggregate, got {other:?}"),
            },
            other => panic!("expected the plan to end in an aggregate, got {other:?}"),
        }
    }

    #[test]
    fn two_disjoint_column_blocks_are_joined_before_reconstruction() {
        let mut reg = Registry::new();
        reg.set_min_max("a", int(0), int(999));
        reg.set_min_max("b", int(0), int(999));
        reg.set_min_max("tid", int(0), int(999));
        let mut schema_a = Schema::new();
        schema_a.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        schema_a.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        let mut schema_b = Schema::new();
        schema_b.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        schema_b.add(AttributeDef::new("b", DataType::Integer)).unwrap();

        let mut m = Map::new();
        m.insert("tid".to_string(), Interval::new(int(0), false, int(999), false).unwrap());
        let block_a = BlockMeta::new(0, crate::metadata::Boundary::new(m.clone()), schema_a, Some(1000));
        let block_b = BlockMeta::new(1, crate::metadata::Boundary::new(m), schema_b, Some(1000));
        let mut part = PartitionMeta::new("p0");
        part.add_block(block_a);
        part.add_block(block_b);

        let filter = cmp("lt", attr("a"), lit("l", 50));
        let sum_of_both = Expression::Function {
            name: "a_plus_b".into(),
            op: "add".into(),
            children: vec![attr("a"), attr("b")],
            data_type: DataType::Integer,
            nullable: false,
        };
        let measure = Expression::Aggregate {
            name: "m".into(),
            op: "sum".into(),
            children: vec![sum_of_both],
            data_type: DataType::Integer,
            nullable: false,
        };
        let mut table = Schema::new();
        table.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        table.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        table.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        let query = Arc::new(Query::new(table.clone(), filter, vec![measure], "t", &reg).unwrap());

        let plan = produce_join_plan(&query, &table, &[part], &reg, Engine::Arrow).unwrap();
        assert!(matches!(plan, PlanNode::Aggregate { .. }));
    }

    /// Minimal test-only interpreter for the boolean/bitmap subset of
    /// `Expression` the join path's final filter and measure guards are
    /// built from, so tests can assert on resolved semantics instead of
    /// only the shape of the emitted tree.
    fn eval(expr: &Expression, env: &Map<String, Value>) -> Value {
        match expr {
            Expression::Attribute { name, .. } => env.get(name).cloned().unwrap_or_else(|| panic!("unbound attribute `{name}`")),
            Expression::Literal { value, .. } => match value {
                LiteralValue::Value(v) => v.clone(),
                LiteralValue::Bool(b) => Value::Boolean(*b),
            },
            Expression::Function { op, children, .. } => match op.as_str() {
                "bitmap_count" => match eval(&children[0], env) {
                    Value::FixedBinary(bits) => int(bits.iter().filter(|b| **b).count() as i64),
                    other => panic!("bitmap_count expects fixed_binary, got {other:?}"),
                },
                "bitmap_get" => {
                    let bits = match eval(&children[0], env) {
                        Value::FixedBinary(b) => b,
                        other => panic!("bitmap_get expects fixed_binary, got {other:?}"),
                    };
                    let idx = match eval(&children[1], env) {
                        Value::Integer { value, .. } => value as usize,
                        other => panic!("bitmap_get offset expects integer, got {other:?}"),
                    };
                    Value::Boolean(bits.get(idx).copied().unwrap_or(false))
                }
                "gte" | "lt" => {
                    let (a, b) = match (eval(&children[0], env), eval(&children[1], env)) {
                        (Value::Integer { value: a, .. }, Value::Integer { value: b, .. }) => (a, b),
                        (a, b) => panic!("{op} expects integers, got {a:?}/{b:?}"),
                    };
                    Value::Boolean(if op == "gte" { a >= b } else { a < b })
                }
                "and" | "or" => {
                    let (a, b) = match (eval(&children[0], env), eval(&children[1], env)) {
                        (Value::Boolean(a), Value::Boolean(b)) => (a, b),
                        (a, b) => panic!("{op} expects booleans, got {a:?}/{b:?}"),
                    };
                    Value::Boolean(if op == "and" { a && b } else { a || b })
                }
                other => panic!("unsupported op in test evaluator: {other}"),
            },
            Expression::IfThenElse { if_expr, then_expr, else_expr, .. } => {
                match eval(if_expr, env) {
                    Value::Boolean(true) => eval(then_expr, env),
                    Value::Boolean(false) => eval(else_expr, env),
                    other => panic!("if-condition must be boolean, got {other:?}"),
                }
            }
            Expression::Aggregate { .. } => panic!("cannot evaluate an aggregate node directly"),
        }
    }

    fn eval_bool(expr: &Expression, env: &Map<String, Value>) -> bool {
        match eval(expr, env) {
            Value::Boolean(b) => b,
            other => panic!("expected boolean, got {other:?}"),
        }
    }

    #[test]
    fn reconstruct_join_final_filter_rejects_by_passed_preds_count_alone() {
        let mut input_schema = Schema::new();
        input_schema.add(AttributeDef::new(TUPLE_ID, DataType::Integer)).unwrap();
        input_schema.add(AttributeDef::new(PASSED_PREDS, DataType::FixedBinary)).unwrap();
        input_schema.add(AttributeDef::new(DIRECT_MEASURES, DataType::FixedBinary)).unwrap();
        input_schema.add(AttributeDef::new(VALID_ATTRIBUTES, DataType::FixedBinary)).unwrap();
        input_schema.add(AttributeDef::new("c", DataType::Integer)).unwrap();

        let mut table_schema = Schema::new();
        table_schema.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        table_schema.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        table_schema.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        table_schema.add(AttributeDef::new("c", DataType::Integer)).unwrap();

        let measure = Expression::Aggregate {
            name: "m".into(),
            op: "sum".into(),
            children: vec![attr("c")],
            data_type: DataType::Integer,
            nullable: false,
        };

        let dummy_input = PlanNode::Read {
            path: "p".to_string(),
            block_ids: std::collections::HashSet::new(),
            schema: input_schema.clone(),
        };

        // Two top-level conjuncts in the query filter; `passed_preds` must
        // carry both bits set for a tuple to survive.
        let (node, _schema) = super::plan::reconstruct_join(dummy_input, &input_schema, &table_schema, 2, &[measure]).unwrap();

        let predicate = match node {
            PlanNode::Project { input, .. } => match *input {
                PlanNode::Filter { predicate, .. } => predicate,
                other => panic!("expected a Filter node under the final Project, got {other:?}"),
            },
            other => panic!("expected reconstruct_join to end in a Project, got {other:?}"),
        };

        let mut one_of_two_passed = Map::new();
        one_of_two_passed.insert(PASSED_PREDS.to_string(), Value::FixedBinary(vec![true, false]));
        assert!(
            !eval_bool(&predicate, &one_of_two_passed),
            "a tuple with only one of two conjuncts satisfied must be rejected outright, \
             regardless of valid_attributes — spec.md §4.6 has no per-predicate value fallback"
        );

        let mut both_passed = Map::new();
        both_passed.insert(PASSED_PREDS.to_string(), Value::FixedBinary(vec![true, true]));
        assert!(eval_bool(&predicate, &both_passed), "a tuple with every conjunct's bit set must survive");
    }

    #[test]
    fn project_measures_nulls_out_a_measure_when_its_attribute_is_not_valid() {
        let mut input_schema = Schema::new();
        input_schema.add(AttributeDef::new(TUPLE_ID, DataType::Integer)).unwrap();
        input_schema.add(AttributeDef::new(PASSED_PREDS, DataType::FixedBinary)).unwrap();
        input_schema.add(AttributeDef::new(DIRECT_MEASURES, DataType::FixedBinary)).unwrap();
        input_schema.add(AttributeDef::new(VALID_ATTRIBUTES, DataType::FixedBinary)).unwrap();
        input_schema.add(AttributeDef::new("a", DataType::Integer)).unwrap();

        let mut table_schema = Schema::new();
        table_schema.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        table_schema.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        table_schema.add(AttributeDef::new("b", DataType::Integer)).unwrap();

        let measure = Expression::Aggregate {
            name: "m".into(),
            op: "sum".into(),
            children: vec![attr("a")],
            data_type: DataType::Integer,
            nullable: false,
        };

        let dummy_input = PlanNode::Read {
            path: "p".to_string(),
            block_ids: std::collections::HashSet::new(),
            schema: input_schema.clone(),
        };
        let (node, out_schema) = super::plan::reconstruct_join(dummy_input, &input_schema, &table_schema, 0, std::slice::from_ref(&measure)).unwrap();

        let measure_expr = match node {
            PlanNode::Project { expressions, .. } => expressions[out_schema.offset("m").unwrap()].clone(),
            other => panic!("expected reconstruct_join to end in a Project, got {other:?}"),
        };

        let mut not_valid = Map::new();
        not_valid.insert(DIRECT_MEASURES.to_string(), Value::FixedBinary(vec![false]));
        not_valid.insert(VALID_ATTRIBUTES.to_string(), Value::FixedBinary(vec![false, false, false]));
        not_valid.insert("a".to_string(), int(7));
        assert_eq!(
            eval(&measure_expr, &not_valid),
            Value::Boolean(false),
            "measure must null out (the `false` default literal) when its attribute's valid bit is unset"
        );

        let mut valid = Map::new();
        valid.insert(DIRECT_MEASURES.to_string(), Value::FixedBinary(vec![false]));
        valid.insert(VALID_ATTRIBUTES.to_string(), Value::FixedBinary(vec![false, true, false]));
        valid.insert("a".to_string(), int(7));
        assert_eq!(eval(&measure_expr, &valid), int(7), "measure must evaluate its child expression once the attribute is valid");
    }
}
