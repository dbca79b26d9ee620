//! The physical plan IR and the top-level entry point that assembles one
//! out of a query's scan parameters (spec.md §4.5/§4.6): `produce_plan`
//! dispatches on [`crate::registry::ReconstructStrategy`] and hands off to
//! the aggregation or join assembly below.

use super::aggregation::produce_scan_parameters_aggregation;
use super::helper::{
    aggregate, equal_join, exchange, filter, make_bitmap_count, make_bitmap_get, project, read, reconstruct_measures,
    union_all,
};
use super::join::produce_join_plan;
use super::scan_parameter::ScanParameter;
use crate::config::PartitionerConfig;
use crate::errors::{PlanError, PlanResult};
use crate::expression::{Expression, LiteralValue};
use crate::metadata::{PartitionMeta, Query};
use crate::registry::{Engine, ReconstructStrategy, Registry, BLOCK_ID, DIRECT_MEASURES, PASSED_PREDS, TUPLE_ID, VALID_ATTRIBUTES};
use crate::schema::Schema;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum PlanNode {
    Read {
        path: String,
        block_ids: std::collections::HashSet<usize>,
        schema: Schema,
    },
    Filter {
        input: Box<PlanNode>,
        predicate: Expression,
    },
    Project {
        input: Box<PlanNode>,
        expressions: Vec<Expression>,
    },
    UnionAll {
        inputs: Vec<PlanNode>,
        schema: Schema,
    },
    Exchange {
        input: Box<PlanNode>,
        scatter_attributes: Vec<String>,
    },
    Aggregate {
        input: Box<PlanNode>,
        group: Option<Box<Expression>>,
        measures: Vec<Expression>,
    },
    EqualJoin {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        left_keys: Vec<String>,
        right_keys: Vec<String>,
    },
}

/// Deduplicates scan parameters that would read the identical
/// `{attributes, filter, projection}` shape off the same file, merging
/// their block-id sets together. Skipped on the Velox engine, whose reader
/// already shares scans across blocks with matching parameters.
pub(crate) fn merge_before_read(parameters: Vec<ScanParameter>, engine: Engine) -> Vec<ScanParameter> {
    if engine != Engine::Arrow {
        return parameters;
    }
    let mut out: Vec<ScanParameter> = Vec::new();
    for p in parameters {
        if let Some(existing) = out.iter_mut().find(|o| p.equal(o)) {
            existing.block_ids.extend(p.block_ids.iter().copied());
            existing.blocks.extend(p.blocks.iter().cloned());
        } else {
            out.push(p);
        }
    }
    out
}

fn read_blocks(p: &ScanParameter, table_schema: &Schema) -> PlanResult<(PlanNode, Schema)> {
    Ok(read(&p.file_path, p.block_ids.clone(), table_schema, &p.read_attributes)?)
}

/// Wraps `read_blocks` with the predicate filter and the bitmap-plus-raw
/// projection a reconstruction scan needs (spec.md §4.4 `readForReconstruction`).
pub(crate) fn read_for_reconstruction(p: &ScanParameter, table_schema: &Schema, reconstruct_attributes: &[bool]) -> PlanResult<(PlanNode, Schema)> {
    let (read_node, read_schema) = read_blocks(p, table_schema)?;
    let (filtered_node, filtered_schema) = match &p.filter {
        Some(f) => filter(read_node, f.clone(), &read_schema),
        None => (read_node, read_schema),
    };

    let mut project_expressions = vec![
        Expression::Literal {
            name: PASSED_PREDS.to_string(),
            value: LiteralValue::Value(crate::value::Value::FixedBinary(p.passed_preds.clone())),
        },
        Expression::Literal {
            name: DIRECT_MEASURES.to_string(),
            value: LiteralValue::Value(crate::value::Value::FixedBinary(p.direct_measures.clone())),
        },
        Expression::Literal {
            name: VALID_ATTRIBUTES.to_string(),
            value: LiteralValue::Value(crate::value::Value::FixedBinary(p.project_attributes.clone())),
        },
    ];
    for (i, attr) in table_schema.iter().enumerate() {
        if !reconstruct_attributes.get(i).copied().unwrap_or(false) {
            continue;
        }
        if p.project_attributes.get(i).copied().unwrap_or(false) {
            project_expressions.push(Expression::Attribute {
                name: attr.name.clone(),
                data_type: attr.data_type,
                size_hint: attr.size_hint,
            });
        } else {
            project_expressions.push(Expression::Literal {
                name: attr.name.clone(),
                value: LiteralValue::Bool(false),
            });
        }
    }
    Ok(project(filtered_node, project_expressions)?)
}

/// Read-filter-project for the direct-evaluation path (spec.md §4.4
/// `readForDirectEval`): no bitmap columns beyond `direct_measures`, since
/// a direct-path block never needs reconstruction.
fn read_for_direct_eval(p: &ScanParameter, table_schema: &Schema, measure_attributes: &[bool]) -> PlanResult<(PlanNode, Schema)> {
    let (read_node, read_schema) = read_blocks(p, table_schema)?;
    let (filtered_node, _) = match &p.filter {
        Some(f) => filter(read_node, f.clone(), &read_schema),
        None => (read_node, read_schema),
    };

    let mut project_expressions = vec![Expression::Literal {
        name: DIRECT_MEASURES.to_string(),
        value: LiteralValue::Value(crate::value::Value::FixedBinary(p.direct_measures.clone())),
    }];
    for (i, attr) in table_schema.iter().enumerate() {
        if !measure_attributes.get(i).copied().unwrap_or(false) {
            continue;
        }
        if p.project_attributes.get(i).copied().unwrap_or(false) {
            project_expressions.push(Expression::Attribute {
                name: attr.name.clone(),
                data_type: attr.data_type,
                size_hint: attr.size_hint,
            });
        } else {
            project_expressions.push(Expression::Literal {
                name: attr.name.clone(),
                value: LiteralValue::Bool(false),
            });
        }
    }
    Ok(project(filtered_node, project_expressions)?)
}

/// Groups `input` by tuple id and combines every reconstruction scan's
/// rows for the same tuple into one wide row, `bitmap_or`-ing the three
/// bitmap columns and taking the first non-null value of every other
/// column (shared by both reconstruction final steps below).
fn group_by_tuple_id(input: PlanNode, input_schema: &Schema) -> PlanResult<(PlanNode, Schema)> {
    let group = Expression::Attribute {
        name: TUPLE_ID.to_string(),
        data_type: crate::value::DataType::Integer,
        size_hint: None,
    };
    let measures = reconstruct_measures(input_schema, TUPLE_ID);
    aggregate(input, input_schema, measures, Some(group))
}

/// Groups reconstruction input by tuple id, re-checks every atomic query
/// predicate against the reassembled tuple (short-circuiting on
/// `passed_preds` where a block already proved the predicate true), then
/// projects each measure guarded by `direct_measures`/`valid_attributes`
/// (spec.md §4.5, the aggregation-reconstruction path's own final step).
pub(crate) fn reconstruct(
    input: PlanNode,
    input_schema: &Schema,
    table_schema: &Schema,
    filters: &[Expression],
    all_measures: &[Expression],
) -> PlanResult<(PlanNode, Schema)> {
    let (agg_node, schema_after_agg) = group_by_tuple_id(input, input_schema)?;

    let mut new_filters = Vec::new();
    for f in filters {
        let attrs = f.attributes();
        if attrs.is_empty() {
            new_filters.push(f.clone());
            continue;
        }
        if attrs.len() != 1 {
            return Err(PlanError::InvariantViolation(
                "reconstruct: each atomic filter must reference exactly one attribute".to_string(),
            ));
        }
        let name = attrs.iter().next().expect("checked len == 1");
        if !schema_after_agg.contains(name) {
            continue;
        }
        let pred_index = filters.iter().position(|x| x.equal(f)).unwrap_or(0);
        let passed_pred_exp = make_bitmap_get(PASSED_PREDS, pred_index);
        let attr_offset = table_schema.offset(name)?;
        let valid_attr_exp = make_bitmap_get(VALID_ATTRIBUTES, attr_offset);

        let valid_check_if = Expression::IfThenElse {
            name: f.name().to_string(),
            if_expr: Box::new(valid_attr_exp),
            then_expr: Box::new(f.clone()),
            else_expr: Box::new(Expression::Literal {
                name: "error".to_string(),
                value: LiteralValue::Bool(false),
            }),
        };
        new_filters.push(Expression::IfThenElse {
            name: f.name().to_string(),
            if_expr: Box::new(passed_pred_exp),
            then_expr: Box::new(Expression::Literal {
                name: "passed".to_string(),
                value: LiteralValue::Bool(true),
            }),
            else_expr: Box::new(valid_check_if),
        });
    }

    let (filtered_node, schema_after_filter) = if !new_filters.is_empty() {
        let predicate = Expression::connect_expression("filter_expression", new_filters, false, true);
        filter(agg_node, predicate, &schema_after_agg)
    } else {
        (agg_node, schema_after_agg)
    };

    project_measures(filtered_node, &schema_after_filter, table_schema, all_measures)
}

/// Join-reconstruction's own final step (spec.md §4.6 "Final filter"):
/// groups `input` by tuple id same as [`reconstruct`], but rejects a tuple
/// outright once `bitmap_count(passed_preds) < num_conjuncts` — no
/// per-predicate value re-check against `valid_attributes`, since the join
/// path's ancestor scans already guarantee every counted predicate was
/// evaluated against real data before its `passed_preds` bit was set.
pub(crate) fn reconstruct_join(
    input: PlanNode,
    input_schema: &Schema,
    table_schema: &Schema,
    num_conjuncts: usize,
    all_measures: &[Expression],
) -> PlanResult<(PlanNode, Schema)> {
    let (agg_node, schema_after_agg) = group_by_tuple_id(input, input_schema)?;

    let predicate = Expression::Function {
        name: "passed_preds_count_check".to_string(),
        op: "gte".to_string(),
        children: vec![
            make_bitmap_count(PASSED_PREDS),
            Expression::Literal {
                name: "num_conjuncts".to_string(),
                value: LiteralValue::Value(crate::value::Value::Integer {
                    value: num_conjuncts as i64,
                    bits: 32,
                }),
            },
        ],
        data_type: crate::value::DataType::Boolean,
        nullable: false,
    };
    let (filtered_node, schema_after_filter) = filter(agg_node, predicate, &schema_after_agg);

    project_measures(filtered_node, &schema_after_filter, table_schema, all_measures)
}

/// Shared §4.5/§4.6 measure-projection tail: null out a measure's result
/// unless every attribute it reads is present and marked valid in
/// `schema`, skipping the evaluation entirely when `direct_measures`
/// already covers it from a sibling direct-evaluation scan.
fn project_measures(
    input: PlanNode,
    schema: &Schema,
    table_schema: &Schema,
    all_measures: &[Expression],
) -> PlanResult<(PlanNode, Schema)> {
    let mut project_expressions = Vec::with_capacity(all_measures.len());
    for (i, measure) in all_measures.iter().enumerate() {
        let default_value = Expression::Literal {
            name: measure.name().to_string(),
            value: LiteralValue::Bool(false),
        };
        let attrs_in_measure = measure.attributes();
        let mut offsets = Vec::with_capacity(attrs_in_measure.len());
        let mut all_exist = true;
        for a in &attrs_in_measure {
            offsets.push(table_schema.offset(a)?);
            all_exist &= schema.contains(a);
        }
        if !all_exist {
            project_expressions.push(default_value);
            continue;
        }

        let check_valid_attributes = {
            let exps: Vec<Expression> = offsets.iter().map(|o| make_bitmap_get(VALID_ATTRIBUTES, *o)).collect();
            Expression::connect_expression("check_valid_attributes", exps, false, true)
        };

        let children = match measure {
            Expression::Aggregate { children, .. } => children,
            _ => {
                return Err(PlanError::InvariantViolation(
                    "project_measures: query measures must be aggregate expressions".to_string(),
                ))
            }
        };
        if children.len() != 1 {
            return Err(PlanError::InvariantViolation("measures must be unary".to_string()));
        }
        let check_measure_exp = make_bitmap_get(DIRECT_MEASURES, i);
        let inner_if = Expression::IfThenElse {
            name: "evaluate_exp_in_measure_inner".to_string(),
            if_expr: Box::new(check_valid_attributes),
            then_expr: Box::new(children[0].clone()),
            else_expr: Box::new(default_value.clone()),
        };
        project_expressions.push(Expression::IfThenElse {
            name: measure.name().to_string(),
            if_expr: Box::new(check_measure_exp),
            then_expr: Box::new(default_value),
            else_expr: Box::new(inner_if),
        });
    }
    Ok(project(input, project_expressions)?)
}

fn reconstruct_path(
    table_schema: &Schema,
    scan_parameters: &[ScanParameter],
    query: &Query,
) -> PlanResult<(PlanNode, Schema)> {
    let mut reconstruct_attributes = vec![false; table_schema.len()];
    for p in scan_parameters {
        for (i, b) in p.project_attributes.iter().enumerate() {
            reconstruct_attributes[i] |= *b;
        }
    }

    let mut read_nodes = Vec::new();
    let mut schema_after_read: Option<Schema> = None;
    for p in scan_parameters {
        let (node, schema) = read_for_reconstruction(p, table_schema, &reconstruct_attributes)?;
        match &schema_after_read {
            None => schema_after_read = Some(schema),
            Some(existing) if existing != &schema => {
                return Err(PlanError::InvariantViolation(
                    "reconstructPath: inputs of union have different schemas".to_string(),
                ))
            }
            _ => {}
        }
        read_nodes.push(node);
    }
    let schema_after_read = schema_after_read.ok_or_else(|| {
        PlanError::InvariantViolation("reconstructPath: no scan parameters to read".to_string())
    })?;

    let (union_node, schema_after_union) = union_all(read_nodes, schema_after_read);

    let filters = query.filter().sub_expressions("and")?;
    reconstruct(union_node, &schema_after_union, table_schema, &filters, query.measures())
}

fn direct_evaluation(input_schema: &Schema, all_measures: &[Expression]) -> PlanResult<Vec<Expression>> {
    let mut project_expressions = Vec::with_capacity(all_measures.len());
    for (i, measure) in all_measures.iter().enumerate() {
        let default_value = Expression::Literal {
            name: measure.name().to_string(),
            value: LiteralValue::Bool(false),
        };
        let attrs_in_measure = measure.attributes();
        let all_exist = attrs_in_measure.iter().all(|a| input_schema.contains(a));
        if !all_exist {
            project_expressions.push(default_value);
            continue;
        }
        let children = match measure {
            Expression::Aggregate { children, .. } => children,
            _ => {
                return Err(PlanError::InvariantViolation(
                    "directEvaluation: query measures must be aggregate expressions".to_string(),
                ))
            }
        };
        if children.len() != 1 {
            return Err(PlanError::InvariantViolation("measures must be unary".to_string()));
        }
        let check_measure_exp = make_bitmap_get(DIRECT_MEASURES, i);
        project_expressions.push(Expression::IfThenElse {
            name: measure.name().to_string(),
            if_expr: Box::new(check_measure_exp),
            then_expr: Box::new(children[0].clone()),
            else_expr: Box::new(default_value),
        });
    }
    Ok(project_expressions)
}

pub(crate) fn direct_eval_path(table_schema: &Schema, scan_parameters: &[ScanParameter], query: &Query) -> PlanResult<(PlanNode, Schema)> {
    let mut direct_attributes = vec![false; table_schema.len()];
    for i in 0..query.num_measures() {
        for a in query.attributes_in_measure(i) {
            direct_attributes[table_schema.offset(a)?] = true;
        }
    }

    let mut read_nodes = Vec::new();
    let mut schema_after_read: Option<Schema> = None;
    for p in scan_parameters {
        let (node, schema) = read_for_direct_eval(p, table_schema, &direct_attributes)?;
        match &schema_after_read {
            None => schema_after_read = Some(schema),
            Some(existing) if existing != &schema => {
                return Err(PlanError::InvariantViolation(
                    "directEvalPath: inputs of union have different schemas".to_string(),
                ))
            }
            _ => {}
        }
        read_nodes.push(node);
    }
    let schema_after_read = schema_after_read.ok_or_else(|| {
        PlanError::InvariantViolation("directEvalPath: no scan parameters to read".to_string())
    })?;

    let (union_node, schema_after_union) = union_all(read_nodes, schema_after_read);
    let expressions = direct_evaluation(&schema_after_union, query.measures())?;
    Ok(project(union_node, expressions)?)
}

/// Assembles the full aggregation-reconstruction plan: reconstruct path
/// plus direct path, unioned and re-aggregated into the final per-measure
/// result row (spec.md §4.5 `evaluateAggregatePlan`).
fn evaluate_aggregate_plan(
    table_schema: &Schema,
    query: &Query,
    unmerged_reconstruct: Vec<ScanParameter>,
    unmerged_direct: Vec<ScanParameter>,
    engine: Engine,
) -> PlanResult<PlanNode> {
    let reconstruct_params = merge_before_read(unmerged_reconstruct, engine);
    let direct_params = merge_before_read(unmerged_direct, engine);

    let all_measures = query.measures();
    let mut schema_out_path: Option<Schema> = None;
    let mut reconstruct_node = None;
    if !reconstruct_params.is_empty() {
        let (node, schema) = reconstruct_path(table_schema, &reconstruct_params, query)?;
        if schema.len() != all_measures.len() {
            return Err(PlanError::InvariantViolation(
                "evaluate: reconstruction path output arity must match query measures".to_string(),
            ));
        }
        schema_out_path = Some(schema);
        reconstruct_node = Some(node);
    }

    let mut direct_node = None;
    let mut schema_after_direct = None;
    if !direct_params.is_empty() {
        let (node, schema) = direct_eval_path(table_schema, &direct_params, query)?;
        if schema.len() != all_measures.len() {
            return Err(PlanError::InvariantViolation(
                "evaluate: direct path output arity must match query measures".to_string(),
            ));
        }
        schema_out_path = Some(schema.clone());
        schema_after_direct = Some(schema);
        direct_node = Some(node);
    }

    let schema_out_path = schema_out_path.ok_or_else(|| {
        PlanError::InvariantViolation("evaluate: no blocks produced a scan parameter for this query".to_string())
    })?;
    if let (Some(_), Some(direct_schema)) = (&reconstruct_node, &schema_after_direct) {
        if direct_schema != &schema_out_path {
            return Err(PlanError::InvariantViolation(
                "evaluate: direct path and reconstruction path must have the same output schema".to_string(),
            ));
        }
    }

    let mut inputs = Vec::new();
    if let Some(n) = reconstruct_node {
        inputs.push(n);
    }
    if let Some(n) = direct_node {
        inputs.push(n);
    }
    let (union_node, schema_after_union) = union_all(inputs, schema_out_path);

    let (exchanged_node, schema_after_exchange) = if engine == Engine::Velox {
        exchange(union_node, &schema_after_union, Vec::new())
    } else {
        (union_node, schema_after_union)
    };

    let final_measures: Vec<Expression> = all_measures
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let attr = schema_after_exchange.get_at(i).expect("arity checked above");
            Expression::Aggregate {
                name: m.name().to_string(),
                op: match m {
                    Expression::Aggregate { op, .. } => op.clone(),
                    _ => "sum".to_string(),
                },
                children: vec![Expression::Attribute {
                    name: attr.name.clone(),
                    data_type: attr.data_type,
                    size_hint: attr.size_hint,
                }],
                data_type: m.data_type(),
                nullable: m_nullable(m),
            }
        })
        .collect();
    Ok(aggregate(exchanged_node, &schema_after_exchange, final_measures, None)?.0)
}

fn m_nullable(m: &Expression) -> bool {
    matches!(m, Expression::Aggregate { nullable, .. } if *nullable)
}

/// Entry point: derives scan parameters for `query` against `partitions`
/// and assembles the physical plan, dispatching on `strategy`.
pub fn produce_plan(
    query: &Arc<Query>,
    partitions: &[PartitionMeta],
    registry: &Registry,
    strategy: ReconstructStrategy,
    config: &PartitionerConfig,
) -> PlanResult<PlanNode> {
    let table_schema = query.table_schema().clone();
    let engine = config.engine();
    match strategy {
        ReconstructStrategy::Aggregate => {
            let (direct, reconstruct) = produce_scan_parameters_aggregation(query, &table_schema, partitions, registry)?;
            evaluate_aggregate_plan(&table_schema, query, reconstruct, direct, engine)
        }
        ReconstructStrategy::Join => produce_join_plan(query, &table_schema, partitions, registry, engine),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::LiteralValue as LV;
    use crate::schema::AttributeDef;
    use crate::value::{DataType, Value};
    use std::collections::HashMap;

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
            value: LV::Value(int(v)),
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

    fn schema3() -> Schema {
        let mut s = Schema::new();
        s.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        s.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        s.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        s
    }

    #[test]
    fn single_covering_block_plan_has_no_union_of_two_paths() {
        let mut reg = Registry::new();
        reg.set_min_max("a", int(0), int(99));
        reg.set_min_max("b", int(0), int(99));
        let filter_expr = cmp("gte", attr("a"), lit("l", 10));
        let measure = Expression::Aggregate {
            name: "m".into(),
            op: "sum".into(),
            children: vec![attr("b")],
            data_type: DataType::Integer,
            nullable: false,
        };
        let query = Arc::new(Query::new(schema3(), filter_expr, vec![measure], "t", &reg).unwrap());

        let mut schema = Schema::new();
        schema.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        schema.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        schema.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        let mut m = HashMap::new();
        m.insert("a".to_string(), crate::metadata::Interval::new(int(0), false, int(99), false).unwrap());
        let block = crate::metadata::BlockMeta::new(0, crate::metadata::Boundary::new(m), schema, Some(1000));
        let mut part = PartitionMeta::new("p0");
        part.add_block(block);

        let config = PartitionerConfig::default();
        let plan = produce_plan(&query, &[part], &reg, ReconstructStrategy::Aggregate, &config).unwrap();
        match plan {
            PlanNode::Aggregate { input, .. } => match *input {
                PlanNode::UnionAll { inputs, .. } => assert_eq!(inputs.len(), 1),
                other => panic!("expected a union under the final aggregate, got {other:?}"),
            },
            other => panic!("expected the plan to end in an aggregate, got {other:?}"),
        }
    }
}
