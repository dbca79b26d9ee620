//! Primitive physical-plan builders (spec.md §4.4): `read`, `filter`,
//! `project`, `union_all`, `exchange`, `aggregate`, `equal_join`. Each
//! returns the [`PlanNode`] it built plus the output schema, mirroring the
//! original's substrait-`Rel`-plus-`Schema` return convention without
//! depending on substrait itself.

use super::plan::PlanNode;
use crate::errors::{PlanError, PlanResult};
use crate::expression::{Expression, LiteralValue};
use crate::registry::{BLOCK_ID, DIRECT_MEASURES, PASSED_PREDS, VALID_ATTRIBUTES};
use crate::schema::{AttributeDef, Schema};
use crate::value::{DataType, Value};
use std::collections::HashSet;

/// Builds `bitmap_get(bitmap_attribute, offset)`, the expression the
/// reconstruction path uses to read a single bit out of a packed bitmap
/// column (`passed_preds`, `direct_measures`, `valid_attributes`).
pub fn make_bitmap_get(bitmap_attribute_name: &str, offset: usize) -> Expression {
    Expression::Function {
        name: format!("get_{bitmap_attribute_name}_{offset}"),
        op: "bitmap_get".to_string(),
        children: vec![
            Expression::Attribute {
                name: bitmap_attribute_name.to_string(),
                data_type: DataType::FixedBinary,
                size_hint: None,
            },
            Expression::Literal {
                name: "offset".to_string(),
                value: LiteralValue::Value(Value::Integer { value: offset as i64, bits: 32 }),
            },
        ],
        data_type: DataType::Boolean,
        nullable: false,
    }
}

/// Builds `bitmap_count(bitmap_attribute)`, counting the set bits in a
/// packed bitmap column — used by the join-reconstruction path's final
/// filter to check how many query predicates a tuple has accumulated
/// `passed_preds` bits for.
pub fn make_bitmap_count(bitmap_attribute_name: &str) -> Expression {
    Expression::Function {
        name: format!("count_{bitmap_attribute_name}"),
        op: "bitmap_count".to_string(),
        children: vec![Expression::Attribute {
            name: bitmap_attribute_name.to_string(),
            data_type: DataType::FixedBinary,
            size_hint: None,
        }],
        data_type: DataType::Integer,
        nullable: false,
    }
}

/// Builds the node that reads `attributes` of `block_ids` out of `path`,
/// prefixing the synthetic `block_id` column the original always carries
/// alongside the user-requested attributes.
pub fn read(path: &str, block_ids: HashSet<usize>, table_schema: &Schema, attributes: &[bool]) -> PlanResult<(PlanNode, Schema)> {
    let mut schema = Schema::new();
    schema.add(AttributeDef::new(BLOCK_ID, crate::value::DataType::Integer))?;
    for (i, attr) in table_schema.iter().enumerate() {
        if attributes.get(i).copied().unwrap_or(false) {
            schema.add(attr.clone())?;
        }
    }
    let node = PlanNode::Read {
        path: path.to_string(),
        block_ids,
        schema: schema.clone(),
    };
    Ok((node, schema))
}

/// Filters `input` by `predicate`; the schema is unchanged since a filter
/// never adds or drops columns.
pub fn filter(input: PlanNode, predicate: Expression, input_schema: &Schema) -> (PlanNode, Schema) {
    let node = PlanNode::Filter {
        input: Box::new(input),
        predicate,
    };
    (node, input_schema.clone())
}

/// Projects `expressions` over `input`, producing a schema with one
/// attribute per expression named after it.
pub fn project(input: PlanNode, expressions: Vec<Expression>) -> PlanResult<(PlanNode, Schema)> {
    let mut schema = Schema::new();
    for e in &expressions {
        schema.add(AttributeDef::new(e.name(), e.data_type()))?;
    }
    let node = PlanNode::Project {
        input: Box::new(input),
        expressions,
    };
    Ok((node, schema))
}

/// Unions `inputs`, all of which must already share `schema`.
pub fn union_all(inputs: Vec<PlanNode>, schema: Schema) -> (PlanNode, Schema) {
    let node = PlanNode::UnionAll {
        inputs,
        schema: schema.clone(),
    };
    (node, schema)
}

/// Scatters `input` by `scatter_attributes` across worker boundaries; the
/// schema is unchanged. An empty scatter list means "scatter arbitrarily",
/// used at the final aggregation fan-in.
pub fn exchange(input: PlanNode, input_schema: &Schema, scatter_attributes: Vec<String>) -> (PlanNode, Schema) {
    let node = PlanNode::Exchange {
        input: Box::new(input),
        scatter_attributes,
    };
    (node, input_schema.clone())
}

/// Groups `input` by `group` (or the whole input if `None`) and evaluates
/// `measures`; the bitmap columns (`passed_preds`, `direct_measures`,
/// `valid_attributes`) get a `bitmap_or` aggregate instead of `measures`'
/// declared op, mirroring the original's per-column-kind dispatch.
pub fn aggregate(
    input: PlanNode,
    input_schema: &Schema,
    measures: Vec<Expression>,
    group: Option<Expression>,
) -> PlanResult<(PlanNode, Schema)> {
    let _ = input_schema;
    let mut schema = Schema::new();
    for m in &measures {
        schema.add(AttributeDef::new(m.name(), m.data_type()))?;
    }
    let node = PlanNode::Aggregate {
        input: Box::new(input),
        group: group.map(Box::new),
        measures,
    };
    Ok((node, schema))
}

/// Reconstruction-by-aggregation measure list: one `reconstruct` op per
/// ordinary attribute, one `bitmap_or` per bitmap column, skipping the
/// synthetic `tid`/`block_id` grouping columns.
pub fn reconstruct_measures(input_schema: &Schema, tuple_id: &str) -> Vec<Expression> {
    input_schema
        .iter()
        .filter(|a| a.name != tuple_id && a.name != BLOCK_ID)
        .map(|a| {
            let op = if a.name == PASSED_PREDS || a.name == DIRECT_MEASURES || a.name == VALID_ATTRIBUTES {
                "bitmap_or"
            } else {
                "reconstruct"
            };
            Expression::Aggregate {
                name: a.name.clone(),
                op: op.to_string(),
                children: vec![Expression::Attribute {
                    name: a.name.clone(),
                    data_type: a.data_type,
                    size_hint: a.size_hint,
                }],
                data_type: a.data_type,
                nullable: true,
            }
        })
        .collect()
}

/// Equi-joins `left` and `right` on `left_keys`/`right_keys` (positionally
/// paired), producing the concatenation of both schemas.
pub fn equal_join(
    left: PlanNode,
    right: PlanNode,
    left_schema: &Schema,
    right_schema: &Schema,
    left_keys: Vec<String>,
    right_keys: Vec<String>,
) -> PlanResult<(PlanNode, Schema)> {
    if left_keys.len() != right_keys.len() || left_keys.is_empty() {
        return Err(PlanError::InvariantViolation(
            "equal_join requires a non-empty, equal-length key pairing".to_string(),
        ));
    }
    let mut schema = left_schema.clone();
    schema.append(right_schema)?;
    let node = PlanNode::EqualJoin {
        left: Box::new(left),
        right: Box::new(right),
        left_keys,
        right_keys,
    };
    Ok((node, schema))
}
