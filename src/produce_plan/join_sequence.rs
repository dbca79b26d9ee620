//! Greedy left-deep join ordering for the join-reconstruction path
//! (spec.md §4.3/§4.6): folds a group of scan parameters that all
//! contribute measure attributes for the same tuple set into one wide row
//! per tuple id, largest-estimated-size scan first.
//!
//! The original drives this choice by repeatedly picking the table
//! attribute with the largest combined row-weight and extracting every
//! scan parameter that reads it (`findLargestAttribute`/`extractBlocks`),
//! recursing to build a right-deep tree. Here the ordering is flattened to
//! a single descending sort by each scan parameter's own estimated row
//! count and folded left-to-right with an explicit loop: it reaches the
//! same greedy intent (biggest table joined first) without recursion or
//! the attribute-weight bookkeeping, at the cost of not regrouping
//! multi-attribute overlaps block by block.

use super::helper::{equal_join, make_bitmap_get, project};
use super::plan::{read_for_reconstruction, PlanNode};
use super::scan_parameter::ScanParameter;
use crate::errors::{PlanError, PlanResult};
use crate::expression::Expression;
use crate::registry::{DIRECT_MEASURES, PASSED_PREDS, TUPLE_ID, VALID_ATTRIBUTES};
use crate::schema::{AttributeDef, Schema};

fn estimate_rows(p: &ScanParameter) -> u64 {
    p.blocks.iter().filter_map(|b| b.row_num_opt()).sum()
}

/// Joins every scan parameter in `group` on `tid`, producing one row per
/// tuple id with every group member's attributes merged in. `group` must
/// be non-empty. `reconstruct_attributes` is the bitmap every member of
/// this group *and every other group this plan unions with* projects,
/// so every resulting group's output schema lines up for the union that
/// follows (mirrors `reconstructPath`'s single shared bitmap).
pub fn join_sequence(group: Vec<ScanParameter>, table_schema: &Schema, reconstruct_attributes: &[bool]) -> PlanResult<(PlanNode, Schema)> {
    if group.is_empty() {
        return Err(PlanError::InvariantViolation(
            "join_sequence: cannot join an empty scan parameter group".to_string(),
        ));
    }

    let mut ordered = group;
    ordered.sort_by_key(|p| std::cmp::Reverse(estimate_rows(p)));

    let mut ordered_iter = ordered.into_iter();
    let first = ordered_iter.next().expect("checked non-empty above");
    let (mut node, mut schema) = read_for_reconstruction(&first, table_schema, reconstruct_attributes)?;

    for p in ordered_iter {
        let (next_node, next_schema) = read_for_reconstruction(&p, table_schema, reconstruct_attributes)?;
        let (joined, joined_schema) = merge_on_tuple_id(node, &schema, next_node, &next_schema)?;
        node = joined;
        schema = joined_schema;
    }

    Ok((node, schema))
}

/// Re-emits every column of `node` (whose output is `schema`) renamed with
/// `prefix`, so a self-join's two sides never collide on attribute names.
/// `project`'s output schema names each column after the expression it was
/// built from, so wrapping each attribute in a same-valued `identity`
/// function under the prefixed name is enough to achieve the rename.
fn prefix_columns(node: PlanNode, schema: &Schema, prefix: &str) -> PlanResult<(PlanNode, Schema)> {
    let renamed: Vec<Expression> = schema
        .iter()
        .map(|a| Expression::Function {
            name: format!("{prefix}{}", a.name),
            op: "identity".to_string(),
            children: vec![Expression::Attribute {
                name: a.name.clone(),
                data_type: a.data_type,
                size_hint: a.size_hint,
            }],
            data_type: a.data_type,
            nullable: false,
        })
        .collect();
    project(node, renamed)
}

/// Outer-joins `left`/`right` on `tid`, then merges every attribute that
/// appears on both sides: bitmap columns get `bitmap_or`'d, plain
/// attributes prefer whichever side's `valid_attributes` bit says it
/// actually read the column.
fn merge_on_tuple_id(left: PlanNode, left_schema: &Schema, right: PlanNode, right_schema: &Schema) -> PlanResult<(PlanNode, Schema)> {
    let (left_node, left_prefixed) = prefix_columns(left, left_schema, "left_")?;
    let (right_node, right_prefixed) = prefix_columns(right, right_schema, "right_")?;

    let left_tid = format!("left_{TUPLE_ID}");
    let right_tid = format!("right_{TUPLE_ID}");
    let (join_node, _join_schema) = equal_join(
        left_node,
        right_node,
        &left_prefixed,
        &right_prefixed,
        vec![left_tid],
        vec![right_tid],
    )?;

    let mut names: Vec<&str> = left_schema.iter().map(|a| a.name.as_str()).collect();
    for a in right_schema.iter() {
        if !names.contains(&a.name.as_str()) {
            names.push(&a.name);
        }
    }

    let mut expressions = Vec::with_capacity(names.len());
    for name in names {
        let left_name = format!("left_{name}");
        let right_name = format!("right_{name}");
        let on_left = left_schema.contains(name);
        let on_right = right_schema.contains(name);
        let expr = if on_left && on_right {
            let def = left_schema.get(name).expect("checked contains");
            if name == PASSED_PREDS || name == DIRECT_MEASURES || name == VALID_ATTRIBUTES || name == TUPLE_ID {
                Expression::Function {
                    name: name.to_string(),
                    op: "bitmap_or_scalar".to_string(),
                    children: vec![
                        Expression::Attribute { name: left_name, data_type: def.data_type, size_hint: def.size_hint },
                        Expression::Attribute { name: right_name, data_type: def.data_type, size_hint: def.size_hint },
                    ],
                    data_type: def.data_type,
                    nullable: false,
                }
            } else {
                let is_valid = make_bitmap_get(&format!("left_{VALID_ATTRIBUTES}"), 0);
                Expression::IfThenElse {
                    name: name.to_string(),
                    if_expr: Box::new(is_valid),
                    then_expr: Box::new(Expression::Attribute { name: left_name, data_type: def.data_type, size_hint: def.size_hint }),
                    else_expr: Box::new(Expression::Attribute { name: right_name, data_type: def.data_type, size_hint: def.size_hint }),
                }
            }
        } else if on_left {
            let def = left_schema.get(name).expect("checked contains");
            Expression::Attribute { name: left_name, data_type: def.data_type, size_hint: def.size_hint }
        } else {
            let def = right_schema.get(name).expect("checked contains");
            Expression::Attribute { name: right_name, data_type: def.data_type, size_hint: def.size_hint }
        };
        expressions.push(retag(expr, name));
    }

    Ok(project(join_node, expressions)?)
}

fn retag(expr: Expression, name: &str) -> Expression {
    match expr {
        Expression::Attribute { data_type, size_hint, .. } => Expression::Attribute {
            name: name.to_string(),
            data_type,
            size_hint,
        },
        Expression::Function { op, children, data_type, nullable, .. } => Expression::Function {
            name: name.to_string(),
            op,
            children,
            data_type,
            nullable,
        },
        Expression::IfThenElse { if_expr, then_expr, else_expr, .. } => Expression::IfThenElse {
            name: name.to_string(),
            if_expr,
            then_expr,
            else_expr,
        },
        Expression::Literal { value, .. } => Expression::Literal { name: name.to_string(), value },
        other @ Expression::Aggregate { .. } => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::BlockMeta;
    use crate::value::DataType;

    fn table_schema() -> Schema {
        let mut s = Schema::new();
        s.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        s.add(AttributeDef::new("a", DataType::Integer)).unwrap();
        s.add(AttributeDef::new("b", DataType::Integer)).unwrap();
        s
    }

    fn scan_param(path: &str, attr_offset: usize, rows: u64) -> ScanParameter {
        let mut p = ScanParameter::new(path, 3, 1, 0);
        p.read_attributes[0] = true;
        p.read_attributes[attr_offset] = true;
        p.project_attributes[0] = true;
        p.project_attributes[attr_offset] = true;
        let mut schema = Schema::new();
        schema.add(AttributeDef::new("tid", DataType::Integer)).unwrap();
        let block = BlockMeta::new(0, crate::metadata::Boundary::new(Default::default()), schema, Some(rows));
        p.blocks = vec![block];
        p
    }

    #[test]
    fn rejects_empty_group() {
        assert!(join_sequence(vec![], &table_schema(), &[true, true, true]).is_err());
    }

    #[test]
    fn single_member_group_skips_join() {
        let p = scan_param("f", 1, 100);
        let (node, _schema) = join_sequence(vec![p], &table_schema(), &[true, true, true]).unwrap();
        assert!(matches!(node, PlanNode::Project { .. }));
    }

    #[test]
    fn two_member_group_produces_a_join() {
        let a = scan_param("f", 1, 1000);
        let b = scan_param("g", 2, 10);
        let (node, schema) = join_sequence(vec![a, b], &table_schema(), &[true, true, true]).unwrap();
        assert!(matches!(node, PlanNode::Project { .. }));
        assert!(schema.contains("a") && schema.contains("b"));
    }
}
