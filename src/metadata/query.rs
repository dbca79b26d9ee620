//! A single analytical query: a table-wide filter predicate plus a list of
//! aggregate measures, the unit the partitioner samples and the plan
//! builder lowers against stored blocks.

use super::Interval;
use crate::errors::{ExpressionError, ExpressionResult};
use crate::expression::{Expression, LiteralValue};
use crate::metadata::Boundary;
use crate::registry::Registry;
use crate::schema::Schema;
use std::collections::HashMap;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct Query {
    table_schema: Schema,
    filter: Expression,
    measures: Vec<Expression>,
    path: String,
    filter_boundary: Boundary,
    attributes_in_measures: Vec<HashSet<String>>,
}

impl Query {
    pub fn new(
        table_schema: Schema,
        filter: Expression,
        measures: Vec<Expression>,
        path: impl Into<String>,
        registry: &Registry,
    ) -> ExpressionResult<Self> {
        let attributes_in_measures = measures.iter().map(Expression::attributes).collect();
        let filter_boundary = produce_filter_boundary(&filter, registry)?;
        Ok(Self {
            table_schema,
            filter,
            measures,
            path: path.into(),
            filter_boundary,
            attributes_in_measures,
        })
    }

    pub fn table_schema(&self) -> &Schema {
        &self.table_schema
    }

    pub fn filter(&self) -> &Expression {
        &self.filter
    }

    pub fn measures(&self) -> &[Expression] {
        &self.measures
    }

    pub fn attributes_in_measure(&self, index: usize) -> &HashSet<String> {
        &self.attributes_in_measures[index]
    }

    pub fn num_measures(&self) -> usize {
        self.measures.len()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn filter_boundary(&self) -> &Boundary {
        &self.filter_boundary
    }

    /// Every attribute either filtered on or referenced by any measure.
    pub fn all_referred_attributes(&self) -> HashSet<String> {
        let mut out = self.filter_boundary.attributes();
        for m in &self.attributes_in_measures {
            out.extend(m.iter().cloned());
        }
        out
    }
}

/// Operator swap table applied when the literal sits on the left of a
/// comparison (so the attribute becomes the right-hand operand): the
/// comparison direction flips, but `equal` is its own mirror.
fn swap_operator(op: &str) -> &'static str {
    match op {
        "gt" => "lt",
        "lt" => "gt",
        "gte" => "lte",
        "lte" => "gte",
        "equal" => "equal",
        other => other,
    }
}

/// Flattens the filter's top-level `and` tree and folds each atomic
/// comparison (attribute vs literal) into a per-attribute `Interval`,
/// seeded from the registry's table-wide min/max.
fn produce_filter_boundary(filter: &Expression, registry: &Registry) -> ExpressionResult<Boundary> {
    let atoms = filter.sub_expressions("and")?;
    let mut bounds: HashMap<String, Interval> = HashMap::new();

    for atom in atoms {
        let (attr_name, attr_type, op, literal) = match &atom {
            Expression::Function { op, children, .. } if children.len() == 2 => {
                match (&children[0], &children[1]) {
                    (Expression::Attribute { name, data_type, .. }, Expression::Literal { value, .. }) => {
                        (name.clone(), *data_type, op.clone(), value.clone())
                    }
                    (Expression::Literal { value, .. }, Expression::Attribute { name, data_type, .. }) => {
                        (name.clone(), *data_type, swap_operator(op).to_string(), value.clone())
                    }
                    _ => {
                        return Err(ExpressionError::Malformed(
                            "filter atom must compare exactly one attribute with one literal".to_string(),
                        ))
                    }
                }
            }
            _ => {
                return Err(ExpressionError::Malformed(
                    "filter atom must be a binary comparison".to_string(),
                ))
            }
        };

        let value = match literal {
            LiteralValue::Value(v) => v,
            LiteralValue::Bool(_) => {
                return Err(ExpressionError::Malformed(
                    "filter atom literal must carry a typed value".to_string(),
                ))
            }
        };
        let _ = attr_type;

        let entry = bounds.entry(attr_name.clone()).or_insert_with(|| {
            let min = registry.min(&attr_name).cloned().unwrap_or_else(|_| value.clone());
            let max = registry.max(&attr_name).cloned().unwrap_or_else(|_| value.clone());
            Interval::new(min, false, max, false).expect("registry bounds are well ordered")
        });

        match op.as_str() {
            "gt" => entry.set_min(value.next().unwrap_or(value), false)?,
            "gte" => entry.set_min(value, false)?,
            "lt" => entry.set_max(value.prev().unwrap_or(value), false)?,
            "lte" => entry.set_max(value, false)?,
            "equal" => {
                entry.set_min(value.clone(), false)?;
                entry.set_max(value, false)?;
            }
            other => {
                return Err(ExpressionError::Malformed(format!(
                    "unsupported comparison operator `{other}` in filter atom"
                )))
            }
        }
    }

    Ok(Boundary::new(bounds))
}
