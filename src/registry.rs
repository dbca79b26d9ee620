//! Process-wide context the original kept behind static singletons: the
//! table-wide min/max value per attribute, and the well-known synthetic
//! column names the plan builder weaves through every scan parameter. An
//! explicit struct threaded through call sites instead of a singleton.

use crate::errors::{SchemaError, SchemaResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const TUPLE_ID: &str = "tid";
pub const BLOCK_ID: &str = "block_id";
pub const PASSED_PREDS: &str = "passed_preds";
pub const DIRECT_MEASURES: &str = "direct_measures";
pub const POSSIBLE_MEASURES: &str = "possible_measures";
pub const VALID_ATTRIBUTES: &str = "valid_attributes";

/// Which reconstruction strategy `produce_plan` lowers a query into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructStrategy {
    Aggregate,
    Join,
}

/// Which physical-operator vocabulary a plan targets. Affects only how
/// `produce_plan::helper` names operators (e.g. whether an `exchange`
/// boundary is inserted before a union); the relational shape is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Arrow,
    Velox,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    bounds: HashMap<String, (Value, Value)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_min_max(&mut self, attribute: impl Into<String>, min: Value, max: Value) {
        self.bounds.insert(attribute.into(), (min, max));
    }

    pub fn min(&self, attribute: &str) -> SchemaResult<&Value> {
        self.bounds
            .get(attribute)
            .map(|(min, _)| min)
            .ok_or_else(|| SchemaError::NotFound(attribute.to_string()))
    }

    pub fn max(&self, attribute: &str) -> SchemaResult<&Value> {
        self.bounds
            .get(attribute)
            .map(|(_, max)| max)
            .ok_or_else(|| SchemaError::NotFound(attribute.to_string()))
    }

    pub fn attributes(&self) -> HashSet<String> {
        self.bounds.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_attribute_min_max_is_not_found() {
        let reg = Registry::new();
        assert!(reg.min("a").is_err());
        assert!(reg.max("a").is_err());
    }

    #[test]
    fn round_trips_set_bounds() {
        let mut reg = Registry::new();
        reg.set_min_max(
            "a",
            Value::Integer { value: 0, bits: 32 },
            Value::Integer {
                value: 100,
                bits: 32,
            },
        );
        assert_eq!(reg.min("a").unwrap().cmp_value(&Value::Integer { value: 0, bits: 32 }).unwrap(), std::cmp::Ordering::Equal);
    }
}
