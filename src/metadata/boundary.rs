//! A per-attribute map of `Interval`s: the boundary a block or a query's
//! filter predicate carves out of the table's value space. An attribute
//! absent from the map is unconstrained — in relationship comparisons a
//! missing interval behaves as the superset of anything.

use super::{Interval, SetRelation};
use crate::errors::MetadataResult;
use crate::expression::Expression;
use crate::registry::Registry;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Boundary {
    intervals: HashMap<String, Interval>,
}

impl Boundary {
    pub fn new(intervals: HashMap<String, Interval>) -> Self {
        Self { intervals }
    }

    pub fn get(&self, attribute: &str) -> Option<&Interval> {
        self.intervals.get(attribute)
    }

    pub fn intervals(&self) -> &HashMap<String, Interval> {
        &self.intervals
    }

    pub fn attributes(&self) -> HashSet<String> {
        self.intervals.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn erase(&mut self, attribute: &str) {
        self.intervals.remove(attribute);
    }

    pub fn keep_attributes(&mut self, attributes: &HashSet<String>) {
        self.intervals.retain(|k, _| attributes.contains(k));
    }

    fn interval_or_registry(&self, attribute: &str, registry: &Registry) -> MetadataResult<Interval> {
        match self.intervals.get(attribute) {
            Some(i) => Ok(i.clone()),
            None => Ok(Interval::new(
                registry.min(attribute)?.clone(),
                false,
                registry.max(attribute)?.clone(),
                false,
            )?),
        }
    }

    /// Relationship of this boundary to `other`, filling any attribute
    /// missing from either side with its table-wide min/max before folding
    /// the per-attribute relations together (a missing interval behaves as
    /// the superset of anything it's compared against).
    pub fn relationship(&self, other: &Boundary, registry: &Registry) -> MetadataResult<SetRelation> {
        let all_attrs: HashSet<String> = self.attributes().union(&other.attributes()).cloned().collect();
        let mut rel = SetRelation::Equal;
        for attr in &all_attrs {
            let mine = self.interval_or_registry(attr, registry)?;
            let theirs = other.interval_or_registry(attr, registry)?;
            rel = rel.fold(mine.relationship(&theirs)?);
            if rel == SetRelation::Disjoint {
                return Ok(SetRelation::Disjoint);
            }
        }
        Ok(rel)
    }

    pub fn intersect(&self, other: &Boundary) -> MetadataResult<Boundary> {
        let mut out = HashMap::new();
        for (attr, mine) in &self.intervals {
            if let Some(theirs) = other.intervals.get(attr) {
                out.insert(attr.clone(), mine.intersect(theirs)?);
            } else {
                out.insert(attr.clone(), mine.clone());
            }
        }
        for (attr, theirs) in &other.intervals {
            out.entry(attr.clone()).or_insert_with(|| theirs.clone());
        }
        Ok(Boundary::new(out))
    }

    /// Fraction of `self` that `other` overlaps, folded across every
    /// attribute present in `self` (attributes `other` lacks don't
    /// constrain, so they don't shrink the ratio).
    pub fn intersection_ratio(&self, other: &Boundary) -> MetadataResult<f64> {
        let mut ratio = 1.0;
        for (attr, mine) in &self.intervals {
            if let Some(theirs) = other.intervals.get(attr) {
                ratio *= mine.intersection_ratio(theirs)?;
            }
        }
        Ok(ratio)
    }

    pub fn split(&self, attribute: &str, point: &crate::value::Value, point_goes_left: bool) -> MetadataResult<Vec<Boundary>> {
        let Some(interval) = self.intervals.get(attribute) else {
            return Ok(Vec::new());
        };
        let parts = interval.split(point, point_goes_left)?;
        if parts.is_empty() {
            return Ok(Vec::new());
        }
        Ok(parts
            .into_iter()
            .map(|p| {
                let mut m = self.intervals.clone();
                m.insert(attribute.to_string(), p);
                Boundary::new(m)
            })
            .collect())
    }

    pub fn make_expression(&self) -> Expression {
        let mut names: Vec<&String> = self.intervals.keys().collect();
        names.sort();
        let exprs: Vec<Expression> = names
            .iter()
            .map(|name| self.intervals[*name].make_expression(name))
            .collect();
        Expression::connect_expression("boundary_filter", exprs, false, true)
    }

    /// The bounding boundary of a set of boundaries: per attribute, the
    /// union of the intervals from every input that mentions it. An
    /// attribute missing from even one input is dropped entirely, since a
    /// missing interval there is unconstrained and would swallow the union.
    pub fn union(boundaries: &[Boundary]) -> MetadataResult<Boundary> {
        if boundaries.is_empty() {
            return Ok(Boundary::default());
        }
        let mut common: HashSet<String> = boundaries[0].attributes();
        for b in &boundaries[1..] {
            common = common.intersection(&b.attributes()).cloned().collect();
        }
        let mut out = HashMap::new();
        for attr in common {
            let ivs: Vec<Interval> = boundaries
                .iter()
                .map(|b| b.intervals[&attr].clone())
                .collect();
            out.insert(attr, Interval::union(&ivs)?);
        }
        Ok(Boundary::new(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn int(v: i64) -> Value {
        Value::Integer { value: v, bits: 32 }
    }

    fn iv(lo: i64, hi: i64) -> Interval {
        Interval::new(int(lo), false, int(hi), false).unwrap()
    }

    fn boundary(pairs: &[(&str, i64, i64)]) -> Boundary {
        let mut m = HashMap::new();
        for (name, lo, hi) in pairs {
            m.insert(name.to_string(), iv(*lo, *hi));
        }
        Boundary::new(m)
    }

    #[test]
    fn relationship_missing_attribute_acts_as_superset() {
        let mut reg = Registry::new();
        reg.set_min_max("b", int(0), int(100));
        let a = boundary(&[("a", 0, 10)]);
        let b = boundary(&[("a", 2, 5), ("b", 0, 100)]);
        // a is unconstrained on b (acts as full range), and [0,10] superset of [2,5] on a
        assert_eq!(a.relationship(&b, &reg).unwrap(), SetRelation::Superset);
    }

    #[test]
    fn intersect_keeps_attributes_present_on_either_side() {
        let a = boundary(&[("a", 0, 10), ("b", 0, 5)]);
        let b = boundary(&[("a", 5, 15)]);
        let inter = a.intersect(&b).unwrap();
        assert_eq!(inter.get("a").unwrap().low(), &int(5));
        assert_eq!(inter.get("b").unwrap().low(), &int(0));
    }

    #[test]
    fn union_drops_attributes_not_common_to_all() {
        let a = boundary(&[("a", 0, 10), ("b", 0, 10)]);
        let b = boundary(&[("a", 5, 20)]);
        let u = Boundary::union(&[a, b]).unwrap();
        assert!(u.get("a").is_some());
        assert!(u.get("b").is_none());
        assert_eq!(u.get("a").unwrap().high(), &int(20));
    }

    #[test]
    fn keep_attributes_filters_map() {
        let mut b = boundary(&[("a", 0, 10), ("b", 0, 10)]);
        let keep: HashSet<String> = ["a".to_string()].into_iter().collect();
        b.keep_attributes(&keep);
        assert!(b.get("a").is_some());
        assert!(b.get("b").is_none());
    }
}
