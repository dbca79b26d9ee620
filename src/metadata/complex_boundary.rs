//! Disjoint-interval generalization of [`Boundary`]: each attribute maps to
//! a small set of non-overlapping intervals rather than a single range,
//! used when boundaries from several blocks are combined and the union of
//! their ranges would otherwise be a poor (too loose) approximation.

use super::{Boundary, Interval, SetRelation};
use crate::errors::MetadataResult;
use crate::expression::Expression;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComplexBoundary {
    intervals: HashMap<String, Vec<Interval>>,
}

impl ComplexBoundary {
    pub fn new(intervals: HashMap<String, Vec<Interval>>) -> Self {
        Self { intervals }
    }

    pub fn get(&self, attribute: &str) -> Option<&[Interval]> {
        self.intervals.get(attribute).map(Vec::as_slice)
    }

    pub fn attributes(&self) -> HashSet<String> {
        self.intervals.keys().cloned().collect()
    }

    pub fn keep_attributes(&mut self, attributes: &HashSet<String>) {
        self.intervals.retain(|k, _| attributes.contains(k));
    }

    /// Builds a `ComplexBoundary` out of several `Boundary`s: per
    /// attribute mentioned in every input, merges touching/overlapping
    /// intervals with a single greedy left-to-right pass, then caps the
    /// interval count at `max_intervals` by repeatedly merging the pair
    /// whose union costs the least extra span ("extra distance" = the
    /// union's length minus the sum of the two intervals' own lengths).
    /// An attribute absent from any input boundary is dropped: a missing
    /// interval there is unconstrained and would make the per-attribute
    /// list meaningless.
    pub fn from_boundaries(boundaries: &[Boundary], max_intervals: usize) -> MetadataResult<ComplexBoundary> {
        if boundaries.is_empty() {
            return Ok(ComplexBoundary::default());
        }
        let mut common: HashSet<String> = boundaries[0].attributes();
        for b in &boundaries[1..] {
            common = common.intersection(&b.attributes()).cloned().collect();
        }

        let mut out = HashMap::new();
        for attr in common {
            let mut ivs: Vec<Interval> = boundaries
                .iter()
                .map(|b| b.get(&attr).expect("attribute known common").clone())
                .collect();
            ivs.sort_by(|a, b| a.low().cmp_value(b.low()).unwrap_or(Ordering::Equal));

            let mut merged: Vec<Interval> = Vec::new();
            for iv in ivs {
                match merged.last_mut() {
                    Some(last) if touches_or_overlaps(last, &iv)? => {
                        *last = Interval::union(&[last.clone(), iv])?;
                    }
                    _ => merged.push(iv),
                }
            }

            cap_intervals(&mut merged, max_intervals)?;
            out.insert(attr, merged);
        }
        Ok(ComplexBoundary::new(out))
    }

    fn relationship_single(&self, attr: &str, plain: &Interval) -> MetadataResult<SetRelation> {
        let Some(ivs) = self.intervals.get(attr) else {
            return Ok(SetRelation::Superset);
        };
        let mut rels = Vec::with_capacity(ivs.len());
        for iv in ivs {
            rels.push(iv.relationship(plain)?);
        }
        if rels.iter().all(|r| *r == SetRelation::Disjoint) {
            return Ok(SetRelation::Disjoint);
        }
        if rels.iter().filter(|r| **r == SetRelation::Equal).count() == 1 && rels.len() == 1 {
            return Ok(SetRelation::Equal);
        }
        if rels.iter().all(|r| *r == SetRelation::Subset) {
            return Ok(SetRelation::Subset);
        }
        let equal_or_superset_count = rels
            .iter()
            .filter(|r| matches!(r, SetRelation::Superset | SetRelation::Equal))
            .count();
        if equal_or_superset_count >= 1 {
            return Ok(SetRelation::Superset);
        }
        Ok(SetRelation::Intersect)
    }

    /// Relationship of this complex boundary against a plain `Boundary`,
    /// filling missing attributes with the registry the same way
    /// `Boundary::relationship` does.
    pub fn relationship(&self, other: &Boundary, registry: &crate::registry::Registry) -> MetadataResult<SetRelation> {
        let all_attrs: HashSet<String> = self.attributes().union(&other.attributes()).cloned().collect();
        let mut rel = SetRelation::Equal;
        for attr in &all_attrs {
            let plain = match other.get(attr) {
                Some(i) => i.clone(),
                None => Interval::new(registry.min(attr)?.clone(), false, registry.max(attr)?.clone(), false)?,
            };
            rel = rel.fold(self.relationship_single(attr, &plain)?);
            if rel == SetRelation::Disjoint {
                return Ok(SetRelation::Disjoint);
            }
        }
        Ok(rel)
    }

    /// Intersects with a plain `Boundary`, dropping any per-attribute
    /// sub-interval that ends up disjoint from the other side. An
    /// attribute absent from `other` passes through unchanged.
    pub fn intersect(&self, other: &Boundary) -> MetadataResult<ComplexBoundary> {
        let mut out = HashMap::new();
        for (attr, ivs) in &self.intervals {
            match other.get(attr) {
                Some(theirs) => {
                    let mut kept = Vec::new();
                    for iv in ivs {
                        if iv.relationship(theirs)? != SetRelation::Disjoint {
                            kept.push(iv.intersect(theirs)?);
                        }
                    }
                    out.insert(attr.clone(), kept);
                }
                None => {
                    out.insert(attr.clone(), ivs.clone());
                }
            }
        }
        Ok(ComplexBoundary::new(out))
    }

    /// OR across each attribute's interval list, AND across attributes.
    pub fn make_expression(&self) -> Expression {
        let mut names: Vec<&String> = self.intervals.keys().collect();
        names.sort();
        let per_attr: Vec<Expression> = names
            .iter()
            .map(|name| {
                let ivs = &self.intervals[*name];
                let exprs: Vec<Expression> = ivs.iter().map(|iv| iv.make_expression(name)).collect();
                Expression::connect_expression(&format!("{name}_or"), exprs, false, false)
            })
            .collect();
        Expression::connect_expression("complex_boundary_filter", per_attr, false, true)
    }
}

fn touches_or_overlaps(a: &Interval, b: &Interval) -> MetadataResult<bool> {
    if a.relationship(b)? != SetRelation::Disjoint {
        return Ok(true);
    }
    // "touching" means adjacent with no gap: a.high + 1 == b.low
    Ok(a.high().next().ok().map(|n| n == *b.low()).unwrap_or(false))
}

/// Repeatedly merges the pair of intervals whose union costs the least
/// "extra distance" (union length minus the sum of the two original
/// lengths) until at most `max_intervals` remain.
fn cap_intervals(ivs: &mut Vec<Interval>, max_intervals: usize) -> MetadataResult<()> {
    if max_intervals == 0 || ivs.len() <= max_intervals {
        return Ok(());
    }

    struct Candidate {
        extra: f64,
        i: usize,
        j: usize,
    }
    impl PartialEq for Candidate {
        fn eq(&self, o: &Self) -> bool {
            self.extra == o.extra
        }
    }
    impl Eq for Candidate {}
    impl PartialOrd for Candidate {
        fn partial_cmp(&self, o: &Self) -> Option<Ordering> {
            Some(self.cmp(o))
        }
    }
    impl Ord for Candidate {
        fn cmp(&self, o: &Self) -> Ordering {
            // min-heap via reversed ordering on a BinaryHeap (max-heap)
            o.extra.partial_cmp(&self.extra).unwrap_or(Ordering::Equal)
        }
    }

    while ivs.len() > max_intervals {
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::new();
        for i in 0..ivs.len() {
            for j in (i + 1)..ivs.len() {
                let union = Interval::union(&[ivs[i].clone(), ivs[j].clone()])?;
                let union_len = union.high().distance(union.low())?;
                let len_i = ivs[i].high().distance(ivs[i].low())?;
                let len_j = ivs[j].high().distance(ivs[j].low())?;
                heap.push(Candidate {
                    extra: union_len - len_i - len_j,
                    i,
                    j,
                });
            }
        }
        let best = heap.pop().expect("at least one pair when len > 1");
        let merged = Interval::union(&[ivs[best.i].clone(), ivs[best.j].clone()])?;
        let mut next = Vec::with_capacity(ivs.len() - 1);
        for (idx, iv) in ivs.iter().enumerate() {
            if idx != best.i && idx != best.j {
                next.push(iv.clone());
            }
        }
        next.push(merged);
        *ivs = next;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::collections::HashMap as Map;

    fn int(v: i64) -> Value {
        Value::Integer { value: v, bits: 32 }
    }

    fn iv(lo: i64, hi: i64) -> Interval {
        Interval::new(int(lo), false, int(hi), false).unwrap()
    }

    fn boundary(pairs: &[(&str, i64, i64)]) -> Boundary {
        let mut m = Map::new();
        for (name, lo, hi) in pairs {
            m.insert(name.to_string(), iv(*lo, *hi));
        }
        Boundary::new(m)
    }

    #[test]
    fn from_boundaries_merges_overlapping_ranges() {
        let cb = ComplexBoundary::from_boundaries(
            &[boundary(&[("a", 0, 10)]), boundary(&[("a", 5, 20)])],
            5,
        )
        .unwrap();
        let ivs = cb.get("a").unwrap();
        assert_eq!(ivs.len(), 1);
        assert_eq!(ivs[0].low(), &int(0));
        assert_eq!(ivs[0].high(), &int(20));
    }

    #[test]
    fn from_boundaries_keeps_disjoint_ranges_separate() {
        let cb = ComplexBoundary::from_boundaries(
            &[boundary(&[("a", 0, 10)]), boundary(&[("a", 100, 120)])],
            5,
        )
        .unwrap();
        assert_eq!(cb.get("a").unwrap().len(), 2);
    }

    #[test]
    fn cap_intervals_merges_down_to_the_limit() {
        let mut ivs = vec![iv(0, 5), iv(20, 25), iv(40, 45), iv(100, 105)];
        cap_intervals(&mut ivs, 2).unwrap();
        assert_eq!(ivs.len(), 2);
    }

    #[test]
    fn relationship_mixed_subset_and_disjoint_is_intersect() {
        let reg = crate::registry::Registry::new();
        let cb = ComplexBoundary::new(Map::from([("a".to_string(), vec![iv(0, 10), iv(100, 110)])]));
        // probe covers [0,20]: the first sub-interval is a SUBSET of it, the
        // second is DISJOINT from it — not all-SUBSET, so this must not
        // collapse to SUBSET.
        let probe = boundary(&[("a", 0, 20)]);
        assert_eq!(cb.relationship(&probe, &reg).unwrap(), SetRelation::Intersect);
    }

    #[test]
    fn relationship_all_disjoint_sub_intervals_is_disjoint() {
        let reg = crate::registry::Registry::new();
        let cb = ComplexBoundary::from_boundaries(
            &[boundary(&[("a", 0, 10)]), boundary(&[("a", 100, 120)])],
            5,
        )
        .unwrap();
        let probe = boundary(&[("a", 50, 60)]);
        assert_eq!(cb.relationship(&probe, &reg).unwrap(), SetRelation::Disjoint);
    }
}
