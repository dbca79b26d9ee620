//! A closed `[low, high]` range over a single attribute's value domain.

use super::SetRelation;
use crate::errors::{MetadataError, MetadataResult};
use crate::expression::Expression;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    low: Value,
    high: Value,
}

impl Interval {
    /// Builds `[low, high]`, closing an open endpoint via `Value::next`/
    /// `Value::prev`. Fails if the resulting bound order is inverted or if
    /// the endpoint kind does not support `next`/`prev`.
    pub fn new(low: Value, low_open: bool, high: Value, high_open: bool) -> MetadataResult<Self> {
        let low = if low_open { low.next()? } else { low };
        let high = if high_open { high.prev()? } else { high };
        if low.cmp_value(&high)? == std::cmp::Ordering::Greater {
            return Err(MetadataError::IntervalInvariant(format!(
                "low {} is greater than high {}",
                low.to_display_string(),
                high.to_display_string()
            )));
        }
        Ok(Self { low, high })
    }

    /// Builds `[low, high]` without endpoint adjustment or ordering checks;
    /// used internally where the caller has already established the
    /// invariant (e.g. `intersect`, `split`).
    fn new_closed(low: Value, high: Value) -> Self {
        Self { low, high }
    }

    pub fn low(&self) -> &Value {
        &self.low
    }

    pub fn high(&self) -> &Value {
        &self.high
    }

    pub fn set_min(&mut self, value: Value, open: bool) -> MetadataResult<()> {
        self.low = if open { value.next()? } else { value };
        Ok(())
    }

    pub fn set_max(&mut self, value: Value, open: bool) -> MetadataResult<()> {
        self.high = if open { value.prev()? } else { value };
        Ok(())
    }

    /// `EQUAL` / `SUBSET` (this fully inside other) / `SUPERSET` (this
    /// fully contains other) / `INTERSECT` / `DISJOINT`.
    pub fn relationship(&self, other: &Interval) -> MetadataResult<SetRelation> {
        let max_low = if self.low.cmp_value(&other.low)? == std::cmp::Ordering::Greater {
            &self.low
        } else {
            &other.low
        };
        let min_high = if self.high.cmp_value(&other.high)? == std::cmp::Ordering::Less {
            &self.high
        } else {
            &other.high
        };
        if max_low.cmp_value(min_high)? == std::cmp::Ordering::Greater {
            return Ok(SetRelation::Disjoint);
        }
        let cmp_low = self.low.cmp_value(&other.low)?;
        let cmp_high = self.high.cmp_value(&other.high)?;
        use std::cmp::Ordering::*;
        Ok(match (cmp_low, cmp_high) {
            (Equal, Equal) => SetRelation::Equal,
            (Greater | Equal, Less | Equal) => SetRelation::Subset,
            (Less | Equal, Greater | Equal) => SetRelation::Superset,
            _ => SetRelation::Intersect,
        })
    }

    /// Overlap of two non-disjoint intervals.
    pub fn intersect(&self, other: &Interval) -> MetadataResult<Interval> {
        if self.relationship(other)? == SetRelation::Disjoint {
            return Err(MetadataError::IntervalInvariant(
                "cannot intersect disjoint intervals".to_string(),
            ));
        }
        let low = if self.low.cmp_value(&other.low)? == std::cmp::Ordering::Greater {
            self.low.clone()
        } else {
            other.low.clone()
        };
        let high = if self.high.cmp_value(&other.high)? == std::cmp::Ordering::Less {
            self.high.clone()
        } else {
            other.high.clone()
        };
        Ok(Interval::new_closed(low, high))
    }

    /// Fraction of `self`'s span that `other` overlaps, in `(0, 1]`.
    pub fn intersection_ratio(&self, other: &Interval) -> MetadataResult<f64> {
        let inter = self.intersect(other)?;
        let inter_dist = inter.high.distance(&inter.low)?;
        let self_dist = self.high.distance(&self.low)?;
        if inter_dist <= 0.0 || self_dist <= 0.0 || inter_dist > self_dist {
            return Err(MetadataError::IntervalInvariant(
                "invalid interval distance in intersection_ratio".to_string(),
            ));
        }
        Ok(inter_dist / self_dist)
    }

    /// Splits at `point`. `point_goes_left` decides which side `point` ends
    /// up in. Returns an empty vec if `point` is outside this interval or
    /// sits against the wrong edge for the requested side.
    pub fn split(&self, point: &Value, point_goes_left: bool) -> MetadataResult<Vec<Interval>> {
        let cmp_low = point.cmp_value(&self.low)?;
        let cmp_high = point.cmp_value(&self.high)?;
        use std::cmp::Ordering::*;
        if cmp_low == Less
            || cmp_high == Greater
            || (cmp_low == Equal && !point_goes_left)
            || (cmp_high == Equal && point_goes_left)
        {
            return Ok(Vec::new());
        }
        let left_high = if point_goes_left {
            point.clone()
        } else {
            point.prev()?
        };
        let right_low = if point_goes_left {
            point.next()?
        } else {
            point.clone()
        };
        Ok(vec![
            Interval::new_closed(self.low.clone(), left_high),
            Interval::new_closed(right_low, self.high.clone()),
        ])
    }

    /// The smallest interval covering every member of `intervals`.
    pub fn union(intervals: &[Interval]) -> MetadataResult<Interval> {
        let mut iter = intervals.iter();
        let first = iter
            .next()
            .ok_or_else(|| MetadataError::IntervalInvariant("union of empty set".to_string()))?;
        let mut low = first.low.clone();
        let mut high = first.high.clone();
        for i in iter {
            if i.low.cmp_value(&low)? == std::cmp::Ordering::Less {
                low = i.low.clone();
            }
            if i.high.cmp_value(&high)? == std::cmp::Ordering::Greater {
                high = i.high.clone();
            }
        }
        Ok(Interval::new_closed(low, high))
    }

    /// `attr >= low AND attr <= high` as an expression tree.
    pub fn make_expression(&self, attribute_name: &str) -> Expression {
        use crate::expression::LiteralValue;
        let data_type = self.low.data_type();
        let attr = Expression::Attribute {
            name: attribute_name.to_string(),
            data_type,
            size_hint: None,
        };
        let left = Expression::Function {
            name: format!("left_filter_{attribute_name}"),
            op: "gte".to_string(),
            children: vec![
                attr.clone(),
                Expression::Literal {
                    name: format!("left_{attribute_name}"),
                    value: LiteralValue::Value(self.low.clone()),
                },
            ],
            data_type: crate::value::DataType::Boolean,
            nullable: false,
        };
        let right = Expression::Function {
            name: format!("right_filter_{attribute_name}"),
            op: "lte".to_string(),
            children: vec![
                attr,
                Expression::Literal {
                    name: format!("right_{attribute_name}"),
                    value: LiteralValue::Value(self.high.clone()),
                },
            ],
            data_type: crate::value::DataType::Boolean,
            nullable: false,
        };
        Expression::Function {
            name: format!("filter_{attribute_name}"),
            op: "and".to_string(),
            children: vec![left, right],
            data_type: crate::value::DataType::Boolean,
            nullable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Value {
        Value::Integer { value: v, bits: 32 }
    }

    fn iv(lo: i64, hi: i64) -> Interval {
        Interval::new(int(lo), false, int(hi), false).unwrap()
    }

    #[test]
    fn relationship_equal_subset_superset_disjoint() {
        assert_eq!(iv(0, 10).relationship(&iv(0, 10)).unwrap(), SetRelation::Equal);
        assert_eq!(iv(2, 5).relationship(&iv(0, 10)).unwrap(), SetRelation::Subset);
        assert_eq!(iv(0, 10).relationship(&iv(2, 5)).unwrap(), SetRelation::Superset);
        assert_eq!(iv(0, 5).relationship(&iv(3, 10)).unwrap(), SetRelation::Intersect);
        assert_eq!(iv(0, 5).relationship(&iv(6, 10)).unwrap(), SetRelation::Disjoint);
    }

    #[test]
    fn open_endpoint_closes_via_next_prev() {
        let i = Interval::new(int(0), true, int(10), true).unwrap();
        assert_eq!(i.low().cmp_value(&int(1)).unwrap(), std::cmp::Ordering::Equal);
        assert_eq!(i.high().cmp_value(&int(9)).unwrap(), std::cmp::Ordering::Equal);
    }

    #[test]
    fn inverted_bounds_is_an_error() {
        assert!(Interval::new(int(10), false, int(0), false).is_err());
    }

    #[test]
    fn intersect_disjoint_is_an_error() {
        assert!(iv(0, 5).intersect(&iv(6, 10)).is_err());
    }

    #[test]
    fn split_round_trip_conserves_span() {
        let parts = iv(0, 10).split(&int(5), true).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].low().cmp_value(&int(0)).unwrap(), std::cmp::Ordering::Equal);
        assert_eq!(parts[0].high().cmp_value(&int(5)).unwrap(), std::cmp::Ordering::Equal);
        assert_eq!(parts[1].low().cmp_value(&int(6)).unwrap(), std::cmp::Ordering::Equal);
        assert_eq!(parts[1].high().cmp_value(&int(10)).unwrap(), std::cmp::Ordering::Equal);
    }

    #[test]
    fn split_outside_range_is_empty() {
        assert!(iv(0, 10).split(&int(20), true).unwrap().is_empty());
    }

    #[test]
    fn union_spans_all_members() {
        let u = Interval::union(&[iv(0, 5), iv(10, 20), iv(3, 7)]).unwrap();
        assert_eq!(u.low().cmp_value(&int(0)).unwrap(), std::cmp::Ordering::Equal);
        assert_eq!(u.high().cmp_value(&int(20)).unwrap(), std::cmp::Ordering::Equal);
    }

    #[test]
    fn intersection_ratio_is_fraction_of_self() {
        let ratio = iv(0, 10).intersection_ratio(&iv(5, 10)).unwrap();
        assert!((ratio - (6.0 / 11.0)).abs() < 1e-9);
    }
}
