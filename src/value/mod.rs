//! The value domain: totally ordered scalars of a few kinds, each carrying
//! its own notion of `prev`/`next`, distance, signed subtraction and a
//! ratio-weighted midpoint. Continuous/unordered-successor kinds (boolean,
//! string, fixed-binary) simply refuse the operations that don't make sense
//! for them rather than returning a nonsense value.

use crate::errors::{ValueError, ValueResult};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Integer,
    Double,
    Boolean,
    StringEnum,
    String,
    FixedBinary,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Integer => "integer",
            DataType::Double => "double",
            DataType::Boolean => "boolean",
            DataType::StringEnum => "string_enum",
            DataType::String => "string",
            DataType::FixedBinary => "fixed_binary",
        };
        write!(f, "{s}")
    }
}

/// A shared, ordered vocabulary that `Value::StringEnum` indexes into.
/// Mirrors the original's process-wide string dictionary, but passed
/// explicitly rather than held behind a singleton.
#[derive(Debug, Default)]
pub struct StringEnumList {
    words: Vec<String>,
    index: HashMap<String, i64>,
}

impl StringEnumList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, word: &str) -> i64 {
        if let Some(i) = self.index.get(word) {
            return *i;
        }
        let i = self.words.len() as i64;
        self.words.push(word.to_string());
        self.index.insert(word.to_string(), i);
        i
    }

    pub fn get(&self, index: i64) -> Option<&str> {
        self.words.get(index as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Integer { value: i64, bits: u8 },
    Double { scaled: i64, precision: i32 },
    Boolean(bool),
    StringEnum { index: i64, vocab: Arc<StringEnumList> },
    String(String),
    FixedBinary(Vec<bool>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Integer { .. } => DataType::Integer,
            Value::Double { .. } => DataType::Double,
            Value::Boolean(_) => DataType::Boolean,
            Value::StringEnum { .. } => DataType::StringEnum,
            Value::String(_) => DataType::String,
            Value::FixedBinary(_) => DataType::FixedBinary,
        }
    }

    fn type_mismatch(&self, other: &Value) -> ValueError {
        ValueError::TypeMismatch {
            lhs: self.data_type().to_string(),
            rhs: other.data_type().to_string(),
        }
    }

    fn as_f64(&self) -> ValueResult<f64> {
        match self {
            Value::Integer { value, .. } => Ok(*value as f64),
            Value::Double { scaled, precision } => {
                Ok(*scaled as f64 / 10f64.powi(*precision))
            }
            other => Err(ValueError::UnsupportedOperation {
                op: "as_f64",
                kind: other.data_type().to_string(),
            }),
        }
    }

    /// Total order comparison. Requires identical kinds (and, for
    /// `Double`, identical precision).
    pub fn cmp_value(&self, other: &Value) -> ValueResult<Ordering> {
        match (self, other) {
            (Value::Integer { value: a, .. }, Value::Integer { value: b, .. }) => {
                Ok(a.cmp(b))
            }
            (
                Value::Double {
                    scaled: a,
                    precision: pa,
                },
                Value::Double {
                    scaled: b,
                    precision: pb,
                },
            ) => {
                if pa != pb {
                    return Err(ValueError::PrecisionMismatch {
                        lhs: *pa,
                        rhs: *pb,
                    });
                }
                Ok(a.cmp(b))
            }
            (Value::Boolean(a), Value::Boolean(b)) => Ok(a.cmp(b)),
            (Value::StringEnum { index: a, .. }, Value::StringEnum { index: b, .. }) => {
                Ok(a.cmp(b))
            }
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            (Value::FixedBinary(a), Value::FixedBinary(b)) => Ok(a.cmp(b)),
            _ => Err(self.type_mismatch(other)),
        }
    }

    /// The immediate predecessor value of the same kind. Undefined for
    /// boolean, string, and fixed-binary.
    pub fn prev(&self) -> ValueResult<Value> {
        match self {
            Value::Integer { value, bits } => Ok(Value::Integer {
                value: value - 1,
                bits: *bits,
            }),
            Value::Double { scaled, precision } => Ok(Value::Double {
                scaled: scaled - 1,
                precision: *precision,
            }),
            Value::StringEnum { index, vocab } => Ok(Value::StringEnum {
                index: index - 1,
                vocab: vocab.clone(),
            }),
            other => Err(ValueError::UnsupportedOperation {
                op: "prev",
                kind: other.data_type().to_string(),
            }),
        }
    }

    /// The immediate successor value of the same kind. Undefined for
    /// boolean, string, and fixed-binary.
    pub fn next(&self) -> ValueResult<Value> {
        match self {
            Value::Integer { value, bits } => Ok(Value::Integer {
                value: value + 1,
                bits: *bits,
            }),
            Value::Double { scaled, precision } => Ok(Value::Double {
                scaled: scaled + 1,
                precision: *precision,
            }),
            Value::StringEnum { index, vocab } => Ok(Value::StringEnum {
                index: index + 1,
                vocab: vocab.clone(),
            }),
            other => Err(ValueError::UnsupportedOperation {
                op: "next",
                kind: other.data_type().to_string(),
            }),
        }
    }

    /// Signed subtraction `self - other`, returned as `f64` (the original's
    /// "minius"). Undefined for string and fixed-binary.
    pub fn minius(&self, other: &Value) -> ValueResult<f64> {
        match (self, other) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                Err(ValueError::Unimplemented {
                    op: "minius",
                    kind: DataType::String.to_string(),
                })
            }
            (Value::FixedBinary(_), _) | (_, Value::FixedBinary(_)) => {
                Err(ValueError::Unimplemented {
                    op: "minius",
                    kind: DataType::FixedBinary.to_string(),
                })
            }
            _ => Ok(self.as_f64()? - other.as_f64()?),
        }
    }

    /// Distance between two values: `abs(minius) + 1`, always `>= 1`.
    pub fn distance(&self, other: &Value) -> ValueResult<f64> {
        Ok(self.minius(other)?.abs() + 1.0)
    }

    /// Weighted convex midpoint `self + ratio * (other - self)`,
    /// `ratio` in `[0, 1]`. Undefined for boolean, string, fixed-binary.
    pub fn middle(&self, other: &Value, ratio: f64) -> ValueResult<Value> {
        match (self, other) {
            (Value::Integer { bits, .. }, Value::Integer { .. }) => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                let m = a + ratio * (b - a);
                Ok(Value::Integer {
                    value: m.round() as i64,
                    bits: *bits,
                })
            }
            (
                Value::Double { precision: pa, .. },
                Value::Double { precision: pb, .. },
            ) => {
                if pa != pb {
                    return Err(ValueError::PrecisionMismatch {
                        lhs: *pa,
                        rhs: *pb,
                    });
                }
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                let m = a + ratio * (b - a);
                Ok(Value::Double {
                    scaled: (m * 10f64.powi(*pa)).round() as i64,
                    precision: *pa,
                })
            }
            (Value::Boolean(_), _) => Err(ValueError::UnsupportedOperation {
                op: "middle",
                kind: DataType::Boolean.to_string(),
            }),
            (Value::String(_), _) => Err(ValueError::UnsupportedOperation {
                op: "middle",
                kind: DataType::String.to_string(),
            }),
            (Value::FixedBinary(_), _) => Err(ValueError::UnsupportedOperation {
                op: "middle",
                kind: DataType::FixedBinary.to_string(),
            }),
            _ => Err(self.type_mismatch(other)),
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Value::Integer { value, .. } => value.to_string(),
            Value::Double { scaled, precision } => {
                format!("{}", *scaled as f64 / 10f64.powi(*precision))
            }
            Value::Boolean(b) => b.to_string(),
            Value::StringEnum { index, vocab } => {
                vocab.get(*index).unwrap_or("<unknown>").to_string()
            }
            Value::String(s) => s.clone(),
            Value::FixedBinary(bits) => bits
                .iter()
                .map(|b| if *b { '1' } else { '0' })
                .collect(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.cmp_value(other), Ok(Ordering::Equal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Value {
        Value::Integer { value: v, bits: 32 }
    }

    #[test]
    fn integer_prev_next_roundtrip() {
        let v = int(10);
        assert_eq!(v.next().unwrap().cmp_value(&int(11)).unwrap(), Ordering::Equal);
        assert_eq!(v.prev().unwrap().cmp_value(&int(9)).unwrap(), Ordering::Equal);
    }

    #[test]
    fn boolean_prev_next_unsupported() {
        let v = Value::Boolean(true);
        assert!(v.prev().is_err());
        assert!(v.next().is_err());
    }

    #[test]
    fn string_minius_unimplemented() {
        let a = Value::String("a".into());
        let b = Value::String("b".into());
        assert!(a.minius(&b).is_err());
        assert!(a.distance(&b).is_err());
        assert!(a.middle(&b, 0.5).is_err());
    }

    #[test]
    fn distance_is_always_at_least_one() {
        let a = int(0);
        let b = int(0);
        assert_eq!(a.distance(&b).unwrap(), 1.0);
    }

    #[test]
    fn middle_weighted_interpolation() {
        let a = int(0);
        let b = int(100);
        let m = a.middle(&b, 0.5).unwrap();
        assert_eq!(m.cmp_value(&int(50)).unwrap(), Ordering::Equal);
    }

    #[test]
    fn double_precision_mismatch_is_an_error() {
        let a = Value::Double {
            scaled: 100,
            precision: 2,
        };
        let b = Value::Double {
            scaled: 100,
            precision: 3,
        };
        assert!(a.cmp_value(&b).is_err());
    }

    #[test]
    fn cross_kind_compare_is_type_mismatch() {
        let a = int(1);
        let b = Value::Boolean(true);
        assert!(a.cmp_value(&b).is_err());
    }
}
