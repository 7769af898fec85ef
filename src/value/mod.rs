//! # Value Model
//!
//! Boxed runtime values produced by the interpreter and carried through
//! compiled-routine frames. Design points:
//!
//! - **Missingness is a value**: `Value::Missing` inhabits every type.
//!   Strict operations propagate it; non-strict operations (`Coalesce`,
//!   three-valued `And`/`Or`) handle it bespoke.
//! - **Structs are positional**: a struct value is a tuple of field values;
//!   field names live only in the virtual type.
//! - **Cheap clones**: containers and strings are `Arc`-shared. A value
//!   captured by a compiled routine is broadcast read-only across instances
//!   and never mutated post-construction.
//! - **Total order per type**: [`cmp_values`] orders same-typed values for
//!   index keys and merges; missing sorts after every present value.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::types::VType;

/// An interval with inclusivity flags on both endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalValue {
    pub start: Value,
    pub end: Value,
    pub includes_start: bool,
    pub includes_end: bool,
}

/// A boxed runtime value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Missing value (inhabits every type)
    Missing,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Str(Arc<str>),
    /// Packed diploid genotype code
    Call(u32),
    Array(Arc<Vec<Value>>),
    /// Positional struct; field names live in the virtual type
    Struct(Arc<Vec<Value>>),
    Tuple(Arc<Vec<Value>>),
    Interval(Arc<IntervalValue>),
}

impl Value {
    /// String value
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    /// Array value
    pub fn array(elems: Vec<Value>) -> Self {
        Value::Array(Arc::new(elems))
    }

    /// Struct value from field values in declaration order
    pub fn struct_(fields: Vec<Value>) -> Self {
        Value::Struct(Arc::new(fields))
    }

    /// Tuple value
    pub fn tuple(elems: Vec<Value>) -> Self {
        Value::Tuple(Arc::new(elems))
    }

    /// Interval value
    pub fn interval(start: Value, end: Value, includes_start: bool, includes_end: bool) -> Self {
        Value::Interval(Arc::new(IntervalValue {
            start,
            end,
            includes_start,
            includes_end,
        }))
    }

    /// Genomic locus key: `{ contig: Str, position: Int32 }`
    pub fn locus(contig: &str, position: i32) -> Self {
        Value::struct_(vec![Value::str(contig), Value::Int32(position)])
    }

    /// True iff this is `Missing`
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// Extract a bool, if present and boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract an i64, widening Int32
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Extract an f64, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(f64::from(*v)),
            Value::Int64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// Positional fields of a struct or tuple
    pub fn fields(&self) -> Option<&[Value]> {
        match self {
            Value::Struct(fs) | Value::Tuple(fs) => Some(fs),
            _ => None,
        }
    }

    /// Elements of an array
    pub fn elems(&self) -> Option<&[Value]> {
        match self {
            Value::Array(es) => Some(es),
            _ => None,
        }
    }

    /// Check that a present value physically matches a virtual type.
    /// `Missing` matches every type.
    pub fn matches(&self, typ: &VType) -> bool {
        match (self, typ) {
            (Value::Missing, _) => true,
            (Value::Bool(_), VType::Bool) => true,
            (Value::Int32(_), VType::Int32) => true,
            (Value::Int64(_), VType::Int64) => true,
            (Value::Float64(_), VType::Float64) => true,
            (Value::Str(_), VType::Str) => true,
            (Value::Call(_), VType::Call) => true,
            (Value::Array(es), VType::Array(elem) | VType::Stream(elem)) => {
                es.iter().all(|e| e.matches(elem))
            }
            (Value::Struct(vs), VType::Struct(fs)) => {
                vs.len() == fs.len() && vs.iter().zip(fs).all(|(v, (_, t))| v.matches(t))
            }
            (Value::Tuple(vs), VType::Tuple(ts)) => {
                vs.len() == ts.len() && vs.iter().zip(ts).all(|(v, t)| v.matches(t))
            }
            (Value::Interval(iv), VType::Interval(p)) => {
                iv.start.matches(p) && iv.end.matches(p)
            }
            _ => false,
        }
    }
}

/// Total order over same-typed values.
///
/// Missing sorts after every present value. Floats use IEEE total order so
/// NaN has a stable position. Structs, tuples and arrays compare
/// lexicographically; a shorter container that is a prefix of a longer one
/// sorts first.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Missing, Value::Missing) => Ordering::Equal,
        (Value::Missing, _) => Ordering::Greater,
        (_, Value::Missing) => Ordering::Less,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int32(x), Value::Int32(y)) => x.cmp(y),
        (Value::Int64(x), Value::Int64(y)) => x.cmp(y),
        (Value::Float64(x), Value::Float64(y)) => x.total_cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::Call(x), Value::Call(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => cmp_slices(x, y),
        (Value::Struct(x), Value::Struct(y)) => cmp_slices(x, y),
        (Value::Tuple(x), Value::Tuple(y)) => cmp_slices(x, y),
        (Value::Interval(x), Value::Interval(y)) => cmp_values(&x.start, &y.start)
            .then_with(|| cmp_values(&x.end, &y.end))
            .then_with(|| x.includes_start.cmp(&y.includes_start))
            .then_with(|| x.includes_end.cmp(&y.includes_end)),
        // Mixed physical types never reach an ordering site on a
        // constructor-validated tree.
        _ => Ordering::Equal,
    }
}

fn cmp_slices(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = cmp_values(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => write!(f, "NA"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "\"{s}\""),
            Value::Call(c) => write!(f, "Call({c})"),
            Value::Array(es) => {
                write!(f, "[")?;
                for (i, e) in es.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, "]")
            }
            Value::Struct(fs) => {
                write!(f, "{{")?;
                for (i, v) in fs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "}}")
            }
            Value::Tuple(fs) => {
                write!(f, "(")?;
                for (i, v) in fs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Value::Interval(iv) => {
                let open = if iv.includes_start { '[' } else { '(' };
                let close = if iv.includes_end { ']' } else { ')' };
                write!(f, "{open}{}, {}{close}", iv.start, iv.end)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sorts_last() {
        assert_eq!(
            cmp_values(&Value::Int32(5), &Value::Missing),
            Ordering::Less
        );
        assert_eq!(
            cmp_values(&Value::Missing, &Value::Int32(5)),
            Ordering::Greater
        );
        assert_eq!(
            cmp_values(&Value::Missing, &Value::Missing),
            Ordering::Equal
        );
    }

    #[test]
    fn struct_prefix_sorts_first() {
        let short = Value::struct_(vec![Value::str("chr1")]);
        let long = Value::struct_(vec![Value::str("chr1"), Value::Int32(100)]);
        assert_eq!(cmp_values(&short, &long), Ordering::Less);
    }

    #[test]
    fn locus_keys_order_by_contig_then_position() {
        let a = Value::locus("chr1", 500);
        let b = Value::locus("chr1", 900);
        let c = Value::locus("chr2", 100);
        assert_eq!(cmp_values(&a, &b), Ordering::Less);
        assert_eq!(cmp_values(&b, &c), Ordering::Less);
    }

    #[test]
    fn float_ordering_is_total() {
        assert_eq!(
            cmp_values(&Value::Float64(f64::NAN), &Value::Float64(f64::NAN)),
            Ordering::Equal
        );
        assert_eq!(
            cmp_values(&Value::Float64(1.0), &Value::Float64(f64::INFINITY)),
            Ordering::Less
        );
    }

    #[test]
    fn matches_validates_shape() {
        let t = VType::struct_of(vec![("contig", VType::Str), ("position", VType::Int32)]);
        assert!(Value::locus("chr3", 7).matches(&t));
        assert!(Value::Missing.matches(&t));
        assert!(!Value::Int32(7).matches(&t));
    }

    #[test]
    fn display_round_trips_visually() {
        let v = Value::interval(Value::Int32(1), Value::Int32(5), true, false);
        assert_eq!(v.to_string(), "[1, 5)");
        assert_eq!(Value::Missing.to_string(), "NA");
    }
}
