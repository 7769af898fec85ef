//! # Virtual Type System
//!
//! Virtual types describe the shape of values flowing through the IR,
//! independent of any physical encoding. Every IR node derives its virtual
//! type structurally from its children at construction time; the type is
//! never revised afterwards.
//!
//! Struct field order is significant: all consumers address fields
//! positionally, names exist for construction and diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Virtual type of an IR node or runtime value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VType {
    /// No value (statements, `Die` in value position)
    Void,
    Bool,
    Int32,
    Int64,
    Float64,
    Str,
    /// Packed diploid genotype code
    Call,
    /// Ordered sequence, fully materialized
    Array(Box<VType>),
    /// Ordered sequence with single-pass pull semantics; only the staged
    /// evaluator gives this a genuine lazy encoding
    Stream(Box<VType>),
    /// Named fields, positionally addressed
    Struct(Vec<(String, VType)>),
    /// Unnamed fields, positionally addressed
    Tuple(Vec<VType>),
    /// Interval over a point type, with endpoint inclusivity flags
    Interval(Box<VType>),
}

impl VType {
    /// Array of `elem`
    pub fn array(elem: VType) -> Self {
        VType::Array(Box::new(elem))
    }

    /// Stream of `elem`
    pub fn stream(elem: VType) -> Self {
        VType::Stream(Box::new(elem))
    }

    /// Struct from (name, type) pairs
    pub fn struct_of(fields: Vec<(&str, VType)>) -> Self {
        VType::Struct(
            fields
                .into_iter()
                .map(|(n, t)| (n.to_string(), t))
                .collect(),
        )
    }

    /// Interval over `point`
    pub fn interval(point: VType) -> Self {
        VType::Interval(Box::new(point))
    }

    /// True for Int32/Int64/Float64
    pub fn is_numeric(&self) -> bool {
        matches!(self, VType::Int32 | VType::Int64 | VType::Float64)
    }

    /// True if a concrete value of this type can exist at runtime. Streams
    /// and Void are control-flow constructs; using one where a value is
    /// required is a code-generator bug.
    pub fn is_realizable(&self) -> bool {
        !matches!(self, VType::Stream(_) | VType::Void)
    }

    /// Element type of an Array or Stream
    pub fn elem_type(&self) -> Option<&VType> {
        match self {
            VType::Array(e) | VType::Stream(e) => Some(e),
            _ => None,
        }
    }

    /// Positional index of a struct field
    pub fn field_index(&self, name: &str) -> Option<usize> {
        match self {
            VType::Struct(fields) => fields.iter().position(|(n, _)| n == name),
            _ => None,
        }
    }

    /// Type of a struct field
    pub fn field_type(&self, name: &str) -> Option<&VType> {
        match self {
            VType::Struct(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, t)| t),
            _ => None,
        }
    }

    /// Numeric join for binary arithmetic: the wider operand type wins.
    /// Both operands must already be numeric.
    pub fn arith_join(&self, other: &VType) -> Option<VType> {
        if !self.is_numeric() || !other.is_numeric() {
            return None;
        }
        Some(match (self, other) {
            (VType::Float64, _) | (_, VType::Float64) => VType::Float64,
            (VType::Int64, _) | (_, VType::Int64) => VType::Int64,
            _ => VType::Int32,
        })
    }
}

impl fmt::Display for VType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VType::Void => write!(f, "Void"),
            VType::Bool => write!(f, "Bool"),
            VType::Int32 => write!(f, "Int32"),
            VType::Int64 => write!(f, "Int64"),
            VType::Float64 => write!(f, "Float64"),
            VType::Str => write!(f, "Str"),
            VType::Call => write!(f, "Call"),
            VType::Array(e) => write!(f, "Array[{e}]"),
            VType::Stream(e) => write!(f, "Stream[{e}]"),
            VType::Interval(p) => write!(f, "Interval[{p}]"),
            VType::Struct(fields) => {
                write!(f, "Struct{{")?;
                for (i, (n, t)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{n}: {t}")?;
                }
                write!(f, "}}")
            }
            VType::Tuple(elems) => {
                write!(f, "Tuple(")?;
                for (i, t) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arith_join_widens() {
        assert_eq!(VType::Int32.arith_join(&VType::Int32), Some(VType::Int32));
        assert_eq!(VType::Int32.arith_join(&VType::Int64), Some(VType::Int64));
        assert_eq!(
            VType::Int64.arith_join(&VType::Float64),
            Some(VType::Float64)
        );
        assert_eq!(VType::Bool.arith_join(&VType::Int32), None);
    }

    #[test]
    fn streams_are_not_realizable() {
        assert!(!VType::stream(VType::Int32).is_realizable());
        assert!(!VType::Void.is_realizable());
        assert!(VType::array(VType::Int32).is_realizable());
    }

    #[test]
    fn struct_fields_are_positional() {
        let t = VType::struct_of(vec![("locus", VType::Int64), ("alleles", VType::Str)]);
        assert_eq!(t.field_index("alleles"), Some(1));
        assert_eq!(t.field_type("locus"), Some(&VType::Int64));
        assert_eq!(t.field_index("missing"), None);
    }

    #[test]
    fn display_is_stable() {
        let t = VType::struct_of(vec![("a", VType::array(VType::Int32))]);
        assert_eq!(t.to_string(), "Struct{a: Array[Int32]}");
    }
}
