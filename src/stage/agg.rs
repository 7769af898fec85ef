//! Aggregator region
//!
//! Addressed storage for aggregation state used by compiled routines. Cells
//! are allocated at compile time in `StreamAgg` encounter order; the machine
//! addresses them by index with `AggSeq`/`AggResult`, never by name.
//!
//! Per-cell semantics must agree with the interpreter's running state
//! ([`crate::interp::AggState`]); the cross-path equivalence tests hold both
//! to it. Regions serialize with bincode so partial aggregates can cross a
//! partition boundary and be combined on the other side.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::ir::AggOp;
use crate::value::{cmp_values, Value};

/// Partial state of one aggregation site
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AggCell {
    op: AggOp,
    count: i64,
    sum_i: i64,
    sum_f: f64,
    saw_float: bool,
    best: Option<Value>,
    collected: Vec<Value>,
}

impl AggCell {
    fn new(op: AggOp) -> Self {
        AggCell {
            op,
            count: 0,
            sum_i: 0,
            sum_f: 0.0,
            saw_float: false,
            best: None,
            collected: Vec::new(),
        }
    }

    /// Missing values are skipped by every op except `CollectAsArray`.
    fn seq(&mut self, v: Value) {
        match self.op {
            AggOp::Count => {
                if !v.is_missing() {
                    self.count += 1;
                }
            }
            AggOp::Sum => match v {
                Value::Int32(x) => self.sum_i = self.sum_i.wrapping_add(i64::from(x)),
                Value::Int64(x) => self.sum_i = self.sum_i.wrapping_add(x),
                Value::Float64(x) => {
                    self.saw_float = true;
                    self.sum_f += x;
                }
                _ => {}
            },
            AggOp::Min => {
                if !v.is_missing()
                    && self
                        .best
                        .as_ref()
                        .map_or(true, |b| cmp_values(&v, b) == Ordering::Less)
                {
                    self.best = Some(v);
                }
            }
            AggOp::Max => {
                if !v.is_missing()
                    && self
                        .best
                        .as_ref()
                        .map_or(true, |b| cmp_values(&v, b) == Ordering::Greater)
                {
                    self.best = Some(v);
                }
            }
            AggOp::CollectAsArray => self.collected.push(v),
        }
    }

    /// Fold another partial state for the same site into this one. Collected
    /// arrays concatenate in argument order, so combining partitions in
    /// partition order preserves row order.
    fn combine(&mut self, other: &AggCell) {
        match self.op {
            AggOp::Count => self.count += other.count,
            AggOp::Sum => {
                self.sum_i = self.sum_i.wrapping_add(other.sum_i);
                self.sum_f += other.sum_f;
                self.saw_float |= other.saw_float;
            }
            AggOp::Min | AggOp::Max => {
                if let Some(b) = &other.best {
                    self.seq(b.clone());
                }
            }
            AggOp::CollectAsArray => self.collected.extend(other.collected.iter().cloned()),
        }
    }

    fn result(&self) -> Value {
        match self.op {
            AggOp::Count => Value::Int64(self.count),
            AggOp::Sum => {
                if self.saw_float {
                    Value::Float64(self.sum_f + self.sum_i as f64)
                } else {
                    Value::Int64(self.sum_i)
                }
            }
            AggOp::Min | AggOp::Max => self.best.clone().unwrap_or(Value::Missing),
            AggOp::CollectAsArray => Value::array(self.collected.clone()),
        }
    }
}

/// Addressed aggregator storage for one routine invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggRegion {
    cells: Vec<AggCell>,
}

impl AggRegion {
    /// Fresh region matching a routine's cell layout
    pub fn new(signature: &[AggOp]) -> Self {
        AggRegion {
            cells: signature.iter().map(|op| AggCell::new(*op)).collect(),
        }
    }

    /// Cell layout of this region
    pub fn signature(&self) -> Vec<AggOp> {
        self.cells.iter().map(|c| c.op).collect()
    }

    /// Reset cell `cell` to its empty state
    pub fn init(&mut self, cell: usize) -> EngineResult<()> {
        match self.cells.get_mut(cell) {
            Some(c) => {
                *c = AggCell::new(c.op);
                Ok(())
            }
            None => Err(EngineError::internal(
                "aggregation",
                format!("reset of unallocated cell {cell}"),
            )),
        }
    }

    /// Fold one value into cell `cell`
    pub fn seq(&mut self, cell: usize, v: Value) -> EngineResult<()> {
        match self.cells.get_mut(cell) {
            Some(c) => {
                c.seq(v);
                Ok(())
            }
            None => Err(EngineError::internal(
                "aggregation",
                format!("sequenced into unallocated cell {cell}"),
            )),
        }
    }

    /// Final value of cell `cell`
    pub fn result(&self, cell: usize) -> EngineResult<Value> {
        self.cells.get(cell).map(AggCell::result).ok_or_else(|| {
            EngineError::internal(
                "aggregation",
                format!("read of unallocated cell {cell}"),
            )
        })
    }

    /// Merge another region produced by the same routine, cell by cell
    pub fn combine(&mut self, other: &AggRegion) -> EngineResult<()> {
        if self.cells.len() != other.cells.len()
            || self
                .cells
                .iter()
                .zip(&other.cells)
                .any(|(a, b)| a.op != b.op)
        {
            return Err(EngineError::internal(
                "aggregation",
                "combined regions with different cell layouts",
            ));
        }
        for (a, b) in self.cells.iter_mut().zip(&other.cells) {
            a.combine(b);
        }
        Ok(())
    }

    /// Snapshot for transport across a partition boundary
    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Restore a transported snapshot
    pub fn from_bytes(bytes: &[u8]) -> EngineResult<AggRegion> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_skips_missing() {
        let mut r = AggRegion::new(&[AggOp::Count]);
        r.seq(0, Value::Int32(1)).unwrap();
        r.seq(0, Value::Missing).unwrap();
        r.seq(0, Value::Int32(2)).unwrap();
        assert_eq!(r.result(0).unwrap(), Value::Int64(2));
    }

    #[test]
    fn combine_matches_single_pass() {
        let mut whole = AggRegion::new(&[AggOp::Sum, AggOp::Min]);
        let mut left = AggRegion::new(&[AggOp::Sum, AggOp::Min]);
        let mut right = AggRegion::new(&[AggOp::Sum, AggOp::Min]);
        for i in 0..10i64 {
            whole.seq(0, Value::Int64(i)).unwrap();
            whole.seq(1, Value::Int64(i)).unwrap();
            let part = if i < 5 { &mut left } else { &mut right };
            part.seq(0, Value::Int64(i)).unwrap();
            part.seq(1, Value::Int64(i)).unwrap();
        }
        left.combine(&right).unwrap();
        assert_eq!(left.result(0).unwrap(), whole.result(0).unwrap());
        assert_eq!(left.result(1).unwrap(), whole.result(1).unwrap());
    }

    #[test]
    fn snapshot_round_trips() {
        let mut r = AggRegion::new(&[AggOp::CollectAsArray]);
        r.seq(0, Value::Int32(1)).unwrap();
        r.seq(0, Value::Missing).unwrap();
        let restored = AggRegion::from_bytes(&r.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.result(0).unwrap(), r.result(0).unwrap());
    }

    #[test]
    fn layout_mismatch_is_internal() {
        let mut a = AggRegion::new(&[AggOp::Count]);
        let b = AggRegion::new(&[AggOp::Sum]);
        assert!(a.combine(&b).unwrap_err().is_internal());
    }
}
