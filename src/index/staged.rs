//! Compiled index descent
//!
//! The tree descent of [`IndexReader::bound_query`] expressed as a compiled
//! routine: one recursive procedure that reads a node through a host hook,
//! scans its entries against the bound, and either returns a leaf position
//! or calls itself on a child offset. Node decoding and bound comparison
//! stay on the host side ([`DescentHost`]); the routine only sees nodes as
//! plain tuple values.
//!
//! Inside a compiled pipeline this is what an index probe per row looks
//! like; the standalone reader exists for interpreted plans and tooling.

use crate::error::{EngineError, EngineResult};
use crate::ir::{BinaryOp, ComparisonOp};
use crate::stage::{CodeBuilder, HostHooks, HostOp, Instr, Machine, Program, Slot};
use crate::types::VType;
use crate::value::Value;

use super::{key_before_bound, Bound, IndexNode, IndexReader};

/// Host side of a descent: node reads through the reader's cache, bound
/// comparisons against one fixed bound
struct DescentHost<'r> {
    reader: &'r mut IndexReader,
    bound: Bound,
}

impl HostHooks for DescentHost<'_> {
    fn call(&mut self, op: &HostOp, args: &[Value]) -> EngineResult<Value> {
        match op {
            HostOp::IndexReadNode => {
                let offset = match args {
                    [Value::Int64(o)] if *o >= 0 => *o as u64,
                    _ => {
                        return Err(EngineError::internal(
                            "index_descent",
                            format!("node read with bad offset {args:?}"),
                        ))
                    }
                };
                Ok(node_as_value(&*self.reader.node(offset)?))
            }
            HostOp::IndexKeyBeforeBound => match args {
                [key] => Ok(Value::Bool(key_before_bound(key, &self.bound))),
                _ => Err(EngineError::internal(
                    "index_descent",
                    format!("bound comparison with {} arguments", args.len()),
                )),
            },
            HostOp::RngUniform { .. } => Err(EngineError::internal(
                "index_descent",
                "rng draw routed to the index host",
            )),
        }
    }
}

/// `(is_leaf, [(key, payload)])`; the payload is an absolute key index for
/// leaf entries and a child offset for internal ones
fn node_as_value(node: &IndexNode) -> Value {
    match node {
        IndexNode::Leaf { first_idx, entries } => Value::tuple(vec![
            Value::Bool(true),
            Value::array(
                entries
                    .iter()
                    .enumerate()
                    .map(|(i, e)| {
                        Value::tuple(vec![
                            e.key.clone(),
                            Value::Int64((first_idx + i as u64) as i64),
                        ])
                    })
                    .collect(),
            ),
        ]),
        IndexNode::Internal { entries } => Value::tuple(vec![
            Value::Bool(false),
            Value::array(
                entries
                    .iter()
                    .map(|e| {
                        Value::tuple(vec![
                            e.first_key.clone(),
                            Value::Int64(e.child_offset as i64),
                        ])
                    })
                    .collect(),
            ),
        ]),
    }
}

/// An [`IndexReader`] driven by a compiled descent routine
pub struct StagedIndexReader {
    reader: IndexReader,
    program: Program,
}

impl StagedIndexReader {
    pub fn new(reader: IndexReader) -> EngineResult<StagedIndexReader> {
        Ok(StagedIndexReader {
            reader,
            program: build_descent()?,
        })
    }

    /// Number of stored keys sorting before `bound`
    pub fn bound_query(&mut self, bound: &Bound) -> EngineResult<u64> {
        if self.reader.metadata().n_keys == 0 {
            return Ok(0);
        }
        let root = self.reader.metadata().root_offset;
        let mut host = DescentHost {
            reader: &mut self.reader,
            bound: bound.clone(),
        };
        let result = Machine::new(&self.program, 0, None, Some(&mut host))
            .run(&[Value::Int64(root as i64)])?;
        match result {
            Value::Int64(p) if p >= 0 => Ok(p as u64),
            other => Err(EngineError::internal(
                "index_descent",
                format!("descent produced {other} instead of a position"),
            )),
        }
    }

    /// Position of the first key not less than `key`
    pub fn lower_bound(&mut self, key: &Value) -> EngineResult<u64> {
        self.bound_query(&Bound::start(key.clone(), true))
    }

    /// Position one past the last key not greater than `key`
    pub fn upper_bound(&mut self, key: &Value) -> EngineResult<u64> {
        self.bound_query(&Bound::end(key.clone(), true))
    }

    /// Key range selected by an interval: `(start position, key count)`
    pub fn query_interval(
        &mut self,
        start: &Value,
        end: &Value,
        includes_start: bool,
        includes_end: bool,
    ) -> EngineResult<(u64, u64)> {
        let lo = self.bound_query(&Bound::start(start.clone(), includes_start))?;
        let hi = self.bound_query(&Bound::end(end.clone(), includes_end))?;
        if hi < lo {
            return Err(EngineError::internal(
                "index_descent",
                format!("interval bounds crossed: start position {lo}, end position {hi}"),
            ));
        }
        Ok((lo, hi - lo))
    }

    /// The wrapped reader, for metadata and cache inspection
    pub fn reader(&self) -> &IndexReader {
        &self.reader
    }

    /// Close the underlying reader; further queries fail
    pub fn close(&mut self) {
        self.reader.close();
    }
}

/// Build the descent routine: `descend(offset) -> position`
fn build_descent() -> EngineResult<Program> {
    let mut b = CodeBuilder::new(1024);
    let entry = b.ensure_proc("index_descent", 1, |b| {
        // Memoization hands back this procedure's own id for the recursive
        // call; the generator is never re-entered.
        let self_id = b.ensure_proc("index_descent", 1, |_| {
            Err(EngineError::internal("index_descent", "generator re-entered"))
        })?;
        let offset = Slot(0);
        let res = b.slot();
        let end = b.label();

        let node = b.slot();
        b.push(Instr::Host {
            op: HostOp::IndexReadNode,
            dst: node,
            args: vec![offset],
        });
        let entries = b.slot();
        b.push(Instr::TupleGet {
            dst: entries,
            src: node,
            index: 1,
        });
        let n = b.slot();
        b.push(Instr::ArrayLen { dst: n, arr: entries });

        let zero = b.slot();
        let zero_lit = b.lit(Value::Int32(0));
        b.push(Instr::LoadLit { dst: zero, lit: zero_lit });
        let one = b.slot();
        let one_lit = b.lit(Value::Int32(1));
        b.push(Instr::LoadLit { dst: one, lit: one_lit });
        let i = b.slot();
        b.push(Instr::Move { dst: i, src: zero });

        // Entries are sorted, so the scan stops at the first key that does
        // not sort before the bound.
        let scan = b.label();
        let scanned = b.label();
        let t = b.slot();
        b.push(Instr::Mark(scan));
        b.push(Instr::Compare {
            op: ComparisonOp::Ge,
            dst: t,
            l: i,
            r: n,
        });
        b.push(Instr::JumpIf { cond: t, target: scanned });
        let entry_v = b.slot();
        b.push(Instr::ArrayGet {
            dst: entry_v,
            arr: entries,
            idx: i,
        });
        let key = b.slot();
        b.push(Instr::TupleGet {
            dst: key,
            src: entry_v,
            index: 0,
        });
        let before = b.slot();
        b.push(Instr::Host {
            op: HostOp::IndexKeyBeforeBound,
            dst: before,
            args: vec![key],
        });
        b.push(Instr::JumpIfNot {
            cond: before,
            target: scanned,
        });
        b.push(Instr::Binary {
            op: BinaryOp::Add,
            ty: VType::Int32,
            dst: i,
            l: i,
            r: one,
        });
        b.push(Instr::Jump(scan));
        b.push(Instr::Mark(scanned));

        let is_leaf = b.slot();
        b.push(Instr::TupleGet {
            dst: is_leaf,
            src: node,
            index: 0,
        });
        let internal_l = b.label();
        b.push(Instr::JumpIfNot {
            cond: is_leaf,
            target: internal_l,
        });

        // Leaf: the entry at the scan position carries the answer; past the
        // end, the answer is one past the last entry's position.
        let leaf_all = b.label();
        b.push(Instr::Compare {
            op: ComparisonOp::Lt,
            dst: t,
            l: i,
            r: n,
        });
        b.push(Instr::JumpIfNot { cond: t, target: leaf_all });
        b.push(Instr::ArrayGet {
            dst: entry_v,
            arr: entries,
            idx: i,
        });
        b.push(Instr::TupleGet {
            dst: res,
            src: entry_v,
            index: 1,
        });
        b.push(Instr::Jump(end));
        b.push(Instr::Mark(leaf_all));
        let last = b.slot();
        b.push(Instr::Binary {
            op: BinaryOp::Sub,
            ty: VType::Int32,
            dst: last,
            l: n,
            r: one,
        });
        b.push(Instr::ArrayGet {
            dst: entry_v,
            arr: entries,
            idx: last,
        });
        b.push(Instr::TupleGet {
            dst: res,
            src: entry_v,
            index: 1,
        });
        let one64 = b.slot();
        let one64_lit = b.lit(Value::Int64(1));
        b.push(Instr::LoadLit {
            dst: one64,
            lit: one64_lit,
        });
        b.push(Instr::Binary {
            op: BinaryOp::Add,
            ty: VType::Int64,
            dst: res,
            l: res,
            r: one64,
        });
        b.push(Instr::Jump(end));

        // Internal: descend into the last child starting before the bound,
        // child 0 when none does.
        b.push(Instr::Mark(internal_l));
        let child = b.slot();
        b.push(Instr::Move { dst: child, src: zero });
        let have_child = b.label();
        b.push(Instr::Compare {
            op: ComparisonOp::Gt,
            dst: t,
            l: i,
            r: zero,
        });
        b.push(Instr::JumpIfNot {
            cond: t,
            target: have_child,
        });
        b.push(Instr::Binary {
            op: BinaryOp::Sub,
            ty: VType::Int32,
            dst: child,
            l: i,
            r: one,
        });
        b.push(Instr::Mark(have_child));
        b.push(Instr::ArrayGet {
            dst: entry_v,
            arr: entries,
            idx: child,
        });
        let child_offset = b.slot();
        b.push(Instr::TupleGet {
            dst: child_offset,
            src: entry_v,
            index: 1,
        });
        b.push(Instr::Call {
            proc: self_id,
            args: vec![child_offset],
            dst: res,
        });

        b.push(Instr::Mark(end));
        Ok(res)
    })?;
    b.finish(entry, Vec::new())
}
