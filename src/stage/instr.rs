//! Instruction set for compiled routines
//!
//! A compiled routine is a table of procedures over flat value frames. Slots
//! are frame-local registers holding [`Value`]s; presence of a value is
//! tracked in separate boolean slots assigned at compile time, so the hot
//! path never re-inspects values for missingness.
//!
//! Control flow is expressed with labels: [`Instr::Mark`] is a
//! pseudo-instruction recording a position, resolved to a program counter
//! when the procedure is sealed. Procedures call each other two ways:
//! [`Instr::Call`] with a fresh frame (memoized subroutines, recursive
//! descent), and [`Instr::CallShared`] over the caller's frame (bodies split
//! off a long procedure).

use std::collections::HashMap;

use crate::ir::{AggOp, BinaryOp, ComparisonOp, UnaryOp};
use crate::types::VType;
use crate::value::Value;

/// Frame-local register index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(pub u32);

/// Branch target, resolved per procedure when sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Index into the routine's procedure table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcId(pub u32);

/// Index into the routine's interned literal pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LitId(pub u32);

/// Operations serviced by the host rather than the machine itself
#[derive(Debug, Clone, PartialEq)]
pub enum HostOp {
    /// Deterministic uniform draw; args `[lo, hi]`, keyed by the machine's
    /// partition seed and the draw-site uid
    RngUniform {
        /// Draw-site identifier baked in at compile time
        static_uid: u64,
    },
    /// Decode one stored index node; args `[offset]`, returns the node as a
    /// struct value
    IndexReadNode,
    /// Compare a stored key against a query bound; args `[key]`, returns
    /// `Bool(true)` when the key sorts left of the bound
    IndexKeyBeforeBound,
}

/// One machine instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Position marker; a no-op at run time
    Mark(Label),
    Jump(Label),
    /// Branch when the slot holds `Bool(true)`
    JumpIf { cond: Slot, target: Label },
    /// Branch when the slot holds `Bool(false)`
    JumpIfNot { cond: Slot, target: Label },

    LoadLit { dst: Slot, lit: LitId },
    LoadBool { dst: Slot, val: bool },
    Move { dst: Slot, src: Slot },
    /// `dst = Bool(src is missing)`
    TestMissing { dst: Slot, src: Slot },
    /// `dst = Bool(l or r)` over boolean slots
    BoolOr { dst: Slot, l: Slot, r: Slot },

    /// Arithmetic dispatched on the static result type from the tree
    Binary {
        op: BinaryOp,
        ty: VType,
        dst: Slot,
        l: Slot,
        r: Slot,
    },
    Unary { op: UnaryOp, dst: Slot, src: Slot },
    /// Comparison through the total value order
    Compare {
        op: ComparisonOp,
        dst: Slot,
        l: Slot,
        r: Slot,
    },

    ArrayNew { dst: Slot },
    ArrayPush { arr: Slot, src: Slot },
    ArrayLen { dst: Slot, arr: Slot },
    /// Bounds-checked element load; out of range is a user error
    ArrayGet { dst: Slot, arr: Slot, idx: Slot },
    ArraySort { dst: Slot, arr: Slot, ascending: bool },

    StructNew { dst: Slot, fields: Vec<Slot> },
    StructGet { dst: Slot, src: Slot, index: usize },
    TupleNew { dst: Slot, elems: Vec<Slot> },
    TupleGet { dst: Slot, src: Slot, index: usize },
    IntervalNew {
        dst: Slot,
        start: Slot,
        end: Slot,
        includes_start: bool,
        includes_end: bool,
    },

    Host {
        op: HostOp,
        dst: Slot,
        args: Vec<Slot>,
    },

    /// Reset an aggregator cell to its empty state. Emitted at the head of
    /// each aggregation site so a site re-entered inside a loop starts fresh.
    AggInit { cell: usize },
    /// Fold one value into an aggregator cell
    AggSeq { cell: usize, src: Slot },
    /// Read an aggregator cell's final value
    AggResult { dst: Slot, cell: usize },

    /// Invoke with a fresh frame; the callee's `Return` value lands in `dst`
    Call {
        proc: ProcId,
        args: Vec<Slot>,
        dst: Slot,
    },
    /// Invoke over the caller's frame (split procedure bodies)
    CallShared { proc: ProcId },
    Return { src: Slot },
    /// Return from a shared-frame invocation
    ReturnShared,
    /// Abort evaluation with a user error
    Fail { id: &'static str, msg: LitId },
}

/// One sealed procedure
#[derive(Debug, Clone)]
pub struct Proc {
    /// Instruction sequence, markers included
    pub code: Vec<Instr>,
    /// Label id to program counter, built when the procedure is sealed
    pub label_pc: HashMap<u32, usize>,
    /// Frame size; zero for shared-frame procedures
    pub n_slots: usize,
    /// Arguments occupy slots `0..n_args` of a fresh frame
    pub n_args: usize,
}

/// A complete compiled routine
#[derive(Debug, Clone)]
pub struct Program {
    pub procs: Vec<Proc>,
    /// Interned constants shared by all procedures
    pub literals: Vec<Value>,
    pub entry: ProcId,
    /// Aggregator cell layout, in allocation order
    pub agg_signature: Vec<AggOp>,
}

impl Program {
    /// Number of instructions across all procedures, markers excluded
    pub fn instr_count(&self) -> usize {
        self.procs
            .iter()
            .map(|p| {
                p.code
                    .iter()
                    .filter(|i| !matches!(i, Instr::Mark(_)))
                    .count()
            })
            .sum()
    }
}
