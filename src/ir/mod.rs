//! # Expression IR
//!
//! The algebraic tree describing a computation prior to execution, shared by
//! the interpreter, the optimizer and the staged evaluator.
//!
//! ```text
//! front end -> IrNode -> [Optimizer] -> IrNode -> interpret | compile
//! ```
//!
//! Design rules:
//!
//! - **Immutable, copy-on-write**: rewrites build new nodes, never mutate.
//! - **Typed at construction**: every smart constructor validates child types
//!   and derives the node's virtual type. [`IrNode::typ`] is a pure
//!   structural function of the children; it is never revised after
//!   construction.
//! - **Closed kind set**: consumers match exhaustively, so adding a kind is
//!   a compile error until the interpreter, every optimizer rule and the
//!   staged evaluator handle it.
//! - **Strictness is declared per kind** ([`IrNode::is_strict`]): a strict
//!   node is missing whenever any strict child is missing. The optimizer's
//!   null-propagation rule and the staged evaluator's missingness slots both
//!   key off this flag.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{error_id, EngineError, EngineResult};
use crate::types::VType;
use crate::value::Value;

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Integer operands: truncating division (zero divisor is a user error).
    /// Float operands: IEEE division.
    Div,
    /// Modulo (zero divisor is a user error on integers)
    Mod,
    /// Always produces Float64
    Pow,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    /// Strict boolean negation (unlike `And`/`Or`, which are three-valued)
    Not,
}

/// Comparison operators over any realizable type, via the total value order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Aggregation operators for `StreamAgg`. Serializable because aggregator
/// region snapshots carry the op alongside the partial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggOp {
    Count,
    Sum,
    Min,
    Max,
    CollectAsArray,
}

/// Zip length policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZipBehavior {
    /// Stop at the shortest input
    TakeMinLength,
    /// Inputs must have equal length; mismatch is a user error
    AssertSameLength,
}

/// An IR tree node.
///
/// Children are boxed and ordered; arity is fixed per kind. Binding forms
/// carry the bound-variable name. Variants are public for matching, but
/// trees must be built through the smart constructors so type validation
/// happens at construction time.
#[derive(Debug, Clone, PartialEq)]
pub enum IrNode {
    // ----- literals -----
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(String),
    /// Typed missing literal
    NA(VType),
    Void,
    /// Broadcast constant captured by compiled routines
    Literal { value: Value, typ: VType },

    // ----- bindings -----
    Ref { name: String, typ: VType },
    Let { name: String, value: Box<IrNode>, body: Box<IrNode> },
    /// Binds in the aggregation channel, not the plain evaluation channel
    AggLet { name: String, value: Box<IrNode>, body: Box<IrNode> },

    // ----- arithmetic / comparison -----
    ApplyBinaryPrimOp { op: BinaryOp, l: Box<IrNode>, r: Box<IrNode> },
    ApplyUnaryPrimOp { op: UnaryOp, x: Box<IrNode> },
    ApplyComparisonOp { op: ComparisonOp, l: Box<IrNode>, r: Box<IrNode> },

    // ----- control flow -----
    If { cond: Box<IrNode>, cnsq: Box<IrNode>, altr: Box<IrNode> },
    /// First non-missing argument (non-strict)
    Coalesce(Vec<IrNode>),
    IsNA(Box<IrNode>),
    /// Kleene and: `false && NA == false`
    And { l: Box<IrNode>, r: Box<IrNode> },
    /// Kleene or: `true || NA == true`
    Or { l: Box<IrNode>, r: Box<IrNode> },
    /// User-facing fatal error with a stable identifier
    Die { message: String, typ: VType },

    // ----- arrays -----
    MakeArray { elems: Vec<IrNode>, elem_type: VType },
    ArrayRef { a: Box<IrNode>, i: Box<IrNode> },
    ArrayLen(Box<IrNode>),
    ArraySort { a: Box<IrNode>, ascending: bool },
    ToArray(Box<IrNode>),
    ToStream(Box<IrNode>),

    // ----- streams -----
    StreamRange { start: Box<IrNode>, stop: Box<IrNode>, step: Box<IrNode> },
    StreamMap { s: Box<IrNode>, name: String, body: Box<IrNode> },
    StreamFilter { s: Box<IrNode>, name: String, cond: Box<IrNode> },
    StreamFlatMap { s: Box<IrNode>, name: String, body: Box<IrNode> },
    StreamTakeWhile { s: Box<IrNode>, name: String, cond: Box<IrNode> },
    StreamZip {
        streams: Vec<IrNode>,
        names: Vec<String>,
        body: Box<IrNode>,
        behavior: ZipBehavior,
    },
    StreamFold {
        s: Box<IrNode>,
        zero: Box<IrNode>,
        accum_name: String,
        value_name: String,
        body: Box<IrNode>,
    },
    /// K-way merge of pre-sorted streams into one globally sorted stream.
    /// Ties break deterministically by input index.
    StreamMultiMerge(Vec<IrNode>),
    /// Aggregate `value` (under the element binder) across a stream
    StreamAgg {
        s: Box<IrNode>,
        name: String,
        op: AggOp,
        value: Box<IrNode>,
    },

    // ----- structs / tuples -----
    MakeStruct { fields: Vec<(String, IrNode)> },
    GetField { o: Box<IrNode>, name: String },
    InsertFields { o: Box<IrNode>, fields: Vec<(String, IrNode)> },
    SelectFields { o: Box<IrNode>, names: Vec<String> },
    MakeTuple(Vec<IrNode>),
    GetTupleElement { o: Box<IrNode>, idx: usize },

    // ----- intervals -----
    MakeInterval {
        start: Box<IrNode>,
        end: Box<IrNode>,
        includes_start: bool,
        includes_end: bool,
    },

    // ----- randomness -----
    /// Uniform draw from the per-partition seeded RNG. `static_uid`
    /// distinguishes draw sites so rewrites cannot silently merge them.
    ApplyRngUniform { static_uid: u64, lo: Box<IrNode>, hi: Box<IrNode> },

    // ----- relational -----
    /// `n_rows` rows `{ idx: Int64 }` split over `n_partitions`
    TableRange { n_rows: i64, n_partitions: usize },
    TableFilter { child: Box<IrNode>, name: String, pred: Box<IrNode> },
    TableMapRows { child: Box<IrNode>, name: String, new_row: Box<IrNode> },
    TableKeyBy { child: Box<IrNode>, keys: Vec<String> },
    TableCount(Box<IrNode>),
    TableCollect(Box<IrNode>),
}

fn type_error(node: &str, expected: impl fmt::Display, actual: impl fmt::Display) -> EngineError {
    EngineError::user(
        error_id::TYPE_ERROR,
        format!("{node}: expected {expected}, found {actual}"),
    )
}

impl IrNode {
    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    /// Derive the node's virtual type structurally.
    ///
    /// On a constructor-validated tree this cannot fail; it re-validates on
    /// the way so that a malformed hand-built tree fails immediately with a
    /// type error naming the offending node. The walk keeps its own stack,
    /// so derivation depth is bounded by the heap, not the call stack.
    pub fn typ(&self) -> EngineResult<VType> {
        enum Step<'a> {
            Enter(&'a IrNode),
            Exit(&'a IrNode, usize),
        }
        let mut work = vec![Step::Enter(self)];
        let mut derived: Vec<VType> = Vec::new();
        while let Some(step) = work.pop() {
            match step {
                Step::Enter(node) => {
                    let children = node.children();
                    work.push(Step::Exit(node, children.len()));
                    for c in children.into_iter().rev() {
                        work.push(Step::Enter(c));
                    }
                }
                Step::Exit(node, n_children) => {
                    let at = derived.len() - n_children;
                    let t = node.typ_from_children(&derived[at..])?;
                    derived.truncate(at);
                    derived.push(t);
                }
            }
        }
        derived
            .pop()
            .ok_or_else(|| EngineError::internal("typing", "derivation yielded no type"))
    }

    /// One typing step: this node's type from its children's already-derived
    /// types, given in [`IrNode::children`] order.
    fn typ_from_children(&self, ct: &[VType]) -> EngineResult<VType> {
        use IrNode::*;
        match self {
            I32(_) => Ok(VType::Int32),
            I64(_) => Ok(VType::Int64),
            F64(_) => Ok(VType::Float64),
            Bool(_) => Ok(VType::Bool),
            Str(_) => Ok(VType::Str),
            NA(t) => Ok(t.clone()),
            Void => Ok(VType::Void),
            Literal { typ, .. } => Ok(typ.clone()),

            Ref { typ, .. } => Ok(typ.clone()),
            Let { .. } | AggLet { .. } => Ok(ct[1].clone()),

            ApplyBinaryPrimOp { op, .. } => {
                let (lt, rt) = (&ct[0], &ct[1]);
                if *op == BinaryOp::Pow {
                    if lt.is_numeric() && rt.is_numeric() {
                        return Ok(VType::Float64);
                    }
                    return Err(type_error("ApplyBinaryPrimOp(Pow)", "numeric operands", format!("{lt}, {rt}")));
                }
                lt.arith_join(rt)
                    .ok_or_else(|| type_error("ApplyBinaryPrimOp", "numeric operands", format!("{lt}, {rt}")))
            }
            ApplyUnaryPrimOp { op, .. } => {
                let xt = &ct[0];
                match op {
                    UnaryOp::Negate if xt.is_numeric() => Ok(xt.clone()),
                    UnaryOp::Not if *xt == VType::Bool => Ok(VType::Bool),
                    _ => Err(type_error("ApplyUnaryPrimOp", "numeric or Bool", xt)),
                }
            }
            ApplyComparisonOp { .. } => {
                let (lt, rt) = (&ct[0], &ct[1]);
                if lt != rt {
                    return Err(type_error("ApplyComparisonOp", lt, rt));
                }
                if !lt.is_realizable() {
                    return Err(type_error("ApplyComparisonOp", "realizable operand type", lt));
                }
                Ok(VType::Bool)
            }

            If { .. } => {
                if ct[0] != VType::Bool {
                    return Err(type_error("If", VType::Bool, &ct[0]));
                }
                let (tt, ft) = (&ct[1], &ct[2]);
                if tt != ft {
                    return Err(type_error("If branches", tt, ft));
                }
                Ok(tt.clone())
            }
            Coalesce(_) => {
                let first = ct
                    .first()
                    .ok_or_else(|| type_error("Coalesce", "at least one argument", "none"))?;
                for at in &ct[1..] {
                    if at != first {
                        return Err(type_error("Coalesce", first, at));
                    }
                }
                Ok(first.clone())
            }
            IsNA(_) => Ok(VType::Bool),
            And { .. } | Or { .. } => {
                for t in ct {
                    if *t != VType::Bool {
                        return Err(type_error("And/Or", VType::Bool, t));
                    }
                }
                Ok(VType::Bool)
            }
            Die { typ, .. } => Ok(typ.clone()),

            MakeArray { elem_type, .. } => {
                for et in ct {
                    if et != elem_type {
                        return Err(type_error("MakeArray", elem_type, et));
                    }
                }
                Ok(VType::array(elem_type.clone()))
            }
            ArrayRef { .. } => {
                if ct[1] != VType::Int32 {
                    return Err(type_error("ArrayRef index", VType::Int32, &ct[1]));
                }
                match &ct[0] {
                    VType::Array(elem) => Ok((**elem).clone()),
                    other => Err(type_error("ArrayRef", "Array", other)),
                }
            }
            ArrayLen(_) => match &ct[0] {
                VType::Array(_) => Ok(VType::Int32),
                other => Err(type_error("ArrayLen", "Array", other)),
            },
            ArraySort { .. } => match &ct[0] {
                t @ VType::Array(_) => Ok(t.clone()),
                other => Err(type_error("ArraySort", "Array", other)),
            },
            ToArray(_) => match &ct[0] {
                VType::Stream(elem) => Ok(VType::Array(elem.clone())),
                other => Err(type_error("ToArray", "Stream", other)),
            },
            ToStream(_) => match &ct[0] {
                VType::Array(elem) => Ok(VType::Stream(elem.clone())),
                other => Err(type_error("ToStream", "Array", other)),
            },

            StreamRange { .. } => {
                for (label, t) in ["start", "stop", "step"].iter().zip(ct) {
                    if *t != VType::Int32 {
                        return Err(type_error(&format!("StreamRange {label}"), VType::Int32, t));
                    }
                }
                Ok(VType::stream(VType::Int32))
            }
            StreamMap { .. } => {
                expect_stream(&ct[0], "StreamMap")?;
                Ok(VType::stream(ct[1].clone()))
            }
            StreamFilter { .. } => {
                let elem = expect_stream(&ct[0], "StreamFilter")?;
                if ct[1] != VType::Bool {
                    return Err(type_error("StreamFilter cond", VType::Bool, &ct[1]));
                }
                Ok(VType::stream(elem))
            }
            StreamFlatMap { .. } => {
                expect_stream(&ct[0], "StreamFlatMap")?;
                match &ct[1] {
                    t @ VType::Stream(_) => Ok(t.clone()),
                    other => Err(type_error("StreamFlatMap body", "Stream", other)),
                }
            }
            StreamTakeWhile { .. } => {
                let elem = expect_stream(&ct[0], "StreamTakeWhile")?;
                if ct[1] != VType::Bool {
                    return Err(type_error("StreamTakeWhile cond", VType::Bool, &ct[1]));
                }
                Ok(VType::stream(elem))
            }
            StreamZip { .. } => {
                // Children are the input streams followed by the body.
                let (body, streams) = ct.split_last().ok_or_else(|| {
                    type_error("StreamZip", "at least a body", "none")
                })?;
                for s in streams {
                    expect_stream(s, "StreamZip")?;
                }
                Ok(VType::stream(body.clone()))
            }
            StreamFold { .. } => {
                expect_stream(&ct[0], "StreamFold")?;
                let (zt, bt) = (&ct[1], &ct[2]);
                if zt != bt {
                    return Err(type_error("StreamFold accumulator", zt, bt));
                }
                Ok(zt.clone())
            }
            StreamMultiMerge(_) => {
                let first = ct
                    .first()
                    .ok_or_else(|| type_error("StreamMultiMerge", "at least one stream", "none"))?;
                for st in &ct[1..] {
                    if st != first {
                        return Err(type_error("StreamMultiMerge", first, st));
                    }
                }
                match first {
                    VType::Stream(_) => Ok(first.clone()),
                    other => Err(type_error("StreamMultiMerge", "Stream", other)),
                }
            }
            StreamAgg { op, .. } => {
                expect_stream(&ct[0], "StreamAgg")?;
                let vt = &ct[1];
                match op {
                    AggOp::Count => Ok(VType::Int64),
                    AggOp::Sum => match vt {
                        // Integer sums widen to Int64; float sums stay Float64
                        VType::Int32 | VType::Int64 => Ok(VType::Int64),
                        VType::Float64 => Ok(VType::Float64),
                        other => Err(type_error("StreamAgg(Sum)", "numeric", other)),
                    },
                    AggOp::Min | AggOp::Max => Ok(vt.clone()),
                    AggOp::CollectAsArray => Ok(VType::array(vt.clone())),
                }
            }

            MakeStruct { fields } => Ok(VType::Struct(
                fields
                    .iter()
                    .zip(ct)
                    .map(|((n, _), t)| (n.clone(), t.clone()))
                    .collect(),
            )),
            GetField { name, .. } => {
                let ot = &ct[0];
                ot.field_type(name)
                    .cloned()
                    .ok_or_else(|| type_error("GetField", format!("struct with field '{name}'"), ot))
            }
            InsertFields { fields, .. } => {
                let VType::Struct(mut fts) = ct[0].clone() else {
                    return Err(type_error("InsertFields", "Struct", &ct[0]));
                };
                for ((n, _), vt) in fields.iter().zip(&ct[1..]) {
                    match fts.iter_mut().find(|(fname, _)| fname == n) {
                        Some(slot) => slot.1 = vt.clone(),
                        None => fts.push((n.clone(), vt.clone())),
                    }
                }
                Ok(VType::Struct(fts))
            }
            SelectFields { names, .. } => {
                let ot = &ct[0];
                let mut fts = Vec::with_capacity(names.len());
                for n in names {
                    let ft = ot
                        .field_type(n)
                        .ok_or_else(|| type_error("SelectFields", format!("struct with field '{n}'"), ot))?;
                    fts.push((n.clone(), ft.clone()));
                }
                Ok(VType::Struct(fts))
            }
            MakeTuple(_) => Ok(VType::Tuple(ct.to_vec())),
            GetTupleElement { idx, .. } => {
                let ot = &ct[0];
                match ot {
                    VType::Tuple(ts) if *idx < ts.len() => Ok(ts[*idx].clone()),
                    _ => Err(type_error("GetTupleElement", format!("tuple with arity > {idx}"), ot)),
                }
            }

            MakeInterval { .. } => {
                let (st, et) = (&ct[0], &ct[1]);
                if st != et {
                    return Err(type_error("MakeInterval", st, et));
                }
                Ok(VType::interval(st.clone()))
            }

            ApplyRngUniform { .. } => {
                for t in ct {
                    if *t != VType::Float64 {
                        return Err(type_error("ApplyRngUniform", VType::Float64, t));
                    }
                }
                Ok(VType::Float64)
            }

            TableRange { .. } => Ok(VType::stream(VType::struct_of(vec![("idx", VType::Int64)]))),
            TableFilter { .. } => {
                expect_table(&ct[0], "TableFilter")?;
                if ct[1] != VType::Bool {
                    return Err(type_error("TableFilter pred", VType::Bool, &ct[1]));
                }
                Ok(ct[0].clone())
            }
            TableMapRows { .. } => {
                expect_table(&ct[0], "TableMapRows")?;
                if !matches!(ct[1], VType::Struct(_)) {
                    return Err(type_error("TableMapRows row", "Struct", &ct[1]));
                }
                Ok(VType::stream(ct[1].clone()))
            }
            TableKeyBy { keys, .. } => {
                let row = expect_table(&ct[0], "TableKeyBy")?;
                for k in keys {
                    if row.field_index(k).is_none() {
                        return Err(type_error("TableKeyBy", format!("row field '{k}'"), row));
                    }
                }
                Ok(ct[0].clone())
            }
            TableCount(_) => {
                expect_table(&ct[0], "TableCount")?;
                Ok(VType::Int64)
            }
            TableCollect(_) => {
                let row = expect_table(&ct[0], "TableCollect")?;
                Ok(VType::array(row.clone()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Classifiers
    // ------------------------------------------------------------------

    /// Missing-in implies missing-out for this node's strict children.
    ///
    /// Non-strict kinds implement bespoke missingness: `Coalesce` returns the
    /// first non-missing argument, `And`/`Or` are three-valued, `IsNA`
    /// observes missingness, `If` only requires the condition.
    pub fn is_strict(&self) -> bool {
        use IrNode::*;
        !matches!(
            self,
            Coalesce(_)
                | IsNA(_)
                | And { .. }
                | Or { .. }
                | If { .. }
                | NA(_)
                | Literal { .. }
                | Die { .. }
                | Let { .. }
                | AggLet { .. }
                | Ref { .. }
                // Constructors hold missing components without becoming
                // missing themselves.
                | MakeArray { .. }
                | MakeStruct { .. }
                | MakeTuple(_)
                | InsertFields { .. }
                | StreamMap { .. }
                | StreamFilter { .. }
                | StreamFlatMap { .. }
                | StreamTakeWhile { .. }
                | StreamZip { .. }
                | StreamFold { .. }
                | StreamAgg { .. }
                | TableRange { .. }
                | TableFilter { .. }
                | TableMapRows { .. }
                | TableKeyBy { .. }
                | TableCount(_)
                | TableCollect(_)
        )
    }

    /// Static interpret-vs-compile partition consulted by the dispatcher.
    ///
    /// Relational nodes (one-shot global operations, I/O) only ever go to
    /// the interpreter; everything else may be staged.
    pub fn is_compilable(&self) -> bool {
        use IrNode::*;
        let here = match self {
            TableRange { .. }
            | TableFilter { .. }
            | TableMapRows { .. }
            | TableKeyBy { .. }
            | TableCount(_)
            | TableCollect(_) => false,
            // Streams exist only as fused loops in compiled routines; a
            // stream held by a binder or a branch has no register shape.
            Let { value, .. } | AggLet { value, .. } => {
                !matches!(value.typ(), Ok(VType::Stream(_)))
            }
            If { cnsq, .. } => !matches!(cnsq.typ(), Ok(VType::Stream(_))),
            Ref { typ, .. } => !matches!(typ, VType::Stream(_)),
            Coalesce(args) => !matches!(
                args.first().map(IrNode::typ),
                Some(Ok(VType::Stream(_)))
            ),
            _ => true,
        };
        here && self.children().iter().all(|c| c.is_compilable())
    }

    /// True if any node in the subtree draws from the seeded RNG.
    /// Gates repartitioning rewrites (see the optimizer).
    pub fn contains_rng(&self) -> bool {
        matches!(self, IrNode::ApplyRngUniform { .. })
            || self.children().iter().any(|c| c.contains_rng())
    }

    /// True if evaluating this subtree can fail or draw randomness; such
    /// subtrees are never folded or dropped by the optimizer.
    pub fn is_effectful(&self) -> bool {
        matches!(
            self,
            IrNode::Die { .. } | IrNode::ApplyRngUniform { .. }
        ) || self.children().iter().any(|c| c.is_effectful())
    }

    /// Literal payload, if this node is a literal form
    pub fn as_literal(&self) -> Option<(Value, VType)> {
        match self {
            IrNode::I32(v) => Some((Value::Int32(*v), VType::Int32)),
            IrNode::I64(v) => Some((Value::Int64(*v), VType::Int64)),
            IrNode::F64(v) => Some((Value::Float64(*v), VType::Float64)),
            IrNode::Bool(v) => Some((Value::Bool(*v), VType::Bool)),
            IrNode::Str(s) => Some((Value::str(s), VType::Str)),
            IrNode::NA(t) => Some((Value::Missing, t.clone())),
            IrNode::Literal { value, typ } => Some((value.clone(), typ.clone())),
            _ => None,
        }
    }

    /// Rebuild a value as a literal node of the given type
    pub fn from_value(value: Value, typ: VType) -> IrNode {
        match (&value, &typ) {
            (Value::Missing, _) => IrNode::NA(typ),
            (Value::Int32(v), VType::Int32) => IrNode::I32(*v),
            (Value::Int64(v), VType::Int64) => IrNode::I64(*v),
            (Value::Float64(v), VType::Float64) => IrNode::F64(*v),
            (Value::Bool(v), VType::Bool) => IrNode::Bool(*v),
            (Value::Str(s), VType::Str) => IrNode::Str(s.to_string()),
            _ => IrNode::Literal { value, typ },
        }
    }

    // ------------------------------------------------------------------
    // Generic traversal
    // ------------------------------------------------------------------

    /// Direct children in evaluation order
    pub fn children(&self) -> Vec<&IrNode> {
        use IrNode::*;
        match self {
            I32(_) | I64(_) | F64(_) | Bool(_) | Str(_) | NA(_) | Void | Literal { .. }
            | Ref { .. } | Die { .. } | TableRange { .. } => vec![],
            Let { value, body, .. } | AggLet { value, body, .. } => vec![value, body],
            ApplyBinaryPrimOp { l, r, .. }
            | ApplyComparisonOp { l, r, .. }
            | And { l, r }
            | Or { l, r } => vec![l, r],
            ApplyUnaryPrimOp { x, .. } => vec![x],
            If { cond, cnsq, altr } => vec![cond, cnsq, altr],
            Coalesce(args) => args.iter().collect(),
            IsNA(x) | ArrayLen(x) | ToArray(x) | ToStream(x) | TableCount(x) | TableCollect(x) => {
                vec![x]
            }
            MakeArray { elems, .. } | MakeTuple(elems) | StreamMultiMerge(elems) => {
                elems.iter().collect()
            }
            ArrayRef { a, i } => vec![a, i],
            ArraySort { a, .. } => vec![a],
            StreamRange { start, stop, step } => vec![start, stop, step],
            StreamMap { s, body, .. } | StreamFlatMap { s, body, .. } => vec![s, body],
            StreamFilter { s, cond, .. } | StreamTakeWhile { s, cond, .. } => vec![s, cond],
            StreamZip { streams, body, .. } => {
                let mut cs: Vec<&IrNode> = streams.iter().collect();
                cs.push(body);
                cs
            }
            StreamFold { s, zero, body, .. } => vec![s, zero, body],
            StreamAgg { s, value, .. } => vec![s, value],
            MakeStruct { fields } => fields.iter().map(|(_, v)| v).collect(),
            GetField { o, .. } | GetTupleElement { o, .. } => vec![o],
            InsertFields { o, fields } => {
                let mut cs = vec![o.as_ref()];
                cs.extend(fields.iter().map(|(_, v)| v));
                cs
            }
            SelectFields { o, .. } => vec![o],
            MakeInterval { start, end, .. } => vec![start, end],
            ApplyRngUniform { lo, hi, .. } => vec![lo, hi],
            TableFilter { child, pred, .. } => vec![child, pred],
            TableMapRows { child, new_row, .. } => vec![child, new_row],
            TableKeyBy { child, .. } => vec![child],
        }
    }

    /// Rebuild the same kind with each direct child passed through `f`.
    /// Copy-on-write workhorse for the rewrite passes.
    pub fn map_children<F>(self, f: &mut F) -> EngineResult<IrNode>
    where
        F: FnMut(IrNode) -> EngineResult<IrNode>,
    {
        use IrNode::*;
        Ok(match self {
            n @ (I32(_) | I64(_) | F64(_) | Bool(_) | Str(_) | NA(_) | Void | Literal { .. }
            | Ref { .. } | Die { .. } | TableRange { .. }) => n,
            Let { name, value, body } => Let {
                name,
                value: Box::new(f(*value)?),
                body: Box::new(f(*body)?),
            },
            AggLet { name, value, body } => AggLet {
                name,
                value: Box::new(f(*value)?),
                body: Box::new(f(*body)?),
            },
            ApplyBinaryPrimOp { op, l, r } => ApplyBinaryPrimOp {
                op,
                l: Box::new(f(*l)?),
                r: Box::new(f(*r)?),
            },
            ApplyUnaryPrimOp { op, x } => ApplyUnaryPrimOp {
                op,
                x: Box::new(f(*x)?),
            },
            ApplyComparisonOp { op, l, r } => ApplyComparisonOp {
                op,
                l: Box::new(f(*l)?),
                r: Box::new(f(*r)?),
            },
            If { cond, cnsq, altr } => If {
                cond: Box::new(f(*cond)?),
                cnsq: Box::new(f(*cnsq)?),
                altr: Box::new(f(*altr)?),
            },
            Coalesce(args) => Coalesce(map_vec(args, f)?),
            IsNA(x) => IsNA(Box::new(f(*x)?)),
            And { l, r } => And {
                l: Box::new(f(*l)?),
                r: Box::new(f(*r)?),
            },
            Or { l, r } => Or {
                l: Box::new(f(*l)?),
                r: Box::new(f(*r)?),
            },
            MakeArray { elems, elem_type } => MakeArray {
                elems: map_vec(elems, f)?,
                elem_type,
            },
            ArrayRef { a, i } => ArrayRef {
                a: Box::new(f(*a)?),
                i: Box::new(f(*i)?),
            },
            ArrayLen(a) => ArrayLen(Box::new(f(*a)?)),
            ArraySort { a, ascending } => ArraySort {
                a: Box::new(f(*a)?),
                ascending,
            },
            ToArray(s) => ToArray(Box::new(f(*s)?)),
            ToStream(a) => ToStream(Box::new(f(*a)?)),
            StreamRange { start, stop, step } => StreamRange {
                start: Box::new(f(*start)?),
                stop: Box::new(f(*stop)?),
                step: Box::new(f(*step)?),
            },
            StreamMap { s, name, body } => StreamMap {
                s: Box::new(f(*s)?),
                name,
                body: Box::new(f(*body)?),
            },
            StreamFilter { s, name, cond } => StreamFilter {
                s: Box::new(f(*s)?),
                name,
                cond: Box::new(f(*cond)?),
            },
            StreamFlatMap { s, name, body } => StreamFlatMap {
                s: Box::new(f(*s)?),
                name,
                body: Box::new(f(*body)?),
            },
            StreamTakeWhile { s, name, cond } => StreamTakeWhile {
                s: Box::new(f(*s)?),
                name,
                cond: Box::new(f(*cond)?),
            },
            StreamZip {
                streams,
                names,
                body,
                behavior,
            } => StreamZip {
                streams: map_vec(streams, f)?,
                names,
                body: Box::new(f(*body)?),
                behavior,
            },
            StreamFold {
                s,
                zero,
                accum_name,
                value_name,
                body,
            } => StreamFold {
                s: Box::new(f(*s)?),
                zero: Box::new(f(*zero)?),
                accum_name,
                value_name,
                body: Box::new(f(*body)?),
            },
            StreamMultiMerge(streams) => StreamMultiMerge(map_vec(streams, f)?),
            StreamAgg { s, name, op, value } => StreamAgg {
                s: Box::new(f(*s)?),
                name,
                op,
                value: Box::new(f(*value)?),
            },
            MakeStruct { fields } => MakeStruct {
                fields: map_fields(fields, f)?,
            },
            GetField { o, name } => GetField {
                o: Box::new(f(*o)?),
                name,
            },
            InsertFields { o, fields } => InsertFields {
                o: Box::new(f(*o)?),
                fields: map_fields(fields, f)?,
            },
            SelectFields { o, names } => SelectFields {
                o: Box::new(f(*o)?),
                names,
            },
            MakeTuple(elems) => MakeTuple(map_vec(elems, f)?),
            GetTupleElement { o, idx } => GetTupleElement {
                o: Box::new(f(*o)?),
                idx,
            },
            MakeInterval {
                start,
                end,
                includes_start,
                includes_end,
            } => MakeInterval {
                start: Box::new(f(*start)?),
                end: Box::new(f(*end)?),
                includes_start,
                includes_end,
            },
            ApplyRngUniform { static_uid, lo, hi } => ApplyRngUniform {
                static_uid,
                lo: Box::new(f(*lo)?),
                hi: Box::new(f(*hi)?),
            },
            TableFilter { child, name, pred } => TableFilter {
                child: Box::new(f(*child)?),
                name,
                pred: Box::new(f(*pred)?),
            },
            TableMapRows {
                child,
                name,
                new_row,
            } => TableMapRows {
                child: Box::new(f(*child)?),
                name,
                new_row: Box::new(f(*new_row)?),
            },
            TableKeyBy { child, keys } => TableKeyBy {
                child: Box::new(f(*child)?),
                keys,
            },
            TableCount(child) => TableCount(Box::new(f(*child)?)),
            TableCollect(child) => TableCollect(Box::new(f(*child)?)),
        })
    }

    /// Direct children paired with the variable names newly bound inside
    /// each child. Single source of truth for scoping: use-def analyses,
    /// let-forwarding and normalization all consult this instead of
    /// hard-coding binder shapes.
    pub fn scoped_children(&self) -> Vec<(&IrNode, Vec<&str>)> {
        use IrNode::*;
        match self {
            Let { value, body, name } | AggLet { value, body, name } => {
                vec![(value, vec![]), (body, vec![name.as_str()])]
            }
            StreamMap { s, body, name } | StreamFlatMap { s, body, name } => {
                vec![(s, vec![]), (body, vec![name.as_str()])]
            }
            StreamFilter { s, cond, name } | StreamTakeWhile { s, cond, name } => {
                vec![(s, vec![]), (cond, vec![name.as_str()])]
            }
            StreamZip {
                streams,
                names,
                body,
                ..
            } => {
                let mut cs: Vec<(&IrNode, Vec<&str>)> =
                    streams.iter().map(|s| (s, vec![])).collect();
                cs.push((body.as_ref(), names.iter().map(String::as_str).collect()));
                cs
            }
            StreamFold {
                s,
                zero,
                accum_name,
                value_name,
                body,
            } => vec![
                (s, vec![]),
                (zero, vec![]),
                (body, vec![accum_name.as_str(), value_name.as_str()]),
            ],
            StreamAgg { s, name, value, .. } => {
                vec![(s, vec![]), (value, vec![name.as_str()])]
            }
            TableFilter { child, name, pred } => {
                vec![(child, vec![]), (pred, vec![name.as_str()])]
            }
            TableMapRows {
                child,
                name,
                new_row,
            } => vec![(child, vec![]), (new_row, vec![name.as_str()])],
            other => other.children().into_iter().map(|c| (c, vec![])).collect(),
        }
    }

    /// Short kind name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        use IrNode::*;
        match self {
            I32(_) => "I32",
            I64(_) => "I64",
            F64(_) => "F64",
            Bool(_) => "Bool",
            Str(_) => "Str",
            NA(_) => "NA",
            Void => "Void",
            Literal { .. } => "Literal",
            Ref { .. } => "Ref",
            Let { .. } => "Let",
            AggLet { .. } => "AggLet",
            ApplyBinaryPrimOp { .. } => "ApplyBinaryPrimOp",
            ApplyUnaryPrimOp { .. } => "ApplyUnaryPrimOp",
            ApplyComparisonOp { .. } => "ApplyComparisonOp",
            If { .. } => "If",
            Coalesce(_) => "Coalesce",
            IsNA(_) => "IsNA",
            And { .. } => "And",
            Or { .. } => "Or",
            Die { .. } => "Die",
            MakeArray { .. } => "MakeArray",
            ArrayRef { .. } => "ArrayRef",
            ArrayLen(_) => "ArrayLen",
            ArraySort { .. } => "ArraySort",
            ToArray(_) => "ToArray",
            ToStream(_) => "ToStream",
            StreamRange { .. } => "StreamRange",
            StreamMap { .. } => "StreamMap",
            StreamFilter { .. } => "StreamFilter",
            StreamFlatMap { .. } => "StreamFlatMap",
            StreamTakeWhile { .. } => "StreamTakeWhile",
            StreamZip { .. } => "StreamZip",
            StreamFold { .. } => "StreamFold",
            StreamMultiMerge(_) => "StreamMultiMerge",
            StreamAgg { .. } => "StreamAgg",
            MakeStruct { .. } => "MakeStruct",
            GetField { .. } => "GetField",
            InsertFields { .. } => "InsertFields",
            SelectFields { .. } => "SelectFields",
            MakeTuple(_) => "MakeTuple",
            GetTupleElement { .. } => "GetTupleElement",
            MakeInterval { .. } => "MakeInterval",
            ApplyRngUniform { .. } => "ApplyRngUniform",
            TableRange { .. } => "TableRange",
            TableFilter { .. } => "TableFilter",
            TableMapRows { .. } => "TableMapRows",
            TableKeyBy { .. } => "TableKeyBy",
            TableCount(_) => "TableCount",
            TableCollect(_) => "TableCollect",
        }
    }
}

fn map_vec<F>(elems: Vec<IrNode>, f: &mut F) -> EngineResult<Vec<IrNode>>
where
    F: FnMut(IrNode) -> EngineResult<IrNode>,
{
    elems.into_iter().map(|e| f(e)).collect()
}

fn map_fields<F>(fields: Vec<(String, IrNode)>, f: &mut F) -> EngineResult<Vec<(String, IrNode)>>
where
    F: FnMut(IrNode) -> EngineResult<IrNode>,
{
    fields.into_iter().map(|(n, v)| Ok((n, f(v)?))).collect()
}

fn expect_stream(t: &VType, node: &str) -> EngineResult<VType> {
    match t {
        VType::Stream(elem) => Ok((**elem).clone()),
        other => Err(type_error(node, "Stream", other)),
    }
}

fn expect_table<'a>(t: &'a VType, node: &str) -> EngineResult<&'a VType> {
    match t {
        VType::Stream(row) if matches!(**row, VType::Struct(_)) => Ok(row),
        other => Err(type_error(node, "table (stream of rows)", other)),
    }
}

// ----------------------------------------------------------------------
// Smart constructors
// ----------------------------------------------------------------------
//
// Each constructor validates child types by deriving the result type; a
// mismatch fails immediately at construction, naming the offending node and
// the expected/actual types.

impl IrNode {
    fn checked(self) -> EngineResult<IrNode> {
        self.typ()?;
        Ok(self)
    }

    /// `Ref` to an enclosing binder
    pub fn ref_(name: impl Into<String>, typ: VType) -> IrNode {
        IrNode::Ref {
            name: name.into(),
            typ,
        }
    }

    /// `Let name = value in body`
    pub fn let_(name: impl Into<String>, value: IrNode, body: IrNode) -> EngineResult<IrNode> {
        IrNode::Let {
            name: name.into(),
            value: Box::new(value),
            body: Box::new(body),
        }
        .checked()
    }

    /// Binary arithmetic
    pub fn binary(op: BinaryOp, l: IrNode, r: IrNode) -> EngineResult<IrNode> {
        IrNode::ApplyBinaryPrimOp {
            op,
            l: Box::new(l),
            r: Box::new(r),
        }
        .checked()
    }

    /// Unary op
    pub fn unary(op: UnaryOp, x: IrNode) -> EngineResult<IrNode> {
        IrNode::ApplyUnaryPrimOp { op, x: Box::new(x) }.checked()
    }

    /// Comparison via the total value order
    pub fn compare(op: ComparisonOp, l: IrNode, r: IrNode) -> EngineResult<IrNode> {
        IrNode::ApplyComparisonOp {
            op,
            l: Box::new(l),
            r: Box::new(r),
        }
        .checked()
    }

    /// Conditional; branches must agree in type
    pub fn if_(cond: IrNode, cnsq: IrNode, altr: IrNode) -> EngineResult<IrNode> {
        IrNode::If {
            cond: Box::new(cond),
            cnsq: Box::new(cnsq),
            altr: Box::new(altr),
        }
        .checked()
    }

    /// First non-missing argument
    pub fn coalesce(args: Vec<IrNode>) -> EngineResult<IrNode> {
        IrNode::Coalesce(args).checked()
    }

    /// Missingness test
    pub fn is_na(x: IrNode) -> IrNode {
        IrNode::IsNA(Box::new(x))
    }

    /// Kleene conjunction
    pub fn and(l: IrNode, r: IrNode) -> EngineResult<IrNode> {
        IrNode::And {
            l: Box::new(l),
            r: Box::new(r),
        }
        .checked()
    }

    /// Kleene disjunction
    pub fn or(l: IrNode, r: IrNode) -> EngineResult<IrNode> {
        IrNode::Or {
            l: Box::new(l),
            r: Box::new(r),
        }
        .checked()
    }

    /// Array literal with a declared element type
    pub fn make_array(elems: Vec<IrNode>, elem_type: VType) -> EngineResult<IrNode> {
        IrNode::MakeArray { elems, elem_type }.checked()
    }

    /// `a[i]`; out of bounds is a user-fatal evaluation error
    pub fn array_ref(a: IrNode, i: IrNode) -> EngineResult<IrNode> {
        IrNode::ArrayRef {
            a: Box::new(a),
            i: Box::new(i),
        }
        .checked()
    }

    /// Array length
    pub fn array_len(a: IrNode) -> EngineResult<IrNode> {
        IrNode::ArrayLen(Box::new(a)).checked()
    }

    /// Sorted copy of an array
    pub fn array_sort(a: IrNode, ascending: bool) -> EngineResult<IrNode> {
        IrNode::ArraySort {
            a: Box::new(a),
            ascending,
        }
        .checked()
    }

    /// Materialize a stream
    pub fn to_array(s: IrNode) -> EngineResult<IrNode> {
        IrNode::ToArray(Box::new(s)).checked()
    }

    /// View an array as a stream
    pub fn to_stream(a: IrNode) -> EngineResult<IrNode> {
        IrNode::ToStream(Box::new(a)).checked()
    }

    /// `[start, stop)` by `step`; a zero step is a user-fatal evaluation error
    pub fn stream_range(start: IrNode, stop: IrNode, step: IrNode) -> EngineResult<IrNode> {
        IrNode::StreamRange {
            start: Box::new(start),
            stop: Box::new(stop),
            step: Box::new(step),
        }
        .checked()
    }

    /// Per-element transform
    pub fn stream_map(s: IrNode, name: impl Into<String>, body: IrNode) -> EngineResult<IrNode> {
        IrNode::StreamMap {
            s: Box::new(s),
            name: name.into(),
            body: Box::new(body),
        }
        .checked()
    }

    /// Keep elements where `cond` is true (missing cond drops the element)
    pub fn stream_filter(s: IrNode, name: impl Into<String>, cond: IrNode) -> EngineResult<IrNode> {
        IrNode::StreamFilter {
            s: Box::new(s),
            name: name.into(),
            cond: Box::new(cond),
        }
        .checked()
    }

    /// Per-element expansion
    pub fn stream_flat_map(
        s: IrNode,
        name: impl Into<String>,
        body: IrNode,
    ) -> EngineResult<IrNode> {
        IrNode::StreamFlatMap {
            s: Box::new(s),
            name: name.into(),
            body: Box::new(body),
        }
        .checked()
    }

    /// Prefix while `cond` holds (missing cond stops the stream)
    pub fn stream_take_while(
        s: IrNode,
        name: impl Into<String>,
        cond: IrNode,
    ) -> EngineResult<IrNode> {
        IrNode::StreamTakeWhile {
            s: Box::new(s),
            name: name.into(),
            cond: Box::new(cond),
        }
        .checked()
    }

    /// Elementwise combination of several streams
    pub fn stream_zip(
        streams: Vec<IrNode>,
        names: Vec<String>,
        body: IrNode,
        behavior: ZipBehavior,
    ) -> EngineResult<IrNode> {
        if streams.len() != names.len() {
            return Err(type_error(
                "StreamZip",
                format!("{} binder names", streams.len()),
                names.len(),
            ));
        }
        IrNode::StreamZip {
            streams,
            names,
            body: Box::new(body),
            behavior,
        }
        .checked()
    }

    /// Left fold over a stream
    pub fn stream_fold(
        s: IrNode,
        zero: IrNode,
        accum_name: impl Into<String>,
        value_name: impl Into<String>,
        body: IrNode,
    ) -> EngineResult<IrNode> {
        IrNode::StreamFold {
            s: Box::new(s),
            zero: Box::new(zero),
            accum_name: accum_name.into(),
            value_name: value_name.into(),
            body: Box::new(body),
        }
        .checked()
    }

    /// K-way merge of pre-sorted streams
    pub fn stream_multi_merge(streams: Vec<IrNode>) -> EngineResult<IrNode> {
        IrNode::StreamMultiMerge(streams).checked()
    }

    /// Aggregate over a stream
    pub fn stream_agg(
        s: IrNode,
        name: impl Into<String>,
        op: AggOp,
        value: IrNode,
    ) -> EngineResult<IrNode> {
        IrNode::StreamAgg {
            s: Box::new(s),
            name: name.into(),
            op,
            value: Box::new(value),
        }
        .checked()
    }

    /// Struct literal
    pub fn make_struct(fields: Vec<(&str, IrNode)>) -> EngineResult<IrNode> {
        IrNode::MakeStruct {
            fields: fields
                .into_iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
        }
        .checked()
    }

    /// Struct field access
    pub fn get_field(o: IrNode, name: impl Into<String>) -> EngineResult<IrNode> {
        IrNode::GetField {
            o: Box::new(o),
            name: name.into(),
        }
        .checked()
    }

    /// Struct update/extension; existing fields are overwritten in place,
    /// new fields append in declaration order
    pub fn insert_fields(o: IrNode, fields: Vec<(&str, IrNode)>) -> EngineResult<IrNode> {
        IrNode::InsertFields {
            o: Box::new(o),
            fields: fields
                .into_iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
        }
        .checked()
    }

    /// Struct projection, reordering allowed
    pub fn select_fields(o: IrNode, names: Vec<&str>) -> EngineResult<IrNode> {
        IrNode::SelectFields {
            o: Box::new(o),
            names: names.into_iter().map(str::to_string).collect(),
        }
        .checked()
    }

    /// Tuple literal
    pub fn make_tuple(elems: Vec<IrNode>) -> EngineResult<IrNode> {
        IrNode::MakeTuple(elems).checked()
    }

    /// Tuple element access
    pub fn get_tuple_element(o: IrNode, idx: usize) -> EngineResult<IrNode> {
        IrNode::GetTupleElement {
            o: Box::new(o),
            idx,
        }
        .checked()
    }

    /// Interval with endpoint inclusivity flags
    pub fn make_interval(
        start: IrNode,
        end: IrNode,
        includes_start: bool,
        includes_end: bool,
    ) -> EngineResult<IrNode> {
        IrNode::MakeInterval {
            start: Box::new(start),
            end: Box::new(end),
            includes_start,
            includes_end,
        }
        .checked()
    }

    /// Seeded uniform draw; `static_uid` distinguishes draw sites
    pub fn rng_uniform(static_uid: u64, lo: IrNode, hi: IrNode) -> EngineResult<IrNode> {
        IrNode::ApplyRngUniform {
            static_uid,
            lo: Box::new(lo),
            hi: Box::new(hi),
        }
        .checked()
    }

    /// Fatal user error in value position
    pub fn die(message: impl Into<String>, typ: VType) -> IrNode {
        IrNode::Die {
            message: message.into(),
            typ,
        }
    }

    /// Synthetic table of `{ idx }` rows
    pub fn table_range(n_rows: i64, n_partitions: usize) -> IrNode {
        IrNode::TableRange {
            n_rows,
            n_partitions,
        }
    }

    /// Keep rows where `pred` holds
    pub fn table_filter(child: IrNode, name: impl Into<String>, pred: IrNode) -> EngineResult<IrNode> {
        IrNode::TableFilter {
            child: Box::new(child),
            name: name.into(),
            pred: Box::new(pred),
        }
        .checked()
    }

    /// Rewrite each row
    pub fn table_map_rows(
        child: IrNode,
        name: impl Into<String>,
        new_row: IrNode,
    ) -> EngineResult<IrNode> {
        IrNode::TableMapRows {
            child: Box::new(child),
            name: name.into(),
            new_row: Box::new(new_row),
        }
        .checked()
    }

    /// Re-key by row fields
    pub fn table_key_by(child: IrNode, keys: Vec<&str>) -> EngineResult<IrNode> {
        IrNode::TableKeyBy {
            child: Box::new(child),
            keys: keys.into_iter().map(str::to_string).collect(),
        }
        .checked()
    }

    /// Row count (interpreter-only)
    pub fn table_count(child: IrNode) -> EngineResult<IrNode> {
        IrNode::TableCount(Box::new(child)).checked()
    }

    /// Materialize all rows (interpreter-only)
    pub fn table_collect(child: IrNode) -> EngineResult<IrNode> {
        IrNode::TableCollect(Box::new(child)).checked()
    }
}
