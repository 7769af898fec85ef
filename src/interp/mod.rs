//! # Interpreter
//!
//! Direct tree-walking evaluation of IR producing boxed [`Value`]s. Used for
//! IR shapes that cannot or need not be compiled: relational nodes, one-shot
//! global aggregations, metadata-only queries. The staged evaluator must
//! agree with this module on every compilable tree; equivalence is tested,
//! not assumed.
//!
//! Evaluation laws:
//!
//! - A strict node short-circuits to `Missing` the instant any evaluated
//!   strict child is missing.
//! - `And`/`Or` implement three-valued logic (`true || NA == true`,
//!   `false && NA == false`, otherwise missing-contaminated).
//! - `Coalesce` returns its first non-missing argument.
//! - Stream combinators evaluate eagerly to materialized arrays; only the
//!   staged evaluator has a genuine pull model.
//!
//! Arithmetic dispatches on the static operand type pair taken from the IR.
//! That static type is the single authoritative source; a debug assertion
//! cross-checks it against the runtime value so divergence is caught in
//! development rather than silently tolerated.

use std::cmp::Ordering;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{error_id, EngineError, EngineResult};
use crate::ir::{AggOp, BinaryOp, ComparisonOp, IrNode, UnaryOp, ZipBehavior};
use crate::types::VType;
use crate::value::{cmp_values, Value};

/// One immutable binding scope: child scopes extend parents without
/// mutating them.
#[derive(Debug, Clone, Default)]
pub struct Scope(Option<Arc<ScopeNode>>);

#[derive(Debug)]
struct ScopeNode {
    name: String,
    value: Value,
    parent: Scope,
}

impl Scope {
    /// Extend with one binding, returning the child scope
    pub fn bind(&self, name: impl Into<String>, value: Value) -> Scope {
        Scope(Some(Arc::new(ScopeNode {
            name: name.into(),
            value,
            parent: self.clone(),
        })))
    }

    /// Innermost binding for `name`
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        let mut cur = self;
        while let Some(node) = &cur.0 {
            if node.name == name {
                return Some(&node.value);
            }
            cur = &node.parent;
        }
        None
    }
}

/// Evaluation environment: three parallel binding channels plus the
/// per-partition RNG seed. Aggregator state binds variables in a separate
/// namespace from ordinary lets, hence the parallel channels.
#[derive(Debug, Clone, Default)]
pub struct Env {
    /// Plain evaluation scope
    pub eval: Scope,
    /// Aggregation scope
    pub agg: Scope,
    /// Scan scope
    pub scan: Scope,
    /// Per-partition RNG seed (deterministic replay)
    pub rng_seed: u64,
}

impl Env {
    /// Empty environment with seed 0
    pub fn new() -> Self {
        Env::default()
    }

    /// Environment with a per-partition seed
    pub fn with_seed(rng_seed: u64) -> Self {
        Env {
            rng_seed,
            ..Env::default()
        }
    }

    /// Extend the plain evaluation channel
    pub fn bind(&self, name: impl Into<String>, value: Value) -> Env {
        Env {
            eval: self.eval.bind(name, value),
            agg: self.agg.clone(),
            scan: self.scan.clone(),
            rng_seed: self.rng_seed,
        }
    }

    /// Extend the aggregation channel
    pub fn bind_agg(&self, name: impl Into<String>, value: Value) -> Env {
        Env {
            eval: self.eval.clone(),
            agg: self.agg.bind(name, value),
            scan: self.scan.clone(),
            rng_seed: self.rng_seed,
        }
    }
}

/// Evaluate `node` under `env`.
pub fn interpret(node: &IrNode, env: &Env) -> EngineResult<Value> {
    use IrNode::*;
    match node {
        I32(v) => Ok(Value::Int32(*v)),
        I64(v) => Ok(Value::Int64(*v)),
        F64(v) => Ok(Value::Float64(*v)),
        Bool(v) => Ok(Value::Bool(*v)),
        Str(s) => Ok(Value::str(s)),
        NA(_) => Ok(Value::Missing),
        Void => Ok(Value::Missing),
        Literal { value, .. } => Ok(value.clone()),

        Ref { name, .. } => env
            .eval
            .lookup(name)
            .cloned()
            .or_else(|| env.agg.lookup(name).cloned())
            .or_else(|| env.scan.lookup(name).cloned())
            .ok_or_else(|| {
                EngineError::internal("interpreter", format!("unbound reference '{name}'"))
            }),

        Let { name, value, body } => {
            let v = interpret(value, env)?;
            interpret(body, &env.bind(name.clone(), v))
        }
        AggLet { name, value, body } => {
            let v = interpret(value, env)?;
            interpret(body, &env.bind_agg(name.clone(), v))
        }

        ApplyBinaryPrimOp { op, l, r } => {
            let lv = interpret(l, env)?;
            if lv.is_missing() {
                return Ok(Value::Missing);
            }
            let rv = interpret(r, env)?;
            if rv.is_missing() {
                return Ok(Value::Missing);
            }
            // Static type pair drives dispatch; node.typ() is derived from
            // the same children, so agreement is structural.
            let result_type = node.typ()?;
            debug_assert!(lv.matches(&l.typ()?), "stale operand type for {lv}");
            debug_assert!(rv.matches(&r.typ()?), "stale operand type for {rv}");
            apply_binary(*op, &result_type, &lv, &rv)
        }
        ApplyUnaryPrimOp { op, x } => {
            let xv = interpret(x, env)?;
            if xv.is_missing() {
                return Ok(Value::Missing);
            }
            apply_unary(*op, &xv)
        }
        ApplyComparisonOp { op, l, r } => {
            let lv = interpret(l, env)?;
            if lv.is_missing() {
                return Ok(Value::Missing);
            }
            let rv = interpret(r, env)?;
            if rv.is_missing() {
                return Ok(Value::Missing);
            }
            Ok(Value::Bool(compare_with(*op, &lv, &rv)))
        }

        If { cond, cnsq, altr } => match interpret(cond, env)? {
            Value::Missing => Ok(Value::Missing),
            Value::Bool(true) => interpret(cnsq, env),
            Value::Bool(false) => interpret(altr, env),
            other => Err(EngineError::internal(
                "interpreter",
                format!("If condition evaluated to non-Bool {other}"),
            )),
        },
        Coalesce(args) => {
            for a in args {
                let v = interpret(a, env)?;
                if !v.is_missing() {
                    return Ok(v);
                }
            }
            Ok(Value::Missing)
        }
        IsNA(x) => Ok(Value::Bool(interpret(x, env)?.is_missing())),
        And { l, r } => {
            let lv = interpret(l, env)?;
            if lv == Value::Bool(false) {
                return Ok(Value::Bool(false));
            }
            let rv = interpret(r, env)?;
            if rv == Value::Bool(false) {
                return Ok(Value::Bool(false));
            }
            if lv.is_missing() || rv.is_missing() {
                return Ok(Value::Missing);
            }
            Ok(Value::Bool(true))
        }
        Or { l, r } => {
            let lv = interpret(l, env)?;
            if lv == Value::Bool(true) {
                return Ok(Value::Bool(true));
            }
            let rv = interpret(r, env)?;
            if rv == Value::Bool(true) {
                return Ok(Value::Bool(true));
            }
            if lv.is_missing() || rv.is_missing() {
                return Ok(Value::Missing);
            }
            Ok(Value::Bool(false))
        }
        Die { message, .. } => Err(EngineError::user(error_id::DIE, message.clone())),

        MakeArray { elems, .. } => {
            let mut out = Vec::with_capacity(elems.len());
            for e in elems {
                out.push(interpret(e, env)?);
            }
            Ok(Value::array(out))
        }
        ArrayRef { a, i } => {
            let av = interpret(a, env)?;
            if av.is_missing() {
                return Ok(Value::Missing);
            }
            let iv = interpret(i, env)?;
            if iv.is_missing() {
                return Ok(Value::Missing);
            }
            let elems = expect_array(&av)?;
            let idx = expect_i32(&iv)?;
            if idx < 0 || idx as usize >= elems.len() {
                return Err(EngineError::user(
                    error_id::ARRAY_INDEX,
                    format!("index {idx} out of bounds for array of length {}", elems.len()),
                ));
            }
            Ok(elems[idx as usize].clone())
        }
        ArrayLen(a) => {
            let av = interpret(a, env)?;
            if av.is_missing() {
                return Ok(Value::Missing);
            }
            Ok(Value::Int32(expect_array(&av)?.len() as i32))
        }
        ArraySort { a, ascending } => {
            let av = interpret(a, env)?;
            if av.is_missing() {
                return Ok(Value::Missing);
            }
            let mut elems = expect_array(&av)?.to_vec();
            elems.sort_by(cmp_values);
            if !ascending {
                elems.reverse();
            }
            Ok(Value::array(elems))
        }
        ToArray(s) | ToStream(s) => interpret(s, env),

        StreamRange { start, stop, step } => {
            let (sv, ev, stv) = (
                interpret(start, env)?,
                interpret(stop, env)?,
                interpret(step, env)?,
            );
            if sv.is_missing() || ev.is_missing() || stv.is_missing() {
                return Ok(Value::Missing);
            }
            let (start, stop, step) = (expect_i32(&sv)?, expect_i32(&ev)?, expect_i32(&stv)?);
            if step == 0 {
                return Err(EngineError::user(
                    error_id::RANGE_STEP,
                    "StreamRange step must be non-zero",
                ));
            }
            let mut out = Vec::new();
            let mut cur = start;
            while (step > 0 && cur < stop) || (step < 0 && cur > stop) {
                out.push(Value::Int32(cur));
                cur += step;
            }
            Ok(Value::array(out))
        }
        StreamMap { s, name, body } => {
            let sv = interpret(s, env)?;
            if sv.is_missing() {
                return Ok(Value::Missing);
            }
            let mut out = Vec::new();
            for elem in expect_array(&sv)? {
                out.push(interpret(body, &env.bind(name.clone(), elem.clone()))?);
            }
            Ok(Value::array(out))
        }
        StreamFilter { s, name, cond } => {
            let sv = interpret(s, env)?;
            if sv.is_missing() {
                return Ok(Value::Missing);
            }
            let mut out = Vec::new();
            for elem in expect_array(&sv)? {
                // A missing condition drops the element.
                if interpret(cond, &env.bind(name.clone(), elem.clone()))? == Value::Bool(true) {
                    out.push(elem.clone());
                }
            }
            Ok(Value::array(out))
        }
        StreamFlatMap { s, name, body } => {
            let sv = interpret(s, env)?;
            if sv.is_missing() {
                return Ok(Value::Missing);
            }
            let mut out = Vec::new();
            for elem in expect_array(&sv)? {
                let inner = interpret(body, &env.bind(name.clone(), elem.clone()))?;
                if inner.is_missing() {
                    continue;
                }
                out.extend(expect_array(&inner)?.iter().cloned());
            }
            Ok(Value::array(out))
        }
        StreamTakeWhile { s, name, cond } => {
            let sv = interpret(s, env)?;
            if sv.is_missing() {
                return Ok(Value::Missing);
            }
            let mut out = Vec::new();
            for elem in expect_array(&sv)? {
                // A missing condition stops the stream.
                if interpret(cond, &env.bind(name.clone(), elem.clone()))? != Value::Bool(true) {
                    break;
                }
                out.push(elem.clone());
            }
            Ok(Value::array(out))
        }
        StreamZip {
            streams,
            names,
            body,
            behavior,
        } => {
            let mut inputs = Vec::with_capacity(streams.len());
            for s in streams {
                let sv = interpret(s, env)?;
                if sv.is_missing() {
                    return Ok(Value::Missing);
                }
                inputs.push(expect_array(&sv)?.to_vec());
            }
            let min_len = inputs.iter().map(Vec::len).min().unwrap_or(0);
            if *behavior == ZipBehavior::AssertSameLength
                && inputs.iter().any(|v| v.len() != min_len)
            {
                return Err(EngineError::user(
                    error_id::ZIP_LENGTH,
                    format!(
                        "zipped streams declared same-length but lengths were {:?}",
                        inputs.iter().map(Vec::len).collect::<Vec<_>>()
                    ),
                ));
            }
            let mut out = Vec::with_capacity(min_len);
            for i in 0..min_len {
                let mut scope = env.clone();
                for (name, input) in names.iter().zip(&inputs) {
                    scope = scope.bind(name.clone(), input[i].clone());
                }
                out.push(interpret(body, &scope)?);
            }
            Ok(Value::array(out))
        }
        StreamFold {
            s,
            zero,
            accum_name,
            value_name,
            body,
        } => {
            let sv = interpret(s, env)?;
            if sv.is_missing() {
                return Ok(Value::Missing);
            }
            let mut acc = interpret(zero, env)?;
            for elem in expect_array(&sv)? {
                let scope = env
                    .bind(accum_name.clone(), acc)
                    .bind(value_name.clone(), elem.clone());
                acc = interpret(body, &scope)?;
            }
            Ok(acc)
        }
        StreamMultiMerge(streams) => {
            let mut inputs = Vec::with_capacity(streams.len());
            for s in streams {
                let sv = interpret(s, env)?;
                if sv.is_missing() {
                    return Ok(Value::Missing);
                }
                inputs.push(expect_array(&sv)?.to_vec());
            }
            Ok(Value::array(tournament_merge(inputs)))
        }
        StreamAgg { s, name, op, value } => {
            let sv = interpret(s, env)?;
            if sv.is_missing() {
                return Ok(Value::Missing);
            }
            let mut state = AggState::new(*op);
            for elem in expect_array(&sv)? {
                let v = interpret(value, &env.bind(name.clone(), elem.clone()))?;
                state.seq(v);
            }
            Ok(state.result())
        }

        MakeStruct { fields } => {
            let mut out = Vec::with_capacity(fields.len());
            for (_, v) in fields {
                out.push(interpret(v, env)?);
            }
            Ok(Value::struct_(out))
        }
        GetField { o, name } => {
            let ov = interpret(o, env)?;
            if ov.is_missing() {
                return Ok(Value::Missing);
            }
            let idx = o.typ()?.field_index(name).ok_or_else(|| {
                EngineError::internal("interpreter", format!("GetField of unknown field '{name}'"))
            })?;
            Ok(expect_fields(&ov)?[idx].clone())
        }
        InsertFields { o, fields } => {
            let ov = interpret(o, env)?;
            if ov.is_missing() {
                return Ok(Value::Missing);
            }
            let ot = o.typ()?;
            let mut out = expect_fields(&ov)?.to_vec();
            for (n, v) in fields {
                let fv = interpret(v, env)?;
                match ot.field_index(n) {
                    Some(i) => out[i] = fv,
                    None => out.push(fv),
                }
            }
            Ok(Value::struct_(out))
        }
        SelectFields { o, names } => {
            let ov = interpret(o, env)?;
            if ov.is_missing() {
                return Ok(Value::Missing);
            }
            let ot = o.typ()?;
            let fields = expect_fields(&ov)?;
            let mut out = Vec::with_capacity(names.len());
            for n in names {
                let idx = ot.field_index(n).ok_or_else(|| {
                    EngineError::internal(
                        "interpreter",
                        format!("SelectFields of unknown field '{n}'"),
                    )
                })?;
                out.push(fields[idx].clone());
            }
            Ok(Value::struct_(out))
        }
        MakeTuple(elems) => {
            let mut out = Vec::with_capacity(elems.len());
            for e in elems {
                out.push(interpret(e, env)?);
            }
            Ok(Value::tuple(out))
        }
        GetTupleElement { o, idx } => {
            let ov = interpret(o, env)?;
            if ov.is_missing() {
                return Ok(Value::Missing);
            }
            Ok(expect_fields(&ov)?[*idx].clone())
        }

        MakeInterval {
            start,
            end,
            includes_start,
            includes_end,
        } => {
            let sv = interpret(start, env)?;
            if sv.is_missing() {
                return Ok(Value::Missing);
            }
            let ev = interpret(end, env)?;
            if ev.is_missing() {
                return Ok(Value::Missing);
            }
            Ok(Value::interval(sv, ev, *includes_start, *includes_end))
        }

        ApplyRngUniform { static_uid, lo, hi } => {
            let lv = interpret(lo, env)?;
            if lv.is_missing() {
                return Ok(Value::Missing);
            }
            let hv = interpret(hi, env)?;
            if hv.is_missing() {
                return Ok(Value::Missing);
            }
            let (lo, hi) = (expect_f64(&lv)?, expect_f64(&hv)?);
            Ok(Value::Float64(seeded_uniform(
                env.rng_seed,
                *static_uid,
                lo,
                hi,
            )))
        }

        TableRange { .. }
        | TableFilter { .. }
        | TableMapRows { .. }
        | TableKeyBy { .. } => {
            let rows = interpret_table(node, env)?;
            Ok(Value::array(rows))
        }
        TableCount(child) => {
            let rows = interpret_table(child, env)?;
            Ok(Value::Int64(rows.len() as i64))
        }
        TableCollect(child) => {
            let rows = interpret_table(child, env)?;
            Ok(Value::array(rows))
        }
    }
}

/// Draw one uniform value from the per-partition RNG. The stream is keyed by
/// (partition seed, draw-site uid) so a retried partition reproduces the same
/// draws.
pub fn seeded_uniform(partition_seed: u64, static_uid: u64, lo: f64, hi: f64) -> f64 {
    let mut rng = StdRng::seed_from_u64(partition_seed ^ static_uid.rotate_left(17));
    rng.gen_range(0.0..1.0) * (hi - lo) + lo
}

/// Materialize a relational subtree as a row vector.
fn interpret_table(node: &IrNode, env: &Env) -> EngineResult<Vec<Value>> {
    use IrNode::*;
    match node {
        TableRange { n_rows, .. } => Ok((0..*n_rows)
            .map(|i| Value::struct_(vec![Value::Int64(i)]))
            .collect()),
        TableFilter { child, name, pred } => {
            let rows = interpret_table(child, env)?;
            let mut out = Vec::new();
            for row in rows {
                if interpret(pred, &env.bind(name.clone(), row.clone()))? == Value::Bool(true) {
                    out.push(row);
                }
            }
            Ok(out)
        }
        TableMapRows {
            child,
            name,
            new_row,
        } => {
            let rows = interpret_table(child, env)?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(interpret(new_row, &env.bind(name.clone(), row))?);
            }
            Ok(out)
        }
        // Key order is a planning property; row order is preserved here.
        TableKeyBy { child, .. } => interpret_table(child, env),
        other => {
            let v = interpret(other, env)?;
            match v {
                Value::Array(rows) => Ok(rows.to_vec()),
                Value::Missing => Ok(vec![]),
                _ => Err(EngineError::internal(
                    "interpreter",
                    format!("table child evaluated to non-array {v}"),
                )),
            }
        }
    }
}

pub(crate) fn apply_binary(
    op: BinaryOp,
    result_type: &VType,
    l: &Value,
    r: &Value,
) -> EngineResult<Value> {
    match result_type {
        VType::Int32 => {
            let (a, b) = (expect_i32(l)?, expect_i32(r)?);
            int_binary(op, i64::from(a), i64::from(b)).map(|v| Value::Int32(v as i32))
        }
        VType::Int64 => {
            let (a, b) = (
                l.as_i64().ok_or_else(|| stale(l))?,
                r.as_i64().ok_or_else(|| stale(r))?,
            );
            int_binary(op, a, b).map(Value::Int64)
        }
        VType::Float64 => {
            let (a, b) = (expect_f64(l)?, expect_f64(r)?);
            Ok(Value::Float64(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Mod => a.rem_euclid(b),
                BinaryOp::Pow => a.powf(b),
            }))
        }
        other => Err(EngineError::internal(
            "interpreter",
            format!("binary op with non-numeric result type {other}"),
        )),
    }
}

pub(crate) fn apply_unary(op: UnaryOp, x: &Value) -> EngineResult<Value> {
    match (op, x) {
        (UnaryOp::Negate, Value::Int32(v)) => Ok(Value::Int32(v.wrapping_neg())),
        (UnaryOp::Negate, Value::Int64(v)) => Ok(Value::Int64(v.wrapping_neg())),
        (UnaryOp::Negate, Value::Float64(v)) => Ok(Value::Float64(-v)),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        _ => Err(EngineError::internal(
            "interpreter",
            format!("unary op on unexpected value {x}"),
        )),
    }
}

fn int_binary(op: BinaryOp, a: i64, b: i64) -> EngineResult<i64> {
    match op {
        BinaryOp::Add => Ok(a.wrapping_add(b)),
        BinaryOp::Sub => Ok(a.wrapping_sub(b)),
        BinaryOp::Mul => Ok(a.wrapping_mul(b)),
        BinaryOp::Div => {
            if b == 0 {
                Err(EngineError::user(error_id::DIV_BY_ZERO, "division by zero"))
            } else {
                Ok(a.wrapping_div(b))
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                Err(EngineError::user(error_id::DIV_BY_ZERO, "modulo by zero"))
            } else {
                Ok(a.rem_euclid(b))
            }
        }
        // Pow joins to Float64 at typing time
        BinaryOp::Pow => Err(EngineError::internal(
            "interpreter",
            "integer Pow should have joined to Float64",
        )),
    }
}

/// Apply a comparison through the total value order.
pub fn compare_with(op: ComparisonOp, l: &Value, r: &Value) -> bool {
    let ord = cmp_values(l, r);
    match op {
        ComparisonOp::Eq => ord == Ordering::Equal,
        ComparisonOp::Ne => ord != Ordering::Equal,
        ComparisonOp::Lt => ord == Ordering::Less,
        ComparisonOp::Le => ord != Ordering::Greater,
        ComparisonOp::Gt => ord == Ordering::Greater,
        ComparisonOp::Ge => ord != Ordering::Less,
    }
}

// ----------------------------------------------------------------------
// Aggregation
// ----------------------------------------------------------------------

/// Running aggregator state for the interpreter path. The staged evaluator
/// has its own addressed region (`stage::agg`); results must agree.
pub struct AggState {
    op: AggOp,
    count: i64,
    sum_i: i64,
    sum_f: f64,
    saw_float: bool,
    best: Option<Value>,
    collected: Vec<Value>,
}

impl AggState {
    /// Fresh state for one aggregation site
    pub fn new(op: AggOp) -> Self {
        AggState {
            op,
            count: 0,
            sum_i: 0,
            sum_f: 0.0,
            saw_float: false,
            best: None,
            collected: Vec::new(),
        }
    }

    /// Fold in one value. Missing values are skipped by every op except
    /// `CollectAsArray`, which keeps them.
    pub fn seq(&mut self, v: Value) {
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

    /// Final value for this aggregation
    pub fn result(self) -> Value {
        match self.op {
            AggOp::Count => Value::Int64(self.count),
            AggOp::Sum => {
                if self.saw_float {
                    Value::Float64(self.sum_f + self.sum_i as f64)
                } else {
                    Value::Int64(self.sum_i)
                }
            }
            AggOp::Min | AggOp::Max => self.best.unwrap_or(Value::Missing),
            AggOp::CollectAsArray => Value::array(self.collected),
        }
    }
}

// ----------------------------------------------------------------------
// K-way merge
// ----------------------------------------------------------------------

/// Merge pre-sorted inputs into one globally sorted sequence using a
/// tournament tree; ties break by input index, so the merge is
/// deterministic across runs.
pub fn tournament_merge(inputs: Vec<Vec<Value>>) -> Vec<Value> {
    let k = inputs.len().max(1);
    let mut cursors = vec![0usize; inputs.len()];
    let total: usize = inputs.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);

    // Loser-tree over k lanes; a lane past its end holds an infinite key.
    // For the lane counts this engine sees, rebuilding the path from leaf to
    // root per pop is the standard O(log k) replay.
    let mut tree = TournamentTree::new(k);
    for lane in 0..inputs.len() {
        tree.push(lane, inputs[lane].first());
    }
    while let Some(lane) = tree.winner() {
        let v = inputs[lane][cursors[lane]].clone();
        out.push(v);
        cursors[lane] += 1;
        tree.push(lane, inputs[lane].get(cursors[lane]));
    }
    out
}

struct TournamentTree<'a> {
    /// Current head per lane; `None` = exhausted
    heads: Vec<Option<&'a Value>>,
}

impl<'a> TournamentTree<'a> {
    fn new(k: usize) -> Self {
        TournamentTree {
            heads: vec![None; k],
        }
    }

    fn push(&mut self, lane: usize, head: Option<&'a Value>) {
        self.heads[lane] = head;
    }

    /// Lane holding the least head, ties to the lowest lane index
    fn winner(&self) -> Option<usize> {
        let mut best: Option<(usize, &Value)> = None;
        for (lane, head) in self.heads.iter().enumerate() {
            if let Some(v) = head {
                let better = match best {
                    None => true,
                    Some((_, bv)) => cmp_values(v, bv) == Ordering::Less,
                };
                if better {
                    best = Some((lane, v));
                }
            }
        }
        best.map(|(lane, _)| lane)
    }
}

// ----------------------------------------------------------------------
// Value extraction
// ----------------------------------------------------------------------

fn stale(v: &Value) -> EngineError {
    EngineError::internal("interpreter", format!("value {v} does not match static type"))
}

fn expect_array(v: &Value) -> EngineResult<&[Value]> {
    v.elems().ok_or_else(|| stale(v))
}

fn expect_fields(v: &Value) -> EngineResult<&[Value]> {
    v.fields().ok_or_else(|| stale(v))
}

fn expect_i32(v: &Value) -> EngineResult<i32> {
    match v {
        Value::Int32(x) => Ok(*x),
        _ => Err(stale(v)),
    }
}

fn expect_f64(v: &Value) -> EngineResult<f64> {
    v.as_f64().ok_or_else(|| stale(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrNode as Ir;
    use crate::types::VType;

    fn eval(ir: &IrNode) -> Value {
        interpret(ir, &Env::new()).unwrap()
    }

    #[test]
    fn arithmetic_widens() {
        let n = Ir::binary(BinaryOp::Add, Ir::I32(1), Ir::I64(2)).unwrap();
        assert_eq!(eval(&n), Value::Int64(3));
        let n = Ir::binary(BinaryOp::Mul, Ir::F64(1.5), Ir::I32(2)).unwrap();
        assert_eq!(eval(&n), Value::Float64(3.0));
    }

    #[test]
    fn strict_nodes_propagate_missing() {
        let n = Ir::binary(BinaryOp::Add, Ir::NA(VType::Int32), Ir::I32(2)).unwrap();
        assert_eq!(eval(&n), Value::Missing);
        let n = Ir::compare(ComparisonOp::Lt, Ir::I32(1), Ir::NA(VType::Int32)).unwrap();
        assert_eq!(eval(&n), Value::Missing);
    }

    #[test]
    fn three_valued_logic() {
        let na = || Ir::NA(VType::Bool);
        assert_eq!(eval(&Ir::or(Ir::Bool(true), na()).unwrap()), Value::Bool(true));
        assert_eq!(
            eval(&Ir::and(Ir::Bool(false), na()).unwrap()),
            Value::Bool(false)
        );
        assert_eq!(eval(&Ir::or(na(), na()).unwrap()), Value::Missing);
        assert_eq!(eval(&Ir::and(Ir::Bool(true), na()).unwrap()), Value::Missing);
        // Kleene on both sides
        assert_eq!(eval(&Ir::or(na(), Ir::Bool(true)).unwrap()), Value::Bool(true));
        assert_eq!(
            eval(&Ir::and(na(), Ir::Bool(false)).unwrap()),
            Value::Bool(false)
        );
    }

    #[test]
    fn coalesce_returns_first_present() {
        let n = Ir::coalesce(vec![Ir::NA(VType::Int32), Ir::I32(7), Ir::I32(9)]).unwrap();
        assert_eq!(eval(&n), Value::Int32(7));
        let n = Ir::coalesce(vec![Ir::NA(VType::Int32), Ir::NA(VType::Int32)]).unwrap();
        assert_eq!(eval(&n), Value::Missing);
    }

    #[test]
    fn array_out_of_bounds_is_user_fatal() {
        let arr = Ir::make_array(vec![Ir::I32(1), Ir::I32(2)], VType::Int32).unwrap();
        let n = Ir::array_ref(arr, Ir::I32(5)).unwrap();
        let err = interpret(&n, &Env::new()).unwrap_err();
        assert!(err.to_string().contains(error_id::ARRAY_INDEX));
    }

    #[test]
    fn zero_step_range_is_user_fatal() {
        let n = Ir::stream_range(Ir::I32(0), Ir::I32(5), Ir::I32(0)).unwrap();
        let err = interpret(&n, &Env::new()).unwrap_err();
        assert!(err.to_string().contains(error_id::RANGE_STEP));
    }

    #[test]
    fn division_by_zero_is_user_fatal() {
        let n = Ir::binary(BinaryOp::Div, Ir::I32(3), Ir::I32(0)).unwrap();
        let err = interpret(&n, &Env::new()).unwrap_err();
        assert!(err.to_string().contains(error_id::DIV_BY_ZERO));
    }

    #[test]
    fn stream_pipeline_materializes_in_order() {
        let range = Ir::stream_range(Ir::I32(0), Ir::I32(6), Ir::I32(1)).unwrap();
        let doubled = Ir::stream_map(
            range,
            "x",
            Ir::binary(BinaryOp::Mul, Ir::ref_("x", VType::Int32), Ir::I32(2)).unwrap(),
        )
        .unwrap();
        let kept = Ir::stream_filter(
            doubled,
            "y",
            Ir::compare(ComparisonOp::Gt, Ir::ref_("y", VType::Int32), Ir::I32(2)).unwrap(),
        )
        .unwrap();
        let n = Ir::to_array(kept).unwrap();
        assert_eq!(
            eval(&n),
            Value::array(vec![
                Value::Int32(4),
                Value::Int32(6),
                Value::Int32(8),
                Value::Int32(10)
            ])
        );
    }

    #[test]
    fn fold_accumulates_left_to_right() {
        let range = Ir::stream_range(Ir::I32(1), Ir::I32(5), Ir::I32(1)).unwrap();
        let n = Ir::stream_fold(
            range,
            Ir::I32(0),
            "acc",
            "x",
            Ir::binary(
                BinaryOp::Add,
                Ir::ref_("acc", VType::Int32),
                Ir::ref_("x", VType::Int32),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(eval(&n), Value::Int32(10));
    }

    #[test]
    fn multi_merge_interleaves_sorted_inputs() {
        let a = Ir::to_stream(
            Ir::make_array(vec![Ir::I32(1), Ir::I32(3), Ir::I32(5)], VType::Int32).unwrap(),
        )
        .unwrap();
        let b = Ir::to_stream(
            Ir::make_array(vec![Ir::I32(2), Ir::I32(4), Ir::I32(6)], VType::Int32).unwrap(),
        )
        .unwrap();
        let n = Ir::to_array(Ir::stream_multi_merge(vec![a, b]).unwrap()).unwrap();
        assert_eq!(
            eval(&n),
            Value::array((1..=6).map(Value::Int32).collect())
        );
    }

    #[test]
    fn merge_ties_break_by_input_index() {
        let merged = tournament_merge(vec![
            vec![Value::Int32(1), Value::Int32(2)],
            vec![Value::Int32(1)],
        ]);
        assert_eq!(
            merged,
            vec![Value::Int32(1), Value::Int32(1), Value::Int32(2)]
        );
    }

    #[test]
    fn stream_agg_ops() {
        let range = || Ir::stream_range(Ir::I32(1), Ir::I32(5), Ir::I32(1)).unwrap();
        let x = || Ir::ref_("x", VType::Int32);
        let sum = Ir::stream_agg(range(), "x", AggOp::Sum, x()).unwrap();
        assert_eq!(eval(&sum), Value::Int64(10));
        let count = Ir::stream_agg(range(), "x", AggOp::Count, x()).unwrap();
        assert_eq!(eval(&count), Value::Int64(4));
        let min = Ir::stream_agg(range(), "x", AggOp::Min, x()).unwrap();
        assert_eq!(eval(&min), Value::Int32(1));
        let max = Ir::stream_agg(range(), "x", AggOp::Max, x()).unwrap();
        assert_eq!(eval(&max), Value::Int32(4));
    }

    #[test]
    fn table_pipeline() {
        let t = Ir::table_range(10, 3);
        let idx = || {
            Ir::get_field(
                Ir::ref_("row", VType::struct_of(vec![("idx", VType::Int64)])),
                "idx",
            )
            .unwrap()
        };
        let filtered = Ir::table_filter(
            t,
            "row",
            Ir::compare(ComparisonOp::Lt, idx(), Ir::I64(4)).unwrap(),
        )
        .unwrap();
        let count = Ir::table_count(filtered).unwrap();
        assert_eq!(eval(&count), Value::Int64(4));
    }

    #[test]
    fn rng_is_deterministic_per_seed_and_site() {
        let draw = Ir::rng_uniform(42, Ir::F64(0.0), Ir::F64(1.0)).unwrap();
        let a = interpret(&draw, &Env::with_seed(7)).unwrap();
        let b = interpret(&draw, &Env::with_seed(7)).unwrap();
        let c = interpret(&draw, &Env::with_seed(8)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn die_carries_stable_id() {
        let n = Ir::die("bad genotype record", VType::Int32);
        let err = interpret(&n, &Env::new()).unwrap_err();
        assert!(err.to_string().contains(error_id::DIE));
    }
}
