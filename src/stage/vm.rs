//! Routine machine
//!
//! Executes a compiled [`Program`]: a loop over flat value frames with
//! resolved jump targets, no tree walking and no name lookups. Scalar
//! operator semantics are shared with the interpreter (`interp::apply_binary`
//! and friends), so the two paths cannot disagree on arithmetic, comparison
//! order or division errors.
//!
//! Fresh-frame calls recurse through the Rust stack; shared-frame calls run
//! the callee over the caller's frame, which is how split procedure bodies
//! re-join their parent.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::interp::{apply_binary, apply_unary, compare_with, seeded_uniform};
use crate::value::{cmp_values, Value};

use super::agg::AggRegion;
use super::instr::{HostOp, Instr, Label, Proc, ProcId, Program, Slot};

/// Services the machine delegates to its embedder (index node decoding,
/// bound comparison). RNG draws are handled by the machine itself.
pub trait HostHooks {
    /// Service one host operation
    fn call(&mut self, op: &HostOp, args: &[Value]) -> EngineResult<Value>;
}

/// One routine execution
pub struct Machine<'a> {
    program: &'a Program,
    rng_seed: u64,
    agg: Option<&'a mut AggRegion>,
    host: Option<&'a mut dyn HostHooks>,
}

impl<'a> Machine<'a> {
    pub fn new(
        program: &'a Program,
        rng_seed: u64,
        agg: Option<&'a mut AggRegion>,
        host: Option<&'a mut dyn HostHooks>,
    ) -> Self {
        Machine {
            program,
            rng_seed,
            agg,
            host,
        }
    }

    /// Run the entry procedure over `args`
    pub fn run(&mut self, args: &[Value]) -> EngineResult<Value> {
        let entry = self.proc(self.program.entry)?;
        if args.len() != entry.n_args {
            return Err(EngineError::internal(
                "machine",
                format!("entry expects {} arguments, got {}", entry.n_args, args.len()),
            ));
        }
        let mut frame = vec![Value::Missing; entry.n_slots];
        frame[..args.len()].clone_from_slice(args);
        match self.exec(self.program.entry, &mut frame)? {
            Some(v) => Ok(v),
            None => Err(EngineError::internal(
                "machine",
                "entry procedure ended without a return",
            )),
        }
    }

    fn proc(&self, id: ProcId) -> EngineResult<&'a Proc> {
        self.program.procs.get(id.0 as usize).ok_or_else(|| {
            EngineError::internal("machine", format!("call to unknown procedure {}", id.0))
        })
    }

    fn exec(&mut self, id: ProcId, frame: &mut Vec<Value>) -> EngineResult<Option<Value>> {
        let proc = self.proc(id)?;
        let mut pc = 0usize;
        while pc < proc.code.len() {
            match &proc.code[pc] {
                Instr::Mark(_) => {}
                Instr::Jump(l) => {
                    pc = target(proc, *l)?;
                    continue;
                }
                Instr::JumpIf { cond, target: l } => {
                    if bool_at(frame, *cond)? {
                        pc = target(proc, *l)?;
                        continue;
                    }
                }
                Instr::JumpIfNot { cond, target: l } => {
                    if !bool_at(frame, *cond)? {
                        pc = target(proc, *l)?;
                        continue;
                    }
                }

                Instr::LoadLit { dst, lit } => {
                    let v = self.program.literals.get(lit.0 as usize).ok_or_else(|| {
                        EngineError::internal("machine", format!("unknown literal {}", lit.0))
                    })?;
                    set(frame, *dst, v.clone())?;
                }
                Instr::LoadBool { dst, val } => set(frame, *dst, Value::Bool(*val))?,
                Instr::Move { dst, src } => {
                    let v = get(frame, *src)?.clone();
                    set(frame, *dst, v)?;
                }
                Instr::TestMissing { dst, src } => {
                    let m = get(frame, *src)?.is_missing();
                    set(frame, *dst, Value::Bool(m))?;
                }
                Instr::BoolOr { dst, l, r } => {
                    let v = bool_at(frame, *l)? || bool_at(frame, *r)?;
                    set(frame, *dst, Value::Bool(v))?;
                }

                Instr::Binary { op, ty, dst, l, r } => {
                    let v = apply_binary(*op, ty, get(frame, *l)?, get(frame, *r)?)?;
                    set(frame, *dst, v)?;
                }
                Instr::Unary { op, dst, src } => {
                    let v = apply_unary(*op, get(frame, *src)?)?;
                    set(frame, *dst, v)?;
                }
                Instr::Compare { op, dst, l, r } => {
                    let v = compare_with(*op, get(frame, *l)?, get(frame, *r)?);
                    set(frame, *dst, Value::Bool(v))?;
                }

                Instr::ArrayNew { dst } => set(frame, *dst, Value::array(Vec::new()))?,
                Instr::ArrayPush { arr, src } => {
                    let v = get(frame, *src)?.clone();
                    match frame.get_mut(arr.0 as usize) {
                        Some(Value::Array(elems)) => Arc::make_mut(elems).push(v),
                        Some(other) => {
                            return Err(EngineError::internal(
                                "machine",
                                format!("push into non-array {other}"),
                            ))
                        }
                        None => return Err(bad_slot(*arr)),
                    }
                }
                Instr::ArrayLen { dst, arr } => {
                    let n = expect_array(get(frame, *arr)?)?.len();
                    set(frame, *dst, Value::Int32(n as i32))?;
                }
                Instr::ArrayGet { dst, arr, idx } => {
                    let i = expect_index(get(frame, *idx)?)?;
                    let elems = expect_array(get(frame, *arr)?)?;
                    if i < 0 || i as usize >= elems.len() {
                        return Err(EngineError::user(
                            crate::error::error_id::ARRAY_INDEX,
                            format!(
                                "index {i} out of bounds for array of length {}",
                                elems.len()
                            ),
                        ));
                    }
                    let v = elems[i as usize].clone();
                    set(frame, *dst, v)?;
                }
                Instr::ArraySort { dst, arr, ascending } => {
                    let mut elems = expect_array(get(frame, *arr)?)?.to_vec();
                    elems.sort_by(cmp_values);
                    if !ascending {
                        elems.reverse();
                    }
                    set(frame, *dst, Value::array(elems))?;
                }

                Instr::StructNew { dst, fields } => {
                    let vals = fields
                        .iter()
                        .map(|s| get(frame, *s).cloned())
                        .collect::<EngineResult<Vec<_>>>()?;
                    set(frame, *dst, Value::struct_(vals))?;
                }
                Instr::StructGet { dst, src, index } | Instr::TupleGet { dst, src, index } => {
                    let v = expect_fields(get(frame, *src)?)?
                        .get(*index)
                        .cloned()
                        .ok_or_else(|| {
                            EngineError::internal(
                                "machine",
                                format!("field index {index} out of range"),
                            )
                        })?;
                    set(frame, *dst, v)?;
                }
                Instr::TupleNew { dst, elems } => {
                    let vals = elems
                        .iter()
                        .map(|s| get(frame, *s).cloned())
                        .collect::<EngineResult<Vec<_>>>()?;
                    set(frame, *dst, Value::tuple(vals))?;
                }
                Instr::IntervalNew {
                    dst,
                    start,
                    end,
                    includes_start,
                    includes_end,
                } => {
                    let s = get(frame, *start)?.clone();
                    let e = get(frame, *end)?.clone();
                    set(
                        frame,
                        *dst,
                        Value::interval(s, e, *includes_start, *includes_end),
                    )?;
                }

                Instr::Host { op, dst, args } => {
                    let vals = args
                        .iter()
                        .map(|s| get(frame, *s).cloned())
                        .collect::<EngineResult<Vec<_>>>()?;
                    let v = self.host_call(op, &vals)?;
                    set(frame, *dst, v)?;
                }

                Instr::AggInit { cell } => self.agg_region()?.init(*cell)?,
                Instr::AggSeq { cell, src } => {
                    let v = get(frame, *src)?.clone();
                    self.agg_region()?.seq(*cell, v)?;
                }
                Instr::AggResult { dst, cell } => {
                    let v = self.agg_region()?.result(*cell)?;
                    set(frame, *dst, v)?;
                }

                Instr::Call { proc, args, dst } => {
                    let callee = self.proc(*proc)?;
                    if args.len() != callee.n_args {
                        return Err(EngineError::internal(
                            "machine",
                            format!(
                                "procedure {} expects {} arguments, got {}",
                                proc.0,
                                callee.n_args,
                                args.len()
                            ),
                        ));
                    }
                    let mut child = vec![Value::Missing; callee.n_slots];
                    for (i, s) in args.iter().enumerate() {
                        child[i] = get(frame, *s)?.clone();
                    }
                    match self.exec(*proc, &mut child)? {
                        Some(v) => set(frame, *dst, v)?,
                        None => {
                            return Err(EngineError::internal(
                                "machine",
                                "called procedure ended without a return",
                            ))
                        }
                    }
                }
                Instr::CallShared { proc } => {
                    // A return inside a shared body returns from the caller.
                    if let Some(v) = self.exec(*proc, frame)? {
                        return Ok(Some(v));
                    }
                }
                Instr::Return { src } => return Ok(Some(get(frame, *src)?.clone())),
                Instr::ReturnShared => return Ok(None),
                Instr::Fail { id, msg } => {
                    let m = self.program.literals.get(msg.0 as usize).ok_or_else(|| {
                        EngineError::internal("machine", format!("unknown literal {}", msg.0))
                    })?;
                    let text = match m {
                        Value::Str(s) => s.to_string(),
                        other => other.to_string(),
                    };
                    return Err(EngineError::user(*id, text));
                }
            }
            pc += 1;
        }
        Ok(None)
    }

    fn host_call(&mut self, op: &HostOp, args: &[Value]) -> EngineResult<Value> {
        if let HostOp::RngUniform { static_uid } = op {
            let (lo, hi) = match args {
                [Value::Float64(lo), Value::Float64(hi)] => (*lo, *hi),
                _ => {
                    return Err(EngineError::internal(
                        "machine",
                        format!("rng draw with non-float bounds {args:?}"),
                    ))
                }
            };
            return Ok(Value::Float64(seeded_uniform(
                self.rng_seed,
                *static_uid,
                lo,
                hi,
            )));
        }
        match self.host.as_mut() {
            Some(h) => h.call(op, args),
            None => Err(EngineError::internal(
                "machine",
                format!("host operation {op:?} with no host bound"),
            )),
        }
    }

    fn agg_region(&mut self) -> EngineResult<&mut AggRegion> {
        match self.agg.as_deref_mut() {
            Some(r) => Ok(r),
            None => Err(EngineError::internal(
                "machine",
                "aggregation instruction with no region bound",
            )),
        }
    }
}

fn target(proc: &Proc, l: Label) -> EngineResult<usize> {
    proc.label_pc.get(&l.0).copied().ok_or_else(|| {
        EngineError::internal("machine", format!("jump to unmarked label {}", l.0))
    })
}

fn bad_slot(s: Slot) -> EngineError {
    EngineError::internal("machine", format!("slot {} outside the frame", s.0))
}

fn get(frame: &[Value], s: Slot) -> EngineResult<&Value> {
    frame.get(s.0 as usize).ok_or_else(|| bad_slot(s))
}

fn set(frame: &mut [Value], s: Slot, v: Value) -> EngineResult<()> {
    match frame.get_mut(s.0 as usize) {
        Some(slot) => {
            *slot = v;
            Ok(())
        }
        None => Err(bad_slot(s)),
    }
}

fn bool_at(frame: &[Value], s: Slot) -> EngineResult<bool> {
    match get(frame, s)? {
        Value::Bool(b) => Ok(*b),
        other => Err(EngineError::internal(
            "machine",
            format!("branch on non-boolean {other}"),
        )),
    }
}

fn expect_array(v: &Value) -> EngineResult<&[Value]> {
    match v {
        Value::Array(elems) => Ok(elems),
        other => Err(EngineError::internal(
            "machine",
            format!("expected array, found {other}"),
        )),
    }
}

fn expect_fields(v: &Value) -> EngineResult<&[Value]> {
    match v {
        Value::Struct(fields) | Value::Tuple(fields) => Ok(fields),
        other => Err(EngineError::internal(
            "machine",
            format!("expected struct or tuple, found {other}"),
        )),
    }
}

fn expect_index(v: &Value) -> EngineResult<i64> {
    match v {
        Value::Int32(i) => Ok(i64::from(*i)),
        Value::Int64(i) => Ok(*i),
        other => Err(EngineError::internal(
            "machine",
            format!("expected integer index, found {other}"),
        )),
    }
}
