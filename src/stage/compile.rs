//! IR-to-routine compiler
//!
//! Walks a compilable IR tree once and emits register code through the
//! [`CodeBuilder`]. The translation follows three schemes:
//!
//! - **Missingness slots**: every emitted expression is an [`EmitValue`],
//!   a value slot plus an optional boolean presence slot. Strict nodes
//!   evaluate children left to right and branch to a shared not-present
//!   block the moment one child's flag is set, mirroring the interpreter's
//!   short-circuit order. Expressions that are statically present carry no
//!   flag and cost nothing.
//! - **Fused stream loops**: a stream subtree never materializes. Each
//!   combinator compiles to a [`Producer`], a pair of init/advance
//!   instruction fragments over shared slots; the consumer stitches the
//!   fragments into a single loop, so a map-filter-zip chain runs as one
//!   pass with no intermediate collections.
//! - **Aggregator cells**: each `StreamAgg` site gets a region cell at
//!   compile time and is addressed by index with init/seq/result
//!   instructions.
//!
//! The compiler trusts [`IrNode::is_compilable`]; reaching a relational node
//! here is an internal error, not a fallback.

use tracing::debug;

use crate::error::{error_id, EngineError, EngineResult};
use crate::ir::{AggOp, IrNode, ZipBehavior};
use crate::types::VType;
use crate::value::Value;

use super::builder::CodeBuilder;
use super::instr::{HostOp, Instr, Label, Program, Slot};

/// A compiled expression: where its value lives and whether it is present
#[derive(Debug, Clone)]
pub struct EmitValue {
    /// Slot holding the value when present
    pub slot: Slot,
    /// Presence flag; `None` means statically present
    pub missing: Option<Slot>,
    /// Static type from the tree
    pub typ: VType,
}

/// One stream stage as instruction fragments. `init` runs once before the
/// loop; `advance` computes the next element into `elem` or jumps to `end`
/// when exhausted. `missing` is set by `init` when the stream itself turned
/// out to be missing.
struct Producer {
    init: Vec<Instr>,
    advance: Vec<Instr>,
    elem: EmitValue,
    end: Label,
    missing: Option<Slot>,
}

/// Compile `ir` into a routine taking `args` (in order) as entry arguments
pub fn compile_program(
    ir: &IrNode,
    args: &[(String, VType)],
    split_threshold: usize,
) -> EngineResult<Program> {
    if !ir.is_compilable() {
        return Err(EngineError::internal(
            "codegen",
            format!("non-compilable node {} reached the compiler", ir.kind_name()),
        ));
    }
    let mut c = Compiler {
        b: CodeBuilder::new(split_threshold),
        env: Vec::new(),
        agg_sig: Vec::new(),
    };
    let entry = c.b.begin_proc(args.len());
    for (i, (name, typ)) in args.iter().enumerate() {
        let slot = Slot(i as u32);
        let flag = c.b.slot();
        c.b.push(Instr::TestMissing { dst: flag, src: slot });
        c.env.push((
            name.clone(),
            EmitValue {
                slot,
                missing: Some(flag),
                typ: typ.clone(),
            },
        ));
    }
    let out = c.emit(ir)?;
    let ret = c.materialize(&out);
    c.b.push(Instr::Return { src: ret });
    c.b.seal_proc()?;
    let program = c.b.finish(entry, c.agg_sig)?;
    debug!(
        procs = program.procs.len(),
        instrs = program.instr_count(),
        agg_cells = program.agg_signature.len(),
        "staged_compile_done"
    );
    Ok(program)
}

struct Compiler {
    b: CodeBuilder,
    env: Vec<(String, EmitValue)>,
    agg_sig: Vec<AggOp>,
}

impl Compiler {
    // ------------------------------------------------------------------
    // Emission helpers
    // ------------------------------------------------------------------

    fn lookup(&self, name: &str) -> EngineResult<EmitValue> {
        self.env
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, ev)| ev.clone())
            .ok_or_else(|| {
                EngineError::internal("codegen", format!("unbound reference '{name}'"))
            })
    }

    /// Collapse an [`EmitValue`] into one slot that holds `Missing` when the
    /// flag is set
    fn materialize(&mut self, ev: &EmitValue) -> Slot {
        match ev.missing {
            None => ev.slot,
            Some(f) => {
                let out = self.b.slot();
                self.b.push(Instr::Move {
                    dst: out,
                    src: ev.slot,
                });
                let skip = self.b.label();
                self.b.push(Instr::JumpIfNot {
                    cond: f,
                    target: skip,
                });
                let miss = self.b.lit(Value::Missing);
                self.b.push(Instr::LoadLit { dst: out, lit: miss });
                self.b.push(Instr::Mark(skip));
                out
            }
        }
    }

    /// Begin a strict node: allocate the result slot (preset to missing),
    /// emit the children left to right, and after each missing-capable child
    /// branch to a shared not-present label. Returns the children, the
    /// result slot and the label (if any child can be missing).
    fn strict(
        &mut self,
        children: &[&IrNode],
    ) -> EngineResult<(Vec<EmitValue>, Slot, Option<Label>)> {
        let dst = self.b.slot();
        let miss = self.b.lit(Value::Missing);
        self.b.push(Instr::LoadLit { dst, lit: miss });
        let mut na: Option<Label> = None;
        let mut evs = Vec::with_capacity(children.len());
        for c in children {
            let ev = self.emit(c)?;
            if let Some(f) = ev.missing {
                let l = match na {
                    Some(l) => l,
                    None => {
                        let l = self.b.label();
                        na = Some(l);
                        l
                    }
                };
                self.b.push(Instr::JumpIf { cond: f, target: l });
            }
            evs.push(ev);
        }
        Ok((evs, dst, na))
    }

    /// Close a strict node. `elementwise` is set when the computed value can
    /// itself be missing (field and element loads), forcing a runtime test.
    fn finish_strict(
        &mut self,
        dst: Slot,
        na: Option<Label>,
        typ: VType,
        elementwise: bool,
    ) -> EmitValue {
        if let Some(l) = na {
            self.b.push(Instr::Mark(l));
        }
        let missing = if elementwise || na.is_some() {
            let m = self.b.slot();
            self.b.push(Instr::TestMissing { dst: m, src: dst });
            Some(m)
        } else {
            None
        };
        EmitValue { slot: dst, missing, typ }
    }

    /// Store an arbitrary [`EmitValue`] into a fixed value/flag slot pair
    fn store_into(&mut self, ev: &EmitValue, dst: Slot, m: Slot) {
        self.b.push(Instr::Move {
            dst,
            src: ev.slot,
        });
        match ev.missing {
            None => self.b.push(Instr::LoadBool { dst: m, val: false }),
            Some(f) => self.b.push(Instr::Move { dst: m, src: f }),
        }
    }

    // ------------------------------------------------------------------
    // Expression emission
    // ------------------------------------------------------------------

    fn emit(&mut self, ir: &IrNode) -> EngineResult<EmitValue> {
        let ev = self.emit_inner(ir)?;
        self.b.maybe_split()?;
        Ok(ev)
    }

    fn emit_inner(&mut self, ir: &IrNode) -> EngineResult<EmitValue> {
        use IrNode::*;
        match ir {
            I32(v) => self.emit_lit(Value::Int32(*v), VType::Int32),
            I64(v) => self.emit_lit(Value::Int64(*v), VType::Int64),
            F64(v) => self.emit_lit(Value::Float64(*v), VType::Float64),
            Bool(v) => self.emit_lit(Value::Bool(*v), VType::Bool),
            Str(s) => self.emit_lit(Value::str(s), VType::Str),
            Void => self.emit_lit(Value::Missing, VType::Void),
            NA(t) => {
                let slot = self.b.slot();
                let miss = self.b.lit(Value::Missing);
                self.b.push(Instr::LoadLit { dst: slot, lit: miss });
                let flag = self.b.slot();
                self.b.push(Instr::LoadBool {
                    dst: flag,
                    val: true,
                });
                Ok(EmitValue {
                    slot,
                    missing: Some(flag),
                    typ: t.clone(),
                })
            }
            Literal { value, typ } => {
                let ev = self.emit_lit(value.clone(), typ.clone())?;
                if value.is_missing() {
                    let flag = self.b.slot();
                    self.b.push(Instr::LoadBool {
                        dst: flag,
                        val: true,
                    });
                    return Ok(EmitValue {
                        missing: Some(flag),
                        ..ev
                    });
                }
                Ok(ev)
            }

            Ref { name, .. } => self.lookup(name),
            Let { name, value, body } | AggLet { name, value, body } => {
                let v = self.emit(value)?;
                self.env.push((name.clone(), v));
                let out = self.emit(body);
                self.env.pop();
                out
            }

            ApplyBinaryPrimOp { op, l, r } => {
                let ty = ir.typ()?;
                let (evs, dst, na) = self.strict(&[l, r])?;
                self.b.push(Instr::Binary {
                    op: *op,
                    ty: ty.clone(),
                    dst,
                    l: evs[0].slot,
                    r: evs[1].slot,
                });
                Ok(self.finish_strict(dst, na, ty, false))
            }
            ApplyUnaryPrimOp { op, x } => {
                let ty = ir.typ()?;
                let (evs, dst, na) = self.strict(&[x])?;
                self.b.push(Instr::Unary {
                    op: *op,
                    dst,
                    src: evs[0].slot,
                });
                Ok(self.finish_strict(dst, na, ty, false))
            }
            ApplyComparisonOp { op, l, r } => {
                let (evs, dst, na) = self.strict(&[l, r])?;
                self.b.push(Instr::Compare {
                    op: *op,
                    dst,
                    l: evs[0].slot,
                    r: evs[1].slot,
                });
                Ok(self.finish_strict(dst, na, VType::Bool, false))
            }

            If { cond, cnsq, altr } => {
                let typ = ir.typ()?;
                let c = self.emit(cond)?;
                let dst = self.b.slot();
                let m = self.b.slot();
                let else_l = self.b.label();
                let end = self.b.label();
                let na_l = c.missing.map(|f| {
                    let l = self.b.label();
                    self.b.push(Instr::JumpIf { cond: f, target: l });
                    l
                });
                self.b.push(Instr::JumpIfNot {
                    cond: c.slot,
                    target: else_l,
                });
                let t = self.emit(cnsq)?;
                self.store_into(&t, dst, m);
                self.b.push(Instr::Jump(end));
                self.b.push(Instr::Mark(else_l));
                let e = self.emit(altr)?;
                self.store_into(&e, dst, m);
                if let Some(l) = na_l {
                    self.b.push(Instr::Jump(end));
                    self.b.push(Instr::Mark(l));
                    let miss = self.b.lit(Value::Missing);
                    self.b.push(Instr::LoadLit { dst, lit: miss });
                    self.b.push(Instr::LoadBool { dst: m, val: true });
                }
                self.b.push(Instr::Mark(end));
                Ok(EmitValue {
                    slot: dst,
                    missing: Some(m),
                    typ,
                })
            }

            Coalesce(args) => {
                let typ = ir.typ()?;
                let dst = self.b.slot();
                let m = self.b.slot();
                let miss = self.b.lit(Value::Missing);
                self.b.push(Instr::LoadLit { dst, lit: miss });
                self.b.push(Instr::LoadBool { dst: m, val: true });
                let end = self.b.label();
                for a in args {
                    let ev = self.emit(a)?;
                    match ev.missing {
                        None => {
                            // Statically present: later arguments are dead.
                            self.b.push(Instr::Move { dst, src: ev.slot });
                            self.b.push(Instr::LoadBool { dst: m, val: false });
                            self.b.push(Instr::Jump(end));
                            break;
                        }
                        Some(f) => {
                            let skip = self.b.label();
                            self.b.push(Instr::JumpIf {
                                cond: f,
                                target: skip,
                            });
                            self.b.push(Instr::Move { dst, src: ev.slot });
                            self.b.push(Instr::LoadBool { dst: m, val: false });
                            self.b.push(Instr::Jump(end));
                            self.b.push(Instr::Mark(skip));
                        }
                    }
                }
                self.b.push(Instr::Mark(end));
                Ok(EmitValue {
                    slot: dst,
                    missing: Some(m),
                    typ,
                })
            }

            IsNA(x) => {
                let ev = self.emit(x)?;
                let dst = self.b.slot();
                match ev.missing {
                    Some(f) => self.b.push(Instr::Move { dst, src: f }),
                    None => self.b.push(Instr::LoadBool { dst, val: false }),
                }
                Ok(EmitValue {
                    slot: dst,
                    missing: None,
                    typ: VType::Bool,
                })
            }

            And { l, r } => self.emit_kleene(l, r, false),
            Or { l, r } => self.emit_kleene(l, r, true),

            Die { message, typ } => {
                let msg = self.b.lit(Value::str(message));
                self.b.push(Instr::Fail {
                    id: error_id::DIE,
                    msg,
                });
                // Unreachable; a slot is produced to keep the caller regular.
                let slot = self.b.slot();
                Ok(EmitValue {
                    slot,
                    missing: None,
                    typ: typ.clone(),
                })
            }

            MakeArray { elems, elem_type } => {
                let dst = self.b.slot();
                // Elements are evaluated before the array exists, matching
                // left-to-right evaluation order.
                let mut slots = Vec::with_capacity(elems.len());
                for e in elems {
                    let ev = self.emit(e)?;
                    slots.push(self.materialize(&ev));
                }
                self.b.push(Instr::ArrayNew { dst });
                for s in slots {
                    self.b.push(Instr::ArrayPush { arr: dst, src: s });
                }
                Ok(EmitValue {
                    slot: dst,
                    missing: None,
                    typ: VType::array(elem_type.clone()),
                })
            }
            ArrayRef { a, i } => {
                let typ = ir.typ()?;
                let (evs, dst, na) = self.strict(&[a, i])?;
                self.b.push(Instr::ArrayGet {
                    dst,
                    arr: evs[0].slot,
                    idx: evs[1].slot,
                });
                Ok(self.finish_strict(dst, na, typ, true))
            }
            ArrayLen(a) => {
                let (evs, dst, na) = self.strict(&[a])?;
                self.b.push(Instr::ArrayLen {
                    dst,
                    arr: evs[0].slot,
                });
                Ok(self.finish_strict(dst, na, VType::Int32, false))
            }
            ArraySort { a, ascending } => {
                let typ = ir.typ()?;
                let (evs, dst, na) = self.strict(&[a])?;
                self.b.push(Instr::ArraySort {
                    dst,
                    arr: evs[0].slot,
                    ascending: *ascending,
                });
                Ok(self.finish_strict(dst, na, typ, false))
            }

            ToArray(s) => self.emit_collect(s, ir.typ()?),
            ToStream(_) | StreamRange { .. } | StreamMap { .. } | StreamFilter { .. }
            | StreamFlatMap { .. } | StreamTakeWhile { .. } | StreamZip { .. }
            | StreamMultiMerge(_) => Err(EngineError::internal(
                "codegen",
                format!(
                    "stream-typed {} in value position; streams are only \
                     consumed by fused loops",
                    ir.kind_name()
                ),
            )),

            StreamFold {
                s,
                zero,
                accum_name,
                value_name,
                body,
            } => {
                let typ = ir.typ()?;
                let zero_ev = self.emit(zero)?;
                let acc = self.b.slot();
                let accm = self.b.slot();
                self.store_into(&zero_ev, acc, accm);
                let acc_ev = EmitValue {
                    slot: acc,
                    missing: Some(accm),
                    typ: zero_ev.typ.clone(),
                };
                let p = self.compile_stream(s)?;
                let done = self.b.label();
                self.b.begin_barrier();
                self.b.splice(p.init);
                let na_l = p.missing.map(|sm| {
                    let l = self.b.label();
                    self.b.push(Instr::JumpIf { cond: sm, target: l });
                    l
                });
                let top = self.b.label();
                self.b.push(Instr::Mark(top));
                self.b.splice(p.advance);
                self.env.push((accum_name.clone(), acc_ev));
                self.env.push((value_name.clone(), p.elem.clone()));
                let body_ev = self.emit(body);
                self.env.pop();
                self.env.pop();
                let body_ev = body_ev?;
                self.store_into(&body_ev, acc, accm);
                self.b.push(Instr::Jump(top));
                self.b.push(Instr::Mark(p.end));
                if let Some(l) = na_l {
                    self.b.push(Instr::Jump(done));
                    self.b.push(Instr::Mark(l));
                    let miss = self.b.lit(Value::Missing);
                    self.b.push(Instr::LoadLit { dst: acc, lit: miss });
                    self.b.push(Instr::LoadBool {
                        dst: accm,
                        val: true,
                    });
                }
                self.b.push(Instr::Mark(done));
                self.b.end_barrier();
                Ok(EmitValue {
                    slot: acc,
                    missing: Some(accm),
                    typ,
                })
            }

            StreamAgg { s, name, op, value } => {
                let typ = ir.typ()?;
                let cell = self.agg_sig.len();
                self.agg_sig.push(*op);
                let p = self.compile_stream(s)?;
                let dst = self.b.slot();
                let done = self.b.label();
                self.b.begin_barrier();
                self.b.push(Instr::AggInit { cell });
                self.b.splice(p.init);
                let na_l = p.missing.map(|sm| {
                    let l = self.b.label();
                    self.b.push(Instr::JumpIf { cond: sm, target: l });
                    l
                });
                let top = self.b.label();
                self.b.push(Instr::Mark(top));
                self.b.splice(p.advance);
                self.env.push((name.clone(), p.elem.clone()));
                let v = self.emit(value);
                self.env.pop();
                let v = v?;
                let src = self.materialize(&v);
                self.b.push(Instr::AggSeq { cell, src });
                self.b.push(Instr::Jump(top));
                self.b.push(Instr::Mark(p.end));
                self.b.push(Instr::AggResult { dst, cell });
                if let Some(l) = na_l {
                    self.b.push(Instr::Jump(done));
                    self.b.push(Instr::Mark(l));
                    let miss = self.b.lit(Value::Missing);
                    self.b.push(Instr::LoadLit { dst, lit: miss });
                }
                self.b.push(Instr::Mark(done));
                self.b.end_barrier();
                let m = self.b.slot();
                self.b.push(Instr::TestMissing { dst: m, src: dst });
                Ok(EmitValue {
                    slot: dst,
                    missing: Some(m),
                    typ,
                })
            }

            MakeStruct { fields } => {
                let typ = ir.typ()?;
                let mut slots = Vec::with_capacity(fields.len());
                for (_, v) in fields {
                    let ev = self.emit(v)?;
                    slots.push(self.materialize(&ev));
                }
                let dst = self.b.slot();
                self.b.push(Instr::StructNew { dst, fields: slots });
                Ok(EmitValue {
                    slot: dst,
                    missing: None,
                    typ,
                })
            }
            GetField { o, name } => {
                let typ = ir.typ()?;
                let index = o.typ()?.field_index(name).ok_or_else(|| {
                    EngineError::internal("codegen", format!("GetField of unknown field '{name}'"))
                })?;
                let (evs, dst, na) = self.strict(&[o])?;
                self.b.push(Instr::StructGet {
                    dst,
                    src: evs[0].slot,
                    index,
                });
                Ok(self.finish_strict(dst, na, typ, true))
            }
            InsertFields { o, fields } => {
                let typ = ir.typ()?;
                let base_t = o.typ()?;
                let (evs, dst, na) = self.strict(&[o])?;
                let base = evs[0].slot;
                // Inserted values are computed only when the base is present.
                let mut inserted = Vec::with_capacity(fields.len());
                for (n, v) in fields {
                    let ev = self.emit(v)?;
                    let s = self.materialize(&ev);
                    inserted.push((n.as_str(), s));
                }
                let out_fields = match &typ {
                    VType::Struct(fs) => fs,
                    other => {
                        return Err(EngineError::internal(
                            "codegen",
                            format!("InsertFields typed as non-struct {other}"),
                        ))
                    }
                };
                let mut slots = Vec::with_capacity(out_fields.len());
                for (fname, _) in out_fields {
                    if let Some((_, s)) = inserted.iter().rev().find(|(n, _)| n == fname) {
                        slots.push(*s);
                    } else {
                        let idx = base_t.field_index(fname).ok_or_else(|| {
                            EngineError::internal(
                                "codegen",
                                format!("InsertFields lost field '{fname}'"),
                            )
                        })?;
                        let s = self.b.slot();
                        self.b.push(Instr::StructGet {
                            dst: s,
                            src: base,
                            index: idx,
                        });
                        slots.push(s);
                    }
                }
                self.b.push(Instr::StructNew { dst, fields: slots });
                Ok(self.finish_strict(dst, na, typ, false))
            }
            SelectFields { o, names } => {
                let typ = ir.typ()?;
                let base_t = o.typ()?;
                let (evs, dst, na) = self.strict(&[o])?;
                let mut slots = Vec::with_capacity(names.len());
                for n in names {
                    let idx = base_t.field_index(n).ok_or_else(|| {
                        EngineError::internal(
                            "codegen",
                            format!("SelectFields of unknown field '{n}'"),
                        )
                    })?;
                    let s = self.b.slot();
                    self.b.push(Instr::StructGet {
                        dst: s,
                        src: evs[0].slot,
                        index: idx,
                    });
                    slots.push(s);
                }
                self.b.push(Instr::StructNew { dst, fields: slots });
                Ok(self.finish_strict(dst, na, typ, false))
            }
            MakeTuple(elems) => {
                let typ = ir.typ()?;
                let mut slots = Vec::with_capacity(elems.len());
                for e in elems {
                    let ev = self.emit(e)?;
                    slots.push(self.materialize(&ev));
                }
                let dst = self.b.slot();
                self.b.push(Instr::TupleNew { dst, elems: slots });
                Ok(EmitValue {
                    slot: dst,
                    missing: None,
                    typ,
                })
            }
            GetTupleElement { o, idx } => {
                let typ = ir.typ()?;
                let (evs, dst, na) = self.strict(&[o])?;
                self.b.push(Instr::TupleGet {
                    dst,
                    src: evs[0].slot,
                    index: *idx,
                });
                Ok(self.finish_strict(dst, na, typ, true))
            }

            MakeInterval {
                start,
                end,
                includes_start,
                includes_end,
            } => {
                let typ = ir.typ()?;
                let (evs, dst, na) = self.strict(&[start, end])?;
                self.b.push(Instr::IntervalNew {
                    dst,
                    start: evs[0].slot,
                    end: evs[1].slot,
                    includes_start: *includes_start,
                    includes_end: *includes_end,
                });
                Ok(self.finish_strict(dst, na, typ, false))
            }

            ApplyRngUniform { static_uid, lo, hi } => {
                let (evs, dst, na) = self.strict(&[lo, hi])?;
                self.b.push(Instr::Host {
                    op: HostOp::RngUniform {
                        static_uid: *static_uid,
                    },
                    dst,
                    args: vec![evs[0].slot, evs[1].slot],
                });
                Ok(self.finish_strict(dst, na, VType::Float64, false))
            }

            TableRange { .. }
            | TableFilter { .. }
            | TableMapRows { .. }
            | TableKeyBy { .. }
            | TableCount(_)
            | TableCollect(_) => Err(EngineError::internal(
                "codegen",
                format!("relational node {} reached the compiler", ir.kind_name()),
            )),
        }
    }

    fn emit_lit(&mut self, v: Value, typ: VType) -> EngineResult<EmitValue> {
        let slot = self.b.slot();
        let lit = self.b.lit(v);
        self.b.push(Instr::LoadLit { dst: slot, lit });
        Ok(EmitValue {
            slot,
            missing: None,
            typ,
        })
    }

    /// Three-valued `And` (`identity == false`) and `Or` (`identity == true`):
    /// a present decisive side wins without evaluating further, otherwise
    /// missingness contaminates.
    fn emit_kleene(&mut self, l: &IrNode, r: &IrNode, or: bool) -> EngineResult<EmitValue> {
        let dst = self.b.slot();
        let m = self.b.slot();
        let decided = self.b.label();
        let na = self.b.label();
        let end = self.b.label();

        let lv = self.emit(l)?;
        let skip_l = self.b.label();
        if let Some(f) = lv.missing {
            self.b.push(Instr::JumpIf {
                cond: f,
                target: skip_l,
            });
        }
        // A present decisive left side short-circuits the right side.
        if or {
            self.b.push(Instr::JumpIf {
                cond: lv.slot,
                target: decided,
            });
        } else {
            self.b.push(Instr::JumpIfNot {
                cond: lv.slot,
                target: decided,
            });
        }
        self.b.push(Instr::Mark(skip_l));

        let rv = self.emit(r)?;
        let skip_r = self.b.label();
        if let Some(f) = rv.missing {
            self.b.push(Instr::JumpIf {
                cond: f,
                target: skip_r,
            });
        }
        if or {
            self.b.push(Instr::JumpIf {
                cond: rv.slot,
                target: decided,
            });
        } else {
            self.b.push(Instr::JumpIfNot {
                cond: rv.slot,
                target: decided,
            });
        }
        self.b.push(Instr::Mark(skip_r));

        // No decisive side; missing on either side contaminates.
        match (lv.missing, rv.missing) {
            (Some(a), Some(b)) => {
                let any = self.b.slot();
                self.b.push(Instr::BoolOr { dst: any, l: a, r: b });
                self.b.push(Instr::JumpIf {
                    cond: any,
                    target: na,
                });
            }
            (Some(a), None) | (None, Some(a)) => {
                self.b.push(Instr::JumpIf { cond: a, target: na });
            }
            (None, None) => {}
        }
        self.b.push(Instr::LoadBool { dst, val: !or });
        self.b.push(Instr::LoadBool { dst: m, val: false });
        self.b.push(Instr::Jump(end));

        self.b.push(Instr::Mark(decided));
        self.b.push(Instr::LoadBool { dst, val: or });
        self.b.push(Instr::LoadBool { dst: m, val: false });
        self.b.push(Instr::Jump(end));

        self.b.push(Instr::Mark(na));
        let miss = self.b.lit(Value::Missing);
        self.b.push(Instr::LoadLit { dst, lit: miss });
        self.b.push(Instr::LoadBool { dst: m, val: true });

        self.b.push(Instr::Mark(end));
        Ok(EmitValue {
            slot: dst,
            missing: Some(m),
            typ: VType::Bool,
        })
    }

    /// `ToArray` over a stream: drive the fused loop, pushing each element
    fn emit_collect(&mut self, s: &IrNode, typ: VType) -> EngineResult<EmitValue> {
        let p = self.compile_stream(s)?;
        let dst = self.b.slot();
        let m = self.b.slot();
        let done = self.b.label();
        self.b.begin_barrier();
        self.b.splice(p.init);
        let na_l = p.missing.map(|sm| {
            let l = self.b.label();
            self.b.push(Instr::JumpIf { cond: sm, target: l });
            l
        });
        self.b.push(Instr::ArrayNew { dst });
        let top = self.b.label();
        self.b.push(Instr::Mark(top));
        self.b.splice(p.advance);
        let el = self.materialize(&p.elem);
        self.b.push(Instr::ArrayPush { arr: dst, src: el });
        self.b.push(Instr::Jump(top));
        self.b.push(Instr::Mark(p.end));
        self.b.push(Instr::LoadBool { dst: m, val: false });
        if let Some(l) = na_l {
            self.b.push(Instr::Jump(done));
            self.b.push(Instr::Mark(l));
            let miss = self.b.lit(Value::Missing);
            self.b.push(Instr::LoadLit { dst, lit: miss });
            self.b.push(Instr::LoadBool { dst: m, val: true });
        }
        self.b.push(Instr::Mark(done));
        self.b.end_barrier();
        Ok(EmitValue {
            slot: dst,
            missing: Some(m),
            typ,
        })
    }

    // ------------------------------------------------------------------
    // Stream producers
    // ------------------------------------------------------------------

    fn compile_stream(&mut self, ir: &IrNode) -> EngineResult<Producer> {
        use IrNode::*;
        match ir {
            StreamRange { start, stop, step } => self.range_producer(start, stop, step),
            ToStream(a) => self.array_producer(a),
            StreamMap { s, name, body } => {
                let inner = self.compile_stream(s)?;
                self.b.begin_fragment();
                self.b.splice(inner.advance);
                self.env.push((name.clone(), inner.elem.clone()));
                let body_ev = self.emit(body);
                self.env.pop();
                let body_ev = body_ev?;
                let advance = self.b.end_fragment()?;
                Ok(Producer {
                    init: inner.init,
                    advance,
                    elem: body_ev,
                    end: inner.end,
                    missing: inner.missing,
                })
            }
            StreamFilter { s, name, cond } => {
                let inner = self.compile_stream(s)?;
                self.b.begin_fragment();
                let retry = self.b.label();
                self.b.push(Instr::Mark(retry));
                self.b.splice(inner.advance);
                self.env.push((name.clone(), inner.elem.clone()));
                let c = self.emit(cond);
                self.env.pop();
                let c = c?;
                // A missing condition drops the element.
                if let Some(f) = c.missing {
                    self.b.push(Instr::JumpIf {
                        cond: f,
                        target: retry,
                    });
                }
                self.b.push(Instr::JumpIfNot {
                    cond: c.slot,
                    target: retry,
                });
                let advance = self.b.end_fragment()?;
                Ok(Producer {
                    init: inner.init,
                    advance,
                    elem: inner.elem,
                    end: inner.end,
                    missing: inner.missing,
                })
            }
            StreamTakeWhile { s, name, cond } => {
                let inner = self.compile_stream(s)?;
                self.b.begin_fragment();
                self.b.splice(inner.advance);
                self.env.push((name.clone(), inner.elem.clone()));
                let c = self.emit(cond);
                self.env.pop();
                let c = c?;
                // A missing condition stops the stream.
                if let Some(f) = c.missing {
                    self.b.push(Instr::JumpIf {
                        cond: f,
                        target: inner.end,
                    });
                }
                self.b.push(Instr::JumpIfNot {
                    cond: c.slot,
                    target: inner.end,
                });
                let advance = self.b.end_fragment()?;
                Ok(Producer {
                    init: inner.init,
                    advance,
                    elem: inner.elem,
                    end: inner.end,
                    missing: inner.missing,
                })
            }
            StreamFlatMap { s, name, body } => {
                let outer = self.compile_stream(s)?;
                self.env.push((name.clone(), outer.elem.clone()));
                let body_p = self.compile_stream(body);
                self.env.pop();
                let body_p = body_p?;

                let active = self.b.slot();
                self.b.begin_fragment();
                self.b.splice(outer.init);
                self.b.push(Instr::LoadBool {
                    dst: active,
                    val: false,
                });
                let init = self.b.end_fragment()?;

                self.b.begin_fragment();
                let retry = self.b.label();
                let fetch = self.b.label();
                let got = self.b.label();
                self.b.push(Instr::Mark(retry));
                self.b.push(Instr::JumpIfNot {
                    cond: active,
                    target: fetch,
                });
                self.b.splice(body_p.advance);
                self.b.push(Instr::Jump(got));
                self.b.push(Instr::Mark(body_p.end));
                self.b.push(Instr::LoadBool {
                    dst: active,
                    val: false,
                });
                self.b.push(Instr::Mark(fetch));
                self.b.splice(outer.advance);
                self.b.splice(body_p.init);
                // A missing inner stream skips this outer element.
                if let Some(f) = body_p.missing {
                    self.b.push(Instr::JumpIf {
                        cond: f,
                        target: fetch,
                    });
                }
                self.b.push(Instr::LoadBool {
                    dst: active,
                    val: true,
                });
                self.b.push(Instr::Jump(retry));
                self.b.push(Instr::Mark(got));
                let advance = self.b.end_fragment()?;
                Ok(Producer {
                    init,
                    advance,
                    elem: body_p.elem,
                    end: outer.end,
                    missing: outer.missing,
                })
            }
            StreamZip {
                streams,
                names,
                body,
                behavior,
            } => self.zip_producer(streams, names, body, *behavior),
            StreamMultiMerge(streams) => self.merge_producer(streams, ir.typ()?),
            Let { name, value, body } | AggLet { name, value, body } => {
                // A binder over a stream body: the bound value joins the
                // stream's init so it is computed once per activation.
                self.b.begin_fragment();
                let v = self.emit(value)?;
                let pre = self.b.end_fragment()?;
                self.env.push((name.clone(), v));
                let inner = self.compile_stream(body);
                self.env.pop();
                let mut inner = inner?;
                let mut init = pre;
                init.append(&mut inner.init);
                inner.init = init;
                Ok(inner)
            }
            other => Err(EngineError::internal(
                "codegen",
                format!(
                    "no loop shape for stream node {}; the dispatcher should \
                     have sent this tree to the interpreter",
                    other.kind_name()
                ),
            )),
        }
    }

    fn range_producer(
        &mut self,
        start: &IrNode,
        stop: &IrNode,
        step: &IrNode,
    ) -> EngineResult<Producer> {
        let end = self.b.label();
        let cur = self.b.slot();
        let stop_s = self.b.slot();
        let step_s = self.b.slot();
        let zero = self.b.slot();
        let elem = self.b.slot();

        self.b.begin_fragment();
        let sm = self.b.slot();
        self.b.push(Instr::LoadBool {
            dst: sm,
            val: false,
        });
        let miss_l = self.b.label();
        let mut any_missing = false;
        let mut parts = Vec::new();
        for child in [start, stop, step] {
            let ev = self.emit(child)?;
            if let Some(f) = ev.missing {
                any_missing = true;
                self.b.push(Instr::JumpIf {
                    cond: f,
                    target: miss_l,
                });
            }
            parts.push(ev);
        }
        self.b.push(Instr::Move {
            dst: cur,
            src: parts[0].slot,
        });
        self.b.push(Instr::Move {
            dst: stop_s,
            src: parts[1].slot,
        });
        self.b.push(Instr::Move {
            dst: step_s,
            src: parts[2].slot,
        });
        let zero_lit = self.b.lit(Value::Int32(0));
        self.b.push(Instr::LoadLit {
            dst: zero,
            lit: zero_lit,
        });
        let nonzero = self.b.label();
        let eq = self.b.slot();
        self.b.push(Instr::Compare {
            op: crate::ir::ComparisonOp::Ne,
            dst: eq,
            l: step_s,
            r: zero,
        });
        self.b.push(Instr::JumpIf {
            cond: eq,
            target: nonzero,
        });
        let msg = self.b.lit(Value::str("StreamRange step must be non-zero"));
        self.b.push(Instr::Fail {
            id: error_id::RANGE_STEP,
            msg,
        });
        self.b.push(Instr::Mark(nonzero));
        let missing = if any_missing {
            let ok = self.b.label();
            self.b.push(Instr::Jump(ok));
            self.b.push(Instr::Mark(miss_l));
            self.b.push(Instr::LoadBool { dst: sm, val: true });
            self.b.push(Instr::Mark(ok));
            Some(sm)
        } else {
            None
        };
        let init = self.b.end_fragment()?;

        self.b.begin_fragment();
        let pos = self.b.slot();
        let t = self.b.slot();
        let neg_l = self.b.label();
        let emit_l = self.b.label();
        self.b.push(Instr::Compare {
            op: crate::ir::ComparisonOp::Gt,
            dst: pos,
            l: step_s,
            r: zero,
        });
        self.b.push(Instr::JumpIfNot {
            cond: pos,
            target: neg_l,
        });
        self.b.push(Instr::Compare {
            op: crate::ir::ComparisonOp::Ge,
            dst: t,
            l: cur,
            r: stop_s,
        });
        self.b.push(Instr::JumpIf { cond: t, target: end });
        self.b.push(Instr::Jump(emit_l));
        self.b.push(Instr::Mark(neg_l));
        self.b.push(Instr::Compare {
            op: crate::ir::ComparisonOp::Le,
            dst: t,
            l: cur,
            r: stop_s,
        });
        self.b.push(Instr::JumpIf { cond: t, target: end });
        self.b.push(Instr::Mark(emit_l));
        self.b.push(Instr::Move {
            dst: elem,
            src: cur,
        });
        self.b.push(Instr::Binary {
            op: crate::ir::BinaryOp::Add,
            ty: VType::Int32,
            dst: cur,
            l: cur,
            r: step_s,
        });
        let advance = self.b.end_fragment()?;

        Ok(Producer {
            init,
            advance,
            elem: EmitValue {
                slot: elem,
                missing: None,
                typ: VType::Int32,
            },
            end,
            missing,
        })
    }

    fn array_producer(&mut self, a: &IrNode) -> EngineResult<Producer> {
        let elem_t = a
            .typ()?
            .elem_type()
            .cloned()
            .ok_or_else(|| EngineError::internal("codegen", "ToStream of non-array"))?;
        let end = self.b.label();
        let arr = self.b.slot();
        let idx = self.b.slot();
        let one = self.b.slot();
        let len = self.b.slot();
        let elem = self.b.slot();

        self.b.begin_fragment();
        let av = self.emit(a)?;
        let missing = match av.missing {
            Some(f) => {
                // The source being missing is observed here; the consumer
                // skips the loop entirely.
                let sm = self.b.slot();
                self.b.push(Instr::Move { dst: sm, src: f });
                Some(sm)
            }
            None => None,
        };
        self.b.push(Instr::Move {
            dst: arr,
            src: av.slot,
        });
        let zero_lit = self.b.lit(Value::Int32(0));
        self.b.push(Instr::LoadLit {
            dst: idx,
            lit: zero_lit,
        });
        let one_lit = self.b.lit(Value::Int32(1));
        self.b.push(Instr::LoadLit { dst: one, lit: one_lit });
        let init = self.b.end_fragment()?;

        self.b.begin_fragment();
        let t = self.b.slot();
        self.b.push(Instr::ArrayLen { dst: len, arr });
        self.b.push(Instr::Compare {
            op: crate::ir::ComparisonOp::Ge,
            dst: t,
            l: idx,
            r: len,
        });
        self.b.push(Instr::JumpIf { cond: t, target: end });
        self.b.push(Instr::ArrayGet {
            dst: elem,
            arr,
            idx,
        });
        self.b.push(Instr::Binary {
            op: crate::ir::BinaryOp::Add,
            ty: VType::Int32,
            dst: idx,
            l: idx,
            r: one,
        });
        let em = self.b.slot();
        self.b.push(Instr::TestMissing {
            dst: em,
            src: elem,
        });
        let advance = self.b.end_fragment()?;

        Ok(Producer {
            init,
            advance,
            elem: EmitValue {
                slot: elem,
                missing: Some(em),
                typ: elem_t,
            },
            end,
            missing,
        })
    }

    fn zip_producer(
        &mut self,
        streams: &[IrNode],
        names: &[String],
        body: &IrNode,
        behavior: ZipBehavior,
    ) -> EngineResult<Producer> {
        let end = self.b.label();
        let mut producers = Vec::with_capacity(streams.len());
        for s in streams {
            producers.push(self.compile_stream(s)?);
        }

        self.b.begin_fragment();
        let sm = self.b.slot();
        self.b.push(Instr::LoadBool {
            dst: sm,
            val: false,
        });
        let miss_l = self.b.label();
        let mut any_missing = false;
        let mut inits = Vec::new();
        for p in &mut producers {
            inits.push(std::mem::take(&mut p.init));
        }
        for (p, init) in producers.iter().zip(inits) {
            self.b.splice(init);
            if let Some(f) = p.missing {
                any_missing = true;
                self.b.push(Instr::JumpIf {
                    cond: f,
                    target: miss_l,
                });
            }
        }
        let missing = if any_missing {
            let ok = self.b.label();
            self.b.push(Instr::Jump(ok));
            self.b.push(Instr::Mark(miss_l));
            self.b.push(Instr::LoadBool { dst: sm, val: true });
            self.b.push(Instr::Mark(ok));
            Some(sm)
        } else {
            None
        };
        let init = self.b.end_fragment()?;

        // Per-lane presence flags let both length policies advance every
        // lane before deciding.
        let has: Vec<Slot> = producers.iter().map(|_| self.b.slot()).collect();

        self.b.begin_fragment();
        let mut advances = Vec::new();
        for p in &mut producers {
            advances.push(std::mem::take(&mut p.advance));
        }
        for (i, (p, advance)) in producers.iter().zip(advances).enumerate() {
            self.b.splice(advance);
            self.b.push(Instr::LoadBool {
                dst: has[i],
                val: true,
            });
            let after = self.b.label();
            self.b.push(Instr::Jump(after));
            self.b.push(Instr::Mark(p.end));
            self.b.push(Instr::LoadBool {
                dst: has[i],
                val: false,
            });
            self.b.push(Instr::Mark(after));
        }
        match behavior {
            ZipBehavior::TakeMinLength => {
                for h in &has {
                    self.b.push(Instr::JumpIfNot {
                        cond: *h,
                        target: end,
                    });
                }
            }
            ZipBehavior::AssertSameLength => {
                let first_ended = self.b.label();
                let mismatch = self.b.label();
                let body_l = self.b.label();
                self.b.push(Instr::JumpIfNot {
                    cond: has[0],
                    target: first_ended,
                });
                for h in &has[1..] {
                    self.b.push(Instr::JumpIfNot {
                        cond: *h,
                        target: mismatch,
                    });
                }
                self.b.push(Instr::Jump(body_l));
                self.b.push(Instr::Mark(first_ended));
                for h in &has[1..] {
                    self.b.push(Instr::JumpIf {
                        cond: *h,
                        target: mismatch,
                    });
                }
                self.b.push(Instr::Jump(end));
                self.b.push(Instr::Mark(mismatch));
                let msg = self
                    .b
                    .lit(Value::str("zipped streams declared same-length but were not"));
                self.b.push(Instr::Fail {
                    id: error_id::ZIP_LENGTH,
                    msg,
                });
                self.b.push(Instr::Mark(body_l));
            }
        }
        for (name, p) in names.iter().zip(&producers) {
            self.env.push((name.clone(), p.elem.clone()));
        }
        let body_ev = self.emit(body);
        for _ in names {
            self.env.pop();
        }
        let body_ev = body_ev?;
        let advance = self.b.end_fragment()?;

        Ok(Producer {
            init,
            advance,
            elem: body_ev,
            end,
            missing,
        })
    }

    /// K-way merge over pre-sorted lanes: each advance emits the least head
    /// (ties to the lowest lane) and refills that lane. Lane refills live in
    /// shared-frame procedures because both init (priming) and advance
    /// (refilling) need them.
    fn merge_producer(&mut self, streams: &[IrNode], typ: VType) -> EngineResult<Producer> {
        let elem_t = typ
            .elem_type()
            .cloned()
            .ok_or_else(|| EngineError::internal("codegen", "merge of non-stream"))?;
        if streams.is_empty() {
            return Err(EngineError::internal(
                "codegen",
                "merge with no input streams",
            ));
        }
        let end = self.b.label();
        let mut producers = Vec::with_capacity(streams.len());
        for s in streams {
            producers.push(self.compile_stream(s)?);
        }
        let k = producers.len();
        let has: Vec<Slot> = (0..k).map(|_| self.b.slot()).collect();
        let cur: Vec<Slot> = (0..k).map(|_| self.b.slot()).collect();
        let lane_const: Vec<Slot> = (0..k).map(|_| self.b.slot()).collect();
        let best = self.b.slot();
        let best_lane = self.b.slot();
        let found = self.b.slot();

        // One shared-frame refill procedure per lane; slots above are all in
        // the enclosing frame.
        let mut refill = Vec::with_capacity(k);
        for (i, p) in producers.iter_mut().enumerate() {
            let proc = self.b.begin_proc(0);
            self.b.splice(std::mem::take(&mut p.advance));
            self.b.push(Instr::Move {
                dst: cur[i],
                src: p.elem.slot,
            });
            if let Some(f) = p.elem.missing {
                let skip = self.b.label();
                self.b.push(Instr::JumpIfNot {
                    cond: f,
                    target: skip,
                });
                let miss = self.b.lit(Value::Missing);
                self.b.push(Instr::LoadLit {
                    dst: cur[i],
                    lit: miss,
                });
                self.b.push(Instr::Mark(skip));
            }
            self.b.push(Instr::LoadBool {
                dst: has[i],
                val: true,
            });
            self.b.push(Instr::ReturnShared);
            self.b.push(Instr::Mark(p.end));
            self.b.push(Instr::LoadBool {
                dst: has[i],
                val: false,
            });
            self.b.seal_proc()?;
            refill.push(proc);
        }

        self.b.begin_fragment();
        let sm = self.b.slot();
        self.b.push(Instr::LoadBool {
            dst: sm,
            val: false,
        });
        let miss_l = self.b.label();
        let mut any_missing = false;
        let mut inits = Vec::new();
        for p in &mut producers {
            inits.push(std::mem::take(&mut p.init));
        }
        for (p, init) in producers.iter().zip(inits) {
            self.b.splice(init);
            if let Some(f) = p.missing {
                any_missing = true;
                self.b.push(Instr::JumpIf {
                    cond: f,
                    target: miss_l,
                });
            }
        }
        for (i, proc) in refill.iter().enumerate() {
            let lit = self.b.lit(Value::Int32(i as i32));
            self.b.push(Instr::LoadLit {
                dst: lane_const[i],
                lit,
            });
            self.b.push(Instr::CallShared { proc: *proc });
        }
        let missing = if any_missing {
            let ok = self.b.label();
            self.b.push(Instr::Jump(ok));
            self.b.push(Instr::Mark(miss_l));
            self.b.push(Instr::LoadBool { dst: sm, val: true });
            self.b.push(Instr::Mark(ok));
            Some(sm)
        } else {
            None
        };
        let init = self.b.end_fragment()?;

        self.b.begin_fragment();
        self.b.push(Instr::LoadBool {
            dst: found,
            val: false,
        });
        let t = self.b.slot();
        for i in 0..k {
            let skip_i = self.b.label();
            let take_i = self.b.label();
            self.b.push(Instr::JumpIfNot {
                cond: has[i],
                target: skip_i,
            });
            self.b.push(Instr::JumpIfNot {
                cond: found,
                target: take_i,
            });
            self.b.push(Instr::Compare {
                op: crate::ir::ComparisonOp::Lt,
                dst: t,
                l: cur[i],
                r: best,
            });
            self.b.push(Instr::JumpIfNot {
                cond: t,
                target: skip_i,
            });
            self.b.push(Instr::Mark(take_i));
            self.b.push(Instr::Move {
                dst: best,
                src: cur[i],
            });
            self.b.push(Instr::Move {
                dst: best_lane,
                src: lane_const[i],
            });
            self.b.push(Instr::LoadBool {
                dst: found,
                val: true,
            });
            self.b.push(Instr::Mark(skip_i));
        }
        self.b.push(Instr::JumpIfNot {
            cond: found,
            target: end,
        });
        let em = self.b.slot();
        self.b.push(Instr::TestMissing {
            dst: em,
            src: best,
        });
        // Refill the lane that just surrendered its head.
        let done = self.b.label();
        for i in 0..k {
            let next_i = self.b.label();
            self.b.push(Instr::Compare {
                op: crate::ir::ComparisonOp::Eq,
                dst: t,
                l: best_lane,
                r: lane_const[i],
            });
            self.b.push(Instr::JumpIfNot {
                cond: t,
                target: next_i,
            });
            self.b.push(Instr::CallShared { proc: refill[i] });
            self.b.push(Instr::Jump(done));
            self.b.push(Instr::Mark(next_i));
        }
        self.b.push(Instr::Mark(done));
        let advance = self.b.end_fragment()?;

        Ok(Producer {
            init,
            advance,
            elem: EmitValue {
                slot: best,
                missing: Some(em),
                typ: elem_t,
            },
            end,
            missing,
        })
    }
}
