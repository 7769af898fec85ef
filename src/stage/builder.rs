//! Procedure builder
//!
//! [`CodeBuilder`] owns everything global to one compiled routine: the
//! procedure table, the interned literal pool and the label supply. On top of
//! plain instruction emission it provides three structural services the
//! compiler leans on:
//!
//! - **Fragments**: instruction runs recorded out of line and spliced later.
//!   Stream producers are built as init/advance fragments and stitched into
//!   their consumer's loop.
//! - **Splitting**: straight-line runs longer than the configured threshold
//!   are moved into shared-frame helper procedures at safe sequence points,
//!   keeping any single procedure body bounded. Runs containing control flow
//!   or open barriers are never cut.
//! - **Memoized procedures**: [`CodeBuilder::ensure_proc`] builds a keyed
//!   procedure at most once and reserves its id before generation, so a
//!   procedure body may call itself.

use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::ir::AggOp;
use crate::value::Value;

use super::instr::{Instr, Label, LitId, Proc, ProcId, Program, Slot};

/// Builder for one [`Program`]
pub struct CodeBuilder {
    procs: Vec<Option<Proc>>,
    literals: Vec<Value>,
    memo: HashMap<String, ProcId>,
    frames: Vec<ProcFrame>,
    next_label: u32,
    split_threshold: usize,
    /// First emission outside any open procedure; surfaced at the next
    /// [`CodeBuilder::seal_proc`] or [`CodeBuilder::finish`]
    misuse: Option<EngineError>,
}

struct ProcFrame {
    id: ProcId,
    code: Vec<Instr>,
    /// Open out-of-line fragments; emission goes to the innermost
    fragments: Vec<Vec<Instr>>,
    n_slots: usize,
    n_args: usize,
    barrier_depth: usize,
    /// Start of the current straight-line run in `code`
    chunk_start: usize,
}

impl CodeBuilder {
    /// Builder with the given procedure-split threshold
    pub fn new(split_threshold: usize) -> Self {
        CodeBuilder {
            procs: Vec::new(),
            literals: Vec::new(),
            memo: HashMap::new(),
            frames: Vec::new(),
            next_label: 0,
            split_threshold,
            misuse: None,
        }
    }

    // ------------------------------------------------------------------
    // Procedures
    // ------------------------------------------------------------------

    /// Open a new procedure; its arguments occupy slots `0..n_args`
    pub fn begin_proc(&mut self, n_args: usize) -> ProcId {
        let id = ProcId(self.procs.len() as u32);
        self.procs.push(None);
        self.frames.push(ProcFrame {
            id,
            code: Vec::new(),
            fragments: Vec::new(),
            n_slots: n_args,
            n_args,
            barrier_depth: 0,
            chunk_start: 0,
        });
        id
    }

    /// Seal the innermost open procedure
    pub fn seal_proc(&mut self) -> EngineResult<ProcId> {
        if let Some(e) = self.misuse.take() {
            return Err(e);
        }
        let frame = self.frames.pop().ok_or_else(|| {
            EngineError::internal("codegen", "seal_proc with no open procedure")
        })?;
        if !frame.fragments.is_empty() {
            return Err(EngineError::internal(
                "codegen",
                "procedure sealed with an open fragment",
            ));
        }
        let mut label_pc = HashMap::new();
        for (pc, instr) in frame.code.iter().enumerate() {
            if let Instr::Mark(Label(l)) = instr {
                if label_pc.insert(*l, pc).is_some() {
                    return Err(EngineError::internal(
                        "codegen",
                        format!("label {l} marked twice in one procedure"),
                    ));
                }
            }
        }
        let id = frame.id;
        self.procs[id.0 as usize] = Some(Proc {
            code: frame.code,
            label_pc,
            n_slots: frame.n_slots,
            n_args: frame.n_args,
        });
        Ok(id)
    }

    /// Build the procedure for `key` at most once. The id is reserved and
    /// memoized before `gen` runs, so the generated body may call it
    /// recursively. `gen` returns the result slot; a `Return` is appended.
    pub fn ensure_proc<F>(&mut self, key: &str, n_args: usize, gen: F) -> EngineResult<ProcId>
    where
        F: FnOnce(&mut CodeBuilder) -> EngineResult<Slot>,
    {
        if let Some(id) = self.memo.get(key) {
            return Ok(*id);
        }
        let id = self.begin_proc(n_args);
        self.memo.insert(key.to_string(), id);
        let ret = gen(self)?;
        self.push(Instr::Return { src: ret });
        self.seal_proc()?;
        Ok(id)
    }

    /// Finish the routine. Every opened procedure must be sealed.
    pub fn finish(self, entry: ProcId, agg_signature: Vec<AggOp>) -> EngineResult<Program> {
        if let Some(e) = self.misuse {
            return Err(e);
        }
        if !self.frames.is_empty() {
            return Err(EngineError::internal(
                "codegen",
                "routine finished with an open procedure",
            ));
        }
        let procs = self
            .procs
            .into_iter()
            .map(|p| {
                p.ok_or_else(|| EngineError::internal("codegen", "unsealed procedure in table"))
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Program {
            procs,
            literals: self.literals,
            entry,
            agg_signature,
        })
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn top(&mut self) -> EngineResult<&mut ProcFrame> {
        self.frames.last_mut().ok_or_else(|| {
            EngineError::internal("codegen", "instruction emitted outside a procedure")
        })
    }

    fn note_misuse(&mut self, what: &str) {
        self.misuse
            .get_or_insert_with(|| EngineError::internal("codegen", what));
    }

    /// Append one instruction to the innermost fragment, or to the procedure
    /// body if none is open
    pub fn push(&mut self, instr: Instr) {
        let is_flow = matches!(
            instr,
            Instr::Mark(_)
                | Instr::Jump(_)
                | Instr::JumpIf { .. }
                | Instr::JumpIfNot { .. }
                | Instr::Return { .. }
                | Instr::ReturnShared
        );
        let Some(frame) = self.frames.last_mut() else {
            self.note_misuse("instruction emitted outside a procedure");
            return;
        };
        if let Some(fragment) = frame.fragments.last_mut() {
            fragment.push(instr);
        } else {
            frame.code.push(instr);
            if is_flow {
                frame.chunk_start = frame.code.len();
            }
        }
    }

    /// Fresh frame slot
    pub fn slot(&mut self) -> Slot {
        match self.frames.last_mut() {
            Some(frame) => {
                let s = Slot(frame.n_slots as u32);
                frame.n_slots += 1;
                s
            }
            None => {
                self.note_misuse("slot requested outside a procedure");
                Slot(u32::MAX)
            }
        }
    }

    /// Fresh label
    pub fn label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    /// Intern a literal, reusing an existing equal entry
    pub fn lit(&mut self, v: Value) -> LitId {
        if let Some(i) = self.literals.iter().position(|x| *x == v) {
            return LitId(i as u32);
        }
        self.literals.push(v);
        LitId((self.literals.len() - 1) as u32)
    }

    // ------------------------------------------------------------------
    // Fragments, barriers, splitting
    // ------------------------------------------------------------------

    /// Start recording out of line
    pub fn begin_fragment(&mut self) {
        match self.frames.last_mut() {
            Some(frame) => frame.fragments.push(Vec::new()),
            None => self.note_misuse("fragment opened outside a procedure"),
        }
    }

    /// Stop recording and hand back the fragment
    pub fn end_fragment(&mut self) -> EngineResult<Vec<Instr>> {
        let frame = self.top()?;
        frame.fragments.pop().ok_or_else(|| {
            EngineError::internal("codegen", "end_fragment with no open fragment")
        })
    }

    /// Splice previously recorded instructions into the current sink
    pub fn splice(&mut self, instrs: Vec<Instr>) {
        for i in instrs {
            self.push(i);
        }
    }

    /// Enter a region that must never be cut by splitting
    pub fn begin_barrier(&mut self) {
        match self.frames.last_mut() {
            Some(frame) => frame.barrier_depth += 1,
            None => self.note_misuse("barrier opened outside a procedure"),
        }
    }

    /// Leave a no-split region
    pub fn end_barrier(&mut self) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.barrier_depth = frame.barrier_depth.saturating_sub(1);
                frame.chunk_start = frame.code.len();
            }
            None => self.note_misuse("barrier closed outside a procedure"),
        }
    }

    /// Safe sequence point: if the straight-line run since the last point
    /// exceeds the threshold, move it into a shared-frame helper procedure.
    pub fn maybe_split(&mut self) -> EngineResult<()> {
        let threshold = self.split_threshold;
        let chunk = {
            let frame = self.top()?;
            if !frame.fragments.is_empty()
                || frame.barrier_depth > 0
                || frame.code.len() - frame.chunk_start < threshold
            {
                return Ok(());
            }
            frame.code.split_off(frame.chunk_start)
        };
        let helper = ProcId(self.procs.len() as u32);
        let mut code = chunk;
        code.push(Instr::ReturnShared);
        self.procs.push(Some(Proc {
            code,
            label_pc: HashMap::new(),
            n_slots: 0,
            n_args: 0,
        }));
        let frame = self.top()?;
        frame.code.push(Instr::CallShared { proc: helper });
        frame.chunk_start = frame.code.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn literals_are_deduplicated() {
        let mut b = CodeBuilder::new(1024);
        let a = b.lit(Value::Int32(7));
        let c = b.lit(Value::Int32(7));
        let d = b.lit(Value::Int32(8));
        assert_eq!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn long_straight_runs_are_split_into_helpers() {
        let mut b = CodeBuilder::new(4);
        let entry = b.begin_proc(0);
        let dst = b.slot();
        for _ in 0..10 {
            let lit = b.lit(Value::Int32(1));
            b.push(Instr::LoadLit { dst, lit });
            b.maybe_split().unwrap();
        }
        b.push(Instr::Return { src: dst });
        b.seal_proc().unwrap();
        let program = b.finish(entry, vec![]).unwrap();
        assert!(program.procs.len() > 1, "expected helper procedures");
        let entry_proc = &program.procs[entry.0 as usize];
        assert!(entry_proc
            .code
            .iter()
            .any(|i| matches!(i, Instr::CallShared { .. })));
    }

    #[test]
    fn control_flow_blocks_splitting() {
        let mut b = CodeBuilder::new(2);
        let entry = b.begin_proc(0);
        let dst = b.slot();
        let l = b.label();
        b.push(Instr::Mark(l));
        for _ in 0..8 {
            b.push(Instr::Jump(l));
            b.maybe_split().unwrap();
        }
        b.push(Instr::Return { src: dst });
        b.seal_proc().unwrap();
        let program = b.finish(entry, vec![]).unwrap();
        assert_eq!(program.procs.len(), 1);
    }

    #[test]
    fn emission_outside_a_procedure_surfaces_at_seal() {
        let mut b = CodeBuilder::new(1024);
        let stray = b.slot();
        b.push(Instr::LoadBool {
            dst: stray,
            val: true,
        });
        b.begin_proc(0);
        let src = b.slot();
        b.push(Instr::Return { src });
        let err = b.seal_proc().unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn stray_slot_after_sealing_surfaces_at_finish() {
        let mut b = CodeBuilder::new(1024);
        let entry = b.begin_proc(0);
        let src = b.slot();
        b.push(Instr::Return { src });
        b.seal_proc().unwrap();
        assert_eq!(b.slot(), Slot(u32::MAX));
        let err = b.finish(entry, vec![]).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn ensure_proc_is_memoized() {
        let mut b = CodeBuilder::new(1024);
        let entry = b.begin_proc(0);
        let a = b
            .ensure_proc("shared", 1, |b| {
                let s = b.slot();
                let lit = b.lit(Value::Int64(3));
                b.push(Instr::LoadLit { dst: s, lit });
                Ok(s)
            })
            .unwrap();
        let c = b.ensure_proc("shared", 1, |_| unreachable!()).unwrap();
        assert_eq!(a, c);
        let dst = b.slot();
        b.push(Instr::Return { src: dst });
        b.seal_proc().unwrap();
        let program = b.finish(entry, vec![]).unwrap();
        assert_eq!(program.procs.len(), 2);
    }
}
