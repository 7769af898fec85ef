//! # Staged Evaluation
//!
//! Compiles a typed IR tree into a flat register routine and executes it.
//! The pipeline:
//!
//! ```text
//!   IrNode ──compile──▶ Program ──Machine──▶ Value
//!              │            │
//!              │            ├─ procedures (entry, split helpers,
//!              │            │  memoized subroutines)
//!              │            ├─ interned literal pool
//!              │            └─ aggregator cell layout
//!              │
//!              └─ missingness slots, fused stream loops,
//!                 aggregator cells assigned here
//! ```
//!
//! The compiler assigns every sub-expression a value slot and, where needed,
//! a boolean presence slot, then emits straight-line code with resolved
//! jumps. Stream pipelines fuse into single loops; long straight-line runs
//! are split into shared-frame helper procedures so no single body grows
//! without bound. A [`CompiledFn`] owns the routine plus its per-run state:
//! the partition RNG seed, an aggregator region matching the routine's cell
//! layout, and optional host hooks for index operations.
//!
//! Splitting behavior and the default threshold live in
//! [`builder::CodeBuilder`]; the observable semantics of every routine are
//! pinned to the tree-walking interpreter by the equivalence tests below.

mod agg;
mod builder;
mod compile;
mod instr;
mod vm;

pub use agg::AggRegion;
pub use compile::compile_program;
pub use instr::{HostOp, Instr, Program};
pub use vm::{HostHooks, Machine};

pub(crate) use builder::CodeBuilder;
pub(crate) use instr::Slot;

use crate::error::EngineResult;
use crate::ir::IrNode;
use crate::types::VType;
use crate::value::Value;

/// Straight-line run length at which a procedure body is split
pub const DEFAULT_SPLIT_THRESHOLD: usize = 64;

/// Compile `ir` into a reusable routine taking `args` in order
pub fn compile(ir: &IrNode, args: &[(String, VType)]) -> EngineResult<CompiledFn> {
    let program = compile_program(ir, args, DEFAULT_SPLIT_THRESHOLD)?;
    Ok(CompiledFn {
        program,
        rng_seed: 0,
        agg: None,
        host: None,
    })
}

/// A compiled routine bundled with its per-run state
pub struct CompiledFn {
    program: Program,
    rng_seed: u64,
    agg: Option<AggRegion>,
    host: Option<Box<dyn HostHooks>>,
}

impl CompiledFn {
    /// Execute over `args`; missing arguments are legal values
    pub fn run(&mut self, args: &[Value]) -> EngineResult<Value> {
        if self.agg.is_none() && !self.program.agg_signature.is_empty() {
            self.agg = Some(AggRegion::new(&self.program.agg_signature));
        }
        Machine::new(
            &self.program,
            self.rng_seed,
            self.agg.as_mut(),
            self.host.as_mut().map(|h| h.as_mut() as &mut dyn HostHooks),
        )
        .run(args)
    }

    /// Per-partition RNG seed for deterministic draws
    pub fn set_rng_seed(&mut self, seed: u64) {
        self.rng_seed = seed;
    }

    /// Bind host hooks servicing index operations
    pub fn set_host(&mut self, host: Box<dyn HostHooks>) {
        self.host = Some(host);
    }

    /// Replace the aggregator region, e.g. with one restored from another
    /// partition
    pub fn set_agg_region(&mut self, region: AggRegion) {
        self.agg = Some(region);
    }

    /// Aggregator region from the last run, if the routine aggregates
    pub fn agg_region(&self) -> Option<&AggRegion> {
        self.agg.as_ref()
    }

    /// The underlying routine
    pub fn program(&self) -> &Program {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{interpret, Env};
    use crate::ir::{AggOp, BinaryOp, ComparisonOp, UnaryOp, ZipBehavior};

    const SEED: u64 = 11;

    /// Both evaluation paths must agree on every closed expression.
    fn assert_equiv(ir: &IrNode) {
        let expected = interpret(ir, &Env::with_seed(SEED));
        let mut f = compile(ir, &[]).unwrap();
        f.set_rng_seed(SEED);
        let got = f.run(&[]);
        match (expected, got) {
            (Ok(a), Ok(b)) => assert_eq!(a, b, "paths disagree on {}", ir.kind_name()),
            (Err(a), Err(b)) => assert_eq!(a.to_string(), b.to_string()),
            (a, b) => panic!("one path failed: interpreted {a:?}, staged {b:?}"),
        }
    }

    fn int_stream(lo: i32, hi: i32) -> IrNode {
        IrNode::stream_range(IrNode::I32(lo), IrNode::I32(hi), IrNode::I32(1)).unwrap()
    }

    #[test]
    fn arithmetic_and_missing_short_circuit() {
        assert_equiv(
            &IrNode::binary(BinaryOp::Add, IrNode::I32(2), IrNode::I32(40)).unwrap(),
        );
        assert_equiv(
            &IrNode::binary(BinaryOp::Add, IrNode::NA(VType::Int32), IrNode::I32(1)).unwrap(),
        );
        assert_equiv(
            &IrNode::binary(BinaryOp::Div, IrNode::F64(1.0), IrNode::F64(0.0)).unwrap(),
        );
        assert_equiv(&IrNode::unary(UnaryOp::Negate, IrNode::I64(9)).unwrap());
    }

    #[test]
    fn division_by_zero_fails_on_both_paths() {
        let ir = IrNode::binary(BinaryOp::Div, IrNode::I32(1), IrNode::I32(0)).unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn conditional_on_missing_predicate() {
        let ir = IrNode::if_(
            IrNode::is_na(IrNode::NA(VType::Int32)),
            IrNode::I32(1),
            IrNode::I32(2),
        )
        .unwrap();
        assert_equiv(&ir);
        assert_equiv(
            &IrNode::if_(IrNode::NA(VType::Bool), IrNode::I32(1), IrNode::I32(2)).unwrap(),
        );
    }

    #[test]
    fn kleene_logic_truth_table() {
        let vals = [
            IrNode::Bool(true),
            IrNode::Bool(false),
            IrNode::NA(VType::Bool),
        ];
        for l in &vals {
            for r in &vals {
                assert_equiv(&IrNode::and(l.clone(), r.clone()).unwrap());
                assert_equiv(&IrNode::or(l.clone(), r.clone()).unwrap());
            }
        }
    }

    #[test]
    fn kleene_false_short_circuits_effects() {
        // false && Die must not raise on either path.
        let ir = IrNode::and(
            IrNode::Bool(false),
            IrNode::die("unreachable", VType::Bool),
        )
        .unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn coalesce_picks_first_present() {
        let ir = IrNode::coalesce(vec![
            IrNode::NA(VType::Int32),
            IrNode::I32(5),
            IrNode::I32(9),
        ])
        .unwrap();
        assert_equiv(&ir);
        assert_equiv(
            &IrNode::coalesce(vec![IrNode::NA(VType::Int32), IrNode::NA(VType::Int32)]).unwrap(),
        );
    }

    #[test]
    fn let_binding_and_shadowing() {
        let ir = IrNode::let_(
            "x",
            IrNode::I32(3),
            IrNode::let_(
                "x",
                IrNode::binary(
                    BinaryOp::Mul,
                    IrNode::ref_("x", VType::Int32),
                    IrNode::I32(2),
                )
                .unwrap(),
                IrNode::ref_("x", VType::Int32),
            )
            .unwrap(),
        )
        .unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn array_construction_keeps_missing_elements() {
        let ir = IrNode::make_array(
            vec![IrNode::I32(1), IrNode::NA(VType::Int32), IrNode::I32(3)],
            VType::Int32,
        )
        .unwrap();
        assert_equiv(&ir);
        assert_equiv(&IrNode::array_len(ir.clone()).unwrap());
        assert_equiv(&IrNode::array_ref(ir.clone(), IrNode::I32(1)).unwrap());
        assert_equiv(&IrNode::array_ref(ir.clone(), IrNode::I32(7)).unwrap());
        assert_equiv(&IrNode::array_sort(ir, false).unwrap());
    }

    #[test]
    fn struct_and_tuple_access() {
        let s = IrNode::make_struct(vec![
            ("a", IrNode::I32(1)),
            ("b", IrNode::NA(VType::Str)),
        ])
        .unwrap();
        assert_equiv(&IrNode::get_field(s.clone(), "a").unwrap());
        assert_equiv(&IrNode::get_field(s.clone(), "b").unwrap());
        assert_equiv(
            &IrNode::insert_fields(s.clone(), vec![("b", IrNode::Str("hi".into())), ("c", IrNode::I64(4))])
                .unwrap(),
        );
        assert_equiv(&IrNode::select_fields(s, vec!["b"]).unwrap());
        let t = IrNode::make_tuple(vec![IrNode::Bool(true), IrNode::F64(2.5)]).unwrap();
        assert_equiv(&IrNode::get_tuple_element(t, 1).unwrap());
    }

    #[test]
    fn interval_endpoints() {
        assert_equiv(
            &IrNode::make_interval(IrNode::I32(1), IrNode::I32(5), true, false).unwrap(),
        );
        assert_equiv(
            &IrNode::make_interval(IrNode::NA(VType::Int32), IrNode::I32(5), true, true).unwrap(),
        );
    }

    #[test]
    fn range_map_filter_fuses() {
        let ir = IrNode::to_array(
            IrNode::stream_filter(
                IrNode::stream_map(
                    int_stream(0, 10),
                    "x",
                    IrNode::binary(
                        BinaryOp::Mul,
                        IrNode::ref_("x", VType::Int32),
                        IrNode::I32(3),
                    )
                    .unwrap(),
                )
                .unwrap(),
                "y",
                IrNode::compare(
                    ComparisonOp::Lt,
                    IrNode::ref_("y", VType::Int32),
                    IrNode::I32(20),
                )
                .unwrap(),
            )
            .unwrap(),
        )
        .unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn descending_range() {
        let ir = IrNode::to_array(
            IrNode::stream_range(IrNode::I32(10), IrNode::I32(0), IrNode::I32(-3)).unwrap(),
        )
        .unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn zero_step_range_fails_on_both_paths() {
        let ir = IrNode::to_array(
            IrNode::stream_range(IrNode::I32(0), IrNode::I32(5), IrNode::I32(0)).unwrap(),
        )
        .unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn take_while_stops_on_missing_condition() {
        let cond = IrNode::if_(
            IrNode::compare(
                ComparisonOp::Lt,
                IrNode::ref_("x", VType::Int32),
                IrNode::I32(3),
            )
            .unwrap(),
            IrNode::Bool(true),
            IrNode::NA(VType::Bool),
        )
        .unwrap();
        let ir = IrNode::to_array(
            IrNode::stream_take_while(int_stream(0, 10), "x", cond).unwrap(),
        )
        .unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn filter_drops_on_missing_condition() {
        // Condition is missing for even elements, true otherwise.
        let cond = IrNode::if_(
            IrNode::compare(
                ComparisonOp::Eq,
                IrNode::binary(
                    BinaryOp::Mod,
                    IrNode::ref_("x", VType::Int32),
                    IrNode::I32(2),
                )
                .unwrap(),
                IrNode::I32(0),
            )
            .unwrap(),
            IrNode::NA(VType::Bool),
            IrNode::Bool(true),
        )
        .unwrap();
        let ir = IrNode::to_array(
            IrNode::stream_filter(int_stream(0, 6), "x", cond).unwrap(),
        )
        .unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn flat_map_expands_and_skips_missing_inner() {
        let inner = IrNode::stream_range(
            IrNode::I32(0),
            IrNode::ref_("x", VType::Int32),
            IrNode::I32(1),
        )
        .unwrap();
        let ir = IrNode::to_array(
            IrNode::stream_flat_map(int_stream(0, 4), "x", inner).unwrap(),
        )
        .unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn zip_take_min_length() {
        let ir = IrNode::to_array(
            IrNode::stream_zip(
                vec![int_stream(0, 3), int_stream(10, 20)],
                vec!["a".into(), "b".into()],
                IrNode::binary(
                    BinaryOp::Add,
                    IrNode::ref_("a", VType::Int32),
                    IrNode::ref_("b", VType::Int32),
                )
                .unwrap(),
                ZipBehavior::TakeMinLength,
            )
            .unwrap(),
        )
        .unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn zip_assert_same_length_raises_on_mismatch() {
        let ir = IrNode::to_array(
            IrNode::stream_zip(
                vec![int_stream(0, 3), int_stream(0, 5)],
                vec!["a".into(), "b".into()],
                IrNode::ref_("a", VType::Int32),
                ZipBehavior::AssertSameLength,
            )
            .unwrap(),
        )
        .unwrap();
        let staged = compile(&ir, &[]).unwrap().run(&[]);
        match staged {
            Err(e) => assert!(e.to_string().contains("locus.user.zip_length")),
            Ok(v) => panic!("length mismatch went unnoticed: {v}"),
        }
    }

    #[test]
    fn multi_merge_interleaves_sorted_lanes() {
        let lane = |elems: Vec<i32>| {
            IrNode::to_stream(
                IrNode::make_array(elems.into_iter().map(IrNode::I32).collect(), VType::Int32)
                    .unwrap(),
            )
            .unwrap()
        };
        let ir = IrNode::to_array(
            IrNode::stream_multi_merge(vec![lane(vec![1, 3, 5]), lane(vec![2, 4, 6])]).unwrap(),
        )
        .unwrap();
        let mut f = compile(&ir, &[]).unwrap();
        let got = f.run(&[]).unwrap();
        let want = Value::array((1..=6).map(Value::Int32).collect());
        assert_eq!(got, want);
        assert_equiv(&ir);
    }

    #[test]
    fn fold_accumulates_in_order() {
        let ir = IrNode::stream_fold(
            int_stream(1, 5),
            IrNode::I32(0),
            "acc",
            "x",
            IrNode::binary(
                BinaryOp::Add,
                IrNode::ref_("acc", VType::Int32),
                IrNode::ref_("x", VType::Int32),
            )
            .unwrap(),
        )
        .unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn aggregation_matches_interpreter() {
        for op in [
            AggOp::Count,
            AggOp::Sum,
            AggOp::Min,
            AggOp::Max,
            AggOp::CollectAsArray,
        ] {
            let value = IrNode::if_(
                IrNode::compare(
                    ComparisonOp::Eq,
                    IrNode::ref_("x", VType::Int32),
                    IrNode::I32(2),
                )
                .unwrap(),
                IrNode::NA(VType::Int32),
                IrNode::ref_("x", VType::Int32),
            )
            .unwrap();
            let ir = IrNode::stream_agg(int_stream(0, 5), "x", op, value).unwrap();
            assert_equiv(&ir);
        }
    }

    #[test]
    fn aggregation_site_resets_between_runs() {
        let ir = IrNode::stream_agg(
            int_stream(0, 4),
            "x",
            AggOp::Sum,
            IrNode::ref_("x", VType::Int32),
        )
        .unwrap();
        let mut f = compile(&ir, &[]).unwrap();
        let first = f.run(&[]).unwrap();
        let second = f.run(&[]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn stream_over_missing_array_is_missing() {
        let ir = IrNode::to_array(
            IrNode::stream_map(
                IrNode::to_stream(IrNode::NA(VType::array(VType::Int32))).unwrap(),
                "x",
                IrNode::ref_("x", VType::Int32),
            )
            .unwrap(),
        )
        .unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn rng_draw_is_deterministic_across_paths() {
        let ir = IrNode::rng_uniform(42, IrNode::F64(0.0), IrNode::F64(10.0)).unwrap();
        assert_equiv(&ir);
    }

    #[test]
    fn entry_arguments_may_be_missing() {
        let body = IrNode::coalesce(vec![
            IrNode::ref_("n", VType::Int32),
            IrNode::I32(-1),
        ])
        .unwrap();
        let mut f = compile(&body, &[("n".to_string(), VType::Int32)]).unwrap();
        assert_eq!(f.run(&[Value::Int32(7)]).unwrap(), Value::Int32(7));
        assert_eq!(f.run(&[Value::Missing]).unwrap(), Value::Int32(-1));
    }

    #[test]
    fn long_straight_line_runs_split_into_procedures() {
        // A wide strict expression produces a long straight-line run.
        let terms = (0..100)
            .map(|i| {
                IrNode::binary(BinaryOp::Add, IrNode::I32(i), IrNode::I32(i + 1)).unwrap()
            })
            .collect();
        let ir = IrNode::make_tuple(terms).unwrap();
        let f = compile(&ir, &[]).unwrap();
        assert!(
            f.program().procs.len() > 1,
            "expected split helper procedures"
        );
        assert_equiv(&ir);
    }

    #[test]
    fn relational_nodes_are_rejected() {
        let ir = IrNode::table_count(IrNode::table_range(10, 2)).unwrap();
        let err = compile(&ir, &[]).map(|_| ()).unwrap_err();
        assert!(err.is_internal());
    }
}
