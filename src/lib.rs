//! # Locus
//!
//! Staged-compilation query execution core for genomic data. One typed
//! expression IR flows through the whole engine:
//!
//! ```text
//!           ┌───────────┐    ┌─────────────┐    ┌───────────────────────┐
//!   IR ───▶ │ optimizer │───▶│ dispatcher  │───▶│ staged: IR → routine  │
//!           │ (fixpoint │    │ compilable? │    │ (fused loops, slots)  │
//!           │  rewrite) │    └──────┬──────┘    └───────────┬───────────┘
//!           └───────────┘          │                        │
//!                                  ▼                        ▼
//!                        ┌─────────────────┐       ┌─────────────────┐
//!                        │ interpreter     │       │ register machine │
//!                        │ (tree walking)  │       │ + agg region     │
//!                        └─────────────────┘       └─────────────────┘
//! ```
//!
//! Both paths implement identical semantics over the same [`value::Value`]
//! model; the staged path exists for throughput, the interpreter for
//! relational nodes, stream-valued binders and debugging. On-disk partition
//! key indexes ([`index`]) answer interval queries without touching row
//! data, and plug into compiled routines through host hooks.
//!
//! [`Engine`] is the front door: optimize, pick a path, evaluate.

pub mod config;
pub mod error;
pub mod index;
pub mod interp;
pub mod ir;
pub mod optimizer;
pub mod stage;
pub mod types;
pub mod value;

pub use config::EngineOptions;
pub use error::{EngineError, EngineResult};
pub use ir::IrNode;
pub use types::VType;
pub use value::Value;

use tracing::debug;

/// Optimizing evaluator over closed expressions
#[derive(Debug, Clone, Default)]
pub struct Engine {
    options: EngineOptions,
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(options: EngineOptions) -> Self {
        Engine { options }
    }

    /// Optimize and evaluate a closed expression with RNG seed 0
    pub fn run(&self, ir: &IrNode) -> EngineResult<Value> {
        self.run_seeded(ir, 0)
    }

    /// Optimize and evaluate a closed expression with a per-partition seed
    pub fn run_seeded(&self, ir: &IrNode, rng_seed: u64) -> EngineResult<Value> {
        let optimized =
            optimizer::Optimizer::with_max_iterations(self.options.max_optimizer_iterations)
                .optimize(ir.clone())?;
        if !self.options.interpret_only && optimized.is_compilable() {
            debug!(kind = optimized.kind_name(), "dispatch_staged");
            let program =
                stage::compile_program(&optimized, &[], self.options.split_threshold)?;
            let mut agg = stage::AggRegion::new(&program.agg_signature);
            return stage::Machine::new(&program, rng_seed, Some(&mut agg), None).run(&[]);
        }
        debug!(kind = optimized.kind_name(), "dispatch_interpreted");
        interp::interpret(&optimized, &interp::Env::with_seed(rng_seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AggOp, BinaryOp, ComparisonOp};

    #[test]
    fn scalar_expression_goes_through_the_staged_path() {
        let ir = IrNode::binary(BinaryOp::Add, IrNode::I32(40), IrNode::I32(2)).unwrap();
        assert_eq!(Engine::new().run(&ir).unwrap(), Value::Int32(42));
    }

    #[test]
    fn relational_plan_falls_back_to_the_interpreter() {
        let pred = IrNode::compare(
            ComparisonOp::Lt,
            IrNode::get_field(
                IrNode::ref_("row", VType::struct_of(vec![("idx", VType::Int64)])),
                "idx",
            )
            .unwrap(),
            IrNode::I64(3),
        )
        .unwrap();
        let table = IrNode::table_filter(IrNode::table_range(10, 2), "row", pred).unwrap();
        let ir = IrNode::table_count(table).unwrap();
        assert_eq!(Engine::new().run(&ir).unwrap(), Value::Int64(3));
    }

    #[test]
    fn both_dispatch_modes_agree() {
        let ir = IrNode::stream_agg(
            IrNode::stream_range(IrNode::I32(0), IrNode::I32(100), IrNode::I32(1)).unwrap(),
            "x",
            AggOp::Sum,
            IrNode::ref_("x", VType::Int32),
        )
        .unwrap();
        let staged = Engine::new().run(&ir).unwrap();
        let interpreted = Engine::with_options(EngineOptions::new().interpret_only())
            .run(&ir)
            .unwrap();
        assert_eq!(staged, interpreted);
        assert_eq!(staged, Value::Int64(4950));
    }

    #[test]
    fn seeds_reproduce_rng_draws() {
        let ir = IrNode::rng_uniform(9, IrNode::F64(0.0), IrNode::F64(1.0)).unwrap();
        let engine = Engine::new();
        assert_eq!(
            engine.run_seeded(&ir, 5).unwrap(),
            engine.run_seeded(&ir, 5).unwrap()
        );
        assert_ne!(
            engine.run_seeded(&ir, 5).unwrap(),
            engine.run_seeded(&ir, 6).unwrap()
        );
    }
}
