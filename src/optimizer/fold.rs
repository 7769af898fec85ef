//! Constant folding
//!
//! Bottom-up: any pure node whose direct children are all literals is
//! evaluated once with the interpreter and replaced by a literal of the same
//! type. Folding reuses the interpreter so the rewrite cannot drift from the
//! evaluation semantics it must preserve.

use crate::error::EngineResult;
use crate::interp::{interpret, Env};
use crate::ir::IrNode;

/// Fold constants throughout a tree
pub fn fold_constants(ir: IrNode) -> EngineResult<IrNode> {
    let ir = ir.map_children(&mut fold_constants)?;
    fold_node(ir)
}

fn fold_node(ir: IrNode) -> EngineResult<IrNode> {
    if ir.as_literal().is_some() || !is_foldable(&ir) {
        return Ok(ir);
    }
    if !ir.children().iter().all(|c| c.as_literal().is_some()) {
        return Ok(ir);
    }
    let typ = ir.typ()?;
    // Stream-typed results stay structural; a literal of stream type is not
    // realizable.
    if !typ.is_realizable() {
        return Ok(ir);
    }
    match interpret(&ir, &Env::new()) {
        Ok(v) => Ok(IrNode::from_value(v, typ)),
        // A user error here (1/0, out-of-bounds) must surface at evaluation
        // time with runtime context, not at optimization time.
        Err(e) if !e.is_internal() => Ok(ir),
        Err(e) => Err(e),
    }
}

/// Nodes that may be replaced by their value: no randomness, no explicit
/// failure, no relational semantics, no leaf forms that are already values.
fn is_foldable(ir: &IrNode) -> bool {
    use IrNode::*;
    !matches!(
        ir,
        Die { .. }
            | ApplyRngUniform { .. }
            | Ref { .. }
            | TableRange { .. }
            | TableFilter { .. }
            | TableMapRows { .. }
            | TableKeyBy { .. }
            | TableCount(_)
            | TableCollect(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, IrNode as Ir};
    use crate::types::VType;
    use crate::value::Value;

    #[test]
    fn arithmetic_folds() {
        let n = Ir::binary(
            BinaryOp::Add,
            Ir::binary(BinaryOp::Mul, Ir::I32(3), Ir::I32(4)).unwrap(),
            Ir::I32(5),
        )
        .unwrap();
        assert_eq!(fold_constants(n).unwrap(), Ir::I32(17));
    }

    #[test]
    fn array_len_folds_through_literal_array() {
        let arr =
            Ir::make_array(vec![Ir::I32(1), Ir::I32(2), Ir::I32(3)], VType::Int32).unwrap();
        let n = Ir::array_len(arr).unwrap();
        // MakeArray folds to a Literal first, then ArrayLen folds over it.
        assert_eq!(fold_constants(n).unwrap(), Ir::I32(3));
    }

    #[test]
    fn division_by_zero_is_left_for_runtime() {
        let n = Ir::binary(BinaryOp::Div, Ir::I32(1), Ir::I32(0)).unwrap();
        let folded = fold_constants(n.clone()).unwrap();
        assert_eq!(folded, n);
    }

    #[test]
    fn rng_never_folds() {
        let n = Ir::rng_uniform(1, Ir::F64(0.0), Ir::F64(1.0)).unwrap();
        let folded = fold_constants(n.clone()).unwrap();
        assert_eq!(folded, n);
    }

    #[test]
    fn missing_literals_fold_strict_ops() {
        let n = Ir::binary(BinaryOp::Add, Ir::NA(VType::Int32), Ir::I32(2)).unwrap();
        assert_eq!(fold_constants(n).unwrap(), Ir::NA(VType::Int32));
    }

    #[test]
    fn folded_literal_keeps_type() {
        let n = Ir::make_struct(vec![("a", Ir::I32(1))]).unwrap();
        let folded = fold_constants(n.clone()).unwrap();
        match folded {
            Ir::Literal { value, typ } => {
                assert_eq!(value, Value::struct_(vec![Value::Int32(1)]));
                assert_eq!(typ, n.typ().unwrap());
            }
            other => panic!("expected literal, got {other:?}"),
        }
    }
}
