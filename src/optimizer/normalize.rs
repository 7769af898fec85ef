//! Name normalization
//!
//! Alpha-renames every binder to a canonical `__norm_N` name assigned in
//! deterministic traversal order. Trees that are semantically identical but
//! used different variable names become structurally identical, which is
//! what tree-keyed caches and equality checks require. The pass is
//! idempotent: normalizing a normalized tree reassigns the same names.
//!
//! A free variable not present in the caller's allow-list is an internal
//! consistency error: it signals a bug in an upstream transformation, not
//! user input.

use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};
use crate::ir::IrNode;

/// Fresh-name source for one normalization run. Explicit state, no
/// process-wide counter: two runs over the same tree produce the same names.
#[derive(Debug, Default)]
pub struct NameSupply {
    next: u64,
}

impl NameSupply {
    /// New supply starting at zero
    pub fn new() -> Self {
        NameSupply::default()
    }

    /// Next canonical name
    pub fn fresh(&mut self) -> String {
        let name = format!("__norm_{}", self.next);
        self.next += 1;
        name
    }
}

/// Normalize all binder names in `ir`. Free variables must appear in
/// `allowed_free`.
pub fn normalize(ir: IrNode, allowed_free: &HashSet<String>) -> EngineResult<IrNode> {
    let mut supply = NameSupply::new();
    rename(ir, &mut supply, &mut Vec::new(), allowed_free)
}

fn rename(
    ir: IrNode,
    supply: &mut NameSupply,
    scope: &mut Vec<(String, String)>,
    allowed_free: &HashSet<String>,
) -> EngineResult<IrNode> {
    use IrNode::*;
    match ir {
        Ref { name, typ } => {
            let renamed = scope
                .iter()
                .rev()
                .find(|(old, _)| *old == name)
                .map(|(_, new)| new.clone());
            match renamed {
                Some(new) => Ok(Ref { name: new, typ }),
                None if allowed_free.contains(&name) => Ok(Ref { name, typ }),
                None => Err(EngineError::internal(
                    "normalize",
                    format!("free variable '{name}' escaped an upstream transformation"),
                )),
            }
        }
        Let { name, value, body } => {
            let value = rename(*value, supply, scope, allowed_free)?;
            let fresh = supply.fresh();
            scope.push((name, fresh.clone()));
            let body = rename(*body, supply, scope, allowed_free)?;
            scope.pop();
            Ok(Let {
                name: fresh,
                value: Box::new(value),
                body: Box::new(body),
            })
        }
        AggLet { name, value, body } => {
            let value = rename(*value, supply, scope, allowed_free)?;
            let fresh = supply.fresh();
            scope.push((name, fresh.clone()));
            let body = rename(*body, supply, scope, allowed_free)?;
            scope.pop();
            Ok(AggLet {
                name: fresh,
                value: Box::new(value),
                body: Box::new(body),
            })
        }
        StreamMap { s, name, body } => {
            let s = rename(*s, supply, scope, allowed_free)?;
            let fresh = supply.fresh();
            scope.push((name, fresh.clone()));
            let body = rename(*body, supply, scope, allowed_free)?;
            scope.pop();
            Ok(StreamMap {
                s: Box::new(s),
                name: fresh,
                body: Box::new(body),
            })
        }
        StreamFlatMap { s, name, body } => {
            let s = rename(*s, supply, scope, allowed_free)?;
            let fresh = supply.fresh();
            scope.push((name, fresh.clone()));
            let body = rename(*body, supply, scope, allowed_free)?;
            scope.pop();
            Ok(StreamFlatMap {
                s: Box::new(s),
                name: fresh,
                body: Box::new(body),
            })
        }
        StreamFilter { s, name, cond } => {
            let s = rename(*s, supply, scope, allowed_free)?;
            let fresh = supply.fresh();
            scope.push((name, fresh.clone()));
            let cond = rename(*cond, supply, scope, allowed_free)?;
            scope.pop();
            Ok(StreamFilter {
                s: Box::new(s),
                name: fresh,
                cond: Box::new(cond),
            })
        }
        StreamTakeWhile { s, name, cond } => {
            let s = rename(*s, supply, scope, allowed_free)?;
            let fresh = supply.fresh();
            scope.push((name, fresh.clone()));
            let cond = rename(*cond, supply, scope, allowed_free)?;
            scope.pop();
            Ok(StreamTakeWhile {
                s: Box::new(s),
                name: fresh,
                cond: Box::new(cond),
            })
        }
        StreamZip {
            streams,
            names,
            body,
            behavior,
        } => {
            let streams = streams
                .into_iter()
                .map(|s| rename(s, supply, scope, allowed_free))
                .collect::<EngineResult<Vec<_>>>()?;
            let fresh: Vec<String> = names.iter().map(|_| supply.fresh()).collect();
            let depth = scope.len();
            for (old, new) in names.into_iter().zip(fresh.iter()) {
                scope.push((old, new.clone()));
            }
            let body = rename(*body, supply, scope, allowed_free)?;
            scope.truncate(depth);
            Ok(StreamZip {
                streams,
                names: fresh,
                body: Box::new(body),
                behavior,
            })
        }
        StreamFold {
            s,
            zero,
            accum_name,
            value_name,
            body,
        } => {
            let s = rename(*s, supply, scope, allowed_free)?;
            let zero = rename(*zero, supply, scope, allowed_free)?;
            let fresh_acc = supply.fresh();
            let fresh_val = supply.fresh();
            scope.push((accum_name, fresh_acc.clone()));
            scope.push((value_name, fresh_val.clone()));
            let body = rename(*body, supply, scope, allowed_free)?;
            scope.pop();
            scope.pop();
            Ok(StreamFold {
                s: Box::new(s),
                zero: Box::new(zero),
                accum_name: fresh_acc,
                value_name: fresh_val,
                body: Box::new(body),
            })
        }
        StreamAgg { s, name, op, value } => {
            let s = rename(*s, supply, scope, allowed_free)?;
            let fresh = supply.fresh();
            scope.push((name, fresh.clone()));
            let value = rename(*value, supply, scope, allowed_free)?;
            scope.pop();
            Ok(StreamAgg {
                s: Box::new(s),
                name: fresh,
                op,
                value: Box::new(value),
            })
        }
        TableFilter { child, name, pred } => {
            let child = rename(*child, supply, scope, allowed_free)?;
            let fresh = supply.fresh();
            scope.push((name, fresh.clone()));
            let pred = rename(*pred, supply, scope, allowed_free)?;
            scope.pop();
            Ok(TableFilter {
                child: Box::new(child),
                name: fresh,
                pred: Box::new(pred),
            })
        }
        TableMapRows {
            child,
            name,
            new_row,
        } => {
            let child = rename(*child, supply, scope, allowed_free)?;
            let fresh = supply.fresh();
            scope.push((name, fresh.clone()));
            let new_row = rename(*new_row, supply, scope, allowed_free)?;
            scope.pop();
            Ok(TableMapRows {
                child: Box::new(child),
                name: fresh,
                new_row: Box::new(new_row),
            })
        }
        other => other.map_children(&mut |c| rename(c, supply, scope, allowed_free)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, IrNode as Ir};
    use crate::types::VType;

    fn no_free() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn alpha_equivalent_trees_normalize_identically() {
        let build = |name: &str| {
            Ir::let_(
                name,
                Ir::I32(5),
                Ir::binary(BinaryOp::Add, Ir::ref_(name, VType::Int32), Ir::I32(1)).unwrap(),
            )
            .unwrap()
        };
        let a = normalize(build("first"), &no_free()).unwrap();
        let b = normalize(build("completely_different"), &no_free()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn normalization_is_idempotent() {
        let tree = Ir::stream_map(
            Ir::stream_range(Ir::I32(0), Ir::I32(5), Ir::I32(1)).unwrap(),
            "elt",
            Ir::binary(BinaryOp::Mul, Ir::ref_("elt", VType::Int32), Ir::I32(3)).unwrap(),
        )
        .unwrap();
        let once = normalize(tree, &no_free()).unwrap();
        let twice = normalize(once.clone(), &no_free()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn free_variable_outside_allow_list_is_internal_error() {
        let tree = Ir::ref_("ghost", VType::Int32);
        let err = normalize(tree, &no_free()).unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn allow_listed_free_variable_survives() {
        let mut allowed = HashSet::new();
        allowed.insert("global".to_string());
        let tree = Ir::ref_("global", VType::Int32);
        let out = normalize(tree.clone(), &allowed).unwrap();
        assert_eq!(out, tree);
    }

    #[test]
    fn shadowing_renames_innermost_binder() {
        let inner = Ir::let_(
            "x",
            Ir::I32(2),
            Ir::ref_("x", VType::Int32),
        )
        .unwrap();
        let outer = Ir::let_("x", Ir::I32(1), inner).unwrap();
        let out = normalize(outer, &no_free()).unwrap();
        // Outer binder is __norm_0, inner is __norm_1, and the ref points at
        // the inner one.
        match out {
            Ir::Let { name, body, .. } => {
                assert_eq!(name, "__norm_0");
                match *body {
                    Ir::Let { name, body, .. } => {
                        assert_eq!(name, "__norm_1");
                        assert_eq!(*body, Ir::ref_("__norm_1", VType::Int32));
                    }
                    other => panic!("expected inner Let, got {other:?}"),
                }
            }
            other => panic!("expected Let, got {other:?}"),
        }
    }
}
