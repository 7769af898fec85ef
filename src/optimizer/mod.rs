//! # IR Optimizer
//!
//! Rewrites an IR tree into a simplified, semantically equivalent tree,
//! applied to fixpoint:
//!
//! ```text
//! IrNode -> [fold constants -> simplify -> forward lets -> prune fields]* -> IrNode
//! ```
//!
//! Guarantees, checked rather than assumed:
//!
//! - Equivalence under the interpreter's evaluation laws (strictness,
//!   three-valued logic, error behavior): a rewrite never drops an effectful
//!   subtree and never folds a failing one.
//! - Type preservation: `typeof(out) == typeof(in)` is verified after the
//!   run; a mismatch aborts as an internal consistency error with both
//!   types and the rewritten tree.
//! - Repartitioning safety: table rewrites that could change how rows meet
//!   partitions are disabled whenever the subtree draws from the seeded
//!   RNG, because regrouping changes which draws land where. This is a
//!   correctness condition, not a heuristic.

pub mod fold;
pub mod normalize;
pub mod prune;

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::ir::IrNode;
use crate::types::VType;

/// IR optimizer with fixpoint iteration
pub struct Optimizer {
    max_iterations: usize,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer {
    /// Optimizer with the default iteration bound
    pub fn new() -> Self {
        Optimizer { max_iterations: 10 }
    }

    /// Optimizer with a custom iteration bound
    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Optimizer { max_iterations }
    }

    /// Optimize to fixpoint, then verify type preservation.
    pub fn optimize(&self, ir: IrNode) -> EngineResult<IrNode> {
        let before_type = ir.typ()?;
        let mut current = ir;
        for iteration in 0..self.max_iterations {
            let next = Self::apply_all(current.clone())?;
            if next == current {
                debug!(iteration, "optimizer_fixpoint");
                break;
            }
            current = next;
        }
        let after_type = current.typ()?;
        if after_type != before_type {
            return Err(EngineError::internal(
                "optimizer",
                format!(
                    "rewrite changed type from {before_type} to {after_type}; tree: {current:?}"
                ),
            ));
        }
        Ok(current)
    }

    fn apply_all(ir: IrNode) -> EngineResult<IrNode> {
        let ir = fold::fold_constants(ir)?;
        let ir = simplify(ir)?;
        let ir = prune::forward_lets(ir)?;
        prune::prune_dead_fields(ir)
    }
}

/// One bottom-up pass of the peephole rules
pub fn simplify(ir: IrNode) -> EngineResult<IrNode> {
    let ir = ir.map_children(&mut simplify)?;
    rewrite(ir)
}

fn is_na(ir: &IrNode) -> bool {
    matches!(ir.as_literal(), Some((v, _)) if v.is_missing())
}

fn pure_all(nodes: &[&IrNode]) -> bool {
    nodes.iter().all(|n| !n.is_effectful())
}

fn rewrite(ir: IrNode) -> EngineResult<IrNode> {
    use IrNode::*;

    // Strict nodes with a known-missing operand collapse to a typed NA.
    // (Stream-typed nodes are excluded: an NA stream is not realizable.)
    if ir.is_strict() && ir.children().iter().any(|c| is_na(c)) && pure_all(&ir.children()) {
        let typ = ir.typ()?;
        if typ.is_realizable() {
            debug!(kind = ir.kind_name(), "simplify_na_propagation");
            return Ok(NA(typ));
        }
    }

    Ok(match ir {
        If { cond, cnsq, altr } => match cond.as_literal() {
            Some((v, _)) if v.as_bool() == Some(true) => *cnsq,
            Some((v, _)) if v.as_bool() == Some(false) => *altr,
            Some((v, _)) if v.is_missing() => {
                let typ = cnsq.typ()?;
                if typ.is_realizable() {
                    NA(typ)
                } else {
                    If { cond, cnsq, altr }
                }
            }
            _ => If { cond, cnsq, altr },
        },

        IsNA(x) => match x.as_literal() {
            Some((v, _)) => Bool(v.is_missing()),
            None => IsNA(x),
        },

        Coalesce(args) => {
            // Leading NA literals never win; a present literal always does.
            // The result type is the arguments' shared type, recorded up
            // front because the all-NA case drops every argument.
            let result_type = args.first().map(IrNode::typ).transpose()?;
            let mut kept: Vec<IrNode> = Vec::with_capacity(args.len());
            for a in args {
                if is_na(&a) {
                    continue;
                }
                let present_literal = a.as_literal().is_some();
                kept.push(a);
                if present_literal {
                    break;
                }
            }
            match kept.len() {
                0 => NA(result_type.unwrap_or(VType::Void)),
                1 => kept.into_iter().next().unwrap_or(Void),
                _ => Coalesce(kept),
            }
        }

        And { l, r } => match (l.as_literal(), r.as_literal()) {
            // false short-circuits before the other side runs
            (Some((v, _)), _) if v.as_bool() == Some(false) => Bool(false),
            (Some((v, _)), _) if v.as_bool() == Some(true) => *r,
            (_, Some((v, _))) if v.as_bool() == Some(true) => *l,
            (_, Some((v, _))) if v.as_bool() == Some(false) && !l.is_effectful() => Bool(false),
            _ => And { l, r },
        },
        Or { l, r } => match (l.as_literal(), r.as_literal()) {
            (Some((v, _)), _) if v.as_bool() == Some(true) => Bool(true),
            (Some((v, _)), _) if v.as_bool() == Some(false) => *r,
            (_, Some((v, _))) if v.as_bool() == Some(false) => *l,
            (_, Some((v, _))) if v.as_bool() == Some(true) && !l.is_effectful() => Bool(true),
            _ => Or { l, r },
        },

        ArrayLen(a) => match a.as_ref() {
            MakeArray { elems, .. } if pure_all(&elems.iter().collect::<Vec<_>>()) => {
                I32(elems.len() as i32)
            }
            _ => ArrayLen(a),
        },

        ArrayRef { a, i } => {
            if let (MakeArray { elems, .. }, Some((idx, _))) = (a.as_ref(), i.as_literal()) {
                if let Some(idx) = idx.as_i64() {
                    if idx >= 0
                        && (idx as usize) < elems.len()
                        && pure_all(&elems.iter().collect::<Vec<_>>())
                    {
                        return Ok(elems[idx as usize].clone());
                    }
                }
            }
            ArrayRef { a, i }
        }

        ToArray(s) => match *s {
            ToStream(a) => *a,
            other => ToArray(Box::new(other)),
        },
        ToStream(a) => match *a {
            ToArray(s) => *s,
            other => ToStream(Box::new(other)),
        },

        GetField { o, name } => match o.as_ref() {
            MakeStruct { fields } => {
                let others_pure = fields
                    .iter()
                    .filter(|(n, _)| *n != name)
                    .all(|(_, v)| !v.is_effectful());
                match fields.iter().find(|(n, _)| *n == name) {
                    Some((_, v)) if others_pure => v.clone(),
                    _ => GetField { o, name },
                }
            }
            InsertFields { o: base, fields } => {
                if let Some((_, v)) = fields.iter().find(|(n, _)| *n == name) {
                    let others_pure = fields
                        .iter()
                        .filter(|(n, _)| *n != name)
                        .all(|(_, v)| !v.is_effectful())
                        && !base.is_effectful();
                    if others_pure {
                        return Ok(v.clone());
                    }
                } else if pure_all(&fields.iter().map(|(_, v)| v).collect::<Vec<_>>())
                    && base.typ()?.field_index(&name).is_some()
                {
                    return Ok(GetField {
                        o: Box::new(base.as_ref().clone()),
                        name,
                    });
                }
                GetField { o, name }
            }
            _ => GetField { o, name },
        },

        SelectFields { o, names } => match *o {
            SelectFields { o: inner, .. } => SelectFields { o: inner, names },
            MakeStruct { fields } => {
                if pure_all(&fields.iter().map(|(_, v)| v).collect::<Vec<_>>()) {
                    let kept: Vec<(String, IrNode)> = names
                        .iter()
                        .filter_map(|n| {
                            fields
                                .iter()
                                .find(|(fname, _)| fname == n)
                                .map(|(fname, v)| (fname.clone(), v.clone()))
                        })
                        .collect();
                    MakeStruct { fields: kept }
                } else {
                    SelectFields {
                        o: Box::new(MakeStruct { fields }),
                        names,
                    }
                }
            }
            other => SelectFields {
                o: Box::new(other),
                names,
            },
        },

        GetTupleElement { o, idx } => match o.as_ref() {
            MakeTuple(elems) if idx < elems.len() => {
                let others_pure = elems
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != idx)
                    .all(|(_, v)| !v.is_effectful());
                if others_pure {
                    elems[idx].clone()
                } else {
                    GetTupleElement { o, idx }
                }
            }
            _ => GetTupleElement { o, idx },
        },

        // ----- table rules -----
        TableFilter { child, name, pred } =>

{
            // Filter-after-filter fuses by conjunction. Disabled when the
            // predicates draw randomness (fusing changes the draw order
            // relative to rows, which changes results under per-partition
            // seeding) and when either predicate is effectful: a row the
            // inner predicate drops must never reach the outer one.
            if let TableFilter {
                child: inner_child,
                name: inner_name,
                pred: inner_pred,
            } = *child
            {
                let fusion_allowed = !inner_pred.contains_rng()
                    && !pred.contains_rng()
                    && !inner_pred.is_effectful()
                    && !pred.is_effectful();
                if fusion_allowed {
                    debug!(rule = "table_filter_fusion", "optimizer_table_rewrite");
                    // Binders inside the inner predicate get canonical fresh
                    // names first, so the substituted row ref cannot be
                    // captured by one of them.
                    let allowed = prune::free_refs(&inner_pred);
                    let opened = normalize::normalize(*inner_pred, &allowed)?;
                    let renamed = prune::subst(
                        opened,
                        &inner_name,
                        &IrNode::Ref {
                            name: name.clone(),
                            typ: inner_child.typ()?.elem_type().cloned().ok_or_else(|| {
                                EngineError::internal("optimizer", "table child lost its row type")
                            })?,
                        },
                    )?;
                    return Ok(TableFilter {
                        child: inner_child,
                        name,
                        pred: Box::new(IrNode::And {
                            l: Box::new(renamed),
                            r: pred,
                        }),
                    });
                }
                return Ok(TableFilter {
                    child: Box::new(TableFilter {
                        child: inner_child,
                        name: inner_name,
                        pred: inner_pred,
                    }),
                    name,
                    pred,
                });
            }
            TableFilter { child, name, pred }
        }

        TableKeyBy { child, keys } => match *child {
            // Re-keying immediately overrides the previous key.
            TableKeyBy { child: inner, .. } => TableKeyBy { child: inner, keys },
            other => TableKeyBy {
                child: Box::new(other),
                keys,
            },
        },

        TableCount(child) => match *child {
            // Known partition layout: the count never needs row evaluation.
            TableRange { n_rows, .. } => I64(n_rows),
            // Mapping rows cannot change their number; dropping the map is
            // only safe when it draws no randomness (the map would otherwise
            // be repartition-relevant for downstream replay).
            TableMapRows {
                child: inner,
                name,
                new_row,
            } => {
                if !new_row.contains_rng() && !new_row.is_effectful() {
                    debug!(rule = "count_drops_map_rows", "optimizer_table_rewrite");
                    TableCount(inner)
                } else {
                    TableCount(Box::new(TableMapRows {
                        child: inner,
                        name,
                        new_row,
                    }))
                }
            }
            TableKeyBy { child: inner, .. } => TableCount(inner),
            other => TableCount(Box::new(other)),
        },

        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{interpret, Env};
    use crate::ir::{BinaryOp, ComparisonOp, IrNode as Ir};
    use crate::value::Value;

    fn optimize(ir: IrNode) -> IrNode {
        Optimizer::new().optimize(ir).unwrap()
    }

    #[test]
    fn array_len_of_make_array_folds_to_literal() {
        let n = Ir::array_len(
            Ir::make_array(vec![Ir::I32(1), Ir::I32(2), Ir::I32(3)], VType::Int32).unwrap(),
        )
        .unwrap();
        let out = optimize(n);
        assert_eq!(out, Ir::I32(3));
        assert_eq!(
            interpret(&out, &Env::new()).unwrap(),
            Value::Int32(3)
        );
    }

    #[test]
    fn if_is_na_na_selects_consequent() {
        let n = Ir::if_(
            Ir::is_na(Ir::NA(VType::Int32)),
            Ir::I32(1),
            Ir::I32(2),
        )
        .unwrap();
        assert_eq!(optimize(n), Ir::I32(1));
    }

    #[test]
    fn strict_node_with_missing_child_collapses() {
        let n = Ir::binary(BinaryOp::Mul, Ir::NA(VType::Int32), Ir::I32(3)).unwrap();
        assert_eq!(optimize(n), Ir::NA(VType::Int32));
    }

    #[test]
    fn die_is_never_dropped() {
        let die = Ir::die("invariant violated", VType::Int32);
        let n = Ir::let_("x", die.clone(), Ir::I32(1)).unwrap();
        let out = optimize(n);
        // The binding is dead, but its value is effectful and must stay.
        match out {
            Ir::Let { value, .. } => assert_eq!(*value, die),
            other => panic!("expected Let to survive, got {other:?}"),
        }
    }

    #[test]
    fn filter_after_filter_fuses_by_conjunction() {
        let t = Ir::table_range(100, 4);
        let row_t = VType::struct_of(vec![("idx", VType::Int64)]);
        let idx = |name: &str| Ir::get_field(Ir::ref_(name, row_t.clone()), "idx").unwrap();
        let f1 = Ir::table_filter(
            t,
            "a",
            Ir::compare(ComparisonOp::Gt, idx("a"), Ir::I64(10)).unwrap(),
        )
        .unwrap();
        let f2 = Ir::table_filter(
            f1,
            "b",
            Ir::compare(ComparisonOp::Lt, idx("b"), Ir::I64(20)).unwrap(),
        )
        .unwrap();
        let out = optimize(f2.clone());
        // One filter with a conjunction, not two.
        match &out {
            Ir::TableFilter { child, pred, .. } => {
                assert!(matches!(child.as_ref(), Ir::TableRange { .. }));
                assert!(matches!(pred.as_ref(), Ir::And { .. }));
            }
            other => panic!("expected fused TableFilter, got {other:?}"),
        }
        assert_eq!(
            interpret(&Ir::table_collect(out).unwrap(), &Env::new()).unwrap(),
            interpret(&Ir::table_collect(f2).unwrap(), &Env::new()).unwrap()
        );
    }

    #[test]
    fn rng_in_predicate_blocks_filter_fusion() {
        let t = Ir::table_range(100, 4);
        let row_t = VType::struct_of(vec![("idx", VType::Int64)]);
        let noisy_pred = Ir::compare(
            ComparisonOp::Lt,
            Ir::rng_uniform(11, Ir::F64(0.0), Ir::F64(1.0)).unwrap(),
            Ir::F64(0.5),
        )
        .unwrap();
        let f1 = Ir::table_filter(t, "a", noisy_pred).unwrap();
        let f2 = Ir::table_filter(
            f1,
            "b",
            Ir::compare(
                ComparisonOp::Gt,
                Ir::get_field(Ir::ref_("b", row_t), "idx").unwrap(),
                Ir::I64(1),
            )
            .unwrap(),
        )
        .unwrap();
        let out = optimize(f2);
        match &out {
            Ir::TableFilter { child, .. } => {
                assert!(
                    matches!(child.as_ref(), Ir::TableFilter { .. }),
                    "fusion should have been blocked"
                );
            }
            other => panic!("expected nested TableFilter, got {other:?}"),
        }
    }

    #[test]
    fn effectful_predicate_blocks_filter_fusion() {
        // The inner filter drops every row (missing predicate), so the
        // failing outer predicate must never run; fusing would evaluate it.
        let t = Ir::table_range(3, 1);
        let f1 = Ir::table_filter(t, "a", Ir::NA(VType::Bool)).unwrap();
        let f2 = Ir::table_filter(f1, "b", Ir::die("boom", VType::Bool)).unwrap();
        let count = Ir::table_count(f2).unwrap();
        assert_eq!(
            interpret(&count, &Env::new()).unwrap(),
            Value::Int64(0)
        );
        let out = optimize(count);
        assert_eq!(interpret(&out, &Env::new()).unwrap(), Value::Int64(0));
    }

    #[test]
    fn fused_predicates_keep_bindings_separate() {
        let t = Ir::table_range(10, 2);
        let row_t = VType::struct_of(vec![("idx", VType::Int64)]);
        // The inner predicate's local binding shares the outer filter's
        // row name; fusion must not let the row ref resolve to it.
        let inner_pred = Ir::let_(
            "b",
            Ir::I64(5),
            Ir::compare(
                ComparisonOp::Eq,
                Ir::get_field(Ir::ref_("a", row_t.clone()), "idx").unwrap(),
                Ir::ref_("b", VType::Int64),
            )
            .unwrap(),
        )
        .unwrap();
        let f1 = Ir::table_filter(t, "a", inner_pred).unwrap();
        let f2 = Ir::table_filter(
            f1,
            "b",
            Ir::compare(
                ComparisonOp::Lt,
                Ir::get_field(Ir::ref_("b", row_t), "idx").unwrap(),
                Ir::I64(8),
            )
            .unwrap(),
        )
        .unwrap();
        let count = Ir::table_count(f2).unwrap();
        assert_eq!(
            interpret(&count, &Env::new()).unwrap(),
            Value::Int64(1)
        );
        let out = optimize(count);
        assert_eq!(interpret(&out, &Env::new()).unwrap(), Value::Int64(1));
    }

    #[test]
    fn all_missing_coalesce_keeps_its_type() {
        let n = Ir::coalesce(vec![Ir::NA(VType::Int32), Ir::NA(VType::Int32)]).unwrap();
        let out = simplify(n).unwrap();
        assert_eq!(out, Ir::NA(VType::Int32));
    }

    #[test]
    fn count_short_circuits_via_known_partitions() {
        let n = Ir::table_count(Ir::table_range(1234, 8)).unwrap();
        assert_eq!(optimize(n), Ir::I64(1234));
    }

    #[test]
    fn key_by_idempotence() {
        let t = Ir::table_range(10, 2);
        let k1 = Ir::table_key_by(t, vec!["idx"]).unwrap();
        let k2 = Ir::table_key_by(k1, vec!["idx"]).unwrap();
        let out = optimize(k2);
        match &out {
            Ir::TableKeyBy { child, .. } => {
                assert!(matches!(child.as_ref(), Ir::TableRange { .. }));
            }
            other => panic!("expected single TableKeyBy, got {other:?}"),
        }
    }

    #[test]
    fn optimize_is_idempotent() {
        let n = Ir::if_(
            Ir::is_na(Ir::NA(VType::Int32)),
            Ir::binary(BinaryOp::Add, Ir::I32(1), Ir::I32(2)).unwrap(),
            Ir::I32(0),
        )
        .unwrap();
        let once = optimize(n);
        let twice = optimize(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn type_is_preserved() {
        let n = Ir::coalesce(vec![Ir::NA(VType::Int32), Ir::I32(5)]).unwrap();
        let before = n.typ().unwrap();
        let out = optimize(n);
        assert_eq!(out.typ().unwrap(), before);
        assert_eq!(out, Ir::I32(5));
    }
}
