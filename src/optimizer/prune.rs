//! Binding and field pruning
//!
//! - **Let-forwarding**: a binding used at most once, whose value is closed
//!   (no free references, so no capture risk) and effect-free, is inlined or
//!   dropped.
//! - **Dead-field pruning**: a let-bound struct whose fields are only ever
//!   read through `GetField` is rebuilt with just the fields actually read
//!   downstream.

use std::collections::HashSet;

use crate::error::EngineResult;
use crate::ir::IrNode;
use crate::types::VType;

/// Names referenced but not bound within `ir`
pub fn free_refs(ir: &IrNode) -> HashSet<String> {
    let mut out = HashSet::new();
    collect_free(ir, &mut Vec::new(), &mut out);
    out
}

fn collect_free(ir: &IrNode, bound: &mut Vec<String>, out: &mut HashSet<String>) {
    if let IrNode::Ref { name, .. } = ir {
        if !bound.iter().any(|b| b == name) {
            out.insert(name.clone());
        }
        return;
    }
    for (child, names) in ir.scoped_children() {
        let depth = bound.len();
        bound.extend(names.iter().map(|n| n.to_string()));
        collect_free(child, bound, out);
        bound.truncate(depth);
    }
}

/// Free uses of `name` within `ir`, respecting shadowing
pub fn count_uses(ir: &IrNode, name: &str) -> usize {
    match ir {
        IrNode::Ref { name: n, .. } => usize::from(n == name),
        _ => ir
            .scoped_children()
            .iter()
            .map(|(child, bound)| {
                if bound.iter().any(|b| *b == name) {
                    0
                } else {
                    count_uses(child, name)
                }
            })
            .sum(),
    }
}

/// Replace free `Ref`s to `name` with `replacement`. Binders inside `ir`
/// shadow `name`, but nothing here protects the replacement's own free refs:
/// the caller passes a closed replacement, or renames `ir`'s binders first
/// (see [`super::normalize`]).
pub fn subst(ir: IrNode, name: &str, replacement: &IrNode) -> EngineResult<IrNode> {
    match &ir {
        IrNode::Ref { name: n, .. } if n == name => Ok(replacement.clone()),
        _ => {
            let shadows = ir
                .scoped_children()
                .iter()
                .any(|(_, bound)| bound.iter().any(|b| *b == name));
            if shadows {
                // Binder forms rebinding `name` keep their inner tree as-is;
                // only the unbound children are rewritten.
                subst_scoped(ir, name, replacement)
            } else {
                ir.map_children(&mut |c| subst(c, name, replacement))
            }
        }
    }
}

fn subst_scoped(ir: IrNode, name: &str, replacement: &IrNode) -> EngineResult<IrNode> {
    // map_children visits children in the same order scoped_children reports
    // them; children that rebind `name` are left untouched.
    let scope_mask: Vec<bool> = ir
        .scoped_children()
        .iter()
        .map(|(_, bound)| bound.iter().any(|b| *b == name))
        .collect();
    let mut idx = 0;
    ir.map_children(&mut |c| {
        let shadowed = scope_mask.get(idx).copied().unwrap_or(false);
        idx += 1;
        if shadowed {
            Ok(c)
        } else {
            subst(c, name, replacement)
        }
    })
}

/// Inline or drop single-use bindings
pub fn forward_lets(ir: IrNode) -> EngineResult<IrNode> {
    let ir = ir.map_children(&mut forward_lets)?;
    if let IrNode::Let { name, value, body } = ir {
        let uses = count_uses(&body, &name);
        let closed = free_refs(&value).is_empty();
        if uses == 0 && !value.is_effectful() {
            return Ok(*body);
        }
        if uses == 1 && closed && !value.is_effectful() {
            return subst(*body, &name, &value);
        }
        return Ok(IrNode::Let { name, value, body });
    }
    Ok(ir)
}

/// Drop struct fields never read downstream.
///
/// Fires on `Let x = MakeStruct(...)` where every free use of `x` in the
/// body is `GetField(Ref x, _)`: the struct is rebuilt with only the fields
/// read, and the refs are retyped to the narrowed struct. The tree's type is
/// unchanged because every surviving `GetField` yields the same value.
pub fn prune_dead_fields(ir: IrNode) -> EngineResult<IrNode> {
    let ir = ir.map_children(&mut prune_dead_fields)?;
    let IrNode::Let { name, value, body } = ir else {
        return Ok(ir);
    };
    let IrNode::MakeStruct { fields } = *value else {
        return Ok(IrNode::Let { name, value, body });
    };

    let mut read = HashSet::new();
    if !only_field_reads(&body, &name, &mut read) {
        return Ok(IrNode::Let {
            name,
            value: Box::new(IrNode::MakeStruct { fields }),
            body,
        });
    }
    let dropped_pure = fields
        .iter()
        .filter(|(n, _)| !read.contains(n))
        .all(|(_, v)| !v.is_effectful());
    if read.len() == fields.len() || !dropped_pure {
        return Ok(IrNode::Let {
            name,
            value: Box::new(IrNode::MakeStruct { fields }),
            body,
        });
    }

    let kept: Vec<(String, IrNode)> = fields
        .into_iter()
        .filter(|(n, _)| read.contains(n))
        .collect();
    let narrowed = IrNode::MakeStruct { fields: kept };
    let new_typ = narrowed.typ()?;
    let body = retype_refs(*body, &name, &new_typ)?;
    Ok(IrNode::Let {
        name,
        value: Box::new(narrowed),
        body: Box::new(body),
    })
}

/// True if every free use of `name` is `GetField(Ref name, _)`; collects the
/// fields read.
fn only_field_reads(ir: &IrNode, name: &str, read: &mut HashSet<String>) -> bool {
    if let IrNode::GetField { o, name: field } = ir {
        if matches!(o.as_ref(), IrNode::Ref { name: n, .. } if n == name) {
            read.insert(field.clone());
            return true;
        }
    }
    if let IrNode::Ref { name: n, .. } = ir {
        if n == name {
            // A bare use observes the whole struct.
            return false;
        }
    }
    ir.scoped_children().iter().all(|(child, bound)| {
        bound.iter().any(|b| *b == name) || only_field_reads(child, name, read)
    })
}

fn retype_refs(ir: IrNode, name: &str, typ: &VType) -> EngineResult<IrNode> {
    match &ir {
        IrNode::Ref { name: n, .. } if n == name => Ok(IrNode::Ref {
            name: n.clone(),
            typ: typ.clone(),
        }),
        _ => {
            let shadows = ir
                .scoped_children()
                .iter()
                .any(|(_, bound)| bound.iter().any(|b| *b == name));
            if shadows {
                return Ok(ir);
            }
            ir.map_children(&mut |c| retype_refs(c, name, typ))
        }
    }
}
