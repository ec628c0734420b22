//! Pure structural AST transforms.
//!
//! Every function here returns a fresh [`Ast`]; inputs are never modified.
//! The rewrite surface is deliberately small: replace one subtree, renumber
//! the whole tree, clear one macro snapshot. Optimizers compose these.

use ahash::AHashMap;

use crate::ast::{Ast, Expr, ExprId, ExprKind};

/// Replaces the subtree rooted at `at_id` with `new_subtree`.
///
/// Every other node keeps its id and structure. Source maintenance:
/// - positions of nodes that left the tree are dropped;
/// - the macro snapshot keyed by `at_id`, if any, is removed (the snapshot no
///   longer describes the node);
/// - any other macro snapshot that references `at_id` is updated in place
///   when the replacement keeps the id (it still fits the slot), and
///   otherwise has that operand slot invalidated to `NotSet`.
///
/// If `at_id` does not occur, the result is structurally identical to the
/// input.
#[must_use]
pub fn replace_subtree(ast: &Ast, new_subtree: Expr, at_id: ExprId) -> Ast {
    let (mut root, mut source) = ast.clone().into_parts();
    let replaced = replace_in_place(&mut root, at_id, &new_subtree);
    if !replaced {
        return Ast::new(root, source);
    }

    source.macro_calls.remove(&at_id);
    let keeps_id = new_subtree.id == at_id;
    for snapshot in source.macro_calls.values_mut() {
        if snapshot.contains_id(at_id) {
            if keeps_id {
                replace_in_place(snapshot, at_id, &new_subtree);
            } else {
                replace_in_place(snapshot, at_id, &Expr::not_set());
            }
        }
    }

    let mut present: ahash::AHashSet<ExprId> = ahash::AHashSet::new();
    root.visit(&mut |e| {
        present.insert(e.id);
    });
    source.positions.retain(|id, _| present.contains(id));

    Ast::new(root, source)
}

/// Removes the macro snapshot recorded for `id`, if any, so the node unparses
/// in its expanded form.
#[must_use]
pub fn clear_macro_call(ast: &Ast, id: ExprId) -> Ast {
    let (root, mut source) = ast.clone().into_parts();
    source.macro_calls.remove(&id);
    Ast::new(root, source)
}

/// Records a macro snapshot for `id`, so the node unparses in the given
/// call form. Used by rewrites that synthesize macro-shaped nodes
/// (`cel.bind` emission).
#[must_use]
pub fn with_macro_call(ast: &Ast, id: ExprId, snapshot: Expr) -> Ast {
    let (root, mut source) = ast.clone().into_parts();
    source.macro_calls.insert(id, snapshot);
    Ast::new(root, source)
}

/// Renumbers every node densely and monotonically in post-order, starting at
/// `base` (clamped to 1; id 0 stays reserved).
///
/// Returns the fresh AST and the old→new mapping so callers can rewrite
/// their own id-keyed state. Positions and macro snapshots are rewritten
/// through the mapping; snapshot-only nodes (parts of the pre-expansion form
/// that did not survive into the tree) receive fresh ids above the tree's.
#[must_use]
pub fn renumber_ids(ast: &Ast, base: u64) -> (Ast, AHashMap<ExprId, ExprId>) {
    let (mut root, source) = ast.clone().into_parts();
    let mut mapping = AHashMap::new();
    let mut next = base.max(1);
    assign_postorder(&mut root, &mut mapping, &mut next);

    let mut new_source = crate::ast::SourceInfo {
        text: source.text,
        positions: AHashMap::new(),
        macro_calls: AHashMap::new(),
    };
    for (old, offset) in &source.positions {
        if let Some(new) = mapping.get(old) {
            new_source.positions.insert(*new, *offset);
        }
    }
    // process snapshots in key order so fresh ids for snapshot-only nodes
    // come out the same for equal inputs
    let mut macro_calls: Vec<(ExprId, Expr)> = source.macro_calls.into_iter().collect();
    macro_calls.sort_by_key(|(id, _)| *id);
    let mut snapshot_only: AHashMap<ExprId, ExprId> = AHashMap::new();
    for (old_key, mut snapshot) in macro_calls {
        let Some(new_key) = mapping.get(&old_key).copied() else {
            continue;
        };
        renumber_snapshot(&mut snapshot, &mapping, &mut snapshot_only, &mut next);
        new_source.macro_calls.insert(new_key, snapshot);
    }

    (Ast::new(root, new_source), mapping)
}

/// Renumbers starting at 1. The conventional normalization applied after a
/// rewrite pass so tests can assert exact ids.
#[must_use]
pub fn stabilize(ast: &Ast) -> Ast {
    renumber_ids(ast, 1).0
}

fn assign_postorder(expr: &mut Expr, mapping: &mut AHashMap<ExprId, ExprId>, next: &mut u64) {
    for child in children_mut(expr) {
        assign_postorder(child, mapping, next);
    }
    if matches!(expr.kind, ExprKind::NotSet) {
        return;
    }
    let new = ExprId::new(*next);
    *next += 1;
    mapping.insert(expr.id, new);
    expr.id = new;
}

fn renumber_snapshot(
    expr: &mut Expr,
    mapping: &AHashMap<ExprId, ExprId>,
    snapshot_only: &mut AHashMap<ExprId, ExprId>,
    next: &mut u64,
) {
    for child in children_mut(expr) {
        renumber_snapshot(child, mapping, snapshot_only, next);
    }
    if matches!(expr.kind, ExprKind::NotSet) {
        return;
    }
    expr.id = if let Some(new) = mapping.get(&expr.id) {
        *new
    } else {
        *snapshot_only.entry(expr.id).or_insert_with(|| {
            let id = ExprId::new(*next);
            *next += 1;
            id
        })
    };
}

fn replace_in_place(expr: &mut Expr, at: ExprId, with: &Expr) -> bool {
    if expr.id == at {
        *expr = with.clone();
        return true;
    }
    for child in children_mut(expr) {
        if replace_in_place(child, at, with) {
            return true;
        }
    }
    false
}

fn children_mut(expr: &mut Expr) -> Vec<&mut Expr> {
    match &mut expr.kind {
        ExprKind::NotSet | ExprKind::Const(_) | ExprKind::Ident(_) => vec![],
        ExprKind::Select(sel) => vec![&mut sel.operand],
        ExprKind::Call(call) => {
            let mut out = Vec::with_capacity(call.args.len() + 1);
            if let Some(target) = &mut call.target {
                out.push(target);
            }
            out.extend(call.args.iter_mut());
            out
        }
        ExprKind::List(list) => list.elements.iter_mut().collect(),
        ExprKind::Map(map) => map
            .entries
            .iter_mut()
            .flat_map(|e| [&mut e.key, &mut e.value])
            .collect(),
        ExprKind::Struct(st) => st.entries.iter_mut().map(|e| &mut e.value).collect(),
        ExprKind::Comprehension(comp) => vec![
            &mut comp.iter_range,
            &mut comp.accu_init,
            &mut comp.loop_condition,
            &mut comp.loop_step,
            &mut comp.result,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::factory::ExprFactory;
    use crate::ast::SourceInfo;
    use crate::operators;

    fn sample() -> Ast {
        // size([0]) + 1, with sparse ids
        let mut fx = ExprFactory::new(10);
        let zero = fx.int(0);
        let list = fx.list(vec![zero]);
        let size = fx.global_call("size", vec![list]);
        let one = fx.int(1);
        let add = fx.global_call(operators::ADD, vec![size, one]);
        Ast::new(add, SourceInfo::default())
    }

    #[test]
    fn renumber_is_dense_monotonic_postorder() {
        let ast = sample();
        let (renumbered, mapping) = renumber_ids(&ast, 1);
        let mut ids = Vec::new();
        renumbered.root().visit(&mut |e| ids.push(e.id.get()));
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..=ids.len() as u64).collect::<Vec<_>>());
        // the root is numbered last in post-order
        assert_eq!(renumbered.root().id.get(), ids.len() as u64);
        assert_eq!(mapping.len(), ids.len());
    }

    #[test]
    fn replace_leaves_other_structure_untouched() {
        let ast = sample();
        // replace the literal 1 with 2, keeping the id
        let one_id = ast
            .root()
            .children()
            .last()
            .map(|e| e.id)
            .expect("add has two children");
        let replacement = Expr::new(one_id, ExprKind::Const(crate::ast::Constant::Int(2)));
        let out = replace_subtree(&ast, replacement, one_id);
        let before: Vec<ExprId> = {
            let mut v = Vec::new();
            ast.root().visit(&mut |e| v.push(e.id));
            v
        };
        let after: Vec<ExprId> = {
            let mut v = Vec::new();
            out.root().visit(&mut |e| v.push(e.id));
            v
        };
        assert_eq!(before, after);
        // original is unchanged
        assert_ne!(ast.root(), out.root());
    }

    #[test]
    fn replace_missing_id_is_identity() {
        let ast = sample();
        let out = replace_subtree(&ast, Expr::not_set(), ExprId::new(9999));
        assert_eq!(ast.root(), out.root());
    }

    #[test]
    fn snapshot_slot_invalidated_when_replacement_changes_id() {
        let mut fx = ExprFactory::new(1);
        let arg = fx.int(7);
        let arg_id = arg.id;
        let call = fx.global_call("size", vec![arg]);
        let call_id = call.id;
        let mut source = SourceInfo::default();
        // snapshot that references the argument node by id
        let snap_arg = Expr::new(arg_id, ExprKind::Const(crate::ast::Constant::Int(7)));
        let snapshot = Expr::new(
            fx.next_id(),
            ExprKind::Call(Box::new(crate::ast::CallExpr {
                target: None,
                function: "shadow".to_string(),
                args: vec![snap_arg],
            })),
        );
        source.macro_calls.insert(call_id, snapshot);
        let ast = Ast::new(call, source);

        // fresh-id replacement: the slot no longer fits and becomes NotSet
        let mut fx2 = ExprFactory::new(100);
        let fresh = fx2.int(8);
        let out = replace_subtree(&ast, fresh, arg_id);
        let snapshot = out.source().macro_calls.get(&call_id).expect("snapshot kept");
        let slot = &snapshot.children()[0];
        assert!(matches!(slot.kind, ExprKind::NotSet));

        // id-preserving replacement: the slot is updated instead
        let same_id = Expr::new(arg_id, ExprKind::Const(crate::ast::Constant::Int(8)));
        let out = replace_subtree(&ast, same_id, arg_id);
        let snapshot = out.source().macro_calls.get(&call_id).expect("snapshot kept");
        let slot = &snapshot.children()[0];
        assert_eq!(slot.kind, ExprKind::Const(crate::ast::Constant::Int(8)));
    }

    #[test]
    fn replacing_a_macro_node_clears_its_snapshot() {
        let mut fx = ExprFactory::new(1);
        let call = fx.global_call("size", vec![]);
        let call_id = call.id;
        let mut source = SourceInfo::default();
        source.macro_calls.insert(call_id, Expr::not_set());
        let ast = Ast::new(call, source);
        let out = replace_subtree(&ast, fx.int(0), call_id);
        assert!(out.source().macro_calls.is_empty());
    }
}
