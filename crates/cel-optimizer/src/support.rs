//! Helpers shared by the optimizers.

use cel_core::{
    ast::{Expr, ExprKind},
    Env, FunctionDecl,
};

/// Renders a pure ident/select chain as its dotted source path.
pub(crate) fn dotted(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(name.clone()),
        ExprKind::Select(sel) if !sel.test_only => {
            dotted(&sel.operand).map(|prefix| format!("{prefix}.{}", sel.field))
        }
        _ => None,
    }
}

/// The function a call names, with the member-call spelling of qualified
/// globals (`optional.of(x)`) resolved through the container. The flag is
/// true when the syntactic target is a namespace rather than an operand.
pub(crate) fn resolve_call<'e>(env: &'e Env, expr: &Expr) -> Option<(&'e FunctionDecl, bool)> {
    let ExprKind::Call(call) = &expr.kind else {
        return None;
    };
    if let Some(target) = &call.target {
        if let Some(prefix) = dotted(target) {
            let qualified = format!("{prefix}.{}", call.function);
            if env.resolve_variable(&prefix).is_none() {
                if let Some((_, decl)) = env.resolve_function(&qualified) {
                    return Some((decl, true));
                }
            }
        }
        return env.find_function(&call.function).map(|decl| (decl, false));
    }
    env.resolve_function(&call.function).map(|(_, decl)| (decl, false))
}

/// The qualified name a call spells, whether global or namespaced member
/// style.
pub(crate) fn qualified_function(expr: &Expr) -> Option<String> {
    let ExprKind::Call(call) = &expr.kind else {
        return None;
    };
    match &call.target {
        None => Some(call.function.clone()),
        Some(target) => dotted(target).map(|prefix| format!("{prefix}.{}", call.function)),
    }
}

/// Whether every overload of the called function opted into folding, the
/// purity contract elimination and folding both require.
pub(crate) fn call_is_pure(env: &Env, expr: &Expr) -> bool {
    match resolve_call(env, expr) {
        Some((decl, _)) => decl.overloads.values().all(|o| o.foldable),
        None => false,
    }
}

/// In-place mutable traversal of a node's children, in canonical order.
pub(crate) fn children_mut(expr: &mut Expr) -> Vec<&mut Expr> {
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
