//! Constant folding.
//!
//! A bounded fixed-point that replaces a subtree with its literal value
//! when every input is a literal and every invoked function opted into
//! folding. Boolean shortcuts (`x && true`, `true ? a : b`), optional-entry
//! pruning, and presence tests over struct literals are rewritten
//! structurally without evaluation.

use cel_core::{
    ast::{
        factory::ExprFactory, mutator, navigation::NavigableAst, Ast, Constant, Expr, ExprKind,
        ListExpr, MapEntry, MapExpr, StructExpr, StructField,
    },
    operators, CelType, EmptyActivation, Env, Value,
};

use crate::{
    support::{self, qualified_function},
    OptimizeError, Optimizer, OptimizerConfig,
};

#[derive(Debug, Default)]
pub struct ConstantFoldingOptimizer {
    config: OptimizerConfig,
}

impl ConstantFoldingOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: OptimizerConfig) -> Self {
        Self { config }
    }
}

impl Optimizer for ConstantFoldingOptimizer {
    fn optimize(&self, env: &Env, ast: &Ast) -> Result<Ast, OptimizeError> {
        let mut current = ast.clone();
        for _ in 0..self.config.max_iterations {
            match fold_pass(env, &current) {
                Some(next) => current = next,
                None => return Ok(mutator::stabilize(&current)),
            }
        }
        Err(OptimizeError::MaxIterationCountReached)
    }
}

/// Applies the first available rewrite, or `None` at fixpoint.
fn fold_pass(env: &Env, ast: &Ast) -> Option<Ast> {
    let nav = NavigableAst::new(ast);
    for node in nav.preorder() {
        if let Some(replacement) = rewrite(env, node) {
            return Some(mutator::replace_subtree(ast, replacement, node.id));
        }
    }
    None
}

fn rewrite(env: &Env, node: &Expr) -> Option<Expr> {
    if let Some(shortcut) = boolean_shortcut(node) {
        return Some(shortcut);
    }
    if let Some(pruned) = prune_optional_entries(env, node) {
        return Some(pruned);
    }
    if let Some(folded) = fold_presence_test(node) {
        return Some(folded);
    }
    if is_literal(node) || !is_constant_subtree(env, node) {
        return None;
    }
    evaluate_subtree(env, node)
}

/// `true ? a : b → a`, `x && false → false`, `x || true → true`,
/// `x && true → x`, `x || false → x`.
fn boolean_shortcut(node: &Expr) -> Option<Expr> {
    let ExprKind::Call(call) = &node.kind else {
        return None;
    };
    if call.target.is_some() {
        return None;
    }
    match (call.function.as_str(), call.args.as_slice()) {
        (operators::CONDITIONAL, [cond, then, otherwise]) => match const_bool(cond) {
            Some(true) => Some(then.clone()),
            Some(false) => Some(otherwise.clone()),
            None => None,
        },
        (operators::LOGICAL_AND, [lhs, rhs]) => match (const_bool(lhs), const_bool(rhs)) {
            (Some(false), _) | (_, Some(false)) => {
                Some(Expr::new(node.id, ExprKind::Const(Constant::Bool(false))))
            }
            (Some(true), None) => Some(rhs.clone()),
            (None, Some(true)) => Some(lhs.clone()),
            _ => None,
        },
        (operators::LOGICAL_OR, [lhs, rhs]) => match (const_bool(lhs), const_bool(rhs)) {
            (Some(true), _) | (_, Some(true)) => {
                Some(Expr::new(node.id, ExprKind::Const(Constant::Bool(true))))
            }
            (Some(false), None) => Some(rhs.clone()),
            (None, Some(false)) => Some(lhs.clone()),
            _ => None,
        },
        _ => None,
    }
}

fn const_bool(expr: &Expr) -> Option<bool> {
    match &expr.kind {
        ExprKind::Const(Constant::Bool(b)) => Some(*b),
        _ => None,
    }
}

/// Rewrites optional entries whose value is a decided optional call:
/// `?optional.none()` disappears, `?optional.of(e)` becomes a plain entry,
/// `?optional.ofNonZeroValue(lit)` is decided by the literal's zero test.
fn prune_optional_entries(env: &Env, node: &Expr) -> Option<Expr> {
    #[derive(Clone, Copy)]
    enum Decision {
        Keep,
        Drop,
        Inline,
    }
    let decide = |optional: bool, value: &Expr| -> Decision {
        if !optional {
            return Decision::Keep;
        }
        match qualified_function(value).as_deref() {
            Some("optional.none") => Decision::Drop,
            Some("optional.of") => Decision::Inline,
            Some("optional.ofNonZeroValue") => {
                let ExprKind::Call(call) = &value.kind else {
                    return Decision::Keep;
                };
                let [arg] = call.args.as_slice() else {
                    return Decision::Keep;
                };
                if !is_constant_subtree(env, arg) {
                    return Decision::Keep;
                }
                match evaluate_to_value(env, arg) {
                    Some(value) if value.is_zero_value() => Decision::Drop,
                    Some(_) => Decision::Inline,
                    None => Decision::Keep,
                }
            }
            _ => Decision::Keep,
        }
    };
    let inlined_arg = |value: &Expr| -> Expr {
        let ExprKind::Call(call) = &value.kind else {
            return value.clone();
        };
        call.args.first().cloned().unwrap_or_else(|| value.clone())
    };

    match &node.kind {
        ExprKind::List(list) if !list.optional_indices.is_empty() => {
            let mut changed = false;
            let mut elements = Vec::with_capacity(list.elements.len());
            let mut optional_indices = Vec::new();
            for (i, element) in list.elements.iter().enumerate() {
                let optional = list.optional_indices.contains(&(i as u32));
                match decide(optional, element) {
                    Decision::Keep => {
                        if optional {
                            optional_indices.push(elements.len() as u32);
                        }
                        elements.push(element.clone());
                    }
                    Decision::Drop => changed = true,
                    Decision::Inline => {
                        changed = true;
                        elements.push(inlined_arg(element));
                    }
                }
            }
            changed.then(|| {
                Expr::new(
                    node.id,
                    ExprKind::List(ListExpr {
                        elements,
                        optional_indices,
                    }),
                )
            })
        }
        ExprKind::Map(map) if map.entries.iter().any(|e| e.optional) => {
            let mut changed = false;
            let mut entries = Vec::with_capacity(map.entries.len());
            for entry in &map.entries {
                match decide(entry.optional, &entry.value) {
                    Decision::Keep => entries.push(entry.clone()),
                    Decision::Drop => changed = true,
                    Decision::Inline => {
                        changed = true;
                        entries.push(MapEntry {
                            key: entry.key.clone(),
                            value: inlined_arg(&entry.value),
                            optional: false,
                        });
                    }
                }
            }
            changed.then(|| Expr::new(node.id, ExprKind::Map(MapExpr { entries })))
        }
        ExprKind::Struct(st) if st.entries.iter().any(|e| e.optional) => {
            let mut changed = false;
            let mut entries = Vec::with_capacity(st.entries.len());
            for entry in &st.entries {
                match decide(entry.optional, &entry.value) {
                    Decision::Keep => entries.push(entry.clone()),
                    Decision::Drop => changed = true,
                    Decision::Inline => {
                        changed = true;
                        entries.push(StructField {
                            field: entry.field.clone(),
                            value: inlined_arg(&entry.value),
                            optional: false,
                        });
                    }
                }
            }
            changed.then(|| {
                Expr::new(
                    node.id,
                    ExprKind::Struct(StructExpr {
                        message_name: st.message_name.clone(),
                        entries,
                    }),
                )
            })
        }
        _ => None,
    }
}

/// `has(Struct{...}.field)` over a struct literal is a known boolean.
fn fold_presence_test(node: &Expr) -> Option<Expr> {
    let ExprKind::Select(sel) = &node.kind else {
        return None;
    };
    if !sel.test_only {
        return None;
    }
    let ExprKind::Struct(st) = &sel.operand.kind else {
        return None;
    };
    // undecided optional entries could still add or drop the field
    if st.entries.iter().any(|e| e.optional) {
        return None;
    }
    let present = st.entries.iter().any(|e| e.field == sel.field);
    Some(Expr::new(node.id, ExprKind::Const(Constant::Bool(present))))
}

fn is_literal(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Const(_) => true,
        ExprKind::List(list) => {
            list.optional_indices.is_empty() && list.elements.iter().all(is_literal)
        }
        ExprKind::Map(map) => map
            .entries
            .iter()
            .all(|e| !e.optional && is_literal(&e.key) && is_literal(&e.value)),
        ExprKind::Struct(st) => st.entries.iter().all(|e| !e.optional && is_literal(&e.value)),
        _ => false,
    }
}

/// Whether the subtree evaluates from literals alone: no identifiers, no
/// comprehensions, and only functions whose overloads all opted into
/// folding.
fn is_constant_subtree(env: &Env, expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Const(_) => true,
        ExprKind::Ident(_) | ExprKind::Comprehension(_) | ExprKind::NotSet | ExprKind::Select(_) => {
            false
        }
        ExprKind::Call(call) => {
            let Some((decl, namespace_target)) = support::resolve_call(env, expr) else {
                return false;
            };
            decl.overloads.values().all(|o| o.foldable)
                && (namespace_target
                    || call.target.iter().all(|t| is_constant_subtree(env, t)))
                && call.args.iter().all(|a| is_constant_subtree(env, a))
        }
        ExprKind::List(list) => list.elements.iter().all(|e| is_constant_subtree(env, e)),
        ExprKind::Map(map) => map
            .entries
            .iter()
            .all(|e| is_constant_subtree(env, &e.key) && is_constant_subtree(env, &e.value)),
        ExprKind::Struct(st) => st.entries.iter().all(|e| is_constant_subtree(env, &e.value)),
    }
}

fn evaluate_to_value(env: &Env, expr: &Expr) -> Option<Value> {
    let sub_ast = Ast::new(expr.clone(), cel_core::ast::SourceInfo::default());
    let program = env.plan_unchecked(&sub_ast).ok()?;
    program.eval(&EmptyActivation).ok()
}

/// Evaluates a constant subtree and renders the result as a literal
/// expression. Errors (division by zero inside dead code, say) leave the
/// subtree in place for the runtime to report.
fn evaluate_subtree(env: &Env, node: &Expr) -> Option<Expr> {
    let value = evaluate_to_value(env, node)?;
    let mut fx = ExprFactory::new(node.max_id() + 1);
    let mut replacement = value_to_expr(&value, &mut fx)?;
    // values without a literal form render back as calls (`duration("5s")`,
    // `optional.of(x)`); once the rendering is its own normal form the
    // rewrite has converged
    if replacement.same_shape(node) {
        return None;
    }
    replacement.id = node.id;
    Some(replacement)
}

fn value_to_expr(value: &Value, fx: &mut ExprFactory) -> Option<Expr> {
    if let Some(constant) = value.to_constant() {
        return Some(fx.constant(constant));
    }
    match value {
        Value::List(list) => {
            let elements = list
                .iter()
                .map(|v| value_to_expr(v, fx))
                .collect::<Option<Vec<_>>>()?;
            Some(fx.list(elements))
        }
        Value::Map(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (key, val) in map.iter() {
                let key = value_to_expr(&key.to_value(), fx)?;
                let value = value_to_expr(val, fx)?;
                entries.push(MapEntry {
                    key,
                    value,
                    optional: false,
                });
            }
            Some(fx.map(entries))
        }
        Value::Struct(st) => {
            let mut entries = Vec::with_capacity(st.fields.len());
            for (field, val) in &st.fields {
                entries.push(StructField {
                    field: field.clone(),
                    value: value_to_expr(val, fx)?,
                    optional: false,
                });
            }
            Some(fx.strukt(st.type_name.clone(), entries))
        }
        Value::Optional(cel_core::OptionalValue::Present(inner)) => {
            let inner = value_to_expr(inner, fx)?;
            Some(fx.global_call("optional.of", vec![inner]))
        }
        Value::Optional(cel_core::OptionalValue::Absent) => {
            Some(fx.global_call("optional.none", vec![]))
        }
        Value::Duration(_) => {
            let text = literal_text(value)?;
            let arg = fx.string(text);
            Some(fx.global_call("duration", vec![arg]))
        }
        Value::Timestamp(_) => {
            let text = literal_text(value)?;
            let arg = fx.string(text);
            Some(fx.global_call("timestamp", vec![arg]))
        }
        Value::Type(ty) => {
            // builtin type names are identifiers in source form
            matches!(
                ty,
                CelType::Bool
                    | CelType::Int
                    | CelType::Uint
                    | CelType::Double
                    | CelType::String
                    | CelType::Bytes
                    | CelType::Null
                    | CelType::Type(None)
            )
            .then(|| fx.ident(ty.to_string()))
        }
        _ => None,
    }
}

fn literal_text(value: &Value) -> Option<String> {
    match value.convert_to_string() {
        Ok(Value::String(s)) => Some(s.to_string()),
        _ => None,
    }
}
