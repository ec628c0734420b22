//! Identifier inlining.
//!
//! Replaces every reachable reference to a (possibly qualified) name with a
//! deep copy of a replacement expression. References under `has(…)` are
//! rewritten into a semantically equivalent presence check on the
//! replacement instead, since the replacement is no longer a selectable
//! field.

use cel_core::{
    ast::{factory::ExprFactory, mutator, navigation::NavigableAst, Ast, Expr, ExprId, ExprKind},
    operators, CelType, Env,
};

use crate::{support, OptimizeError, Optimizer, OptimizerConfig};

/// One name to inline and the expression that replaces it.
#[derive(Debug, Clone)]
pub struct InlineVariable {
    name: String,
    replacement: Expr,
    declared_type: Option<CelType>,
}

impl InlineVariable {
    pub fn new(name: impl Into<String>, replacement: Expr) -> Self {
        Self {
            name: name.into(),
            replacement,
            declared_type: None,
        }
    }

    pub fn from_ast(name: impl Into<String>, replacement: &Ast) -> Self {
        Self::new(name, replacement.root().clone())
    }

    /// Declares the replacement's type, used to pick the presence-test
    /// rewrite for identifier replacements.
    #[must_use]
    pub fn with_type(mut self, ty: CelType) -> Self {
        self.declared_type = Some(ty);
        self
    }
}

#[derive(Debug)]
pub struct InliningOptimizer {
    inlines: Vec<InlineVariable>,
    config: OptimizerConfig,
}

impl InliningOptimizer {
    pub fn new(inlines: Vec<InlineVariable>) -> Self {
        Self {
            inlines,
            config: OptimizerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: OptimizerConfig) -> Self {
        self.config = config;
        self
    }
}

impl Optimizer for InliningOptimizer {
    fn optimize(&self, env: &Env, ast: &Ast) -> Result<Ast, OptimizeError> {
        let mut current = ast.clone();
        for inline in &self.inlines {
            if inline.name.starts_with('@') {
                return Err(OptimizeError::InternalName(inline.name.clone()));
            }
            current = apply_inline(env, &current, inline, &self.config)?;
        }
        Ok(mutator::stabilize(&current))
    }
}

fn apply_inline(
    env: &Env,
    ast: &Ast,
    inline: &InlineVariable,
    config: &OptimizerConfig,
) -> Result<Ast, OptimizeError> {
    // one collection pass: occurrences introduced by the replacement itself
    // are intentionally not revisited, so a no-op inline terminates
    let matches = collect_matches(ast, inline);
    if matches.len() > config.max_iterations {
        return Err(OptimizeError::MaxIterationCountReached);
    }
    let mut current = ast.clone();
    for matched in matches {
        let mut fx = ExprFactory::new(current.max_id() + 1);
        let replacement = match matched.presence {
            false => fx.copy_with_fresh_ids(&inline.replacement),
            true => presence_rewrite(env, inline, &mut fx),
        };
        current = mutator::replace_subtree(&current, replacement, matched.id);
    }
    Ok(current)
}

struct Match {
    id: ExprId,
    /// true when the reference sits under `has(…)` as the tested field
    presence: bool,
}

fn collect_matches(ast: &Ast, inline: &InlineVariable) -> Vec<Match> {
    let nav = NavigableAst::new(ast);
    let mut out = Vec::new();
    for node in nav.preorder() {
        let presence = match &node.kind {
            ExprKind::Ident(_) | ExprKind::Select(_) => {
                let Some(path) = chain_path(node) else {
                    continue;
                };
                if path.name != inline.name {
                    continue;
                }
                path.test_only
            }
            _ => continue,
        };
        if shadowed(&nav, node.id, &inline.name) {
            continue;
        }
        out.push(Match {
            id: node.id,
            presence,
        });
    }
    out
}

struct ChainPath {
    name: String,
    test_only: bool,
}

/// The dotted path a node spells, including the field of a presence test:
/// `has(a.b.c)` is a test-only select spelling `a.b.c`.
fn chain_path(node: &Expr) -> Option<ChainPath> {
    match &node.kind {
        ExprKind::Ident(name) => Some(ChainPath {
            name: name.clone(),
            test_only: false,
        }),
        ExprKind::Select(sel) => {
            let prefix = support::dotted(&sel.operand)?;
            Some(ChainPath {
                name: format!("{prefix}.{}", sel.field),
                test_only: sel.test_only,
            })
        }
        _ => None,
    }
}

/// Whether the name's root segment is rebound by an enclosing comprehension
/// (including `cel.bind` forms, which desugar to comprehensions).
fn shadowed(nav: &NavigableAst<'_>, id: ExprId, name: &str) -> bool {
    let root_segment = name.split('.').next().unwrap_or(name);
    nav.enclosing_comprehensions(id)
        .into_iter()
        .filter_map(|ancestor| match &ancestor.kind {
            ExprKind::Comprehension(comp) => Some(comp),
            _ => None,
        })
        .any(|comp| {
            comp.iter_var == root_segment
                || comp.iter_var2.as_deref() == Some(root_segment)
                || comp.accu_var == root_segment
        })
}

/// The presence-test rewrite table: `has(x.f)` becomes an emptiness or
/// zero-value check appropriate to the replacement's shape.
fn presence_rewrite(env: &Env, inline: &InlineVariable, fx: &mut ExprFactory) -> Expr {
    let replacement = &inline.replacement;
    match &replacement.kind {
        ExprKind::List(_) | ExprKind::Map(_) | ExprKind::Const(cel_core::ast::Constant::String(_))
        | ExprKind::Const(cel_core::ast::Constant::Bytes(_)) => size_not_zero(replacement, fx),
        ExprKind::Const(cel_core::ast::Constant::Int(_)) => {
            let zero = fx.int(0);
            not_equals(replacement, zero, fx)
        }
        ExprKind::Const(cel_core::ast::Constant::Uint(_)) => {
            let zero = fx.uint(0);
            not_equals(replacement, zero, fx)
        }
        ExprKind::Const(cel_core::ast::Constant::Double(_)) => {
            let zero = fx.double(0.0);
            not_equals(replacement, zero, fx)
        }
        ExprKind::Const(cel_core::ast::Constant::Bool(_)) => {
            let falsy = fx.bool(false);
            not_equals(replacement, falsy, fx)
        }
        ExprKind::Struct(st) => {
            let empty = fx.strukt(st.message_name.clone(), vec![]);
            not_equals(replacement, empty, fx)
        }
        ExprKind::Call(_) => match support::qualified_function(replacement).as_deref() {
            Some("timestamp") => {
                let zero = fx.int(0);
                let epoch = fx.global_call("timestamp", vec![zero]);
                not_equals(replacement, epoch, fx)
            }
            Some("duration") => {
                let zero = fx.string("0");
                let empty = fx.global_call("duration", vec![zero]);
                not_equals(replacement, empty, fx)
            }
            _ => not_null(replacement, fx),
        },
        ExprKind::Ident(name) => {
            let ty = inline
                .declared_type
                .clone()
                .or_else(|| env.resolve_variable(name).map(|(_, decl)| decl.ty.clone()));
            ident_presence_rewrite(replacement, ty, fx)
        }
        _ => not_null(replacement, fx),
    }
}

fn ident_presence_rewrite(replacement: &Expr, ty: Option<CelType>, fx: &mut ExprFactory) -> Expr {
    match ty {
        Some(CelType::Int) => {
            let zero = fx.int(0);
            not_equals(replacement, zero, fx)
        }
        Some(CelType::Uint) => {
            let zero = fx.uint(0);
            not_equals(replacement, zero, fx)
        }
        Some(CelType::Double) => {
            let zero = fx.double(0.0);
            not_equals(replacement, zero, fx)
        }
        Some(CelType::Bool) => {
            let falsy = fx.bool(false);
            not_equals(replacement, falsy, fx)
        }
        Some(CelType::String | CelType::Bytes | CelType::List(_) | CelType::Map(_, _)) => {
            size_not_zero(replacement, fx)
        }
        Some(CelType::Timestamp) => {
            let zero = fx.int(0);
            let epoch = fx.global_call("timestamp", vec![zero]);
            not_equals(replacement, epoch, fx)
        }
        Some(CelType::Duration) => {
            let zero = fx.string("0");
            let empty = fx.global_call("duration", vec![zero]);
            not_equals(replacement, empty, fx)
        }
        // wrapper-typed and unknown identifiers compare against null
        _ => not_null(replacement, fx),
    }
}

fn size_not_zero(replacement: &Expr, fx: &mut ExprFactory) -> Expr {
    let copy = fx.copy_with_fresh_ids(replacement);
    let size = fx.member_call(copy, "size", vec![]);
    let zero = fx.int(0);
    fx.global_call(operators::NOT_EQUALS, vec![size, zero])
}

fn not_equals(replacement: &Expr, rhs: Expr, fx: &mut ExprFactory) -> Expr {
    let copy = fx.copy_with_fresh_ids(replacement);
    fx.global_call(operators::NOT_EQUALS, vec![copy, rhs])
}

fn not_null(replacement: &Expr, fx: &mut ExprFactory) -> Expr {
    let copy = fx.copy_with_fresh_ids(replacement);
    let null = fx.null();
    fx.global_call(operators::NOT_EQUALS, vec![copy, null])
}
