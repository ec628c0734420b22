//! Parse-time macro expansion.
//!
//! Surface macros desugar into the comprehension primitive (or a test-only
//! select, for `has`) as the parser builds call nodes. The pre-expansion
//! call is recorded in the source overlay so the unparser can print the
//! original form; snapshot arguments share subtrees, and therefore ids,
//! with the expansion.

use cel_core::ast::{
    factory::ExprFactory, Expr, ExprKind, SourceInfo, ACCUMULATOR_VAR,
};
use cel_core::operators;

use crate::error::ParseError;

/// The set of macro names the parser expands. Standard macros plus
/// `cel.bind` from the bindings extension are on by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroSet {
    names: Vec<String>,
}

impl MacroSet {
    pub fn standard() -> Self {
        Self {
            names: ["has", "all", "exists", "exists_one", "map", "filter", "cel.bind"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    pub fn none() -> Self {
        Self { names: Vec::new() }
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.names.contains(&name) {
            self.names.push(name);
        }
        self
    }

    #[must_use]
    pub fn without(mut self, name: &str) -> Self {
        self.names.retain(|n| n != name);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Builds the macro set an environment's standard-library subset and
    /// extensions allow.
    pub fn from_env(env: &cel_core::Env) -> Self {
        let mut set = Self::none();
        for name in ["has", "all", "exists", "exists_one", "map", "filter", "cel.bind"] {
            if env.macro_enabled(name) {
                set = set.with(name);
            }
        }
        set
    }
}

impl Default for MacroSet {
    fn default() -> Self {
        Self::standard()
    }
}

/// `has(e.f)` → test-only select.
pub(crate) fn expand_has(
    fx: &mut ExprFactory,
    source: &mut SourceInfo,
    offset: u32,
    arg: Expr,
) -> Result<Expr, ParseError> {
    let ExprKind::Select(sel) = arg.kind.clone() else {
        return Err(ParseError {
            message: "invalid argument to has() macro: field selection required".to_string(),
            offset,
        });
    };
    if sel.test_only {
        return Err(ParseError {
            message: "invalid argument to has() macro: already a presence test".to_string(),
            offset,
        });
    }
    let snapshot = fx.global_call("has", vec![arg]);
    let expanded = fx.presence_test(sel.operand, sel.field);
    source.positions.insert(expanded.id, offset);
    source.macro_calls.insert(expanded.id, snapshot);
    Ok(expanded)
}

/// The accumulator-based macros: `all`, `exists`, `exists_one`, `map`
/// (2- and 3-arg), and `filter`.
pub(crate) fn expand_comprehension(
    fx: &mut ExprFactory,
    source: &mut SourceInfo,
    offset: u32,
    name: &str,
    target: Expr,
    mut args: Vec<Expr>,
) -> Result<Expr, ParseError> {
    let iter_var = simple_var_name(&args[0], offset)?;
    let snapshot = fx.member_call(target.clone(), name, args.clone());

    let accu = |fx: &mut ExprFactory| fx.ident(ACCUMULATOR_VAR);
    let (accu_init, loop_condition, loop_step, result) = match (name, args.len()) {
        ("all", 2) => {
            let init = fx.bool(true);
            let cond_arg = accu(fx);
            let cond = fx.global_call(operators::NOT_STRICTLY_FALSE, vec![cond_arg]);
            let lhs = accu(fx);
            let step = fx.global_call(operators::LOGICAL_AND, vec![lhs, args.swap_remove(1)]);
            let result = accu(fx);
            (init, cond, step, result)
        }
        ("exists", 2) => {
            let init = fx.bool(false);
            let inner = accu(fx);
            let negated = fx.global_call(operators::LOGICAL_NOT, vec![inner]);
            let cond = fx.global_call(operators::NOT_STRICTLY_FALSE, vec![negated]);
            let lhs = accu(fx);
            let step = fx.global_call(operators::LOGICAL_OR, vec![lhs, args.swap_remove(1)]);
            let result = accu(fx);
            (init, cond, step, result)
        }
        ("exists_one", 2) => {
            let init = fx.int(0);
            let cond = fx.bool(true);
            let current = accu(fx);
            let one = fx.int(1);
            let incremented = fx.global_call(operators::ADD, vec![current, one]);
            let unchanged = accu(fx);
            let step = fx.global_call(
                operators::CONDITIONAL,
                vec![args.swap_remove(1), incremented, unchanged],
            );
            let lhs = accu(fx);
            let one = fx.int(1);
            let result = fx.global_call(operators::EQUALS, vec![lhs, one]);
            (init, cond, step, result)
        }
        ("map", 2) => {
            let init = fx.list(vec![]);
            let cond = fx.bool(true);
            let transformed = fx.list(vec![args.swap_remove(1)]);
            let lhs = accu(fx);
            let step = fx.global_call(operators::ADD, vec![lhs, transformed]);
            let result = accu(fx);
            (init, cond, step, result)
        }
        ("map", 3) => {
            let init = fx.list(vec![]);
            let cond = fx.bool(true);
            let transform = args.swap_remove(2);
            let predicate = args.swap_remove(1);
            let transformed = fx.list(vec![transform]);
            let lhs = accu(fx);
            let appended = fx.global_call(operators::ADD, vec![lhs, transformed]);
            let unchanged = accu(fx);
            let step = fx.global_call(operators::CONDITIONAL, vec![predicate, appended, unchanged]);
            let result = accu(fx);
            (init, cond, step, result)
        }
        ("filter", 2) => {
            let init = fx.list(vec![]);
            let cond = fx.bool(true);
            let element = fx.ident(iter_var.as_str());
            let kept = fx.list(vec![element]);
            let lhs = accu(fx);
            let appended = fx.global_call(operators::ADD, vec![lhs, kept]);
            let unchanged = accu(fx);
            let step = fx.global_call(
                operators::CONDITIONAL,
                vec![args.swap_remove(1), appended, unchanged],
            );
            let result = accu(fx);
            (init, cond, step, result)
        }
        _ => {
            return Err(ParseError {
                message: format!("wrong number of arguments to {name}() macro"),
                offset,
            });
        }
    };

    let expanded = fx.comprehension(
        iter_var,
        None,
        target,
        ACCUMULATOR_VAR,
        accu_init,
        loop_condition,
        loop_step,
        result,
    );
    source.positions.insert(expanded.id, offset);
    source.macro_calls.insert(expanded.id, snapshot);
    Ok(expanded)
}

/// `cel.bind(var, init, body)` → a zero-trip comprehension that binds the
/// accumulator.
pub(crate) fn expand_bind(
    fx: &mut ExprFactory,
    source: &mut SourceInfo,
    offset: u32,
    target: Expr,
    mut args: Vec<Expr>,
) -> Result<Expr, ParseError> {
    let var_name = simple_var_name(&args[0], offset)?;
    let snapshot = fx.member_call(target, "bind", args.clone());

    let body = args.swap_remove(2);
    let init = args.swap_remove(1);
    let range = fx.list(vec![]);
    let cond = fx.bool(false);
    let step = fx.ident(var_name.as_str());
    let expanded = fx.comprehension("#unused", None, range, var_name, init, cond, step, body);
    source.positions.insert(expanded.id, offset);
    source.macro_calls.insert(expanded.id, snapshot);
    Ok(expanded)
}

fn simple_var_name(expr: &Expr, offset: u32) -> Result<String, ParseError> {
    match &expr.kind {
        ExprKind::Ident(name) if !name.contains('.') => {
            if name == ACCUMULATOR_VAR {
                Err(ParseError {
                    message: format!("iteration variable overwrites accumulator '{ACCUMULATOR_VAR}'"),
                    offset,
                })
            } else {
                Ok(name.clone())
            }
        }
        _ => Err(ParseError {
            message: "macro variable must be a simple identifier".to_string(),
            offset,
        }),
    }
}
