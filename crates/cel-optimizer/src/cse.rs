//! Common-subexpression elimination.
//!
//! Finds maximal sets of structurally equal, pure subexpressions and binds
//! each to a fresh name, in one of two emission styles:
//!
//! - **Bind**: cascaded `cel.bind(@rN, expr, body)` macros wrapping the
//!   smallest enclosing scope of each group, inner subexpressions bound
//!   first. The bind comprehensions carry macro snapshots so they unparse
//!   in macro form.
//! - **Block**: a single flat `cel.@block([e0, e1, …], body)` at the root,
//!   with occurrences replaced by `@indexN` references. References only ever
//!   point backwards; a verification pass enforces the shape.

use cel_core::{
    ast::{
        factory::ExprFactory, mutator, navigation::NavigableAst, Ast, CallExpr, Expr, ExprId,
        ExprKind, ListExpr, BLOCK_FUNCTION, BLOCK_INDEX_PREFIX,
    },
    Env,
};
use indexmap::IndexMap;

use crate::{support, OptimizeError, Optimizer, OptimizerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CseStyle {
    /// Cascaded `cel.bind` macros.
    Bind,
    /// One flat `cel.@block` at the root.
    Block,
}

#[derive(Debug)]
pub struct SubexpressionOptimizer {
    style: CseStyle,
    config: OptimizerConfig,
}

impl SubexpressionOptimizer {
    pub fn new_bind() -> Self {
        Self {
            style: CseStyle::Bind,
            config: OptimizerConfig::default(),
        }
    }

    pub fn new_block() -> Self {
        Self {
            style: CseStyle::Block,
            config: OptimizerConfig::default(),
        }
    }

    pub fn with_config(style: CseStyle, config: OptimizerConfig) -> Self {
        Self { style, config }
    }
}

impl Optimizer for SubexpressionOptimizer {
    fn optimize(&self, env: &Env, ast: &Ast) -> Result<Ast, OptimizeError> {
        match self.style {
            CseStyle::Bind => self.optimize_bind(env, ast),
            CseStyle::Block => self.optimize_block(env, ast),
        }
    }
}

impl SubexpressionOptimizer {
    fn optimize_bind(&self, env: &Env, ast: &Ast) -> Result<Ast, OptimizeError> {
        let mut current = ast.clone();
        let mut counter = 0_usize;
        for _ in 0..=self.config.max_iterations {
            let Some(group) = next_group(env, &current) else {
                return Ok(mutator::stabilize(&current));
            };
            let name = format!("@r{counter}");
            counter += 1;

            let (occurrence_ids, lca_id, template) = group;
            let mut fx = ExprFactory::new(current.max_id() + 1);
            for id in &occurrence_ids {
                let reference = fx.ident(name.as_str());
                current = mutator::replace_subtree(&current, reference, *id);
            }

            // wrap the smallest enclosing scope of all occurrences
            let nav = NavigableAst::new(&current);
            let body = nav
                .node(lca_id)
                .ok_or_else(|| OptimizeError::Verify("bind scope disappeared".to_string()))?
                .clone();
            drop(nav);

            let mut fx = ExprFactory::new(current.max_id().max(template.max_id()) + 1);
            let range = fx.list(vec![]);
            let loop_condition = fx.bool(false);
            let step = fx.ident(name.as_str());
            let bind = fx.comprehension(
                "#unused",
                None,
                range,
                name.as_str(),
                template.clone(),
                loop_condition,
                step,
                body.clone(),
            );
            let bind_id = bind.id;
            let cel = fx.ident("cel");
            let var = fx.ident(name.as_str());
            let snapshot = fx.member_call(cel, "bind", vec![var, template, body]);

            current = mutator::replace_subtree(&current, bind, lca_id);
            current = mutator::with_macro_call(&current, bind_id, snapshot);
        }
        Err(OptimizeError::MaxIterationCountReached)
    }

    fn optimize_block(&self, env: &Env, ast: &Ast) -> Result<Ast, OptimizeError> {
        let mut current = ast.clone();
        let mut slots: Vec<Expr> = Vec::new();
        for _ in 0..=self.config.max_iterations {
            let Some((occurrence_ids, _, template)) = next_group(env, &current) else {
                if slots.is_empty() {
                    // a second pass over already-blocked output finds nothing
                    // new; the existing block must still verify
                    if is_block_root(current.root()) {
                        verify_block(&current)?;
                    }
                    return Ok(mutator::stabilize(&current));
                }
                let blocked = assemble_block(current, std::mem::take(&mut slots));
                let blocked = if self.config.subexpression_max_recursion_depth > 0 {
                    flatten_deep(
                        blocked,
                        self.config.subexpression_max_recursion_depth,
                        self.config.max_iterations,
                    )?
                } else {
                    blocked
                };
                verify_block(&blocked)?;
                return Ok(mutator::stabilize(&blocked));
            };
            let name = format!("{BLOCK_INDEX_PREFIX}{}", slots.len());
            let mut fx = ExprFactory::new(current.max_id() + 1);
            for id in &occurrence_ids {
                let reference = fx.ident(name.as_str());
                current = mutator::replace_subtree(&current, reference, *id);
            }
            slots.push(template);
        }
        Err(OptimizeError::MaxIterationCountReached)
    }
}

/// The next elimination group: occurrence ids, their lowest common
/// ancestor, and a template copy of the shared shape. Groups surface in
/// post-order of first occurrence, so inner subexpressions are bound before
/// the expressions containing them.
fn next_group(env: &Env, ast: &Ast) -> Option<(Vec<ExprId>, ExprId, Expr)> {
    let nav = NavigableAst::new(ast);
    let mut groups: IndexMap<u64, Vec<&Expr>> = IndexMap::new();
    for node in nav.postorder() {
        if eligible(env, &nav, node) {
            groups.entry(node.shape_hash()).or_default().push(node);
        }
    }
    for (_, group) in groups {
        let first = group[0];
        let equal: Vec<&Expr> = group
            .into_iter()
            .filter(|candidate| candidate.same_shape(first))
            .collect();
        if equal.len() < 2 {
            continue;
        }
        let ids: Vec<ExprId> = equal.iter().map(|e| e.id).collect();
        let lca = nav
            .lowest_common_ancestor(&ids)
            .unwrap_or_else(|| ast.root().id);
        return Some((ids, lca, first.clone()));
    }
    None
}

/// A candidate must be a call, select, or comprehension built from pure
/// functions, with no internal names and no references to variables bound
/// by an enclosing comprehension (extraction would move it out of their
/// scope).
fn eligible(env: &Env, nav: &NavigableAst<'_>, node: &Expr) -> bool {
    if !matches!(
        node.kind,
        ExprKind::Call(_) | ExprKind::Select(_) | ExprKind::Comprehension(_)
    ) {
        return false;
    }
    let bound: Vec<&str> = nav
        .enclosing_comprehensions(node.id)
        .into_iter()
        .filter_map(|ancestor| match &ancestor.kind {
            ExprKind::Comprehension(comp) => Some(comp),
            _ => None,
        })
        .flat_map(|comp| {
            [
                Some(comp.iter_var.as_str()),
                comp.iter_var2.as_deref(),
                Some(comp.accu_var.as_str()),
            ]
        })
        .flatten()
        .collect();

    let mut ok = true;
    node.visit(&mut |expr| {
        if !ok {
            return;
        }
        match &expr.kind {
            ExprKind::NotSet => ok = false,
            // references to variables bound outside the candidate cannot
            // move; names bound within it (its own comprehensions, earlier
            // block slots) travel fine
            ExprKind::Ident(name) => {
                if bound.contains(&name.as_str()) {
                    ok = false;
                }
            }
            ExprKind::Call(call) => {
                if call.function == BLOCK_FUNCTION || !support::call_is_pure(env, expr) {
                    ok = false;
                }
            }
            _ => {}
        }
    });
    ok
}

fn is_block_root(root: &Expr) -> bool {
    matches!(&root.kind, ExprKind::Call(call) if call.function == BLOCK_FUNCTION)
}

fn assemble_block(ast: Ast, slots: Vec<Expr>) -> Ast {
    let (body, source) = ast.into_parts();
    let max = slots
        .iter()
        .map(Expr::max_id)
        .chain([body.max_id()])
        .max()
        .unwrap_or(0);
    let mut fx = ExprFactory::new(max + 1);
    let slot_list = Expr::new(
        fx.next_id(),
        ExprKind::List(ListExpr {
            elements: slots,
            optional_indices: vec![],
        }),
    );
    let block = Expr::new(
        fx.next_id(),
        ExprKind::Call(Box::new(CallExpr {
            target: None,
            function: BLOCK_FUNCTION.to_string(),
            args: vec![slot_list, body],
        })),
    );
    Ast::new(block, source)
}

// ---------------------------------------------------------------------------
// Depth flattening
// ---------------------------------------------------------------------------

/// Extracts deeply nested subexpressions into additional block slots until
/// no emitted element nests deeper than `limit` levels. New slots are
/// inserted *before* the element they came from, so references stay
/// backward.
fn flatten_deep(ast: Ast, limit: usize, max_iterations: usize) -> Result<Ast, OptimizeError> {
    let mut current = ast;
    for _ in 0..=max_iterations {
        let (root, source) = current.into_parts();
        let ExprKind::Call(mut call) = root.kind else {
            return Err(OptimizeError::Verify("block root disappeared".to_string()));
        };
        let root_id = root.id;
        let body = call.args.pop().expect("block has a body");
        let slot_list = call.args.pop().expect("block has a slot list");
        let ExprKind::List(list) = slot_list.kind else {
            return Err(OptimizeError::Verify("block slots are not a list".to_string()));
        };
        let slot_list_id = slot_list.id;
        let mut elements = list.elements;

        let mut extraction = None;
        for (position, element) in elements.iter().chain([&body]).enumerate() {
            if height(element) > limit {
                if let Some(target_id) = deep_subtree(element, limit) {
                    extraction = Some((position.min(elements.len()), target_id));
                    break;
                }
            }
        }

        let rebuild = |elements: Vec<Expr>, body: Expr| {
            let slot_list = Expr::new(
                slot_list_id,
                ExprKind::List(ListExpr {
                    elements,
                    optional_indices: vec![],
                }),
            );
            let block = Expr::new(
                root_id,
                ExprKind::Call(Box::new(CallExpr {
                    target: None,
                    function: BLOCK_FUNCTION.to_string(),
                    args: vec![slot_list, body],
                })),
            );
            Ast::new(block, source.clone())
        };

        let Some((position, target_id)) = extraction else {
            return Ok(rebuild(elements, body));
        };

        // shift existing references at or after the insertion point
        let mut body = body;
        for element in elements.iter_mut().chain([&mut body]) {
            shift_index_references(element, position);
        }

        let max = elements
            .iter()
            .map(Expr::max_id)
            .chain([body.max_id()])
            .max()
            .unwrap_or(0);
        let mut fx = ExprFactory::new(max + 1);
        let reference = fx.ident(format!("{BLOCK_INDEX_PREFIX}{position}"));

        let host = if position < elements.len() {
            &mut elements[position]
        } else {
            &mut body
        };
        let extracted = take_subtree(host, target_id, reference)
            .ok_or_else(|| OptimizeError::Verify("flattening target disappeared".to_string()))?;
        elements.insert(position, extracted);

        current = rebuild(elements, body);
    }
    Err(OptimizeError::MaxIterationCountReached)
}

fn height(expr: &Expr) -> usize {
    1 + expr.children().iter().map(|c| height(c)).max().unwrap_or(0)
}

/// A strict descendant whose height is exactly `limit`, found by walking
/// down the tallest spine. Extracting it shortens the host by at least one
/// level per round.
fn deep_subtree(expr: &Expr, limit: usize) -> Option<ExprId> {
    let mut current = expr;
    loop {
        let tallest = current
            .children()
            .into_iter()
            .max_by_key(|c| height(c))?;
        if height(tallest) <= limit {
            return Some(tallest.id);
        }
        current = tallest;
    }
}

fn take_subtree(host: &mut Expr, target_id: ExprId, replacement: Expr) -> Option<Expr> {
    if host.id == target_id {
        return Some(std::mem::replace(host, replacement));
    }
    for child in support::children_mut(host) {
        if let Some(found) = take_subtree(child, target_id, replacement.clone()) {
            return Some(found);
        }
    }
    None
}

fn shift_index_references(expr: &mut Expr, from: usize) {
    if let ExprKind::Ident(name) = &mut expr.kind {
        if let Some(index) = parse_index_reference(name) {
            if index >= from {
                *name = format!("{BLOCK_INDEX_PREFIX}{}", index + 1);
            }
        }
        return;
    }
    for child in support::children_mut(expr) {
        shift_index_references(child, from);
    }
}

fn parse_index_reference(name: &str) -> Option<usize> {
    name.strip_prefix(BLOCK_INDEX_PREFIX)?.parse().ok()
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Asserts the emitted shape: exactly one `cel.@block`, at the root, with
/// at least one slot reference in the body and every reference pointing
/// strictly backward.
fn verify_block(ast: &Ast) -> Result<(), OptimizeError> {
    let root = ast.root();
    let ExprKind::Call(call) = &root.kind else {
        return Err(OptimizeError::Verify("root is not cel.@block".to_string()));
    };
    if call.function != BLOCK_FUNCTION || call.args.len() != 2 {
        return Err(OptimizeError::Verify("root is not cel.@block".to_string()));
    }
    let mut block_count = 0;
    root.visit(&mut |expr| {
        if let ExprKind::Call(inner) = &expr.kind {
            if inner.function == BLOCK_FUNCTION {
                block_count += 1;
            }
        }
    });
    if block_count != 1 {
        return Err(OptimizeError::Verify(format!(
            "expected exactly one cel.@block, found {block_count}"
        )));
    }
    let ExprKind::List(slots) = &call.args[0].kind else {
        return Err(OptimizeError::Verify("block slots are not a list".to_string()));
    };
    for (position, slot) in slots.elements.iter().enumerate() {
        check_references(slot, position)?;
    }
    let slot_count = slots.elements.len();
    check_references(&call.args[1], slot_count)?;
    let mut body_references = 0;
    call.args[1].visit(&mut |expr| {
        if let ExprKind::Ident(name) = &expr.kind {
            if parse_index_reference(name).is_some() {
                body_references += 1;
            }
        }
    });
    if body_references == 0 {
        return Err(OptimizeError::Verify(
            "block body references no slot".to_string(),
        ));
    }
    Ok(())
}

fn check_references(expr: &Expr, limit: usize) -> Result<(), OptimizeError> {
    let mut violation = None;
    expr.visit(&mut |node| {
        if violation.is_some() {
            return;
        }
        if let ExprKind::Ident(name) = &node.kind {
            if let Some(reference) = parse_index_reference(name) {
                if reference >= limit {
                    violation = Some(reference);
                }
            }
        }
    });
    match violation {
        Some(reference) => Err(OptimizeError::IllegalBlockIndex { reference, limit }),
        None => Ok(()),
    }
}
