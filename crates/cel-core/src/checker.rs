//! The type checker.
//!
//! One pass over the tree producing the typed overlay the planner consumes:
//! a `CelType` per node and a [`Reference`] for every identifier, struct
//! construction, and call. Identifiers resolve through the container against
//! declared variables, enum constants, and type names, in that order.
//! Overload resolution unifies parameter types against argument types with
//! type-parameter substitution and prefers the least general match.

use ahash::AHashMap;

use crate::{
    ast::{
        Ast, CheckedAst, Constant, Expr, ExprId, ExprKind, Reference, SourceInfo, BLOCK_FUNCTION,
        BLOCK_INDEX_PREFIX,
    },
    env::{Env, OverloadDecl},
    error::{CheckError, CheckErrors},
    types::{CelType, Substitution},
};

impl Env {
    /// Type-checks a parsed AST against this environment.
    pub fn check(&self, ast: &Ast) -> Result<CheckedAst, CheckErrors> {
        let mut checker = Checker {
            env: self,
            source: ast.source(),
            type_map: AHashMap::new(),
            reference_map: AHashMap::new(),
            errors: Vec::new(),
            scopes: Vec::new(),
        };
        checker.infer(ast.root());
        if checker.errors.is_empty() {
            Ok(CheckedAst::new(ast.clone(), checker.type_map, checker.reference_map))
        } else {
            Err(CheckErrors {
                errors: checker.errors,
            })
        }
    }
}

struct Checker<'a> {
    env: &'a Env,
    source: &'a SourceInfo,
    type_map: AHashMap<ExprId, CelType>,
    reference_map: AHashMap<ExprId, Reference>,
    errors: Vec<CheckError>,
    /// lexical scopes introduced by comprehensions and block slots
    scopes: Vec<(String, CelType)>,
}

impl Checker<'_> {
    fn infer(&mut self, expr: &Expr) -> CelType {
        let ty = match &expr.kind {
            ExprKind::NotSet => self.error(expr.id, "unexpected unset expression"),
            ExprKind::Const(c) => constant_type(c),
            ExprKind::Ident(name) => self.infer_ident(expr.id, name),
            ExprKind::Select(sel) => {
                self.infer_select(expr.id, &sel.operand, &sel.field, sel.test_only)
            }
            ExprKind::Call(_) => self.infer_call(expr),
            ExprKind::List(list) => {
                let mut prev: Option<u32> = None;
                for idx in &list.optional_indices {
                    let in_bounds = (*idx as usize) < list.elements.len();
                    let increasing = prev.is_none_or(|p| *idx > p);
                    if !in_bounds || !increasing {
                        self.error(expr.id, "malformed optional element indices");
                    }
                    prev = Some(*idx);
                }
                let mut elem = CelType::Error;
                for (i, element) in list.elements.iter().enumerate() {
                    let mut t = self.infer(element);
                    if list.optional_indices.contains(&(i as u32)) {
                        t = self.unwrap_optional(element.id, t);
                    }
                    elem = elem.join(&t);
                }
                if matches!(elem, CelType::Error) {
                    elem = CelType::Dyn;
                }
                CelType::list(elem)
            }
            ExprKind::Map(map) => {
                let mut key = CelType::Error;
                let mut value = CelType::Error;
                for entry in &map.entries {
                    let kt = self.infer(&entry.key);
                    if !valid_key_type(&kt) {
                        self.error(entry.key.id, format!("'{kt}' is not a valid map key type"));
                    }
                    let mut vt = self.infer(&entry.value);
                    if entry.optional {
                        vt = self.unwrap_optional(entry.value.id, vt);
                    }
                    key = key.join(&kt);
                    value = value.join(&vt);
                }
                if matches!(key, CelType::Error) {
                    key = CelType::Dyn;
                }
                if matches!(value, CelType::Error) {
                    value = CelType::Dyn;
                }
                CelType::map(key, value)
            }
            ExprKind::Struct(st) => self.infer_struct(expr.id, st),
            ExprKind::Comprehension(comp) => self.infer_comprehension(expr.id, comp),
        };
        self.type_map.insert(expr.id, ty.clone());
        ty
    }

    fn infer_ident(&mut self, id: ExprId, name: &str) -> CelType {
        if let Some(ty) = self.lookup_scope(name) {
            return ty;
        }
        if let Some((qualified, decl)) = self.env.resolve_variable(name) {
            let ty = decl.ty.clone();
            self.reference_map.insert(
                id,
                Reference::Var {
                    name: qualified,
                    value: None,
                },
            );
            return ty;
        }
        if let Some((qualified, number)) = self.env.resolve_enum_constant(name) {
            self.reference_map.insert(
                id,
                Reference::Var {
                    name: qualified,
                    value: Some(Constant::Int(number)),
                },
            );
            return CelType::Int;
        }
        if let Some((qualified, ty)) = self.env.resolve_type_ident(name) {
            self.reference_map.insert(
                id,
                Reference::Var {
                    name: qualified,
                    value: None,
                },
            );
            return CelType::type_of(ty);
        }
        self.error(id, format!("undeclared reference to '{name}'"))
    }

    fn infer_select(&mut self, id: ExprId, operand: &Expr, field: &str, test_only: bool) -> CelType {
        // a select chain may spell a qualified name (`pkg.var`, `pkg.Enum.VAL`)
        if let Some(qualified) = dotted_name(operand, field) {
            if !test_only {
                if let Some((resolved, decl)) = self.env.resolve_variable(&qualified) {
                    let ty = decl.ty.clone();
                    self.reference_map.insert(
                        id,
                        Reference::Var {
                            name: resolved,
                            value: None,
                        },
                    );
                    return ty;
                }
                if let Some((resolved, number)) = self.env.resolve_enum_constant(&qualified) {
                    self.reference_map.insert(
                        id,
                        Reference::Var {
                            name: resolved,
                            value: Some(Constant::Int(number)),
                        },
                    );
                    return CelType::Int;
                }
            }
            // only treat the chain as a qualified name when its root is not
            // otherwise resolvable; fall through to field selection
        }
        let operand_type = self.infer(operand);
        let result = self.select_field_type(id, &operand_type, field);
        if test_only { CelType::Bool } else { result }
    }

    fn select_field_type(&mut self, id: ExprId, operand_type: &CelType, field: &str) -> CelType {
        match operand_type {
            CelType::Struct(name) => match self.env.provider().find_struct(name) {
                Some(decl) => match decl.fields.get(field) {
                    Some(ty) => ty.clone(),
                    None => self.error(id, format!("undefined field '{field}' on '{name}'")),
                },
                None => self.error(id, format!("unknown message type '{name}'")),
            },
            CelType::Map(_, value) => (**value).clone(),
            CelType::Dyn | CelType::Any | CelType::TypeParam(_) => CelType::Dyn,
            CelType::Error => CelType::Error,
            CelType::Optional(_) => self.error(
                id,
                format!("field selection on optional requires '.?{field}' or '.value()'"),
            ),
            other => self.error(id, format!("type '{other}' does not support field selection")),
        }
    }

    fn infer_call(&mut self, expr: &Expr) -> CelType {
        let ExprKind::Call(call) = &expr.kind else {
            unreachable!("infer_call on non-call");
        };

        if call.function == BLOCK_FUNCTION {
            return self.infer_block(expr.id, call.target.as_ref(), &call.args);
        }

        // a member call whose target spells a namespace is a qualified
        // global call: `math.greatest(…)`, `optional.of(…)`
        if let Some(target) = &call.target {
            if let Some(prefix) = expr_dotted_name(target) {
                let qualified = format!("{prefix}.{}", call.function);
                if self.env.resolve_function(&qualified).is_some() && self.root_is_namespace(target) {
                    let arg_types: Vec<CelType> = call.args.iter().map(|a| self.infer(a)).collect();
                    return self.resolve_overloads(expr.id, &qualified, &arg_types, false);
                }
            }
        }

        match &call.target {
            Some(target) => {
                let mut arg_types = Vec::with_capacity(call.args.len() + 1);
                arg_types.push(self.infer(target));
                for arg in &call.args {
                    arg_types.push(self.infer(arg));
                }
                self.resolve_overloads(expr.id, &call.function, &arg_types, true)
            }
            None => {
                let arg_types: Vec<CelType> = call.args.iter().map(|a| self.infer(a)).collect();
                self.resolve_overloads(expr.id, &call.function, &arg_types, false)
            }
        }
    }

    /// Whether a member-call target chain names a namespace rather than a
    /// value: true when its root identifier is not a declared variable or a
    /// scope binding.
    fn root_is_namespace(&self, target: &Expr) -> bool {
        let mut root = target;
        while let ExprKind::Select(sel) = &root.kind {
            root = &sel.operand;
        }
        match &root.kind {
            ExprKind::Ident(name) => {
                self.lookup_scope(name).is_none() && self.env.resolve_variable(name).is_none()
            }
            _ => false,
        }
    }

    fn resolve_overloads(
        &mut self,
        id: ExprId,
        function: &str,
        arg_types: &[CelType],
        member: bool,
    ) -> CelType {
        let resolved = if member {
            self.env.find_function(function).map(|decl| (function.to_string(), decl))
        } else {
            self.env.resolve_function(function)
        };
        let Some((_, decl)) = resolved else {
            return self.error(id, format!("undeclared function '{function}'"));
        };

        let mut matches: Vec<(&OverloadDecl, CelType, u32)> = Vec::new();
        for overload in decl.overloads.values() {
            if overload.member != member || overload.params.len() != arg_types.len() {
                continue;
            }
            let mut subs = Substitution::new();
            let ok = overload
                .params
                .iter()
                .zip(arg_types)
                .all(|(param, arg)| arg.assignable_to(param, &mut subs));
            if !ok {
                continue;
            }
            let generality: u32 = overload
                .params
                .iter()
                .zip(arg_types)
                .map(|(param, arg)| param.generality_against(arg))
                .sum();
            matches.push((overload, overload.result.substitute(&subs), generality));
        }

        if matches.is_empty() {
            let rendered: Vec<String> = arg_types.iter().map(ToString::to_string).collect();
            return self.error(
                id,
                format!(
                    "found no matching overload for '{function}' applied to ({})",
                    rendered.join(", ")
                ),
            );
        }

        let best = matches.iter().map(|(_, _, g)| *g).min().unwrap_or(0);
        let tied: Vec<&(&OverloadDecl, CelType, u32)> =
            matches.iter().filter(|(_, _, g)| *g == best).collect();
        let overload_ids: Vec<String> = tied.iter().map(|(o, _, _)| o.id.clone()).collect();
        let result = tied
            .iter()
            .map(|(_, r, _)| r.clone())
            .reduce(|a, b| a.join(&b))
            .unwrap_or(CelType::Dyn);
        self.reference_map.insert(id, Reference::Func { overload_ids });
        result
    }

    fn infer_block(&mut self, id: ExprId, target: Option<&Expr>, args: &[Expr]) -> CelType {
        if target.is_some() || args.len() != 2 {
            return self.error(id, "cel.@block expects a subexpression list and a body");
        }
        let ExprKind::List(slots) = &args[0].kind else {
            return self.error(args[0].id, "cel.@block subexpressions must be a list literal");
        };
        let depth = self.scopes.len();
        for (i, slot) in slots.elements.iter().enumerate() {
            let ty = self.infer(slot);
            self.scopes.push((format!("{BLOCK_INDEX_PREFIX}{i}"), ty));
        }
        // the list node itself still needs a type for the planner
        self.type_map
            .insert(args[0].id, CelType::list(CelType::Dyn));
        let result = self.infer(&args[1]);
        self.scopes.truncate(depth);
        result
    }

    fn infer_struct(&mut self, id: ExprId, st: &crate::ast::StructExpr) -> CelType {
        let Some((qualified, decl)) = self.env.resolve_struct(&st.message_name) else {
            return self.error(id, format!("unknown message type '{}'", st.message_name));
        };
        let field_types: Vec<(String, Option<CelType>)> = st
            .entries
            .iter()
            .map(|e| (e.field.clone(), decl.fields.get(&e.field).cloned()))
            .collect();
        self.reference_map.insert(
            id,
            Reference::Var {
                name: qualified.clone(),
                value: None,
            },
        );
        for (entry, (field, field_type)) in st.entries.iter().zip(field_types) {
            let mut vt = self.infer(&entry.value);
            if entry.optional {
                vt = self.unwrap_optional(entry.value.id, vt);
            }
            match field_type {
                Some(ft) => {
                    let mut subs = Substitution::new();
                    if !vt.assignable_to(&ft, &mut subs) {
                        self.error(
                            entry.value.id,
                            format!("expected '{ft}' for field '{field}', found '{vt}'"),
                        );
                    }
                }
                None => {
                    self.error(id, format!("undefined field '{field}' on '{qualified}'"));
                }
            }
        }
        CelType::Struct(qualified)
    }

    fn infer_comprehension(&mut self, id: ExprId, comp: &crate::ast::ComprehensionExpr) -> CelType {
        if comp.iter_var == comp.accu_var
            || comp.iter_var2.as_deref() == Some(comp.accu_var.as_str())
        {
            self.error(
                id,
                format!("accumulator '{}' shadowed by an iteration variable", comp.accu_var),
            );
        }
        let range_type = self.infer(&comp.iter_range);
        let (var1, var2) = match &range_type {
            CelType::List(elem) => match comp.iter_var2 {
                Some(_) => (CelType::Int, Some((**elem).clone())),
                None => ((**elem).clone(), None),
            },
            CelType::Map(key, value) => match comp.iter_var2 {
                Some(_) => ((**key).clone(), Some((**value).clone())),
                None => ((**key).clone(), None),
            },
            CelType::Dyn | CelType::Any | CelType::TypeParam(_) | CelType::Error => {
                (CelType::Dyn, comp.iter_var2.as_ref().map(|_| CelType::Dyn))
            }
            other => {
                self.error(
                    comp.iter_range.id,
                    format!("expression of type '{other}' cannot be the range of a comprehension"),
                );
                (CelType::Dyn, comp.iter_var2.as_ref().map(|_| CelType::Dyn))
            }
        };

        let accu_type = self.infer(&comp.accu_init);
        let depth = self.scopes.len();
        self.scopes.push((comp.accu_var.clone(), accu_type.clone()));
        self.scopes.push((comp.iter_var.clone(), var1));
        if let (Some(name), Some(ty)) = (&comp.iter_var2, var2) {
            self.scopes.push((name.clone(), ty));
        }

        let cond_type = self.infer(&comp.loop_condition);
        let mut subs = Substitution::new();
        if !cond_type.assignable_to(&CelType::Bool, &mut subs) {
            self.error(
                comp.loop_condition.id,
                format!("comprehension condition must be bool, found '{cond_type}'"),
            );
        }
        let step_type = self.infer(&comp.loop_step);

        self.scopes.truncate(depth);
        self.scopes
            .push((comp.accu_var.clone(), accu_type.join(&step_type)));
        let result = self.infer(&comp.result);
        self.scopes.truncate(depth);
        result
    }

    fn unwrap_optional(&mut self, id: ExprId, ty: CelType) -> CelType {
        match ty {
            CelType::Optional(inner) => *inner,
            CelType::Dyn | CelType::Any | CelType::Error => CelType::Dyn,
            other => self.error(id, format!("optional entry must be optional type, found '{other}'")),
        }
    }

    fn lookup_scope(&self, name: &str) -> Option<CelType> {
        self.scopes
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.clone())
    }

    fn error(&mut self, id: ExprId, message: impl Into<String>) -> CelType {
        self.errors.push(CheckError {
            message: message.into(),
            id,
            offset: self.source.positions.get(&id).copied(),
        });
        CelType::Error
    }
}

fn constant_type(c: &Constant) -> CelType {
    match c {
        Constant::Null => CelType::Null,
        Constant::Bool(_) => CelType::Bool,
        Constant::Int(_) => CelType::Int,
        Constant::Uint(_) => CelType::Uint,
        Constant::Double(_) => CelType::Double,
        Constant::String(_) => CelType::String,
        Constant::Bytes(_) => CelType::Bytes,
    }
}

fn valid_key_type(ty: &CelType) -> bool {
    matches!(
        ty,
        CelType::Bool
            | CelType::Int
            | CelType::Uint
            | CelType::String
            | CelType::Dyn
            | CelType::Any
            | CelType::TypeParam(_)
            | CelType::Error
    )
}

/// Renders `operand.field` as a dotted name when the operand is a pure
/// ident/select chain.
fn dotted_name(operand: &Expr, field: &str) -> Option<String> {
    expr_dotted_name(operand).map(|prefix| format!("{prefix}.{field}"))
}

fn expr_dotted_name(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(name.clone()),
        ExprKind::Select(sel) if !sel.test_only => {
            expr_dotted_name(&sel.operand).map(|prefix| format!("{prefix}.{}", sel.field))
        }
        _ => None,
    }
}
