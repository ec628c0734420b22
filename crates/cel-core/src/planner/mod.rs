//! The planner: checked (or parsed) AST → `Interpretable` plan tree.
//!
//! All name, type, overload, and container resolution happens here, once,
//! so evaluation never consults the environment. Checked plans use the
//! reference overlay for exact resolution; parse-only plans fall back to
//! container-candidate attributes and runtime overload dispatch.

pub(crate) mod attributes;
pub(crate) mod interpretable;

use crate::{
    ast::{
        Ast, CheckedAst, Expr, ExprId, ExprKind, Reference, BLOCK_FUNCTION, BLOCK_INDEX_PREFIX,
    },
    env::Env,
    error::PlanError,
    interpreter::{EvalOptions, Program},
    operators,
    planner::{
        attributes::{Attribute, CandidateName, NamespacedAttribute, Qualifier},
        interpretable::{
            BlockPlan, CallPlan, CandidateBinding, DispatchTarget, FoldPlan, Interpretable,
            LateBoundPlan,
        },
    },
    types::CelType,
    value::Value,
};

impl Env {
    /// Plans a checked AST into an executable program.
    pub fn plan(&self, checked: &CheckedAst) -> Result<Program, PlanError> {
        self.plan_with_options(checked, EvalOptions::default())
    }

    pub fn plan_with_options(
        &self,
        checked: &CheckedAst,
        options: EvalOptions,
    ) -> Result<Program, PlanError> {
        let planner = Planner {
            env: self,
            checked: Some(checked),
        };
        let plan = planner.plan_expr(checked.ast().root())?;
        Ok(Program::new(plan, checked.ast().source().clone(), options))
    }

    /// Plans a parse-only AST: identifier disambiguation and overload
    /// selection defer to evaluation time where the checker would have
    /// resolved them.
    pub fn plan_unchecked(&self, ast: &Ast) -> Result<Program, PlanError> {
        self.plan_unchecked_with_options(ast, EvalOptions::default())
    }

    pub fn plan_unchecked_with_options(
        &self,
        ast: &Ast,
        options: EvalOptions,
    ) -> Result<Program, PlanError> {
        let planner = Planner {
            env: self,
            checked: None,
        };
        let plan = planner.plan_expr(ast.root())?;
        Ok(Program::new(plan, ast.source().clone(), options))
    }
}

struct Planner<'a> {
    env: &'a Env,
    checked: Option<&'a CheckedAst>,
}

impl Planner<'_> {
    fn reference(&self, id: ExprId) -> Option<&Reference> {
        self.checked.and_then(|c| c.reference(id))
    }

    fn checked_type(&self, id: ExprId) -> Option<&CelType> {
        self.checked.and_then(|c| c.type_of(id))
    }

    fn plan_expr(&self, expr: &Expr) -> Result<Interpretable, PlanError> {
        match &expr.kind {
            ExprKind::NotSet => Err(PlanError::new("cannot plan an unset expression", expr.id)),
            ExprKind::Const(c) => Ok(Interpretable::Const {
                id: expr.id,
                value: Value::from_constant(c),
            }),
            ExprKind::Ident(name) => Ok(self.plan_ident(expr.id, name)),
            ExprKind::Select(sel) => self.plan_select(expr.id, sel),
            ExprKind::Call(_) => self.plan_call(expr),
            ExprKind::List(list) => Ok(Interpretable::CreateList {
                id: expr.id,
                elements: list
                    .elements
                    .iter()
                    .map(|e| self.plan_expr(e))
                    .collect::<Result<_, _>>()?,
                optional_indices: list.optional_indices.clone(),
            }),
            ExprKind::Map(map) => {
                let mut keys = Vec::with_capacity(map.entries.len());
                let mut values = Vec::with_capacity(map.entries.len());
                let mut optional_indices = Vec::new();
                for (i, entry) in map.entries.iter().enumerate() {
                    keys.push(self.plan_expr(&entry.key)?);
                    values.push(self.plan_expr(&entry.value)?);
                    if entry.optional {
                        optional_indices.push(i as u32);
                    }
                }
                Ok(Interpretable::CreateMap {
                    id: expr.id,
                    keys,
                    values,
                    optional_indices,
                })
            }
            ExprKind::Struct(st) => {
                let type_name = match self.reference(expr.id) {
                    Some(Reference::Var { name, .. }) => name.clone(),
                    _ => match self.env.resolve_struct(&st.message_name) {
                        Some((qualified, _)) => qualified,
                        None => {
                            return Err(PlanError::new(
                                format!("unknown message type '{}'", st.message_name),
                                expr.id,
                            ));
                        }
                    },
                };
                let mut fields = Vec::with_capacity(st.entries.len());
                let mut values = Vec::with_capacity(st.entries.len());
                let mut optional_indices = Vec::new();
                for (i, entry) in st.entries.iter().enumerate() {
                    fields.push(entry.field.clone());
                    values.push(self.plan_expr(&entry.value)?);
                    if entry.optional {
                        optional_indices.push(i as u32);
                    }
                }
                Ok(Interpretable::CreateStruct {
                    id: expr.id,
                    type_name,
                    fields,
                    values,
                    optional_indices,
                })
            }
            ExprKind::Comprehension(comp) => Ok(Interpretable::Fold(Box::new(FoldPlan {
                id: expr.id,
                iter_var: comp.iter_var.clone(),
                iter_var2: comp.iter_var2.clone(),
                iter_range: self.plan_expr(&comp.iter_range)?,
                accu_var: comp.accu_var.clone(),
                accu_init: self.plan_expr(&comp.accu_init)?,
                loop_condition: self.plan_expr(&comp.loop_condition)?,
                loop_step: self.plan_expr(&comp.loop_step)?,
                result: self.plan_expr(&comp.result)?,
            }))),
        }
    }

    fn plan_ident(&self, id: ExprId, name: &str) -> Interpretable {
        if let Some(reference) = self.reference(id) {
            return self.plan_checked_ident(id, reference);
        }
        if self.checked.is_some() {
            // no reference entry: a comprehension or block binding, resolved
            // against the frame's scope stack
            return Interpretable::Attr {
                id,
                attr: Attribute::Namespaced(NamespacedAttribute {
                    names: vec![CandidateName {
                        name: name.to_string(),
                        absolute: false,
                    }],
                    qualifiers: vec![],
                }),
            };
        }
        self.plan_parse_only_ident(id, name)
    }

    fn plan_checked_ident(&self, id: ExprId, reference: &Reference) -> Interpretable {
        match reference {
            Reference::Var {
                value: Some(constant),
                ..
            } => Interpretable::Const {
                id,
                value: Value::from_constant(constant),
            },
            Reference::Var { name, .. } => {
                // an identifier checked as a type name folds to the type value
                if let Some(CelType::Type(Some(inner))) = self.checked_type(id) {
                    return Interpretable::Const {
                        id,
                        value: Value::Type((**inner).clone()),
                    };
                }
                Interpretable::Attr {
                    id,
                    attr: Attribute::Namespaced(NamespacedAttribute {
                        names: vec![CandidateName {
                            name: name.clone(),
                            absolute: true,
                        }],
                        qualifiers: vec![],
                    }),
                }
            }
            Reference::Func { .. } => Interpretable::Attr {
                id,
                attr: Attribute::Missing {
                    names: vec!["function used as value".to_string()],
                },
            },
        }
    }

    fn plan_parse_only_ident(&self, id: ExprId, name: &str) -> Interpretable {
        // scope bindings (comprehension vars, block slots) use the bare name
        if name.starts_with('@') || name.starts_with("__") {
            return Interpretable::Attr {
                id,
                attr: Attribute::Namespaced(NamespacedAttribute {
                    names: vec![CandidateName {
                        name: name.to_string(),
                        absolute: false,
                    }],
                    qualifiers: vec![],
                }),
            };
        }
        if let Some((_, number)) = self.env.resolve_enum_constant(name) {
            return Interpretable::Const {
                id,
                value: Value::Int(number),
            };
        }
        // declared variables and activation lookups win over type names
        if self.env.resolve_variable(name).is_none() {
            if let Some((_, ty)) = self.env.resolve_type_ident(name) {
                return Interpretable::Const {
                    id,
                    value: Value::Type(ty),
                };
            }
        }
        if let Some(absolute) = name.strip_prefix('.') {
            return Interpretable::Attr {
                id,
                attr: Attribute::Namespaced(NamespacedAttribute {
                    names: vec![CandidateName {
                        name: absolute.to_string(),
                        absolute: true,
                    }],
                    qualifiers: vec![],
                }),
            };
        }
        let names: Vec<CandidateName> = self
            .env
            .container()
            .candidate_names(name)
            .into_iter()
            .map(|candidate| CandidateName {
                // only the bare source name consults the scope stack
                absolute: candidate != name,
                name: candidate,
            })
            .collect();
        Interpretable::Attr {
            id,
            attr: Attribute::Maybe {
                path: name.to_string(),
                alternatives: vec![NamespacedAttribute {
                    names,
                    qualifiers: vec![],
                }],
            },
        }
    }

    fn plan_select(&self, id: ExprId, sel: &crate::ast::SelectExpr) -> Result<Interpretable, PlanError> {
        // the checker may have resolved the whole chain as a qualified name
        if let Some(reference) = self.reference(id) {
            if matches!(reference, Reference::Var { .. }) && !sel.test_only {
                return Ok(self.plan_checked_ident(id, reference));
            }
        }

        let operand = self.plan_expr(&sel.operand)?;
        let mut attr = match operand {
            Interpretable::Attr { attr, .. } => attr,
            other => Attribute::Relative {
                operand: Box::new(other),
                qualifiers: vec![],
            },
        };
        self.push_string_qualifier(&mut attr, &sel.field);

        if sel.test_only {
            if !attr.make_presence_test() {
                return Err(PlanError::new("presence test requires a field selection", id));
            }
            Ok(Interpretable::TestOnly { id, attr })
        } else {
            Ok(Interpretable::Attr { id, attr })
        }
    }

    fn push_string_qualifier(&self, attr: &mut Attribute, field: &str) {
        match attr {
            Attribute::Maybe { path, alternatives } => {
                // the longer dotted path becomes a new, most-specific
                // alternative; existing alternatives gain a field qualifier
                let extended = format!("{path}.{field}");
                for alt in alternatives.iter_mut() {
                    alt.qualifiers.push(Qualifier::String(field.to_string()));
                }
                let names: Vec<CandidateName> = self
                    .env
                    .container()
                    .candidate_names(&extended)
                    .into_iter()
                    .map(|candidate| CandidateName {
                        absolute: true,
                        name: candidate,
                    })
                    .collect();
                alternatives.insert(
                    0,
                    NamespacedAttribute {
                        names,
                        qualifiers: vec![],
                    },
                );
                *path = extended;
            }
            other => {
                if let Some(qualifiers) = other.qualifiers_mut() {
                    qualifiers.push(Qualifier::String(field.to_string()));
                }
            }
        }
    }

    fn plan_call(&self, expr: &Expr) -> Result<Interpretable, PlanError> {
        let ExprKind::Call(call) = &expr.kind else {
            unreachable!("plan_call on non-call");
        };
        let id = expr.id;

        match (call.function.as_str(), call.target.is_none(), call.args.len()) {
            (operators::LOGICAL_AND, true, 2) => {
                return Ok(Interpretable::And {
                    id,
                    lhs: Box::new(self.plan_expr(&call.args[0])?),
                    rhs: Box::new(self.plan_expr(&call.args[1])?),
                });
            }
            (operators::LOGICAL_OR, true, 2) => {
                return Ok(Interpretable::Or {
                    id,
                    lhs: Box::new(self.plan_expr(&call.args[0])?),
                    rhs: Box::new(self.plan_expr(&call.args[1])?),
                });
            }
            (operators::CONDITIONAL, true, 3) => {
                return Ok(Interpretable::Conditional {
                    id,
                    cond: Box::new(self.plan_expr(&call.args[0])?),
                    then: Box::new(self.plan_expr(&call.args[1])?),
                    otherwise: Box::new(self.plan_expr(&call.args[2])?),
                });
            }
            (BLOCK_FUNCTION, true, 2) => return self.plan_block(id, &call.args[0], &call.args[1]),
            _ => {}
        }

        // checked references carry the resolved overload ids
        if let Some(Reference::Func { overload_ids }) = self.reference(id) {
            return self.plan_resolved_call(id, call, overload_ids);
        }

        // a member call whose target spells a namespace is a qualified
        // global call
        if let Some(target) = &call.target {
            if let Some(prefix) = dotted_path(target) {
                let qualified = format!("{prefix}.{}", call.function);
                if self.env.resolve_function(&qualified).is_some()
                    && self.env.resolve_variable(&prefix).is_none()
                {
                    let args = call
                        .args
                        .iter()
                        .map(|a| self.plan_expr(a))
                        .collect::<Result<Vec<_>, _>>()?;
                    return self.plan_dispatch(id, &qualified, args, false);
                }
            }
        }

        match &call.target {
            Some(target) => {
                let mut args = Vec::with_capacity(call.args.len() + 1);
                args.push(self.plan_expr(target)?);
                for arg in &call.args {
                    args.push(self.plan_expr(arg)?);
                }
                self.plan_dispatch(id, &call.function, args, true)
            }
            None => {
                let args = call
                    .args
                    .iter()
                    .map(|a| self.plan_expr(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.plan_dispatch(id, &call.function, args, false)
            }
        }
    }

    /// Plans a call whose overload set the checker already narrowed.
    fn plan_resolved_call(
        &self,
        id: ExprId,
        call: &crate::ast::CallExpr,
        overload_ids: &[String],
    ) -> Result<Interpretable, PlanError> {
        let mut member = false;
        let mut function = call.function.clone();
        let mut candidates = Vec::with_capacity(overload_ids.len());
        let mut non_strict = false;
        let mut late_bound = false;
        for overload_id in overload_ids {
            let Some((decl, overload)) = self.env.find_overload(overload_id) else {
                return Err(PlanError::new(
                    format!("checked overload '{overload_id}' is not declared"),
                    id,
                ));
            };
            member = overload.member;
            function = decl.name.clone();
            non_strict |= overload.non_strict;
            late_bound |= overload.late_bound;
            match self.env.binding(overload_id) {
                Some(binding) => candidates.push(CandidateBinding {
                    decl: overload.clone(),
                    binding: binding.clone(),
                }),
                None if overload.late_bound => {}
                None => {
                    return Err(PlanError::new(
                        format!("no runtime binding for overload '{overload_id}'"),
                        id,
                    ));
                }
            }
        }

        // the checker resolved a qualified global: the syntactic target is
        // namespace, not a value
        let args: Vec<Interpretable> = if member && call.target.is_some() {
            let mut args = Vec::with_capacity(call.args.len() + 1);
            args.push(self.plan_expr(call.target.as_ref().expect("member call has target"))?);
            for arg in &call.args {
                args.push(self.plan_expr(arg)?);
            }
            args
        } else {
            call.args
                .iter()
                .map(|a| self.plan_expr(a))
                .collect::<Result<Vec<_>, _>>()?
        };

        if late_bound && overload_ids.len() == 1 {
            return Ok(Interpretable::LateBound(Box::new(LateBoundPlan {
                id,
                function,
                overload_ids: overload_ids.to_vec(),
                args,
            })));
        }
        let target = match candidates.len() {
            0 => {
                return Err(PlanError::new(
                    format!("no runtime binding for '{function}'"),
                    id,
                ));
            }
            1 => DispatchTarget::Single(candidates.remove(0).binding),
            _ => DispatchTarget::Candidates(candidates),
        };
        Ok(Interpretable::Call(Box::new(CallPlan {
            id,
            function,
            args,
            target,
            non_strict,
        })))
    }

    /// Plans a parse-only call: every declared overload with a compatible
    /// shape stays a candidate and the runtime picks by argument kind.
    fn plan_dispatch(
        &self,
        id: ExprId,
        function: &str,
        args: Vec<Interpretable>,
        member: bool,
    ) -> Result<Interpretable, PlanError> {
        let resolved = if member {
            self.env
                .find_function(function)
                .map(|decl| (function.to_string(), decl))
        } else {
            self.env.resolve_function(function)
        };
        let Some((qualified, decl)) = resolved else {
            return Err(PlanError::new(format!("undeclared function '{function}'"), id));
        };

        let mut candidates = Vec::new();
        let mut non_strict = false;
        let mut late_bound_ids = Vec::new();
        for overload in decl.overloads.values() {
            if overload.member != member || overload.params.len() != args.len() {
                continue;
            }
            non_strict |= overload.non_strict;
            if overload.late_bound {
                late_bound_ids.push(overload.id.clone());
                continue;
            }
            if let Some(binding) = self.env.binding(&overload.id) {
                candidates.push(CandidateBinding {
                    decl: overload.clone(),
                    binding: binding.clone(),
                });
            }
        }

        if candidates.is_empty() && late_bound_ids.len() == 1 {
            return Ok(Interpretable::LateBound(Box::new(LateBoundPlan {
                id,
                function: qualified,
                overload_ids: late_bound_ids,
                args,
            })));
        }
        if candidates.is_empty() {
            return Err(PlanError::new(
                format!("no runtime binding for '{qualified}'"),
                id,
            ));
        }
        let target = if candidates.len() == 1 {
            DispatchTarget::Single(candidates.remove(0).binding)
        } else {
            DispatchTarget::Candidates(candidates)
        };
        Ok(Interpretable::Call(Box::new(CallPlan {
            id,
            function: qualified,
            args,
            target,
            non_strict,
        })))
    }

    fn plan_block(&self, id: ExprId, slots: &Expr, body: &Expr) -> Result<Interpretable, PlanError> {
        let ExprKind::List(list) = &slots.kind else {
            return Err(PlanError::new(
                "cel.@block subexpressions must be a list literal",
                slots.id,
            ));
        };
        let planned: Vec<Interpretable> = list
            .elements
            .iter()
            .map(|e| self.plan_expr(e))
            .collect::<Result<_, _>>()?;
        let slot_names = (0..planned.len())
            .map(|i| format!("{BLOCK_INDEX_PREFIX}{i}"))
            .collect();
        Ok(Interpretable::Block(Box::new(BlockPlan {
            id,
            slot_names,
            slots: planned,
            body: self.plan_expr(body)?,
        })))
    }
}

/// Renders a pure ident/select chain as its dotted source path.
fn dotted_path(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(name.clone()),
        ExprKind::Select(sel) if !sel.test_only => {
            dotted_path(&sel.operand).map(|prefix| format!("{prefix}.{}", sel.field))
        }
        _ => None,
    }
}
