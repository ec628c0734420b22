//! The evaluator.
//!
//! Drives an `Interpretable` plan to a value against an [`Activation`].
//! Evaluation is straight-line synchronous computation: no suspension, no
//! I/O, no shared mutable state. One plan may be evaluated concurrently from
//! many threads, each evaluation owning its own [`Frame`].
//!
//! Errors flow as `Value::Error` so the non-strict operators can absorb
//! them; the public surface converts a top-level error value into
//! `Err(CelError)` localized through the source overlay.

pub mod activation;

pub use activation::{Activation, EmptyActivation, FunctionResolver, MapActivation, MapFunctionResolver};

use smallvec::SmallVec;

use crate::{
    ast::{ExprId, SourceInfo},
    error::CelError,
    planner::{
        attributes::{Attribute, NamespacedAttribute, Qualifier},
        interpretable::{BlockPlan, CallPlan, DispatchTarget, FoldPlan, Interpretable},
    },
    stdlib,
    types::CelType,
    value::{strict_precondition, MapKey, MapValue, OptionalValue, StructValue, Value},
};

/// Evaluation knobs carried by every frame.
#[derive(Debug, Clone, Copy)]
pub struct EvalOptions {
    /// Upper bound on comprehension work: every loop iteration and every
    /// nested comprehension entry counts one step.
    pub max_iterations: u64,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1_000_000,
        }
    }
}

impl EvalOptions {
    #[must_use]
    pub fn with_max_iterations(mut self, limit: u64) -> Self {
        self.max_iterations = limit;
        self
    }
}

/// An executable program: an immutable plan plus the source overlay used to
/// localize runtime faults.
pub struct Program {
    plan: Interpretable,
    source: SourceInfo,
    options: EvalOptions,
}

impl Program {
    pub(crate) fn new(plan: Interpretable, source: SourceInfo, options: EvalOptions) -> Self {
        Self {
            plan,
            source,
            options,
        }
    }

    /// Evaluates against the given activation.
    pub fn eval(&self, activation: &dyn Activation) -> Result<Value, CelError> {
        self.run(activation, None)
    }

    /// Evaluates with a resolver for late-bound functions.
    pub fn eval_with_functions(
        &self,
        activation: &dyn Activation,
        functions: &dyn FunctionResolver,
    ) -> Result<Value, CelError> {
        self.run(activation, Some(functions))
    }

    fn run(
        &self,
        activation: &dyn Activation,
        functions: Option<&dyn FunctionResolver>,
    ) -> Result<Value, CelError> {
        let mut frame = Frame {
            activation,
            functions,
            scope: Vec::new(),
            iterations: 0,
            limit: self.options.max_iterations,
            fold_depth: 0,
        };
        match eval(&self.plan, &mut frame) {
            Value::Error(err) => Err(self.localize(*err)),
            other => Ok(other),
        }
    }

    fn localize(&self, err: CelError) -> CelError {
        if let Some(id) = err.expr_id() {
            if let Some(offset) = self.source.positions.get(&id) {
                return err.with_offset(*offset);
            }
        }
        err
    }
}

struct Frame<'p> {
    activation: &'p dyn Activation,
    functions: Option<&'p dyn FunctionResolver>,
    scope: Vec<ScopeEntry<'p>>,
    iterations: u64,
    limit: u64,
    fold_depth: u32,
}

enum ScopeEntry<'p> {
    Var {
        name: &'p str,
        value: Value,
    },
    /// A `cel.@block` slot: evaluated on first reference, memoized after.
    Lazy {
        name: &'p str,
        expr: &'p Interpretable,
        value: Option<Value>,
    },
}

fn eval<'p>(node: &'p Interpretable, frame: &mut Frame<'p>) -> Value {
    match node {
        Interpretable::Const { value, .. } => value.clone(),
        Interpretable::Attr { id, attr } | Interpretable::TestOnly { id, attr } => {
            resolve_attribute(attr, *id, frame)
        }
        Interpretable::Call(call) => eval_call(call, frame),
        Interpretable::LateBound(call) => {
            let mut args: SmallVec<[Value; 4]> = SmallVec::with_capacity(call.args.len());
            for arg in &call.args {
                args.push(eval(arg, frame));
            }
            if let Some(propagated) = strict_precondition(&args) {
                return propagated;
            }
            let Some(resolver) = frame.functions else {
                return Value::error(
                    CelError::no_matching_overload(&call.function).with_id(call.id),
                );
            };
            match resolver.resolve(&call.function, &call.overload_ids) {
                Some(binding) => match binding.as_ref()(&args) {
                    Ok(value) => value,
                    Err(err) => Value::error(err.with_id(call.id)),
                },
                None => Value::error(
                    CelError::no_matching_overload(&call.function).with_id(call.id),
                ),
            }
        }
        Interpretable::And { id, lhs, rhs } => eval_and(*id, lhs, rhs, frame),
        Interpretable::Or { id, lhs, rhs } => eval_or(*id, lhs, rhs, frame),
        Interpretable::Conditional {
            id,
            cond,
            then,
            otherwise,
        } => match eval(cond, frame) {
            Value::Bool(true) => eval(then, frame),
            Value::Bool(false) => eval(otherwise, frame),
            propagated @ (Value::Error(_) | Value::Unknown(_)) => propagated,
            _ => Value::error(CelError::no_matching_overload("_?_:_").with_id(*id)),
        },
        Interpretable::CreateList {
            id,
            elements,
            optional_indices,
        } => {
            let mut values: Vec<Value> = Vec::with_capacity(elements.len());
            for element in elements {
                values.push(eval(element, frame));
            }
            if let Some(propagated) = strict_precondition(&values) {
                return propagated;
            }
            let mut out = Vec::with_capacity(values.len());
            for (i, value) in values.into_iter().enumerate() {
                if optional_indices.contains(&(i as u32)) {
                    match value {
                        Value::Optional(OptionalValue::Present(inner)) => out.push(*inner),
                        Value::Optional(OptionalValue::Absent) => {}
                        other => {
                            return Value::error(
                                CelError::invalid_argument(format!(
                                    "optional list entry must be optional, found {}",
                                    other.runtime_type()
                                ))
                                .with_id(*id),
                            );
                        }
                    }
                } else {
                    out.push(value);
                }
            }
            Value::list(out)
        }
        Interpretable::CreateMap {
            id,
            keys,
            values,
            optional_indices,
        } => eval_create_map(*id, keys, values, optional_indices, frame),
        Interpretable::CreateStruct {
            id,
            type_name,
            fields,
            values,
            optional_indices,
        } => eval_create_struct(*id, type_name, fields, values, optional_indices, frame),
        Interpretable::Fold(fold) => eval_fold(fold, frame),
        Interpretable::Block(block) => eval_block(block, frame),
    }
}

fn eval_call<'p>(call: &'p CallPlan, frame: &mut Frame<'p>) -> Value {
    let mut args: SmallVec<[Value; 4]> = SmallVec::with_capacity(call.args.len());
    for arg in &call.args {
        args.push(eval(arg, frame));
    }
    if !call.non_strict {
        if let Some(propagated) = strict_precondition(&args) {
            return propagated;
        }
    }
    let binding = match &call.target {
        DispatchTarget::Single(binding) => binding,
        DispatchTarget::Candidates(candidates) => {
            let found = candidates.iter().find(|candidate| {
                candidate
                    .decl
                    .params
                    .iter()
                    .zip(args.iter())
                    .all(|(param, arg)| param_matches(param, arg))
            });
            match found {
                Some(candidate) => &candidate.binding,
                None => {
                    return Value::error(
                        CelError::no_matching_overload(&call.function).with_id(call.id),
                    );
                }
            }
        }
    };
    match binding.as_ref()(&args) {
        Ok(value) => value,
        Err(err) => Value::error(err.with_id(call.id)),
    }
}

/// Runtime kind match for candidate dispatch. Parameterized and dynamic
/// types admit everything; concrete types match their kind.
fn param_matches(param: &CelType, value: &Value) -> bool {
    match param {
        CelType::Dyn | CelType::Any | CelType::TypeParam(_) | CelType::Error => true,
        CelType::Null => matches!(value, Value::Null),
        CelType::Bool => matches!(value, Value::Bool(_)),
        CelType::Int => matches!(value, Value::Int(_)),
        CelType::Uint => matches!(value, Value::Uint(_)),
        CelType::Double => matches!(value, Value::Double(_)),
        CelType::String => matches!(value, Value::String(_)),
        CelType::Bytes => matches!(value, Value::Bytes(_)),
        CelType::Duration => matches!(value, Value::Duration(_)),
        CelType::Timestamp => matches!(value, Value::Timestamp(_)),
        CelType::List(_) => matches!(value, Value::List(_)),
        CelType::Map(_, _) => matches!(value, Value::Map(_)),
        CelType::Optional(_) => matches!(value, Value::Optional(_)),
        CelType::Type(_) => matches!(value, Value::Type(_)),
        CelType::Struct(name) => matches!(value, Value::Struct(s) if s.type_name == *name),
        CelType::Enum(_) => matches!(value, Value::Int(_)),
    }
}

fn eval_and<'p>(
    id: ExprId,
    lhs: &'p Interpretable,
    rhs: &'p Interpretable,
    frame: &mut Frame<'p>,
) -> Value {
    let left = eval(lhs, frame);
    if matches!(left, Value::Bool(false)) {
        return Value::Bool(false);
    }
    let right = eval(rhs, frame);
    if matches!(right, Value::Bool(false)) {
        return Value::Bool(false);
    }
    combine_logic(id, left, right, "_&&_", true)
}

fn eval_or<'p>(
    id: ExprId,
    lhs: &'p Interpretable,
    rhs: &'p Interpretable,
    frame: &mut Frame<'p>,
) -> Value {
    let left = eval(lhs, frame);
    if matches!(left, Value::Bool(true)) {
        return Value::Bool(true);
    }
    let right = eval(rhs, frame);
    if matches!(right, Value::Bool(true)) {
        return Value::Bool(true);
    }
    combine_logic(id, left, right, "_||_", false)
}

/// Joins two non-short-circuited logic operands. Unknowns are preferred over
/// errors; the first error is preferred over the second; anything else that
/// is not the identity boolean is an overload miss.
fn combine_logic(id: ExprId, left: Value, right: Value, function: &str, identity: bool) -> Value {
    match (left, right) {
        (Value::Bool(l), Value::Bool(r)) if l == identity && r == identity => Value::Bool(identity),
        (Value::Unknown(a), Value::Unknown(b)) => Value::unknown(a.merged(&b)),
        (unknown @ Value::Unknown(_), _) | (_, unknown @ Value::Unknown(_)) => unknown,
        (err @ Value::Error(_), _) | (_, err @ Value::Error(_)) => err,
        _ => Value::error(CelError::no_matching_overload(function).with_id(id)),
    }
}

fn eval_create_map<'p>(
    id: ExprId,
    keys: &'p [Interpretable],
    values: &'p [Interpretable],
    optional_indices: &[u32],
    frame: &mut Frame<'p>,
) -> Value {
    let mut evaluated: Vec<(Value, Value)> = Vec::with_capacity(keys.len());
    for (key, value) in keys.iter().zip(values) {
        evaluated.push((eval(key, frame), eval(value, frame)));
    }
    for (key, value) in &evaluated {
        let pair = [key.clone(), value.clone()];
        if let Some(propagated) = strict_precondition(&pair) {
            return propagated;
        }
    }
    let mut map = MapValue::with_capacity(evaluated.len());
    for (i, (key, value)) in evaluated.into_iter().enumerate() {
        let value = if optional_indices.contains(&(i as u32)) {
            match value {
                Value::Optional(OptionalValue::Present(inner)) => *inner,
                Value::Optional(OptionalValue::Absent) => continue,
                other => {
                    return Value::error(
                        CelError::invalid_argument(format!(
                            "optional map entry must be optional, found {}",
                            other.runtime_type()
                        ))
                        .with_id(id),
                    );
                }
            }
        } else {
            value
        };
        let key = match MapKey::from_value(&key) {
            Ok(key) => key,
            Err(err) => return Value::error(err.with_id(id)),
        };
        if map.insert(key.clone(), value).is_some() {
            return Value::error(
                CelError::invalid_argument(format!("repeated key in map literal: {}", key.to_value()))
                    .with_id(id),
            );
        }
    }
    Value::map(map)
}

fn eval_create_struct<'p>(
    id: ExprId,
    type_name: &str,
    fields: &[String],
    values: &'p [Interpretable],
    optional_indices: &[u32],
    frame: &mut Frame<'p>,
) -> Value {
    let mut evaluated: Vec<Value> = Vec::with_capacity(values.len());
    for value in values {
        evaluated.push(eval(value, frame));
    }
    if let Some(propagated) = strict_precondition(&evaluated) {
        return propagated;
    }
    let mut out = StructValue::new(type_name);
    for (i, (field, value)) in fields.iter().zip(evaluated).enumerate() {
        let value = if optional_indices.contains(&(i as u32)) {
            match value {
                Value::Optional(OptionalValue::Present(inner)) => *inner,
                Value::Optional(OptionalValue::Absent) => continue,
                other => {
                    return Value::error(
                        CelError::invalid_argument(format!(
                            "optional field must be optional, found {}",
                            other.runtime_type()
                        ))
                        .with_id(id),
                    );
                }
            }
        } else {
            value
        };
        if out.fields.insert(field.clone(), value).is_some() {
            return Value::error(
                CelError::invalid_argument(format!("field '{field}' set more than once")).with_id(id),
            );
        }
    }
    Value::Struct(std::sync::Arc::new(out))
}

fn eval_fold<'p>(fold: &'p FoldPlan, frame: &mut Frame<'p>) -> Value {
    let range = eval(&fold.iter_range, frame);
    let items: Vec<(Value, Option<Value>)> = match &range {
        Value::List(list) => {
            if fold.iter_var2.is_some() {
                list.iter()
                    .enumerate()
                    .map(|(i, v)| (Value::Int(i as i64), Some(v.clone())))
                    .collect()
            } else {
                list.iter().map(|v| (v.clone(), None)).collect()
            }
        }
        Value::Map(map) => {
            if fold.iter_var2.is_some() {
                map.iter()
                    .map(|(k, v)| (k.to_value(), Some(v.clone())))
                    .collect()
            } else {
                map.keys().map(|k| (k.to_value(), None)).collect()
            }
        }
        propagated @ (Value::Error(_) | Value::Unknown(_)) => return propagated.clone(),
        other => {
            return Value::error(
                CelError::new(
                    crate::error::ErrorKind::NoMatchingOverload,
                    format!(
                        "expression of type '{}' cannot be the range of a comprehension",
                        other.runtime_type()
                    ),
                )
                .with_id(fold.id),
            );
        }
    };

    // nested comprehension entry counts against the iteration budget
    if frame.fold_depth > 0 {
        if let Some(limit_error) = charge_iteration(frame, fold.id) {
            return limit_error;
        }
    }
    frame.fold_depth += 1;

    let accu = eval(&fold.accu_init, frame);
    let depth = frame.scope.len();
    frame.scope.push(ScopeEntry::Var {
        name: &fold.accu_var,
        value: accu,
    });
    let accu_index = frame.scope.len() - 1;

    let mut failure: Option<Value> = None;
    for (item, item2) in items {
        frame.scope.push(ScopeEntry::Var {
            name: &fold.iter_var,
            value: item,
        });
        if let (Some(name), Some(value)) = (&fold.iter_var2, item2) {
            frame.scope.push(ScopeEntry::Var { name, value });
        }

        let condition = eval(&fold.loop_condition, frame);
        match condition {
            Value::Bool(true) => {}
            Value::Bool(false) => {
                frame.scope.truncate(accu_index + 1);
                break;
            }
            propagated @ (Value::Error(_) | Value::Unknown(_)) => {
                frame.scope.truncate(accu_index + 1);
                failure = Some(propagated);
                break;
            }
            _ => {
                frame.scope.truncate(accu_index + 1);
                failure = Some(Value::error(
                    CelError::no_matching_overload("<loop condition>").with_id(fold.id),
                ));
                break;
            }
        }

        let stepped = eval(&fold.loop_step, frame);
        frame.scope.truncate(accu_index + 1);
        if let ScopeEntry::Var { value, .. } = &mut frame.scope[accu_index] {
            *value = stepped;
        }

        if let Some(limit_error) = charge_iteration(frame, fold.id) {
            failure = Some(limit_error);
            break;
        }
    }

    let out = match failure {
        Some(failure) => failure,
        None => eval(&fold.result, frame),
    };
    frame.scope.truncate(depth);
    frame.fold_depth -= 1;
    out
}

fn charge_iteration(frame: &mut Frame<'_>, id: ExprId) -> Option<Value> {
    frame.iterations += 1;
    if frame.iterations > frame.limit {
        Some(Value::error(
            CelError::iteration_limit(frame.limit).with_id(id),
        ))
    } else {
        None
    }
}

fn eval_block<'p>(block: &'p BlockPlan, frame: &mut Frame<'p>) -> Value {
    let depth = frame.scope.len();
    for (name, expr) in block.slot_names.iter().zip(&block.slots) {
        frame.scope.push(ScopeEntry::Lazy {
            name,
            expr,
            value: None,
        });
    }
    let out = eval(&block.body, frame);
    frame.scope.truncate(depth);
    out
}

// ---------------------------------------------------------------------------
// Attribute resolution
// ---------------------------------------------------------------------------

fn resolve_attribute<'p>(attr: &'p Attribute, id: ExprId, frame: &mut Frame<'p>) -> Value {
    match attr {
        Attribute::Namespaced(namespaced) => match bind_candidate(namespaced, frame) {
            Some(value) => apply_qualifiers(value, &namespaced.qualifiers, id),
            None => missing_error(std::slice::from_ref(namespaced), id),
        },
        Attribute::Maybe { alternatives, .. } => {
            for alternative in alternatives {
                if let Some(value) = bind_candidate(alternative, frame) {
                    return apply_qualifiers(value, &alternative.qualifiers, id);
                }
            }
            missing_error(alternatives, id)
        }
        Attribute::Relative {
            operand,
            qualifiers,
        } => {
            let value = eval(operand, frame);
            apply_qualifiers(value, qualifiers, id)
        }
        Attribute::Missing { names } => {
            Value::error(CelError::attribute_not_found(names).with_id(id))
        }
    }
}

fn missing_error(alternatives: &[NamespacedAttribute], id: ExprId) -> Value {
    let names: Vec<String> = alternatives
        .iter()
        .flat_map(|alt| alt.names.iter().map(|c| c.name.clone()))
        .collect();
    Value::error(CelError::attribute_not_found(&names).with_id(id))
}

/// Resolves the first candidate name that binds in the frame: scope stack
/// first for non-absolute simple names, then the base activation.
fn bind_candidate<'p>(attr: &'p NamespacedAttribute, frame: &mut Frame<'p>) -> Option<Value> {
    for candidate in &attr.names {
        if !candidate.absolute {
            if let Some(value) = lookup_scope(frame, &candidate.name) {
                return Some(value);
            }
        }
        if let Some(value) = frame.activation.resolve(&candidate.name) {
            return Some(value);
        }
    }
    None
}

fn lookup_scope<'p>(frame: &mut Frame<'p>, name: &str) -> Option<Value> {
    enum Found<'p> {
        Ready(Value),
        Force(usize, &'p Interpretable),
    }
    let mut found = None;
    for i in (0..frame.scope.len()).rev() {
        match &frame.scope[i] {
            ScopeEntry::Var { name: n, value } if *n == name => {
                found = Some(Found::Ready(value.clone()));
                break;
            }
            ScopeEntry::Lazy {
                name: n,
                expr,
                value,
            } if *n == name => {
                found = Some(match value {
                    Some(value) => Found::Ready(value.clone()),
                    None => Found::Force(i, *expr),
                });
                break;
            }
            _ => {}
        }
    }
    match found? {
        Found::Ready(value) => Some(value),
        Found::Force(index, expr) => {
            let value = eval(expr, frame);
            if let ScopeEntry::Lazy { value: slot, .. } = &mut frame.scope[index] {
                *slot = Some(value.clone());
            }
            Some(value)
        }
    }
}

fn apply_qualifiers(mut value: Value, qualifiers: &[Qualifier], id: ExprId) -> Value {
    for qualifier in qualifiers {
        if matches!(value, Value::Error(_) | Value::Unknown(_)) {
            return value;
        }
        value = match qualify(value, qualifier) {
            Ok(value) => value,
            Err(err) => return Value::error(err.with_id(id)),
        };
    }
    value
}

fn qualify(value: Value, qualifier: &Qualifier) -> Result<Value, CelError> {
    match qualifier {
        Qualifier::String(field) => match &value {
            Value::Map(map) => map
                .get(&MapKey::String(field.as_str().into()))
                .cloned()
                .ok_or_else(|| CelError::no_such_key(field)),
            Value::Struct(st) => st
                .field(field)
                .cloned()
                .ok_or_else(|| CelError::no_such_field(field)),
            other => Err(CelError::invalid_argument(format!(
                "type '{}' does not support field selection",
                other.runtime_type()
            ))),
        },
        Qualifier::Int(i) => stdlib::index_aggregate(&value, &Value::Int(*i)),
        Qualifier::Uint(u) => stdlib::index_aggregate(&value, &Value::Uint(*u)),
        Qualifier::Bool(b) => stdlib::index_aggregate(&value, &Value::Bool(*b)),
        Qualifier::PresenceTest(inner) => presence_test(&value, inner),
    }
}

/// Presence never raises for a missing entry: `has(m.k)` on a map without
/// `k` is `false`.
fn presence_test(value: &Value, inner: &Qualifier) -> Result<Value, CelError> {
    match value {
        Value::Map(map) => {
            let key = match inner {
                Qualifier::String(s) => MapKey::String(s.as_str().into()),
                Qualifier::Int(i) => MapKey::Int(*i),
                Qualifier::Uint(u) => MapKey::Uint(*u),
                Qualifier::Bool(b) => MapKey::Bool(*b),
                Qualifier::PresenceTest(_) => {
                    return Err(CelError::internal("nested presence qualifier"));
                }
            };
            Ok(Value::Bool(map.contains_key(&key)))
        }
        Value::Struct(st) => match inner {
            Qualifier::String(field) => Ok(Value::Bool(st.has_field(field))),
            _ => Ok(Value::Bool(false)),
        },
        other => Err(CelError::invalid_argument(format!(
            "type '{}' does not support presence testing",
            other.runtime_type()
        ))),
    }
}

