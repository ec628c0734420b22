//! Standard function declarations and bindings.
//!
//! Overload ids follow the `targetType_func_argType1_argType2…` convention,
//! lowercase and underscore-separated, with the target type omitted for
//! global overloads and `dyn` spelling both `dyn` and type parameters
//! (`add_int_int`, `string_contains_string`, `size_list`). The id strings
//! are load-bearing: subsetting, serialization, bindings, and the optimizers
//! key off them.
//!
//! Implementations ride the ordinary [`FunctionImpl`] mechanism; nothing in
//! the runtime special-cases a standard function except the logic operators,
//! which the planner lowers to dedicated plan nodes and which therefore
//! carry declarations but no bindings here.

use std::{cmp::Ordering, sync::Arc};

use chrono::{Datelike, Timelike};
use regex::Regex;

use crate::{
    env::{FunctionImpl, OverloadDecl, Registrations, StdlibSubset},
    error::{CelError, EnvError, EvalResult},
    operators,
    types::CelType,
    value::{MapKey, OptionalValue, Value},
};

/// Macros the parser expands by default; subsetting refers to these names.
pub const STANDARD_MACROS: &[&str] = &["has", "all", "exists", "exists_one", "map", "filter"];

/// The canonical extension names and the highest version each ships.
/// `None` marks names that are recognized but not available in this build.
const CANONICAL_EXTENSIONS: &[(&str, Option<u32>)] = &[
    ("strings", Some(2)),
    ("math", Some(1)),
    ("sets", Some(1)),
    ("optional", Some(2)),
    ("bindings", Some(1)),
    ("lists", None),
    ("encoders", None),
    ("regex", None),
    ("protos", None),
    ("comprehensions", None),
];

fn binding(f: impl Fn(&[Value]) -> EvalResult<Value> + Send + Sync + 'static) -> FunctionImpl {
    Arc::new(f)
}

fn declare(
    regs: &mut Registrations,
    subset: &StdlibSubset,
    function: &str,
    decl: OverloadDecl,
    imp: Option<FunctionImpl>,
) -> Result<(), EnvError> {
    if !subset.function_allowed(function, &decl.id) {
        return Ok(());
    }
    regs.declare(function, decl, imp)
}

/// Installs the standard library, honoring the subset.
pub(crate) fn install(regs: &mut Registrations, subset: &StdlibSubset) -> Result<(), EnvError> {
    install_logic(regs, subset)?;
    install_equality(regs, subset)?;
    install_comparisons(regs, subset)?;
    install_arithmetic(regs, subset)?;
    install_aggregates(regs, subset)?;
    install_strings(regs, subset)?;
    install_conversions(regs, subset)?;
    install_time_accessors(regs, subset)?;
    Ok(())
}

/// Installs one canonical extension, returning the version actually
/// installed (the highest implemented version at or below `requested`).
pub(crate) fn install_extension(
    regs: &mut Registrations,
    name: &str,
    requested: u32,
) -> Result<u32, EnvError> {
    let max = match CANONICAL_EXTENSIONS.iter().find(|(n, _)| *n == name) {
        Some((_, Some(max))) => *max,
        Some((_, None)) => {
            return Err(EnvError::UnsupportedExtension {
                name: name.to_string(),
                version: requested,
            });
        }
        None => return Err(EnvError::UnknownExtension(name.to_string())),
    };
    let version = max.min(requested);
    match name {
        "strings" => install_strings_extension(regs)?,
        "math" => install_math_extension(regs)?,
        "sets" => install_sets_extension(regs)?,
        "optional" => install_optional_extension(regs)?,
        // cel.bind is a parse-time macro; the extension carries no functions
        "bindings" => {}
        _ => unreachable!("extension availability checked above"),
    }
    Ok(version)
}

// ---------------------------------------------------------------------------
// Logic
// ---------------------------------------------------------------------------

fn install_logic(regs: &mut Registrations, subset: &StdlibSubset) -> Result<(), EnvError> {
    // The planner lowers `&&`, `||`, and `?:` to dedicated short-circuit
    // plan nodes; their declarations exist for the checker only.
    declare(
        regs,
        subset,
        operators::LOGICAL_AND,
        OverloadDecl::global("logical_and_bool_bool", vec![CelType::Bool, CelType::Bool], CelType::Bool)
            .non_strict(),
        None,
    )?;
    declare(
        regs,
        subset,
        operators::LOGICAL_OR,
        OverloadDecl::global("logical_or_bool_bool", vec![CelType::Bool, CelType::Bool], CelType::Bool)
            .non_strict(),
        None,
    )?;
    declare(
        regs,
        subset,
        operators::CONDITIONAL,
        OverloadDecl::global(
            "conditional_bool_dyn_dyn",
            vec![CelType::Bool, CelType::type_param("A"), CelType::type_param("A")],
            CelType::type_param("A"),
        )
        .with_type_params(vec!["A".to_string()])
        .non_strict(),
        None,
    )?;
    declare(
        regs,
        subset,
        operators::LOGICAL_NOT,
        OverloadDecl::global("logical_not_bool", vec![CelType::Bool], CelType::Bool).foldable(),
        Some(binding(|args| match &args[0] {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            _ => Err(CelError::no_matching_overload(operators::LOGICAL_NOT)),
        })),
    )?;
    declare(
        regs,
        subset,
        operators::NOT_STRICTLY_FALSE,
        OverloadDecl::global("not_strictly_false_bool", vec![CelType::Bool], CelType::Bool).non_strict(),
        Some(binding(|args| {
            // false only for a definitive false; errors and unknowns pass
            Ok(Value::Bool(!matches!(args[0], Value::Bool(false))))
        })),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Equality and ordering
// ---------------------------------------------------------------------------

fn install_equality(regs: &mut Registrations, subset: &StdlibSubset) -> Result<(), EnvError> {
    declare(
        regs,
        subset,
        operators::EQUALS,
        OverloadDecl::global("equals_dyn_dyn", vec![CelType::Dyn, CelType::Dyn], CelType::Bool).foldable(),
        Some(binding(|args| Ok(Value::Bool(args[0].cel_eq(&args[1]))))),
    )?;
    declare(
        regs,
        subset,
        operators::NOT_EQUALS,
        OverloadDecl::global("not_equals_dyn_dyn", vec![CelType::Dyn, CelType::Dyn], CelType::Bool).foldable(),
        Some(binding(|args| Ok(Value::Bool(!args[0].cel_eq(&args[1]))))),
    )?;
    Ok(())
}

fn cmp_binding(pred: fn(Ordering) -> bool) -> FunctionImpl {
    binding(move |args| {
        // a None ordering (NaN) makes every comparison false
        Ok(Value::Bool(args[0].cel_cmp(&args[1]).is_some_and(pred)))
    })
}

fn install_comparisons(regs: &mut Registrations, subset: &StdlibSubset) -> Result<(), EnvError> {
    let pairs: Vec<(&str, CelType, CelType)> = vec![
        ("int_int", CelType::Int, CelType::Int),
        ("uint_uint", CelType::Uint, CelType::Uint),
        ("double_double", CelType::Double, CelType::Double),
        ("int_uint", CelType::Int, CelType::Uint),
        ("uint_int", CelType::Uint, CelType::Int),
        ("int_double", CelType::Int, CelType::Double),
        ("double_int", CelType::Double, CelType::Int),
        ("uint_double", CelType::Uint, CelType::Double),
        ("double_uint", CelType::Double, CelType::Uint),
        ("bool_bool", CelType::Bool, CelType::Bool),
        ("string_string", CelType::String, CelType::String),
        ("bytes_bytes", CelType::Bytes, CelType::Bytes),
        ("duration_duration", CelType::Duration, CelType::Duration),
        ("timestamp_timestamp", CelType::Timestamp, CelType::Timestamp),
    ];
    let ops: [(&str, &str, fn(Ordering) -> bool); 4] = [
        (operators::LESS, "less", |o| o == Ordering::Less),
        (operators::LESS_EQUALS, "less_equals", |o| o != Ordering::Greater),
        (operators::GREATER, "greater", |o| o == Ordering::Greater),
        (operators::GREATER_EQUALS, "greater_equals", |o| o != Ordering::Less),
    ];
    for (function, prefix, pred) in ops {
        let imp = cmp_binding(pred);
        for (suffix, lhs, rhs) in &pairs {
            declare(
                regs,
                subset,
                function,
                OverloadDecl::global(
                    format!("{prefix}_{suffix}"),
                    vec![lhs.clone(), rhs.clone()],
                    CelType::Bool,
                )
                .foldable(),
                Some(imp.clone()),
            )?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

fn install_arithmetic(regs: &mut Registrations, subset: &StdlibSubset) -> Result<(), EnvError> {
    let a = || CelType::type_param("A");
    let add_pairs: Vec<(&str, CelType, CelType, CelType)> = vec![
        ("int_int", CelType::Int, CelType::Int, CelType::Int),
        ("uint_uint", CelType::Uint, CelType::Uint, CelType::Uint),
        ("double_double", CelType::Double, CelType::Double, CelType::Double),
        ("string_string", CelType::String, CelType::String, CelType::String),
        ("bytes_bytes", CelType::Bytes, CelType::Bytes, CelType::Bytes),
        ("list_list", CelType::list(a()), CelType::list(a()), CelType::list(a())),
        ("duration_duration", CelType::Duration, CelType::Duration, CelType::Duration),
        ("timestamp_duration", CelType::Timestamp, CelType::Duration, CelType::Timestamp),
        ("duration_timestamp", CelType::Duration, CelType::Timestamp, CelType::Timestamp),
    ];
    let add = binding(|args| args[0].checked_add(&args[1]));
    for (suffix, lhs, rhs, result) in add_pairs {
        let decl = OverloadDecl::global(format!("add_{suffix}"), vec![lhs, rhs], result).foldable();
        let decl = if suffix == "list_list" {
            decl.with_type_params(vec!["A".to_string()])
        } else {
            decl
        };
        declare(regs, subset, operators::ADD, decl, Some(add.clone()))?;
    }

    let sub_pairs: Vec<(&str, CelType, CelType, CelType)> = vec![
        ("int_int", CelType::Int, CelType::Int, CelType::Int),
        ("uint_uint", CelType::Uint, CelType::Uint, CelType::Uint),
        ("double_double", CelType::Double, CelType::Double, CelType::Double),
        ("duration_duration", CelType::Duration, CelType::Duration, CelType::Duration),
        ("timestamp_duration", CelType::Timestamp, CelType::Duration, CelType::Timestamp),
        ("timestamp_timestamp", CelType::Timestamp, CelType::Timestamp, CelType::Duration),
    ];
    let sub = binding(|args| args[0].checked_sub(&args[1]));
    for (suffix, lhs, rhs, result) in sub_pairs {
        declare(
            regs,
            subset,
            operators::SUBTRACT,
            OverloadDecl::global(format!("subtract_{suffix}"), vec![lhs, rhs], result).foldable(),
            Some(sub.clone()),
        )?;
    }

    let mul = binding(|args| args[0].checked_mul(&args[1]));
    let div = binding(|args| args[0].checked_div(&args[1]));
    let rem = binding(|args| args[0].checked_rem(&args[1]));
    for (suffix, ty) in [
        ("int_int", CelType::Int),
        ("uint_uint", CelType::Uint),
        ("double_double", CelType::Double),
    ] {
        declare(
            regs,
            subset,
            operators::MULTIPLY,
            OverloadDecl::global(format!("multiply_{suffix}"), vec![ty.clone(), ty.clone()], ty.clone())
                .foldable(),
            Some(mul.clone()),
        )?;
        declare(
            regs,
            subset,
            operators::DIVIDE,
            OverloadDecl::global(format!("divide_{suffix}"), vec![ty.clone(), ty.clone()], ty.clone())
                .foldable(),
            Some(div.clone()),
        )?;
        if suffix != "double_double" {
            declare(
                regs,
                subset,
                operators::MODULO,
                OverloadDecl::global(format!("modulo_{suffix}"), vec![ty.clone(), ty.clone()], ty.clone())
                    .foldable(),
                Some(rem.clone()),
            )?;
        }
    }
    declare(
        regs,
        subset,
        operators::DIVIDE,
        OverloadDecl::global("divide_duration_int", vec![CelType::Duration, CelType::Int], CelType::Duration)
            .foldable(),
        Some(div),
    )?;

    let neg = binding(|args| args[0].checked_neg());
    declare(
        regs,
        subset,
        operators::NEGATE,
        OverloadDecl::global("negate_int", vec![CelType::Int], CelType::Int).foldable(),
        Some(neg.clone()),
    )?;
    declare(
        regs,
        subset,
        operators::NEGATE,
        OverloadDecl::global("negate_double", vec![CelType::Double], CelType::Double).foldable(),
        Some(neg),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Aggregates: index, membership, size
// ---------------------------------------------------------------------------

/// Index application shared by the `_[_]` binding and the attribute
/// qualifier machinery.
pub(crate) fn index_aggregate(target: &Value, index: &Value) -> EvalResult<Value> {
    match target {
        Value::List(list) => {
            let i = match index {
                Value::Int(i) => *i,
                Value::Uint(u) => i64::try_from(*u)
                    .map_err(|_| CelError::invalid_argument("index out of range"))?,
                other => {
                    return Err(CelError::invalid_argument(format!(
                        "invalid list index type: {}",
                        other.runtime_type()
                    )));
                }
            };
            usize::try_from(i)
                .ok()
                .and_then(|i| list.get(i))
                .cloned()
                .ok_or_else(|| CelError::invalid_argument(format!("index out of range: {i}")))
        }
        Value::Map(map) => {
            let key = MapKey::from_value(index)?;
            map.get(&key)
                .cloned()
                .ok_or_else(|| CelError::no_such_key(index))
        }
        other => Err(CelError::no_matching_overload_value(operators::INDEX, other)),
    }
}

fn install_aggregates(regs: &mut Registrations, subset: &StdlibSubset) -> Result<(), EnvError> {
    let a = || CelType::type_param("A");
    let b = || CelType::type_param("B");

    let index = binding(|args| index_aggregate(&args[0], &args[1]));
    declare(
        regs,
        subset,
        operators::INDEX,
        OverloadDecl::global("index_list_int", vec![CelType::list(a()), CelType::Int], a())
            .with_type_params(vec!["A".to_string()])
            .foldable(),
        Some(index.clone()),
    )?;
    declare(
        regs,
        subset,
        operators::INDEX,
        OverloadDecl::global("index_map_dyn", vec![CelType::map(a(), b()), a()], b())
            .with_type_params(vec!["A".to_string(), "B".to_string()])
            .foldable(),
        Some(index),
    )?;

    let contains = binding(|args| match &args[1] {
        Value::List(list) => Ok(Value::Bool(list.iter().any(|v| v.cel_eq(&args[0])))),
        Value::Map(map) => {
            let key = MapKey::from_value(&args[0])?;
            Ok(Value::Bool(map.contains_key(&key)))
        }
        other => Err(CelError::no_matching_overload_value(operators::IN, other)),
    });
    declare(
        regs,
        subset,
        operators::IN,
        OverloadDecl::global("in_dyn_list", vec![a(), CelType::list(a())], CelType::Bool)
            .with_type_params(vec!["A".to_string()])
            .foldable(),
        Some(contains.clone()),
    )?;
    declare(
        regs,
        subset,
        operators::IN,
        OverloadDecl::global("in_dyn_map", vec![a(), CelType::map(a(), b())], CelType::Bool)
            .with_type_params(vec!["A".to_string(), "B".to_string()])
            .foldable(),
        Some(contains),
    )?;

    let size = binding(|args| {
        args[0]
            .size()
            .map(Value::Int)
            .ok_or_else(|| CelError::no_matching_overload_value("size", &args[0]))
    });
    for (id, param, member) in [
        ("size_string", CelType::String, false),
        ("size_bytes", CelType::Bytes, false),
        ("size_list", CelType::list(a()), false),
        ("size_map", CelType::map(a(), b()), false),
        ("string_size", CelType::String, true),
        ("bytes_size", CelType::Bytes, true),
        ("list_size", CelType::list(a()), true),
        ("map_size", CelType::map(a(), b()), true),
    ] {
        let decl = if member {
            OverloadDecl::member(id, vec![param], CelType::Int)
        } else {
            OverloadDecl::global(id, vec![param], CelType::Int)
        };
        let decl = decl
            .with_type_params(vec!["A".to_string(), "B".to_string()])
            .foldable();
        declare(regs, subset, "size", decl, Some(size.clone()))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

fn string_args<'a>(args: &'a [Value], function: &str) -> EvalResult<(&'a str, &'a str)> {
    match (&args[0], &args[1]) {
        (Value::String(a), Value::String(b)) => Ok((a, b)),
        _ => Err(CelError::no_matching_overload(function)),
    }
}

fn match_regex(args: &[Value]) -> EvalResult<Value> {
    let (subject, pattern) = string_args(args, "matches")?;
    let re = Regex::new(pattern)
        .map_err(|e| CelError::invalid_argument(format!("invalid regex: {e}")))?;
    Ok(Value::Bool(re.is_match(subject)))
}

fn install_strings(regs: &mut Registrations, subset: &StdlibSubset) -> Result<(), EnvError> {
    declare(
        regs,
        subset,
        "contains",
        OverloadDecl::member("string_contains_string", vec![CelType::String, CelType::String], CelType::Bool)
            .foldable(),
        Some(binding(|args| {
            let (s, sub) = string_args(args, "contains")?;
            Ok(Value::Bool(s.contains(sub)))
        })),
    )?;
    declare(
        regs,
        subset,
        "startsWith",
        OverloadDecl::member(
            "string_starts_with_string",
            vec![CelType::String, CelType::String],
            CelType::Bool,
        )
        .foldable(),
        Some(binding(|args| {
            let (s, prefix) = string_args(args, "startsWith")?;
            Ok(Value::Bool(s.starts_with(prefix)))
        })),
    )?;
    declare(
        regs,
        subset,
        "endsWith",
        OverloadDecl::member(
            "string_ends_with_string",
            vec![CelType::String, CelType::String],
            CelType::Bool,
        )
        .foldable(),
        Some(binding(|args| {
            let (s, suffix) = string_args(args, "endsWith")?;
            Ok(Value::Bool(s.ends_with(suffix)))
        })),
    )?;
    declare(
        regs,
        subset,
        "matches",
        OverloadDecl::member("string_matches_string", vec![CelType::String, CelType::String], CelType::Bool),
        Some(binding(match_regex)),
    )?;
    declare(
        regs,
        subset,
        "matches",
        OverloadDecl::global("matches_string_string", vec![CelType::String, CelType::String], CelType::Bool),
        Some(binding(match_regex)),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn install_conversions(regs: &mut Registrations, subset: &StdlibSubset) -> Result<(), EnvError> {
    type Conv = fn(&Value) -> EvalResult<Value>;
    let groups: Vec<(&str, CelType, Conv, Vec<(&str, CelType)>)> = vec![
        (
            "int",
            CelType::Int,
            Value::convert_to_int,
            vec![
                ("int", CelType::Int),
                ("uint", CelType::Uint),
                ("double", CelType::Double),
                ("string", CelType::String),
                ("timestamp", CelType::Timestamp),
            ],
        ),
        (
            "uint",
            CelType::Uint,
            Value::convert_to_uint,
            vec![
                ("uint", CelType::Uint),
                ("int", CelType::Int),
                ("double", CelType::Double),
                ("string", CelType::String),
            ],
        ),
        (
            "double",
            CelType::Double,
            Value::convert_to_double,
            vec![
                ("double", CelType::Double),
                ("int", CelType::Int),
                ("uint", CelType::Uint),
                ("string", CelType::String),
            ],
        ),
        (
            "string",
            CelType::String,
            Value::convert_to_string,
            vec![
                ("string", CelType::String),
                ("int", CelType::Int),
                ("uint", CelType::Uint),
                ("double", CelType::Double),
                ("bool", CelType::Bool),
                ("bytes", CelType::Bytes),
                ("timestamp", CelType::Timestamp),
                ("duration", CelType::Duration),
            ],
        ),
        (
            "bytes",
            CelType::Bytes,
            Value::convert_to_bytes,
            vec![("bytes", CelType::Bytes), ("string", CelType::String)],
        ),
        (
            "bool",
            CelType::Bool,
            Value::convert_to_bool,
            vec![("bool", CelType::Bool), ("string", CelType::String)],
        ),
        (
            "timestamp",
            CelType::Timestamp,
            Value::convert_to_timestamp,
            vec![
                ("timestamp", CelType::Timestamp),
                ("string", CelType::String),
                ("int", CelType::Int),
            ],
        ),
        (
            "duration",
            CelType::Duration,
            Value::convert_to_duration,
            vec![("duration", CelType::Duration), ("string", CelType::String)],
        ),
    ];
    for (function, result, conv, params) in groups {
        let imp = binding(move |args: &[Value]| conv(&args[0]));
        for (suffix, param) in params {
            declare(
                regs,
                subset,
                function,
                OverloadDecl::global(format!("{function}_{suffix}"), vec![param], result.clone()).foldable(),
                Some(imp.clone()),
            )?;
        }
    }

    declare(
        regs,
        subset,
        "dyn",
        OverloadDecl::global("dyn_dyn", vec![CelType::Dyn], CelType::Dyn).foldable(),
        Some(binding(|args| Ok(args[0].clone()))),
    )?;
    declare(
        regs,
        subset,
        "type",
        OverloadDecl::global("type_dyn", vec![CelType::type_param("A")], CelType::type_of(CelType::type_param("A")))
            .with_type_params(vec!["A".to_string()])
            .foldable(),
        Some(binding(|args| Ok(Value::Type(args[0].runtime_type())))),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Timestamp and duration accessors
// ---------------------------------------------------------------------------

fn timestamp_accessor(
    f: fn(&chrono::DateTime<chrono::Utc>) -> i64,
) -> FunctionImpl {
    binding(move |args| match &args[0] {
        Value::Timestamp(t) => Ok(Value::Int(f(t))),
        _ => Err(CelError::no_matching_overload("timestamp accessor")),
    })
}

fn duration_accessor(f: fn(&chrono::TimeDelta) -> i64) -> FunctionImpl {
    binding(move |args| match &args[0] {
        Value::Duration(d) => Ok(Value::Int(f(d))),
        _ => Err(CelError::no_matching_overload("duration accessor")),
    })
}

fn install_time_accessors(regs: &mut Registrations, subset: &StdlibSubset) -> Result<(), EnvError> {
    // timestamp accessors operate in UTC
    let ts: Vec<(&str, &str, FunctionImpl)> = vec![
        ("getFullYear", "timestamp_get_full_year", timestamp_accessor(|t| i64::from(t.year()))),
        ("getMonth", "timestamp_get_month", timestamp_accessor(|t| i64::from(t.month0()))),
        ("getDayOfMonth", "timestamp_get_day_of_month", timestamp_accessor(|t| i64::from(t.day0()))),
        ("getDate", "timestamp_get_date", timestamp_accessor(|t| i64::from(t.day()))),
        (
            "getDayOfWeek",
            "timestamp_get_day_of_week",
            timestamp_accessor(|t| i64::from(t.weekday().num_days_from_sunday())),
        ),
        (
            "getDayOfYear",
            "timestamp_get_day_of_year",
            timestamp_accessor(|t| i64::from(t.ordinal0())),
        ),
        ("getHours", "timestamp_get_hours", timestamp_accessor(|t| i64::from(t.hour()))),
        ("getMinutes", "timestamp_get_minutes", timestamp_accessor(|t| i64::from(t.minute()))),
        ("getSeconds", "timestamp_get_seconds", timestamp_accessor(|t| i64::from(t.second()))),
        (
            "getMilliseconds",
            "timestamp_get_milliseconds",
            timestamp_accessor(|t| i64::from(t.timestamp_subsec_millis())),
        ),
    ];
    for (function, id, imp) in ts {
        declare(
            regs,
            subset,
            function,
            OverloadDecl::member(id, vec![CelType::Timestamp], CelType::Int).foldable(),
            Some(imp),
        )?;
    }

    let dur: Vec<(&str, &str, FunctionImpl)> = vec![
        ("getHours", "duration_get_hours", duration_accessor(chrono::TimeDelta::num_hours)),
        ("getMinutes", "duration_get_minutes", duration_accessor(chrono::TimeDelta::num_minutes)),
        ("getSeconds", "duration_get_seconds", duration_accessor(chrono::TimeDelta::num_seconds)),
        (
            "getMilliseconds",
            "duration_get_milliseconds",
            duration_accessor(chrono::TimeDelta::num_milliseconds),
        ),
    ];
    for (function, id, imp) in dur {
        declare(
            regs,
            subset,
            function,
            OverloadDecl::member(id, vec![CelType::Duration], CelType::Int).foldable(),
            Some(imp),
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// strings extension (v2 subset)
// ---------------------------------------------------------------------------

fn install_strings_extension(regs: &mut Registrations) -> Result<(), EnvError> {
    regs.declare(
        "charAt",
        OverloadDecl::member("string_char_at_int", vec![CelType::String, CelType::Int], CelType::String)
            .foldable(),
        Some(binding(|args| match (&args[0], &args[1]) {
            (Value::String(s), Value::Int(i)) => {
                let len = s.chars().count() as i64;
                if *i < 0 || *i > len {
                    Err(CelError::invalid_argument(format!("index out of range: {i}")))
                } else if *i == len {
                    Ok(Value::from(""))
                } else {
                    let c = s.chars().nth(*i as usize).unwrap_or_default();
                    Ok(Value::String(c.to_string().into()))
                }
            }
            _ => Err(CelError::no_matching_overload("charAt")),
        })),
    )?;
    regs.declare(
        "indexOf",
        OverloadDecl::member("string_index_of_string", vec![CelType::String, CelType::String], CelType::Int)
            .foldable(),
        Some(binding(|args| {
            let (s, needle) = string_args(args, "indexOf")?;
            match s.find(needle) {
                Some(byte_idx) => Ok(Value::Int(s[..byte_idx].chars().count() as i64)),
                None => Ok(Value::Int(-1)),
            }
        })),
    )?;
    let join = binding(|args: &[Value]| {
        let Value::List(list) = &args[0] else {
            return Err(CelError::no_matching_overload("join"));
        };
        let separator = match args.get(1) {
            Some(Value::String(s)) => s.as_ref(),
            Some(_) => return Err(CelError::no_matching_overload("join")),
            None => "",
        };
        let mut out = String::new();
        for (i, item) in list.iter().enumerate() {
            let Value::String(s) = item else {
                return Err(CelError::invalid_argument("join expects a list of strings"));
            };
            if i > 0 {
                out.push_str(separator);
            }
            out.push_str(s);
        }
        Ok(Value::String(out.into()))
    });
    regs.declare(
        "join",
        OverloadDecl::member("list_join", vec![CelType::list(CelType::String)], CelType::String).foldable(),
        Some(join.clone()),
    )?;
    regs.declare(
        "join",
        OverloadDecl::member(
            "list_join_string",
            vec![CelType::list(CelType::String), CelType::String],
            CelType::String,
        )
        .foldable(),
        Some(join),
    )?;
    regs.declare(
        "lowerAscii",
        OverloadDecl::member("string_lower_ascii", vec![CelType::String], CelType::String).foldable(),
        Some(binding(|args| match &args[0] {
            Value::String(s) => Ok(Value::String(s.to_ascii_lowercase().into())),
            _ => Err(CelError::no_matching_overload("lowerAscii")),
        })),
    )?;
    regs.declare(
        "upperAscii",
        OverloadDecl::member("string_upper_ascii", vec![CelType::String], CelType::String).foldable(),
        Some(binding(|args| match &args[0] {
            Value::String(s) => Ok(Value::String(s.to_ascii_uppercase().into())),
            _ => Err(CelError::no_matching_overload("upperAscii")),
        })),
    )?;
    regs.declare(
        "replace",
        OverloadDecl::member(
            "string_replace_string_string",
            vec![CelType::String, CelType::String, CelType::String],
            CelType::String,
        )
        .foldable(),
        Some(binding(|args| match (&args[0], &args[1], &args[2]) {
            (Value::String(s), Value::String(old), Value::String(new)) => {
                Ok(Value::String(s.replace(old.as_ref(), new).into()))
            }
            _ => Err(CelError::no_matching_overload("replace")),
        })),
    )?;
    regs.declare(
        "split",
        OverloadDecl::member(
            "string_split_string",
            vec![CelType::String, CelType::String],
            CelType::list(CelType::String),
        )
        .foldable(),
        Some(binding(|args| {
            let (s, sep) = string_args(args, "split")?;
            let parts: Vec<Value> = s.split(sep).map(Value::from).collect();
            Ok(Value::list(parts))
        })),
    )?;
    regs.declare(
        "trim",
        OverloadDecl::member("string_trim", vec![CelType::String], CelType::String).foldable(),
        Some(binding(|args| match &args[0] {
            Value::String(s) => Ok(Value::String(s.trim().into())),
            _ => Err(CelError::no_matching_overload("trim")),
        })),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// math extension
// ---------------------------------------------------------------------------

fn pick(values: &mut dyn Iterator<Item = &Value>, want: Ordering, function: &str) -> EvalResult<Value> {
    let mut best: Option<Value> = None;
    for value in values {
        if !matches!(value, Value::Int(_) | Value::Uint(_) | Value::Double(_)) {
            return Err(CelError::no_matching_overload_value(function, value));
        }
        best = Some(match best {
            None => value.clone(),
            Some(current) => {
                if value.cel_cmp(&current) == Some(want) {
                    value.clone()
                } else {
                    current
                }
            }
        });
    }
    best.ok_or_else(|| CelError::invalid_argument(format!("{function} requires at least one value")))
}

fn math_binding(want: Ordering, function: &'static str) -> FunctionImpl {
    binding(move |args| match args {
        [Value::List(list)] => pick(&mut list.iter(), want, function),
        _ => pick(&mut args.iter(), want, function),
    })
}

fn install_math_extension(regs: &mut Registrations) -> Result<(), EnvError> {
    let a = || CelType::type_param("A");
    for (function, want) in [
        ("math.greatest", Ordering::Greater),
        ("math.least", Ordering::Less),
    ] {
        let prefix = function.replace('.', "_");
        let imp = math_binding(want, function);
        regs.declare(
            function,
            OverloadDecl::global(format!("{prefix}_dyn"), vec![a()], a())
                .with_type_params(vec!["A".to_string()])
                .foldable(),
            Some(imp.clone()),
        )?;
        regs.declare(
            function,
            OverloadDecl::global(format!("{prefix}_dyn_dyn"), vec![a(), a()], a())
                .with_type_params(vec!["A".to_string()])
                .foldable(),
            Some(imp.clone()),
        )?;
        regs.declare(
            function,
            OverloadDecl::global(format!("{prefix}_list"), vec![CelType::list(a())], a())
                .with_type_params(vec!["A".to_string()])
                .foldable(),
            Some(imp),
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// sets extension
// ---------------------------------------------------------------------------

fn list_args<'a>(args: &'a [Value], function: &str) -> EvalResult<(&'a [Value], &'a [Value])> {
    match (&args[0], &args[1]) {
        (Value::List(a), Value::List(b)) => Ok((a, b)),
        _ => Err(CelError::no_matching_overload(function)),
    }
}

fn install_sets_extension(regs: &mut Registrations) -> Result<(), EnvError> {
    let a = || CelType::type_param("A");
    let list_list = |id: &str| {
        OverloadDecl::global(id, vec![CelType::list(a()), CelType::list(a())], CelType::Bool)
            .with_type_params(vec!["A".to_string()])
            .foldable()
    };
    regs.declare(
        "sets.contains",
        list_list("sets_contains_list_list"),
        Some(binding(|args| {
            let (haystack, needles) = list_args(args, "sets.contains")?;
            Ok(Value::Bool(
                needles.iter().all(|n| haystack.iter().any(|h| h.cel_eq(n))),
            ))
        })),
    )?;
    regs.declare(
        "sets.equivalent",
        list_list("sets_equivalent_list_list"),
        Some(binding(|args| {
            let (lhs, rhs) = list_args(args, "sets.equivalent")?;
            let covers = |xs: &[Value], ys: &[Value]| xs.iter().all(|x| ys.iter().any(|y| y.cel_eq(x)));
            Ok(Value::Bool(covers(lhs, rhs) && covers(rhs, lhs)))
        })),
    )?;
    regs.declare(
        "sets.intersects",
        list_list("sets_intersects_list_list"),
        Some(binding(|args| {
            let (lhs, rhs) = list_args(args, "sets.intersects")?;
            Ok(Value::Bool(lhs.iter().any(|x| rhs.iter().any(|y| y.cel_eq(x)))))
        })),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// optional extension
// ---------------------------------------------------------------------------

/// Optional-aware field access shared by the `_?._` binding.
fn optional_select(operand: &Value, field: &str) -> EvalResult<Value> {
    match operand {
        Value::Optional(OptionalValue::Absent) => Ok(Value::optional_none()),
        Value::Optional(OptionalValue::Present(inner)) => optional_select(inner, field),
        Value::Map(map) => {
            let key = MapKey::String(field.into());
            Ok(map
                .get(&key)
                .cloned()
                .map_or_else(Value::optional_none, Value::optional_of))
        }
        Value::Struct(st) => Ok(st
            .field(field)
            .cloned()
            .map_or_else(Value::optional_none, Value::optional_of)),
        other => Err(CelError::no_matching_overload_value(operators::OPT_SELECT, other)),
    }
}

fn optional_index(operand: &Value, index: &Value) -> EvalResult<Value> {
    match operand {
        Value::Optional(OptionalValue::Absent) => Ok(Value::optional_none()),
        Value::Optional(OptionalValue::Present(inner)) => optional_index(inner, index),
        Value::List(list) => {
            let i = match index {
                Value::Int(i) => *i,
                Value::Uint(u) => i64::try_from(*u).unwrap_or(-1),
                _ => return Ok(Value::optional_none()),
            };
            Ok(usize::try_from(i)
                .ok()
                .and_then(|i| list.get(i))
                .cloned()
                .map_or_else(Value::optional_none, Value::optional_of))
        }
        Value::Map(map) => {
            let key = MapKey::from_value(index)?;
            Ok(map
                .get(&key)
                .cloned()
                .map_or_else(Value::optional_none, Value::optional_of))
        }
        other => Err(CelError::no_matching_overload_value(operators::OPT_INDEX, other)),
    }
}

fn install_optional_extension(regs: &mut Registrations) -> Result<(), EnvError> {
    let a = || CelType::type_param("A");
    let tp = || vec!["A".to_string()];

    regs.declare(
        "optional.of",
        OverloadDecl::global("optional_of_dyn", vec![a()], CelType::optional(a()))
            .with_type_params(tp())
            .foldable(),
        Some(binding(|args| Ok(Value::optional_of(args[0].clone())))),
    )?;
    regs.declare(
        "optional.ofNonZeroValue",
        OverloadDecl::global("optional_of_non_zero_value_dyn", vec![a()], CelType::optional(a()))
            .with_type_params(tp())
            .foldable(),
        Some(binding(|args| {
            if args[0].is_zero_value() {
                Ok(Value::optional_none())
            } else {
                Ok(Value::optional_of(args[0].clone()))
            }
        })),
    )?;
    regs.declare(
        "optional.none",
        OverloadDecl::global("optional_none", vec![], CelType::optional(CelType::Dyn)).foldable(),
        Some(binding(|_args| Ok(Value::optional_none()))),
    )?;
    regs.declare(
        "hasValue",
        OverloadDecl::member("optional_has_value", vec![CelType::optional(a())], CelType::Bool)
            .with_type_params(tp())
            .foldable(),
        Some(binding(|args| match &args[0] {
            Value::Optional(o) => Ok(Value::Bool(matches!(o, OptionalValue::Present(_)))),
            _ => Err(CelError::no_matching_overload("hasValue")),
        })),
    )?;
    regs.declare(
        "value",
        OverloadDecl::member("optional_value", vec![CelType::optional(a())], a())
            .with_type_params(tp())
            .foldable(),
        Some(binding(|args| match &args[0] {
            Value::Optional(OptionalValue::Present(v)) => Ok((**v).clone()),
            Value::Optional(OptionalValue::Absent) => {
                Err(CelError::invalid_argument("optional.none() dereference"))
            }
            _ => Err(CelError::no_matching_overload("value")),
        })),
    )?;
    regs.declare(
        "or",
        OverloadDecl::member(
            "optional_or_optional",
            vec![CelType::optional(a()), CelType::optional(a())],
            CelType::optional(a()),
        )
        .with_type_params(tp())
        .foldable(),
        Some(binding(|args| match (&args[0], &args[1]) {
            (Value::Optional(OptionalValue::Present(_)), _) => Ok(args[0].clone()),
            (Value::Optional(OptionalValue::Absent), Value::Optional(_)) => Ok(args[1].clone()),
            _ => Err(CelError::no_matching_overload("or")),
        })),
    )?;
    regs.declare(
        "orValue",
        OverloadDecl::member("optional_or_value", vec![CelType::optional(a()), a()], a())
            .with_type_params(tp())
            .foldable(),
        Some(binding(|args| match &args[0] {
            Value::Optional(OptionalValue::Present(v)) => Ok((**v).clone()),
            Value::Optional(OptionalValue::Absent) => Ok(args[1].clone()),
            _ => Err(CelError::no_matching_overload("orValue")),
        })),
    )?;
    regs.declare(
        operators::OPT_SELECT,
        OverloadDecl::global(
            "select_optional_field",
            vec![CelType::Dyn, CelType::String],
            CelType::optional(CelType::Dyn),
        )
        .foldable(),
        Some(binding(|args| match &args[1] {
            Value::String(field) => optional_select(&args[0], field),
            _ => Err(CelError::no_matching_overload(operators::OPT_SELECT)),
        })),
    )?;
    regs.declare(
        operators::OPT_INDEX,
        OverloadDecl::global(
            "optindex_dyn_dyn",
            vec![CelType::Dyn, CelType::Dyn],
            CelType::optional(CelType::Dyn),
        )
        .foldable(),
        Some(binding(|args| optional_index(&args[0], &args[1]))),
    )?;
    Ok(())
}
