//! End-to-end evaluation: source → parse → check → plan → eval.

use cel_core::ast::factory::ExprFactory;
use cel_core::ast::{Ast, SourceInfo};
use cel_core::{
    Activation, CelError, CelType, EmptyActivation, Env, ErrorKind, EvalOptions, FunctionDecl,
    MapActivation, MapFunctionResolver, OverloadDecl, StructDecl, UnknownSet, Value,
};
use cel_parser::parse;

fn base_env() -> Env {
    Env::builder()
        .extension("optional", 2)
        .extension("bindings", 1)
        .register_struct(
            StructDecl::new("TestAllTypes")
                .field("single_int32", CelType::Int)
                .field("single_int64", CelType::Int)
                .field("single_any", CelType::Any),
        )
        .build()
        .expect("environment builds")
}

fn eval_in(env: &Env, source: &str, activation: &dyn Activation) -> Result<Value, CelError> {
    let ast = parse(source).unwrap_or_else(|e| panic!("parse '{source}': {e}"));
    let checked = env
        .check(&ast)
        .unwrap_or_else(|e| panic!("check '{source}': {e}"));
    env.plan(&checked).expect("plan succeeds").eval(activation)
}

fn eval(source: &str) -> Result<Value, CelError> {
    eval_in(&base_env(), source, &EmptyActivation)
}

fn eval_ok(source: &str) -> Value {
    eval(source).unwrap_or_else(|e| panic!("eval '{source}': {e}"))
}

fn eval_err(source: &str) -> CelError {
    match eval(source) {
        Ok(value) => panic!("expected '{source}' to fail, got {value}"),
        Err(err) => err,
    }
}

// ---------------------------------------------------------------------------
// Short-circuit and error absorption
// ---------------------------------------------------------------------------

#[test]
fn short_circuit_absorbs_errors() {
    assert_eq!(eval_ok("false && (1 / 0 == 0)"), Value::Bool(false));
    assert_eq!(eval_ok("true || (1 / 0 == 0)"), Value::Bool(true));
    assert_eq!(eval_ok("(1 / 0 == 0) || true"), Value::Bool(true));
    assert_eq!(eval_ok("(1 / 0 == 0) && false"), Value::Bool(false));
}

#[test]
fn non_definitive_operand_propagates_the_error() {
    assert_eq!(eval_err("(1 / 0 == 0) && true").kind(), ErrorKind::DivisionByZero);
    assert_eq!(eval_err("false || (1 / 0 == 0)").kind(), ErrorKind::DivisionByZero);
}

#[test]
fn conditional_branches_lazily() {
    assert_eq!(eval_ok("1 < 2 ? \"a\" : \"b\""), Value::from("a"));
    assert_eq!(eval_ok("false ? 1 / 0 : 42"), Value::Int(42));
    assert_eq!(eval_err("true ? 1 / 0 : 42").kind(), ErrorKind::DivisionByZero);
}

#[test]
fn unknowns_are_preferred_over_errors_and_absorbed_by_identities() {
    let env = Env::builder().variable("u", CelType::Bool).build().unwrap();
    let mut activation = MapActivation::new();
    activation.bind("u", Value::unknown(UnknownSet::single("u")));
    assert_eq!(eval_in(&env, "u && false", &activation).unwrap(), Value::Bool(false));
    assert_eq!(eval_in(&env, "u || true", &activation).unwrap(), Value::Bool(true));
    let out = eval_in(&env, "u && (1 / 0 == 0)", &activation).unwrap();
    assert!(matches!(out, Value::Unknown(_)), "unknown wins over error, got {out}");
}

// ---------------------------------------------------------------------------
// Arithmetic boundaries
// ---------------------------------------------------------------------------

#[test]
fn integer_overflow_fails() {
    assert_eq!(eval_err("9223372036854775807 + 1").kind(), ErrorKind::Overflow);
    assert_eq!(eval_err("-9223372036854775808 - 1").kind(), ErrorKind::Overflow);
    assert_eq!(eval_err("18446744073709551615u + 1u").kind(), ErrorKind::Overflow);
    // the smallest int literal itself is representable
    assert_eq!(eval_ok("-9223372036854775808 + 1"), Value::Int(i64::MIN + 1));
}

#[test]
fn division_and_modulo() {
    assert_eq!(eval_err("1 / 0").kind(), ErrorKind::DivisionByZero);
    assert_eq!(eval_err("1 % 0").kind(), ErrorKind::DivisionByZero);
    assert_eq!(eval_ok("7 / 2"), Value::Int(3));
    assert_eq!(eval_ok("5 % 3"), Value::Int(2));
    assert_eq!(eval_ok("5u % 3u"), Value::Uint(2));
    let Value::Double(inf) = eval_ok("1.0 / 0.0") else {
        panic!("expected double");
    };
    assert!(inf.is_infinite() && inf > 0.0);
    let Value::Double(nan) = eval_ok("0.0 / 0.0") else {
        panic!("expected double");
    };
    assert!(nan.is_nan());
}

#[test]
fn nan_compares_unequal_to_everything() {
    assert_eq!(eval_ok("0.0 / 0.0 == 0.0 / 0.0"), Value::Bool(false));
    assert_eq!(eval_ok("0.0 / 0.0 != 0.0 / 0.0"), Value::Bool(true));
    assert_eq!(eval_ok("0.0 / 0.0 < 1.0"), Value::Bool(false));
    assert_eq!(eval_ok("0.0 / 0.0 >= 1.0"), Value::Bool(false));
}

#[test]
fn cross_numeric_comparison_is_mathematical() {
    assert_eq!(eval_ok("1 == 1u"), Value::Bool(true));
    assert_eq!(eval_ok("1 == 1.0"), Value::Bool(true));
    assert_eq!(eval_ok("-1 < 0u"), Value::Bool(true));
    assert_eq!(eval_ok("2u < 2.5"), Value::Bool(true));
    assert_eq!(eval_ok("1.5 > 1"), Value::Bool(true));
}

#[test]
fn heterogeneous_equality_is_false() {
    assert_eq!(eval_ok("1 == \"1\""), Value::Bool(false));
    assert_eq!(eval_ok("null == false"), Value::Bool(false));
    assert_eq!(eval_ok("null == null"), Value::Bool(true));
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[test]
fn list_and_map_access() {
    assert_eq!(eval_ok("[[1, 2], [3]][0][1]"), Value::Int(2));
    assert_eq!(eval_ok("{\"a\": 1}[\"a\"]"), Value::Int(1));
    assert_eq!(eval_err("{\"a\": 1}[\"b\"]").kind(), ErrorKind::NoSuchKey);
    assert_eq!(eval_err("{\"a\": 1}.b").kind(), ErrorKind::NoSuchKey);
    assert_eq!(eval_err("[1, 2][5]").kind(), ErrorKind::InvalidArgument);
}

#[test]
fn presence_tests_never_fail_for_missing_entries() {
    assert_eq!(eval_ok("has({\"a\": 1}.a)"), Value::Bool(true));
    assert_eq!(eval_ok("has({\"a\": 1}.b)"), Value::Bool(false));
}

#[test]
fn repeated_map_keys_fail() {
    assert_eq!(eval_err("{1: \"a\", 1u: \"b\"}").kind(), ErrorKind::InvalidArgument);
}

#[test]
fn membership() {
    assert_eq!(eval_ok("2 in [1, 2]"), Value::Bool(true));
    assert_eq!(eval_ok("3 in [1, 2]"), Value::Bool(false));
    assert_eq!(eval_ok("\"k\" in {\"k\": 1}"), Value::Bool(true));
}

#[test]
fn size_counts_code_points() {
    assert_eq!(eval_ok("size(\"hello\")"), Value::Int(5));
    assert_eq!(eval_ok("\"hello\".size()"), Value::Int(5));
    assert_eq!(eval_ok("size(b\"abc\")"), Value::Int(3));
    assert_eq!(eval_ok("size([1, 2, 3])"), Value::Int(3));
    assert_eq!(eval_ok("size({\"a\": 1})"), Value::Int(1));
}

#[test]
fn concatenation() {
    assert_eq!(eval_ok("\"foo\" + \"bar\""), Value::from("foobar"));
    assert_eq!(eval_ok("b\"a\" + b\"b\" == b\"ab\""), Value::Bool(true));
    assert_eq!(eval_ok("[1] + [2, 3] == [1, 2, 3]"), Value::Bool(true));
}

// ---------------------------------------------------------------------------
// Strings and conversions
// ---------------------------------------------------------------------------

#[test]
fn string_functions() {
    assert_eq!(eval_ok("\"hello\".contains(\"ell\")"), Value::Bool(true));
    assert_eq!(eval_ok("\"hello\".startsWith(\"he\")"), Value::Bool(true));
    assert_eq!(eval_ok("\"hello\".endsWith(\"lo\")"), Value::Bool(true));
    assert_eq!(eval_ok("\"abc\".matches(\"^a.c$\")"), Value::Bool(true));
    assert_eq!(eval_err("\"abc\".matches(\"(\")").kind(), ErrorKind::InvalidArgument);
}

#[test]
fn conversions() {
    assert_eq!(eval_ok("int(\"42\")"), Value::Int(42));
    assert_eq!(eval_ok("int(2.9)"), Value::Int(2));
    assert_eq!(eval_ok("uint(7)"), Value::Uint(7));
    assert_eq!(eval_ok("double(\"0.5\")"), Value::Double(0.5));
    assert_eq!(eval_ok("string(42)"), Value::from("42"));
    assert_eq!(eval_ok("string(1.0)"), Value::from("1.0"));
    assert_eq!(eval_ok("string(true)"), Value::from("true"));
    assert_eq!(eval_ok("bytes(\"ab\") == b\"ab\""), Value::Bool(true));
    assert_eq!(eval_ok("bool(\"true\")"), Value::Bool(true));
    assert_eq!(eval_err("int(\"abc\")").kind(), ErrorKind::ConversionFailure);
    assert_eq!(eval_err("int(18446744073709551615u)").kind(), ErrorKind::ConversionFailure);
}

#[test]
fn type_function() {
    assert_eq!(eval_ok("type(1) == int"), Value::Bool(true));
    assert_eq!(eval_ok("type(\"a\") == string"), Value::Bool(true));
    assert_eq!(eval_ok("type(1) == type(2)"), Value::Bool(true));
    assert_eq!(eval_ok("type(1) == double"), Value::Bool(false));
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

#[test]
fn timestamp_and_duration_arithmetic() {
    assert_eq!(
        eval_ok("timestamp(\"2001-01-01T00:00:00Z\") + duration(\"24h\") == timestamp(\"2001-01-02T00:00:00Z\")"),
        Value::Bool(true)
    );
    assert_eq!(
        eval_ok("timestamp(\"2001-01-02T00:00:00Z\") - timestamp(\"2001-01-01T00:00:00Z\") == duration(\"24h\")"),
        Value::Bool(true)
    );
    assert_eq!(eval_ok("duration(\"90m\") == duration(\"1h30m\")"), Value::Bool(true));
    assert_eq!(
        eval_err("timestamp(\"9999-12-31T23:59:59Z\") + duration(\"24h\")").kind(),
        ErrorKind::Overflow
    );
}

#[test]
fn duration_division_preserves_subsecond_remainders() {
    assert_eq!(eval_ok("duration(\"3s\") / 2 == duration(\"1.5s\")"), Value::Bool(true));
    assert_eq!(eval_ok("string(duration(\"3s\") / 2)"), Value::from("1.5s"));
}

#[test]
fn time_accessors() {
    assert_eq!(eval_ok("timestamp(\"2001-02-03T04:05:06Z\").getFullYear()"), Value::Int(2001));
    assert_eq!(eval_ok("timestamp(\"2001-02-03T04:05:06Z\").getMonth()"), Value::Int(1));
    assert_eq!(eval_ok("timestamp(\"2001-02-03T04:05:06Z\").getDate()"), Value::Int(3));
    assert_eq!(eval_ok("timestamp(\"2001-02-03T04:05:06Z\").getSeconds()"), Value::Int(6));
    assert_eq!(eval_ok("duration(\"90m\").getHours()"), Value::Int(1));
    assert_eq!(eval_ok("duration(\"90m\").getMinutes()"), Value::Int(90));
}

// ---------------------------------------------------------------------------
// Comprehensions
// ---------------------------------------------------------------------------

#[test]
fn comprehension_macros() {
    assert_eq!(eval_ok("[1, 2, 3].exists(i, i > 2)"), Value::Bool(true));
    assert_eq!(eval_ok("[1, 2, 3].all(i, i > 0)"), Value::Bool(true));
    assert_eq!(eval_ok("[1, 2, 3].all(i, i > 1)"), Value::Bool(false));
    assert_eq!(eval_ok("[].all(i, i > 0)"), Value::Bool(true));
    assert_eq!(eval_ok("[1, 2, 3].exists_one(i, i == 2)"), Value::Bool(true));
    assert_eq!(eval_ok("[1, 2, 2].exists_one(i, i == 2)"), Value::Bool(false));
    assert_eq!(
        eval_ok("[1, 2, 3, 4].filter(i, i % 2 == 0) == [2, 4]"),
        Value::Bool(true)
    );
    assert_eq!(eval_ok("[1, 2, 3].map(i, i * 2) == [2, 4, 6]"), Value::Bool(true));
    assert_eq!(
        eval_ok("[1, 2, 3, 4].map(i, i % 2 == 0, i * 10) == [20, 40]"),
        Value::Bool(true)
    );
}

#[test]
fn map_comprehension_iterates_keys_in_insertion_order() {
    assert_eq!(
        eval_ok("{\"a\": 1, \"b\": 2}.map(k, k) == [\"a\", \"b\"]"),
        Value::Bool(true)
    );
}

#[test]
fn exists_absorbs_errors_when_a_hit_is_found() {
    assert_eq!(eval_ok("[0, 1].exists(i, 1 / i == 1)"), Value::Bool(true));
    assert_eq!(eval_err("[0, 2].exists(i, 1 / i == 1)").kind(), ErrorKind::DivisionByZero);
}

#[test]
fn comprehension_over_non_aggregate_fails_at_runtime() {
    let env = Env::builder().variable("x", CelType::Dyn).build().unwrap();
    let mut activation = MapActivation::new();
    activation.bind("x", Value::Int(5));
    let err = eval_in(&env, "x.map(i, i)", &activation).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoMatchingOverload);
}

#[test]
fn iteration_limit_bounds_nested_comprehensions() {
    let env = base_env();
    let source = "[1, 2, 3].map(i, [1, 2, 3].map(j, i * j))";
    let ast = parse(source).unwrap();
    let checked = env.check(&ast).unwrap();

    let tight = env
        .plan_with_options(&checked, EvalOptions::default().with_max_iterations(2))
        .unwrap();
    let err = tight.eval(&EmptyActivation).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IterationLimitExceeded);

    let roomy = env
        .plan_with_options(&checked, EvalOptions::default().with_max_iterations(100))
        .unwrap();
    let expected = Value::list(vec![
        Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        Value::list(vec![Value::Int(2), Value::Int(4), Value::Int(6)]),
        Value::list(vec![Value::Int(3), Value::Int(6), Value::Int(9)]),
    ]);
    assert_eq!(roomy.eval(&EmptyActivation).unwrap(), expected);
}

#[test]
fn within_limit_evaluation_never_raises_the_limit_error() {
    let env = base_env();
    let ast = parse("[1, 2].map(i, i)").unwrap();
    let checked = env.check(&ast).unwrap();
    // exactly as many steps as elements
    let program = env
        .plan_with_options(&checked, EvalOptions::default().with_max_iterations(2))
        .unwrap();
    assert!(program.eval(&EmptyActivation).is_ok());
}

#[test]
fn bind_macro_binds_a_name() {
    assert_eq!(eval_ok("cel.bind(x, 5, x + x)"), Value::Int(10));
    assert_eq!(
        eval_ok("cel.bind(first, [1, 2][0], first * 10 + first)"),
        Value::Int(11)
    );
}

#[test]
fn two_variable_comprehension_binds_index_and_value() {
    // sum of index * value over [10, 20, 30], built on the raw primitive
    let env = base_env();
    let mut fx = ExprFactory::new(1);
    let ten = fx.int(10);
    let twenty = fx.int(20);
    let thirty = fx.int(30);
    let range = fx.list(vec![ten, twenty, thirty]);
    let init = fx.int(0);
    let cond = fx.bool(true);
    let sum = fx.ident("sum");
    let i = fx.ident("i");
    let v = fx.ident("v");
    let product = fx.global_call(cel_core::operators::MULTIPLY, vec![i, v]);
    let step = fx.global_call(cel_core::operators::ADD, vec![sum, product]);
    let result = fx.ident("sum");
    let comp = fx.comprehension("i", Some("v".to_string()), range, "sum", init, cond, step, result);
    let ast = Ast::new(comp, SourceInfo::default());
    let program = env.plan_unchecked(&ast).unwrap();
    // 0*10 + 1*20 + 2*30
    assert_eq!(program.eval(&EmptyActivation).unwrap(), Value::Int(80));
}

// ---------------------------------------------------------------------------
// Structs and optionals
// ---------------------------------------------------------------------------

#[test]
fn struct_construction_and_access() {
    assert_eq!(eval_ok("TestAllTypes{single_int32: 4}.single_int32"), Value::Int(4));
    assert_eq!(eval_ok("has(TestAllTypes{single_int32: 4}.single_int32)"), Value::Bool(true));
    assert_eq!(eval_ok("has(TestAllTypes{single_int32: 4}.single_int64)"), Value::Bool(false));
    assert_eq!(
        eval_err("TestAllTypes{single_int32: 4}.single_int64").kind(),
        ErrorKind::NoSuchField
    );
}

#[test]
fn optional_struct_fields_prune_at_construction() {
    assert_eq!(
        eval_ok("has(TestAllTypes{?single_int32: optional.ofNonZeroValue(0)}.single_int32)"),
        Value::Bool(false)
    );
    assert_eq!(
        eval_ok("TestAllTypes{?single_int32: optional.of(4)}.single_int32"),
        Value::Int(4)
    );
}

#[test]
fn optional_values() {
    assert_eq!(eval_ok("optional.of(1).value()"), Value::Int(1));
    assert_eq!(eval_ok("optional.of(1).hasValue()"), Value::Bool(true));
    assert_eq!(eval_ok("optional.none().hasValue()"), Value::Bool(false));
    assert_eq!(eval_ok("optional.none().orValue(42)"), Value::Int(42));
    assert_eq!(eval_ok("optional.none().or(optional.of(7)).value()"), Value::Int(7));
    assert_eq!(eval_err("optional.none().value()").kind(), ErrorKind::InvalidArgument);
}

#[test]
fn optional_select_and_index() {
    assert_eq!(eval_ok("{\"a\": 1}.?a.hasValue()"), Value::Bool(true));
    assert_eq!(eval_ok("{\"a\": 1}.?b.hasValue()"), Value::Bool(false));
    assert_eq!(eval_ok("{\"a\": 1}.?a.value()"), Value::Int(1));
    assert_eq!(eval_ok("[1, 2][?5].hasValue()"), Value::Bool(false));
    assert_eq!(eval_ok("[1, 2][?1].value()"), Value::Int(2));
}

#[test]
fn optional_aggregate_entries() {
    assert_eq!(
        eval_ok("[1, ?optional.none(), ?optional.of(3)] == [1, 3]"),
        Value::Bool(true)
    );
    assert_eq!(
        eval_ok("{?\"k\": optional.of(1), ?\"gone\": optional.none()} == {\"k\": 1}"),
        Value::Bool(true)
    );
}

// ---------------------------------------------------------------------------
// Variables and resolution
// ---------------------------------------------------------------------------

#[test]
fn activation_variables() {
    let env = Env::builder().variable("x", CelType::Int).build().unwrap();
    let mut activation = MapActivation::new();
    activation.bind("x", Value::Int(21));
    assert_eq!(eval_in(&env, "x * 2", &activation).unwrap(), Value::Int(42));
}

#[test]
fn unbound_variable_is_an_attribute_error() {
    let env = Env::builder().variable("x", CelType::Int).build().unwrap();
    let err = eval_in(&env, "x + 1", &EmptyActivation).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AttributeNotFound);
}

#[test]
fn container_expands_unqualified_names() {
    let env = Env::builder()
        .container("a.b")
        .variable("a.b.x", CelType::Int)
        .build()
        .unwrap();
    let mut activation = MapActivation::new();
    activation.bind("a.b.x", Value::Int(41));
    assert_eq!(eval_in(&env, "x + 1", &activation).unwrap(), Value::Int(42));
}

#[test]
fn parse_only_plans_resolve_at_runtime() {
    let env = Env::builder().container("a.b").build().unwrap();
    let mut activation = MapActivation::new();
    activation.bind("a.b.x", Value::Int(41));
    let ast = parse("x + 1").unwrap();
    let program = env.plan_unchecked(&ast).unwrap();
    assert_eq!(program.eval(&activation).unwrap(), Value::Int(42));

    // the bare name is tried last
    let mut bare = MapActivation::new();
    bare.bind("x", Value::Int(1));
    assert_eq!(program.eval(&bare).unwrap(), Value::Int(2));
}

#[test]
fn parse_only_select_chains_prefer_the_qualified_name() {
    let env = Env::builder().build().unwrap();
    let ast = parse("a.b + 1").unwrap();
    let program = env.plan_unchecked(&ast).unwrap();

    // a bound qualified name wins
    let mut qualified = MapActivation::new();
    qualified.bind("a.b", Value::Int(9));
    assert_eq!(program.eval(&qualified).unwrap(), Value::Int(10));

    // otherwise the root binds and the field qualifies it
    let mut nested = MapActivation::new();
    let mut map = cel_core::MapValue::new();
    map.insert(cel_core::MapKey::String("b".into()), Value::Int(4));
    nested.bind("a", Value::map(map));
    assert_eq!(program.eval(&nested).unwrap(), Value::Int(5));
}

#[test]
fn late_bound_functions_dispatch_through_the_resolver() {
    let env = Env::builder()
        .function(FunctionDecl::new("shake").overload(
            OverloadDecl::global("shake_int", vec![CelType::Int], CelType::Int).late_bound(),
        ))
        .build()
        .unwrap();
    let ast = parse("shake(20)").unwrap();
    let checked = env.check(&ast).unwrap();
    let program = env.plan(&checked).unwrap();

    let mut functions = MapFunctionResolver::new();
    functions.bind("shake_int", |args| match args {
        [Value::Int(i)] => Ok(Value::Int(i * 2 + 2)),
        _ => Err(CelError::no_matching_overload("shake")),
    });
    assert_eq!(
        program.eval_with_functions(&EmptyActivation, &functions).unwrap(),
        Value::Int(42)
    );

    // without a resolver the call cannot be satisfied
    let err = program.eval(&EmptyActivation).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoMatchingOverload);
}

#[test]
fn host_functions_bind_by_overload_id() {
    let env = Env::builder()
        .function(FunctionDecl::new("double").overload(OverloadDecl::global(
            "double_int",
            vec![CelType::Int],
            CelType::Int,
        )))
        .binding("double_int", |args| match args {
            [Value::Int(i)] => Ok(Value::Int(i * 2)),
            _ => Err(CelError::no_matching_overload("double")),
        })
        .build()
        .unwrap();
    assert_eq!(eval_in(&env, "double(21)", &EmptyActivation).unwrap(), Value::Int(42));
}

#[test]
fn runtime_errors_carry_source_offsets() {
    let err = eval_err("1 + 1 / 0");
    assert!(err.offset().is_some(), "error should be localized: {err}");
}
