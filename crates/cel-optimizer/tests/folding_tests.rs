//! Constant folding: literal evaluation, boolean shortcuts, optional
//! pruning, and the equivalence/idempotence laws.

use cel_core::{
    unparse, CelType, Env, FunctionDecl, MapActivation, OverloadDecl, StructDecl, Value,
};
use cel_optimizer::{ConstantFoldingOptimizer, Optimizer};
use cel_parser::parse;
use pretty_assertions::assert_eq;

fn env() -> Env {
    Env::builder()
        .extension("optional", 2)
        .extension("bindings", 1)
        .register_struct(
            StructDecl::new("TestAllTypes")
                .field("single_int32", CelType::Int)
                .field("single_int64", CelType::Int),
        )
        .variable("x", CelType::String)
        .variable("n", CelType::Int)
        .build()
        .unwrap()
}

fn folded(env: &Env, source: &str) -> String {
    let ast = parse(source).unwrap_or_else(|e| panic!("parse '{source}': {e}"));
    let out = ConstantFoldingOptimizer::new()
        .optimize(env, &ast)
        .unwrap_or_else(|e| panic!("fold '{source}': {e}"));
    unparse(&out)
}

#[test]
fn arithmetic_folds_to_literals() {
    let env = env();
    assert_eq!(folded(&env, "1 + 2 * 3"), "7");
    assert_eq!(folded(&env, "size(\"hello\") + 1"), "6");
    assert_eq!(folded(&env, "[1, 2, 3][1]"), "2");
    assert_eq!(folded(&env, "\"a\" + \"b\" + \"c\""), "\"abc\"");
    assert_eq!(folded(&env, "10 % 3 == 1"), "true");
}

#[test]
fn folded_ternary_keeps_the_live_branch() {
    let env = env();
    assert_eq!(
        folded(&env, "false ? x + 'world' : 'hello' + 'world'"),
        "\"helloworld\""
    );
    assert_eq!(folded(&env, "true ? n + 1 : n - 1"), "n + 1");
}

#[test]
fn boolean_identities() {
    let env = env();
    assert_eq!(folded(&env, "(n > 1) && true"), "n > 1");
    assert_eq!(folded(&env, "(n > 1) || false"), "n > 1");
    assert_eq!(folded(&env, "(n > 1) && false"), "false");
    assert_eq!(folded(&env, "(n > 1) || true"), "true");
}

#[test]
fn errors_are_left_for_the_runtime() {
    let env = env();
    // 1 / 0 must not fold into anything; the expression shape survives
    assert_eq!(folded(&env, "1 / 0"), "1 / 0");
    assert_eq!(folded(&env, "n + 1 / 0"), "n + 1 / 0");
    // dead branches can still hide errors harmlessly
    assert_eq!(folded(&env, "false ? 1 / 0 : 42"), "42");
}

#[test]
fn variables_do_not_fold() {
    let env = env();
    assert_eq!(folded(&env, "n + 1"), "n + 1");
    assert_eq!(folded(&env, "x.contains(\"a\")"), "x.contains(\"a\")");
}

#[test]
fn optional_entries_prune() {
    let env = env();
    assert_eq!(
        folded(
            &env,
            "TestAllTypes{?single_int64: optional.ofNonZeroValue(0), ?single_int32: optional.of(4)}"
        ),
        "TestAllTypes{single_int32: 4}"
    );
    assert_eq!(folded(&env, "[?optional.none(), 1]"), "[1]");
    assert_eq!(folded(&env, "[?optional.of(2), 1]"), "[2, 1]");
    assert_eq!(folded(&env, "[?optional.ofNonZeroValue(7)]"), "[7]");
    assert_eq!(
        folded(&env, "{?\"k\": optional.ofNonZeroValue(0u)}"),
        "{}"
    );
}

#[test]
fn presence_test_on_struct_literal_folds() {
    let env = env();
    assert_eq!(folded(&env, "has(TestAllTypes{single_int32: 4}.single_int32)"), "true");
    assert_eq!(folded(&env, "has(TestAllTypes{single_int32: 4}.single_int64)"), "false");
}

#[test]
fn comprehensions_are_not_folded() {
    let env = env();
    assert_eq!(folded(&env, "[1, 2].map(i, i * 2)"), "[1, 2].map(i, i * 2)");
}

#[test]
fn user_functions_fold_only_when_opted_in() {
    let base = Env::builder().function(
        FunctionDecl::new("twice")
            .overload(OverloadDecl::global("twice_int", vec![CelType::Int], CelType::Int)),
    );
    let opaque = base
        .binding("twice_int", |args| match args {
            [Value::Int(i)] => Ok(Value::Int(i * 2)),
            _ => unreachable!("dispatch is kind-checked"),
        })
        .build()
        .unwrap();
    assert_eq!(folded(&opaque, "twice(21)"), "twice(21)");

    let pure = Env::builder()
        .function(FunctionDecl::new("twice").overload(
            OverloadDecl::global("twice_int", vec![CelType::Int], CelType::Int).foldable(),
        ))
        .binding("twice_int", |args| match args {
            [Value::Int(i)] => Ok(Value::Int(i * 2)),
            _ => unreachable!("dispatch is kind-checked"),
        })
        .build()
        .unwrap();
    assert_eq!(folded(&pure, "twice(21)"), "42");
}

#[test]
fn folding_is_idempotent() {
    let env = env();
    for source in [
        "1 + 2 * 3",
        "false ? x + 'world' : 'hello' + 'world'",
        "(n > 1) && true",
        "[?optional.none(), 1]",
        "n + 1 / 0",
    ] {
        let ast = parse(source).unwrap();
        let once = ConstantFoldingOptimizer::new().optimize(&env, &ast).unwrap();
        let twice = ConstantFoldingOptimizer::new().optimize(&env, &once).unwrap();
        assert_eq!(twice, once, "folding not idempotent for '{source}'");
    }
}

#[test]
fn folding_preserves_evaluation() {
    let env = env();
    let mut activation = MapActivation::new();
    activation.bind("x", Value::from("hi"));
    activation.bind("n", Value::Int(5));
    for source in [
        "n + 1 + 2",
        "n > 1 ? x + \"!\" : x",
        "size([1, 2]) + n",
        "x.contains(\"h\") && true",
        "[1, 2, 3].map(i, i + size(\"ab\"))[0]",
    ] {
        let ast = parse(source).unwrap();
        let plain = env
            .plan(&env.check(&ast).unwrap())
            .unwrap()
            .eval(&activation)
            .unwrap();
        let optimized = ConstantFoldingOptimizer::new().optimize(&env, &ast).unwrap();
        let folded = env
            .plan(&env.check(&optimized).unwrap())
            .unwrap()
            .eval(&activation)
            .unwrap();
        assert_eq!(folded, plain, "folding changed the result of '{source}'");
    }
}
