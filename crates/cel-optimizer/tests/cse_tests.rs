//! Common-subexpression elimination in both emission styles.

use cel_core::ast::ExprKind;
use cel_core::{unparse, CelType, EmptyActivation, Env, FunctionDecl, OverloadDecl, Value};
use cel_optimizer::{CseStyle, OptimizeError, Optimizer, OptimizerConfig, SubexpressionOptimizer};
use cel_parser::parse;
use pretty_assertions::assert_eq;

fn env() -> Env {
    Env::builder()
        .extension("bindings", 1)
        .variable("n", CelType::Int)
        .build()
        .unwrap()
}

fn eval(env: &Env, ast: &cel_core::ast::Ast) -> Value {
    let checked = env.check(ast).unwrap_or_else(|e| panic!("check: {e}"));
    env.plan(&checked)
        .unwrap()
        .eval(&EmptyActivation)
        .unwrap_or_else(|e| panic!("eval: {e}"))
}

#[test]
fn bind_emission_matches_the_canonical_shape() {
    let env = env();
    let source = "size([0]) + size([0]) + size([1,2]) + size([1,2]) == 6";
    let ast = parse(source).unwrap();
    let optimized = SubexpressionOptimizer::new_bind().optimize(&env, &ast).unwrap();
    assert_eq!(
        unparse(&optimized),
        "cel.bind(@r1, size([1, 2]), cel.bind(@r0, size([0]), @r0 + @r0) + @r1 + @r1) == 6"
    );
    assert_eq!(eval(&env, &optimized), Value::Bool(true));
}

#[test]
fn block_emission_flattens_into_one_block() {
    let env = env();
    let source = "size([0]) + size([0]) + size([1,2]) + size([1,2]) == 6";
    let ast = parse(source).unwrap();
    let optimized = SubexpressionOptimizer::new_block().optimize(&env, &ast).unwrap();
    assert_eq!(
        unparse(&optimized),
        "cel.@block([size([0]), size([1, 2])], @index0 + @index0 + @index1 + @index1 == 6)"
    );
    assert_eq!(eval(&env, &optimized), Value::Bool(true));
}

#[test]
fn nested_subexpressions_are_bound_inner_first() {
    let env = env();
    // size([0]) repeats on its own and inside a larger repeated expression
    let source = "(size([0]) + 1) * (size([0]) + 1) + size([0])";
    let ast = parse(source).unwrap();
    let optimized = SubexpressionOptimizer::new_block().optimize(&env, &ast).unwrap();
    // the inner size([0]) is extracted first; the repeated sum then
    // references it
    assert_eq!(
        unparse(&optimized),
        "cel.@block([size([0]), @index0 + 1], @index1 * @index1 + @index0)"
    );
    assert_eq!(eval(&env, &optimized), Value::Int(5));
}

#[test]
fn block_output_is_stable_under_a_second_pass() {
    let env = env();
    let source = "size([0]) + size([0]) == 2";
    let ast = parse(source).unwrap();
    let once = SubexpressionOptimizer::new_block().optimize(&env, &ast).unwrap();
    let twice = SubexpressionOptimizer::new_block().optimize(&env, &once).unwrap();
    assert_eq!(twice, once);
    // exactly one block at the root
    let mut blocks = 0;
    twice.root().visit(&mut |e| {
        if let ExprKind::Call(call) = &e.kind {
            if call.function == "cel.@block" {
                blocks += 1;
            }
        }
    });
    assert_eq!(blocks, 1);
}

#[test]
fn elimination_preserves_evaluation() {
    let env = env();
    for source in [
        "size([0]) + size([0]) + size([1,2]) + size([1,2]) == 6",
        "(size([0]) + 1) * (size([0]) + 1) + size([0])",
        "size(\"ab\") * size(\"ab\") + size(\"ab\")",
    ] {
        let ast = parse(source).unwrap();
        let plain = eval(&env, &ast);
        for optimizer in [
            SubexpressionOptimizer::new_bind(),
            SubexpressionOptimizer::new_block(),
        ] {
            let optimized = optimizer.optimize(&env, &ast).unwrap();
            assert_eq!(eval(&env, &optimized), plain, "for '{source}'");
        }
    }
}

#[test]
fn no_repeats_means_no_rewrite() {
    let env = env();
    let ast = parse("size([0]) + size([1])").unwrap();
    let optimized = SubexpressionOptimizer::new_bind().optimize(&env, &ast).unwrap();
    assert_eq!(unparse(&optimized), "size([0]) + size([1])");
    let optimized = SubexpressionOptimizer::new_block().optimize(&env, &ast).unwrap();
    assert_eq!(unparse(&optimized), "size([0]) + size([1])");
}

#[test]
fn comprehension_locals_are_not_extracted() {
    let env = env();
    // size([i]) depends on the iteration variable; moving it out of the
    // loop would unbind it
    let source = "[1, 2].map(i, size([i]) + size([i]))";
    let ast = parse(source).unwrap();
    let optimized = SubexpressionOptimizer::new_bind().optimize(&env, &ast).unwrap();
    assert_eq!(unparse(&optimized), "[1, 2].map(i, size([i]) + size([i]))");
}

#[test]
fn impure_functions_are_not_eliminated() {
    let env = Env::builder()
        .function(FunctionDecl::new("now").overload(OverloadDecl::global(
            "now_int",
            vec![CelType::Int],
            CelType::Int,
        )))
        .binding("now_int", |args| Ok(args[0].clone()))
        .build()
        .unwrap();
    let ast = parse("now(1) + now(1)").unwrap();
    let optimized = SubexpressionOptimizer::new_bind().optimize(&env, &ast).unwrap();
    assert_eq!(unparse(&optimized), "now(1) + now(1)");
}

#[test]
fn deep_subexpressions_flatten_under_a_depth_limit() {
    let env = env();
    let source = "size([0]) + size([0]) + size([size([1, 2]) + size([1, 2])])";
    let ast = parse(source).unwrap();
    let config = OptimizerConfig {
        subexpression_max_recursion_depth: 3,
        ..OptimizerConfig::default()
    };
    let optimized = SubexpressionOptimizer::with_config(CseStyle::Block, config)
        .optimize(&env, &ast)
        .unwrap();
    // still verifies and still evaluates the same
    assert_eq!(eval(&env, &optimized), eval(&env, &ast));
    let ExprKind::Call(call) = &optimized.root().kind else {
        panic!("expected block root");
    };
    assert_eq!(call.function, "cel.@block");
}

#[test]
fn verifier_reports_illegal_indices() {
    // hand-build a block whose body references a slot that does not exist
    use cel_core::ast::factory::ExprFactory;
    let env = env();
    let source = "size([0]) + size([0])";
    let ast = parse(source).unwrap();
    let blocked = SubexpressionOptimizer::new_block().optimize(&env, &ast).unwrap();
    // corrupt the body reference
    let mut fx = ExprFactory::new(blocked.max_id() + 1);
    let bogus = fx.ident("@index9");
    let body_id = {
        let ExprKind::Call(call) = &blocked.root().kind else {
            panic!("expected block root");
        };
        call.args[1].id
    };
    let corrupted = cel_core::ast::mutator::replace_subtree(&blocked, bogus, body_id);
    let err = SubexpressionOptimizer::new_block()
        .optimize(&env, &corrupted)
        .unwrap_err();
    assert!(
        matches!(
            err,
            OptimizeError::IllegalBlockIndex { .. } | OptimizeError::Verify(_)
        ),
        "{err:?}"
    );
}
