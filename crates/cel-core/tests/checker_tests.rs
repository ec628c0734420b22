//! Type checker: resolution, overload selection, and rejection.

use cel_core::ast::Reference;
use cel_core::{CelType, Env, EnumDecl, StructDecl};
use cel_parser::parse;

fn env() -> Env {
    Env::builder()
        .variable("name", CelType::String)
        .variable("sizes", CelType::list(CelType::Int))
        .variable("attrs", CelType::map(CelType::String, CelType::Dyn))
        .register_struct(
            StructDecl::new("test.Message")
                .field("id", CelType::Int)
                .field("tags", CelType::list(CelType::String)),
        )
        .register_enum(EnumDecl::new("test.Level").value("LOW", 0).value("HIGH", 10))
        .variable("msg", CelType::Struct("test.Message".to_string()))
        .extension("optional", 2)
        .build()
        .unwrap()
}

fn result_type(source: &str) -> CelType {
    let env = env();
    let ast = parse(source).unwrap();
    let checked = env
        .check(&ast)
        .unwrap_or_else(|e| panic!("check '{source}': {e}"));
    checked.result_type().clone()
}

fn check_fails(source: &str) -> String {
    let env = env();
    let ast = parse(source).unwrap();
    env.check(&ast)
        .expect_err(&format!("expected '{source}' to be rejected"))
        .to_string()
}

#[test]
fn literal_and_operator_types() {
    assert_eq!(result_type("1 + 2"), CelType::Int);
    assert_eq!(result_type("1.0 + 2.0"), CelType::Double);
    assert_eq!(result_type("\"a\" + \"b\""), CelType::String);
    assert_eq!(result_type("1 < 2"), CelType::Bool);
    assert_eq!(result_type("[1, 2]"), CelType::list(CelType::Int));
    assert_eq!(result_type("[1, \"a\"]"), CelType::list(CelType::Dyn));
    assert_eq!(
        result_type("{\"a\": 1}"),
        CelType::map(CelType::String, CelType::Int)
    );
}

#[test]
fn generic_overloads_substitute_type_parameters() {
    assert_eq!(result_type("sizes[0]"), CelType::Int);
    assert_eq!(result_type("[\"a\", \"b\"][0]"), CelType::String);
    assert_eq!(result_type("size(sizes)"), CelType::Int);
    // map values flow out of index expressions
    assert_eq!(result_type("attrs[\"k\"]"), CelType::Dyn);
}

#[test]
fn select_types_flow_from_declarations() {
    assert_eq!(result_type("msg.id"), CelType::Int);
    assert_eq!(result_type("msg.tags"), CelType::list(CelType::String));
    assert_eq!(result_type("has(msg.id)"), CelType::Bool);
    assert_eq!(result_type("attrs.anything"), CelType::Dyn);
}

#[test]
fn struct_construction_checks_fields() {
    assert_eq!(
        result_type("test.Message{id: 1, tags: [\"a\"]}"),
        CelType::Struct("test.Message".to_string())
    );
    let message = check_fails("test.Message{missing: 1}");
    assert!(message.contains("undefined field"), "{message}");
    let message = check_fails("test.Message{id: \"nope\"}");
    assert!(message.contains("expected 'int'"), "{message}");
}

#[test]
fn enum_constants_resolve_to_int() {
    assert_eq!(result_type("test.Level.HIGH"), CelType::Int);
    let env = env();
    let ast = parse("test.Level.HIGH").unwrap();
    let checked = env.check(&ast).unwrap();
    let reference = checked.reference(ast.root().id).expect("reference recorded");
    assert!(
        matches!(reference, Reference::Var { name, value: Some(_) } if name == "test.Level.HIGH"),
        "{reference:?}"
    );
}

#[test]
fn type_identifiers_are_type_values() {
    assert_eq!(result_type("int"), CelType::type_of(CelType::Int));
    assert_eq!(result_type("type(1)"), CelType::type_of(CelType::Int));
    assert_eq!(result_type("type(1) == int"), CelType::Bool);
}

#[test]
fn comprehension_scopes_type_their_variables() {
    assert_eq!(result_type("sizes.map(i, i * 2)"), CelType::list(CelType::Int));
    assert_eq!(result_type("sizes.exists(i, i > 0)"), CelType::Bool);
    assert_eq!(
        result_type("attrs.map(k, k)"),
        CelType::list(CelType::String)
    );
}

#[test]
fn undeclared_names_are_rejected() {
    let message = check_fails("nobody + 1");
    assert!(message.contains("undeclared reference to 'nobody'"), "{message}");
}

#[test]
fn overload_mismatches_are_rejected() {
    let message = check_fails("1 + \"a\"");
    assert!(message.contains("no matching overload"), "{message}");
    let message = check_fails("size(1)");
    assert!(message.contains("no matching overload"), "{message}");
    let message = check_fails("\"a\".contains(1)");
    assert!(message.contains("no matching overload"), "{message}");
}

#[test]
fn comprehension_range_must_be_aggregate() {
    let message = check_fails("(5).map(i, i)");
    assert!(message.contains("cannot be the range"), "{message}");
}

#[test]
fn conditional_requires_bool_condition() {
    let message = check_fails("1 ? 2 : 3");
    assert!(message.contains("no matching overload"), "{message}");
}

#[test]
fn errors_carry_positions() {
    let env = env();
    let ast = parse("name + nobody").unwrap();
    let errors = env.check(&ast).unwrap_err();
    let error = &errors.errors[0];
    assert_eq!(error.offset, Some(7));
}

#[test]
fn every_node_gets_a_type() {
    let env = env();
    let ast = parse("sizes.map(i, i * 2)[0] > 1 ? name : \"none\"").unwrap();
    let checked = env.check(&ast).unwrap();
    let mut missing = Vec::new();
    ast.root().visit(&mut |expr| {
        if checked.type_of(expr.id).is_none() {
            missing.push(expr.id);
        }
    });
    assert!(missing.is_empty(), "nodes without types: {missing:?}");
}
