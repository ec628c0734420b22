//! Environment construction, subsetting, extensions, and serialization.

use cel_core::{
    CelType, Env, EnvBuilder, EnvError, EnvExport, FunctionDecl, FunctionSelector, OverloadDecl,
    StdlibSubset,
};
use pretty_assertions::assert_eq;

#[test]
fn duplicate_variables_fail_the_build() {
    let err = Env::builder()
        .variable("x", CelType::Int)
        .variable("x", CelType::String)
        .build()
        .unwrap_err();
    assert_eq!(err, EnvError::DuplicateVariable("x".to_string()));
}

#[test]
fn duplicate_overload_ids_fail_the_build() {
    let err = Env::builder()
        .function(FunctionDecl::new("f").overload(OverloadDecl::global(
            "size_string",
            vec![CelType::String],
            CelType::Int,
        )))
        .build()
        .unwrap_err();
    assert_eq!(err, EnvError::DuplicateOverload("size_string".to_string()));
}

#[test]
fn bindings_must_name_a_declared_overload() {
    let err = Env::builder()
        .binding("not_a_thing", |_| Ok(cel_core::Value::Null))
        .build()
        .unwrap_err();
    assert_eq!(err, EnvError::UnknownOverload("not_a_thing".to_string()));
}

// ---------------------------------------------------------------------------
// Standard-library subsetting
// ---------------------------------------------------------------------------

#[test]
fn include_and_exclude_are_mutually_exclusive() {
    let err = Env::builder()
        .stdlib_subset(StdlibSubset {
            include_macros: vec!["has".to_string()],
            exclude_macros: vec!["map".to_string()],
            ..StdlibSubset::default()
        })
        .build()
        .unwrap_err();
    assert!(matches!(err, EnvError::InvalidSubset(_)));

    let err = Env::builder()
        .stdlib_subset(StdlibSubset {
            include_functions: vec![FunctionSelector::function("size")],
            exclude_functions: vec![FunctionSelector::function("matches")],
            ..StdlibSubset::default()
        })
        .build()
        .unwrap_err();
    assert!(matches!(err, EnvError::InvalidSubset(_)));
}

#[test]
fn excluded_functions_disappear_from_scope() {
    let env = Env::builder()
        .stdlib_subset(StdlibSubset {
            exclude_functions: vec![FunctionSelector::function("size")],
            ..StdlibSubset::default()
        })
        .build()
        .unwrap();
    assert!(env.find_function("size").is_none());
    // an expression using it no longer checks
    let ast = cel_parser::parse("size(\"abc\")").unwrap();
    assert!(env.check(&ast).is_err());
}

#[test]
fn excluding_a_single_overload_keeps_the_rest() {
    let env = Env::builder()
        .stdlib_subset(StdlibSubset {
            exclude_functions: vec![FunctionSelector::overload("size", "size_string")],
            ..StdlibSubset::default()
        })
        .build()
        .unwrap();
    let decl = env.find_function("size").expect("size still declared");
    assert!(!decl.overloads.contains_key("size_string"));
    assert!(decl.overloads.contains_key("size_list"));
}

#[test]
fn include_set_means_only_those() {
    let env = Env::builder()
        .stdlib_subset(StdlibSubset {
            include_functions: vec![FunctionSelector::function("size")],
            ..StdlibSubset::default()
        })
        .build()
        .unwrap();
    assert!(env.find_function("size").is_some());
    assert!(env.find_function("contains").is_none());
    assert!(env.find_function("_+_").is_none());
}

#[test]
fn disabled_stdlib_declares_nothing() {
    let env = Env::builder()
        .stdlib_subset(StdlibSubset {
            disabled: true,
            ..StdlibSubset::default()
        })
        .build()
        .unwrap();
    assert!(env.find_function("_+_").is_none());
    let ast = cel_parser::parse("1 + 2").unwrap();
    assert!(env.check(&ast).is_err());
}

#[test]
fn macro_subsetting() {
    let env = Env::builder()
        .stdlib_subset(StdlibSubset {
            exclude_macros: vec!["map".to_string()],
            ..StdlibSubset::default()
        })
        .extension("bindings", 1)
        .build()
        .unwrap();
    assert!(env.macro_enabled("has"));
    assert!(!env.macro_enabled("map"));
    assert!(env.macro_enabled("cel.bind"));

    // cel.bind requires the bindings extension
    let plain = Env::builder().build().unwrap();
    assert!(!plain.macro_enabled("cel.bind"));

    let none = Env::builder()
        .stdlib_subset(StdlibSubset {
            disable_macros: true,
            ..StdlibSubset::default()
        })
        .build()
        .unwrap();
    assert!(!none.macro_enabled("has"));
}

// ---------------------------------------------------------------------------
// Extensions
// ---------------------------------------------------------------------------

#[test]
fn extension_version_selector_picks_highest_implemented() {
    let env = Env::builder().extension("strings", 99).build().unwrap();
    assert_eq!(env.extensions()[0].version, 2);
    assert!(env.find_function("charAt").is_some());
}

#[test]
fn unknown_and_unsupported_extensions_fail() {
    let err = Env::builder().extension("telepathy", 1).build().unwrap_err();
    assert_eq!(err, EnvError::UnknownExtension("telepathy".to_string()));

    let err = Env::builder().extension("encoders", 1).build().unwrap_err();
    assert!(matches!(err, EnvError::UnsupportedExtension { .. }));
}

#[test]
fn math_and_sets_extensions_evaluate() {
    let env = Env::builder()
        .extension("math", 1)
        .extension("sets", 1)
        .extension("strings", 2)
        .build()
        .unwrap();
    let eval = |src: &str| {
        let ast = cel_parser::parse(src).unwrap();
        let checked = env.check(&ast).unwrap();
        env.plan(&checked).unwrap().eval(&cel_core::EmptyActivation).unwrap()
    };
    assert_eq!(eval("math.greatest(1, 7)"), cel_core::Value::Int(7));
    assert_eq!(eval("math.least([3, 1, 2])"), cel_core::Value::Int(1));
    assert_eq!(eval("sets.contains([1, 2, 3], [2, 3])"), cel_core::Value::Bool(true));
    assert_eq!(eval("sets.intersects([1], [2])"), cel_core::Value::Bool(false));
    assert_eq!(eval("\"Hello\".lowerAscii()"), cel_core::Value::from("hello"));
    assert_eq!(eval("[\"a\", \"b\"].join(\"-\")"), cel_core::Value::from("a-b"));
    assert_eq!(eval("\"a,b,c\".split(\",\").size()"), cel_core::Value::Int(3));
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

#[test]
fn aliases_and_abbreviations_resolve_in_the_checker() {
    let env = Env::builder()
        .abbreviation("deeply.nested.pkg.flag")
        .unwrap()
        .variable("deeply.nested.pkg.flag", CelType::Bool)
        .build()
        .unwrap();
    let ast = cel_parser::parse("flag == true").unwrap();
    assert!(env.check(&ast).is_ok());

    let env = Env::builder()
        .alias("p", "deeply.nested.pkg")
        .unwrap()
        .variable("deeply.nested.pkg.flag", CelType::Bool)
        .build()
        .unwrap();
    let ast = cel_parser::parse("p.flag == true").unwrap();
    assert!(env.check(&ast).is_ok());
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

fn rich_env() -> Env {
    Env::builder()
        .name("policy")
        .description("request admission policy")
        .container("acme.api")
        .alias("rpc", "google.rpc")
        .unwrap()
        .extension("strings", 2)
        .extension("optional", 2)
        .variable("request.user", CelType::String)
        .variable("request.sizes", CelType::list(CelType::Int))
        .function(
            FunctionDecl::new("acme.allowed")
                .overload(OverloadDecl::global(
                    "acme_allowed_string",
                    vec![CelType::String],
                    CelType::Bool,
                ))
                .overload(
                    OverloadDecl::global(
                        "acme_allowed_list",
                        vec![CelType::list(CelType::type_param("A"))],
                        CelType::Bool,
                    )
                    .with_type_params(vec!["A".to_string()])
                    .late_bound(),
                ),
        )
        .stdlib_subset(StdlibSubset {
            exclude_functions: vec![FunctionSelector::function("matches")],
            ..StdlibSubset::default()
        })
        .build()
        .unwrap()
}

#[test]
fn export_round_trips_through_load() {
    let env = rich_env();
    let export = env.export();
    let rebuilt = EnvBuilder::from_export(export.clone())
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(rebuilt.export(), export);
}

#[test]
fn export_round_trips_through_json() {
    let export = rich_env().export();
    let text = export.to_json();
    let parsed = EnvExport::from_json(&text).unwrap();
    assert_eq!(parsed, export);
}

#[test]
fn exported_functions_keep_their_signatures() {
    let export = rich_env().export();
    let function = export
        .functions
        .iter()
        .find(|f| f.name == "acme.allowed")
        .expect("function exported");
    let late = function
        .overloads
        .iter()
        .find(|o| o.id == "acme_allowed_list")
        .expect("overload exported");
    assert!(late.late_bound);
    assert_eq!(late.params, vec!["list(A)".to_string()]);
    assert_eq!(late.type_params, vec!["A".to_string()]);
}
