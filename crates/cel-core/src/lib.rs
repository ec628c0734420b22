#![doc = include_str!("../../../README.md")]

pub mod ast;
mod checker;
mod container;
mod env;
mod error;
mod interpreter;
pub mod operators;
mod provider;
mod stdlib;
mod types;
mod unparser;
mod value;

pub(crate) mod planner;

pub use crate::{
    container::Container,
    env::{
        ContainerExport, Env, EnvBuilder, EnvExport, ExtensionDecl, FunctionDecl, FunctionExport,
        FunctionImpl, FunctionSelector, OverloadDecl, OverloadExport, OverloadRef, StdlibSubset,
        VariableDecl, VariableExport,
    },
    error::{CelError, CheckError, CheckErrors, EnvError, ErrorKind, EvalResult, PlanError},
    interpreter::{
        Activation, EmptyActivation, EvalOptions, FunctionResolver, MapActivation,
        MapFunctionResolver, Program,
    },
    provider::{DeclaredTypes, EnumDecl, StructDecl, TypeProvider},
    types::{parse_type, CelType, Substitution, TypeParseError},
    unparser::unparse,
    value::{
        MapKey, MapValue, OptionalValue, StructValue, UnknownSet, Value, MAX_TIMESTAMP_SECONDS,
        MIN_TIMESTAMP_SECONDS,
    },
};
