//! The type provider boundary.
//!
//! Descriptor loading is the host's concern; the engine only consumes struct
//! and enum declarations through [`TypeProvider`]. [`DeclaredTypes`] is the
//! in-repo implementation populated by hand, enough for hosts that declare
//! their message shapes directly and for tests.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::types::CelType;

/// A struct (message) type: a fully-qualified name and its declared fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDecl {
    pub name: String,
    pub fields: IndexMap<String, CelType>,
}

impl StructDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: CelType) -> Self {
        self.fields.insert(name.into(), ty);
        self
    }
}

/// An enum type: a fully-qualified name and its number↔name mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDecl {
    pub name: String,
    pub values: IndexMap<String, i64>,
}

impl EnumDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn value(mut self, name: impl Into<String>, number: i64) -> Self {
        self.values.insert(name.into(), number);
        self
    }
}

/// Resolves struct and enum type names for the checker, planner, and
/// runtime. Implementations must be immutable once built.
pub trait TypeProvider: fmt::Debug + Send + Sync {
    fn find_struct(&self, name: &str) -> Option<&StructDecl>;
    fn find_enum(&self, name: &str) -> Option<&EnumDecl>;
}

/// A hand-populated provider over declared types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclaredTypes {
    structs: IndexMap<String, StructDecl>,
    enums: IndexMap<String, EnumDecl>,
}

impl DeclaredTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_struct(&mut self, decl: StructDecl) {
        self.structs.insert(decl.name.clone(), decl);
    }

    pub fn add_enum(&mut self, decl: EnumDecl) {
        self.enums.insert(decl.name.clone(), decl);
    }
}

impl TypeProvider for DeclaredTypes {
    fn find_struct(&self, name: &str) -> Option<&StructDecl> {
        self.structs.get(name)
    }

    fn find_enum(&self, name: &str) -> Option<&EnumDecl> {
        self.enums.get(name)
    }
}
