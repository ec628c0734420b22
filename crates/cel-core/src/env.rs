//! Declared environments.
//!
//! An [`Env`] is immutable once built: variable and function declarations,
//! resolved canonical extensions, the namespace container, the type
//! provider, and the standard-library subset. Building validates everything
//! up front (duplicate names, impossible subsets, unknown extensions) so the
//! checker and planner can trust the tables.

use std::{fmt, sync::Arc};

use ahash::AHashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    container::Container,
    error::{EnvError, EvalResult},
    provider::{DeclaredTypes, EnumDecl, StructDecl, TypeProvider},
    stdlib,
    types::{parse_type, CelType},
    value::Value,
};

/// A function implementation attached to an overload id.
///
/// Receives already-evaluated argument values (for member overloads the
/// target is argument zero). Non-strict implementations may receive error
/// and unknown values and must handle them.
pub type FunctionImpl = Arc<dyn Fn(&[Value]) -> EvalResult<Value> + Send + Sync>;

/// A declared variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: CelType,
}

/// One concrete signature of a function.
///
/// The overload id follows the `targetType_func_argType1_argType2…`
/// convention and is the stable contract: bindings, subsetting, and the
/// optimizers key off it. For member overloads the target type is
/// `params[0]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverloadDecl {
    pub id: String,
    /// Whether the overload is invoked in method style (`target.f(…)`).
    #[serde(default)]
    pub member: bool,
    pub params: Vec<CelType>,
    pub result: CelType,
    #[serde(default)]
    pub type_params: Vec<String>,
    /// Non-strict overloads receive error/unknown arguments unfiltered.
    /// Reserved for the logic operators; hosts rarely want this.
    #[serde(default)]
    pub non_strict: bool,
    /// Late-bound overloads are dispatched against a per-evaluation function
    /// resolver instead of a binding in the environment.
    #[serde(default)]
    pub late_bound: bool,
    /// Whether the constant-folding optimizer may evaluate this overload at
    /// optimization time. Implies the implementation is pure.
    #[serde(default)]
    pub foldable: bool,
}

impl OverloadDecl {
    pub fn global(id: impl Into<String>, params: Vec<CelType>, result: CelType) -> Self {
        Self {
            id: id.into(),
            member: false,
            params,
            result,
            type_params: Vec::new(),
            non_strict: false,
            late_bound: false,
            foldable: false,
        }
    }

    pub fn member(id: impl Into<String>, params: Vec<CelType>, result: CelType) -> Self {
        Self {
            member: true,
            ..Self::global(id, params, result)
        }
    }

    #[must_use]
    pub fn with_type_params(mut self, params: Vec<String>) -> Self {
        self.type_params = params;
        self
    }

    #[must_use]
    pub fn non_strict(mut self) -> Self {
        self.non_strict = true;
        self
    }

    #[must_use]
    pub fn late_bound(mut self) -> Self {
        self.late_bound = true;
        self
    }

    #[must_use]
    pub fn foldable(mut self) -> Self {
        self.foldable = true;
        self
    }
}

/// A function declaration: one name, many overloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub overloads: IndexMap<String, OverloadDecl>,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overloads: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn overload(mut self, decl: OverloadDecl) -> Self {
        self.overloads.insert(decl.id.clone(), decl);
        self
    }
}

/// Reference to one overload inside a function selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverloadRef {
    pub id: String,
}

/// Selects a function, or a subset of its overloads, for inclusion or
/// exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSelector {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overloads: Vec<OverloadRef>,
}

impl FunctionSelector {
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overloads: Vec::new(),
        }
    }

    pub fn overload(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overloads: vec![OverloadRef { id: id.into() }],
        }
    }
}

/// Standard-library subsetting.
///
/// An empty include set means "all included"; an empty exclude set means
/// "none excluded". Including and excluding the same class (macros, or
/// functions) at once fails validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StdlibSubset {
    pub disabled: bool,
    pub disable_macros: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include_macros: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_macros: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include_functions: Vec<FunctionSelector>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_functions: Vec<FunctionSelector>,
}

impl StdlibSubset {
    pub fn validate(&self) -> Result<(), EnvError> {
        if !self.include_macros.is_empty() && !self.exclude_macros.is_empty() {
            return Err(EnvError::InvalidSubset(
                "macros cannot be both included and excluded".to_string(),
            ));
        }
        if !self.include_functions.is_empty() && !self.exclude_functions.is_empty() {
            return Err(EnvError::InvalidSubset(
                "functions cannot be both included and excluded".to_string(),
            ));
        }
        Ok(())
    }

    pub fn function_allowed(&self, name: &str, overload_id: &str) -> bool {
        if self.disabled {
            return false;
        }
        if !self.include_functions.is_empty() {
            return self.include_functions.iter().any(|sel| {
                sel.name == name
                    && (sel.overloads.is_empty() || sel.overloads.iter().any(|o| o.id == overload_id))
            });
        }
        if !self.exclude_functions.is_empty() {
            return !self.exclude_functions.iter().any(|sel| {
                sel.name == name
                    && (sel.overloads.is_empty() || sel.overloads.iter().any(|o| o.id == overload_id))
            });
        }
        true
    }

    pub fn macro_allowed(&self, name: &str) -> bool {
        if self.disable_macros {
            return false;
        }
        if !self.include_macros.is_empty() {
            return self.include_macros.iter().any(|m| m == name);
        }
        if !self.exclude_macros.is_empty() {
            return !self.exclude_macros.iter().any(|m| m == name);
        }
        true
    }
}

/// A resolved canonical extension: the requested name and the version that
/// was actually installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDecl {
    pub name: String,
    pub version: u32,
}

/// Declaration and binding tables accumulated during a build.
#[derive(Default)]
pub(crate) struct Registrations {
    pub functions: IndexMap<String, FunctionDecl>,
    /// overload id → function name
    pub overload_index: AHashMap<String, String>,
    pub bindings: AHashMap<String, FunctionImpl>,
}

impl Registrations {
    pub fn declare(
        &mut self,
        function: &str,
        overload: OverloadDecl,
        binding: Option<FunctionImpl>,
    ) -> Result<(), EnvError> {
        if self.overload_index.contains_key(&overload.id) {
            return Err(EnvError::DuplicateOverload(overload.id));
        }
        self.overload_index
            .insert(overload.id.clone(), function.to_string());
        if let Some(binding) = binding {
            self.bindings.insert(overload.id.clone(), binding);
        }
        self.functions
            .entry(function.to_string())
            .or_insert_with(|| FunctionDecl::new(function))
            .overloads
            .insert(overload.id.clone(), overload);
        Ok(())
    }
}

/// An immutable evaluation environment.
#[derive(Clone)]
pub struct Env {
    name: String,
    description: String,
    container: Container,
    variables: IndexMap<String, VariableDecl>,
    functions: IndexMap<String, FunctionDecl>,
    overload_index: AHashMap<String, String>,
    bindings: AHashMap<String, FunctionImpl>,
    provider: Arc<dyn TypeProvider>,
    extensions: Vec<ExtensionDecl>,
    stdlib: StdlibSubset,
    /// host declarations only, kept apart from the merged tables for export
    user_variables: Vec<VariableDecl>,
    user_functions: Vec<FunctionDecl>,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("name", &self.name)
            .field("container", &self.container)
            .field("variables", &self.variables.len())
            .field("functions", &self.functions.len())
            .field("bindings", &self.bindings.len())
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

impl Env {
    pub fn builder() -> EnvBuilder {
        EnvBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn provider(&self) -> &dyn TypeProvider {
        self.provider.as_ref()
    }

    pub fn stdlib_subset(&self) -> &StdlibSubset {
        &self.stdlib
    }

    pub fn extensions(&self) -> &[ExtensionDecl] {
        &self.extensions
    }

    /// Looks up a variable by exact fully-qualified name.
    pub fn find_variable(&self, name: &str) -> Option<&VariableDecl> {
        self.variables.get(name)
    }

    /// Resolves a possibly-unqualified variable name through the container.
    pub fn resolve_variable(&self, name: &str) -> Option<(String, &VariableDecl)> {
        for candidate in self.container.candidate_names(name) {
            if let Some(decl) = self.variables.get(&candidate) {
                return Some((candidate, decl));
            }
        }
        None
    }

    pub fn find_function(&self, name: &str) -> Option<&FunctionDecl> {
        self.functions.get(name)
    }

    /// Resolves a possibly-unqualified global function name through the
    /// container.
    pub fn resolve_function(&self, name: &str) -> Option<(String, &FunctionDecl)> {
        for candidate in self.container.candidate_names(name) {
            if let Some(decl) = self.functions.get(&candidate) {
                return Some((candidate, decl));
            }
        }
        None
    }

    /// Finds the declaration for an overload id.
    pub fn find_overload(&self, overload_id: &str) -> Option<(&FunctionDecl, &OverloadDecl)> {
        let function = self.overload_index.get(overload_id)?;
        let decl = self.functions.get(function)?;
        let overload = decl.overloads.get(overload_id)?;
        Some((decl, overload))
    }

    /// The runtime binding for an overload id, when one was registered.
    pub fn binding(&self, overload_id: &str) -> Option<&FunctionImpl> {
        self.bindings.get(overload_id)
    }

    /// Whether a parse-time macro is in scope under the subset and installed
    /// extensions.
    pub fn macro_enabled(&self, name: &str) -> bool {
        if name == "cel.bind" {
            return self.extensions.iter().any(|e| e.name == "bindings");
        }
        stdlib::STANDARD_MACROS.contains(&name) && self.stdlib.macro_allowed(name)
    }

    /// Resolves an enum constant such as `my.pkg.Enum.VALUE` through the
    /// container, returning its fully-qualified name and number.
    pub fn resolve_enum_constant(&self, name: &str) -> Option<(String, i64)> {
        for candidate in self.container.candidate_names(name) {
            let Some((type_name, value_name)) = candidate.rsplit_once('.') else {
                continue;
            };
            if let Some(decl) = self.provider.find_enum(type_name) {
                if let Some(number) = decl.values.get(value_name) {
                    return Some((candidate.clone(), *number));
                }
            }
        }
        None
    }

    /// Resolves a type identifier (builtin name, struct, or enum) through
    /// the container, returning the named type.
    pub fn resolve_type_ident(&self, name: &str) -> Option<(String, CelType)> {
        for candidate in self.container.candidate_names(name) {
            let ty = match candidate.as_str() {
                "bool" => Some(CelType::Bool),
                "int" => Some(CelType::Int),
                "uint" => Some(CelType::Uint),
                "double" => Some(CelType::Double),
                "string" => Some(CelType::String),
                "bytes" => Some(CelType::Bytes),
                "list" => Some(CelType::list(CelType::Dyn)),
                "map" => Some(CelType::map(CelType::Dyn, CelType::Dyn)),
                "null_type" => Some(CelType::Null),
                "type" => Some(CelType::Type(None)),
                "duration" | "google.protobuf.Duration" => Some(CelType::Duration),
                "timestamp" | "google.protobuf.Timestamp" => Some(CelType::Timestamp),
                "dyn" => Some(CelType::Dyn),
                other => {
                    if self.provider.find_struct(other).is_some() {
                        Some(CelType::Struct(other.to_string()))
                    } else if self.provider.find_enum(other).is_some() {
                        Some(CelType::Enum(other.to_string()))
                    } else {
                        None
                    }
                }
            };
            if let Some(ty) = ty {
                return Some((candidate, ty));
            }
        }
        None
    }

    /// Resolves a struct construction name through the container.
    pub fn resolve_struct(&self, name: &str) -> Option<(String, &StructDecl)> {
        for candidate in self.container.candidate_names(name) {
            if let Some(decl) = self.provider.find_struct(&candidate) {
                return Some((candidate, decl));
            }
        }
        None
    }

    /// Serializes the declared surface. Round-trip law:
    /// `load(export(env))` builds an environment whose export equals this
    /// one, up to declared ordering.
    pub fn export(&self) -> EnvExport {
        let aliases: IndexMap<String, String> = self
            .container
            .aliases()
            .iter()
            .filter(|(_, fq)| !self.container.abbreviations().contains(fq))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        EnvExport {
            name: self.name.clone(),
            description: self.description.clone(),
            container: ContainerExport {
                name: self.container.name().to_string(),
                abbreviations: self.container.abbreviations().to_vec(),
                aliases,
            },
            extensions: self.extensions.clone(),
            variables: self
                .user_variables
                .iter()
                .map(|v| VariableExport {
                    name: v.name.clone(),
                    ty: v.ty.to_string(),
                })
                .collect(),
            functions: self
                .user_functions
                .iter()
                .map(|f| FunctionExport {
                    name: f.name.clone(),
                    overloads: f.overloads.values().map(OverloadExport::from_decl).collect(),
                })
                .collect(),
            stdlib: self.stdlib.clone(),
        }
    }
}

/// Builder for [`Env`].
#[derive(Default)]
pub struct EnvBuilder {
    name: String,
    description: String,
    container: Container,
    variables: Vec<VariableDecl>,
    functions: Vec<FunctionDecl>,
    bindings: Vec<(String, FunctionImpl)>,
    types: DeclaredTypes,
    custom_provider: Option<Arc<dyn TypeProvider>>,
    extensions: Vec<(String, u32)>,
    stdlib: StdlibSubset,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn container(mut self, name: impl Into<String>) -> Self {
        let old = std::mem::take(&mut self.container);
        let mut container = Container::new(name);
        // carry previously registered names over; infallible since they were
        // already validated
        for fq in old.abbreviations() {
            let _ = container.add_abbreviation(fq.clone());
        }
        for (short, fq) in old.aliases() {
            if !old.abbreviations().contains(fq) {
                let _ = container.add_alias(short.clone(), fq.clone());
            }
        }
        self.container = container;
        self
    }

    /// Registers `short → qualified`.
    pub fn alias(mut self, short: impl Into<String>, qualified: impl Into<String>) -> Result<Self, EnvError> {
        self.container
            .add_alias(short, qualified)
            .map_err(EnvError::InvalidDeclaration)?;
        Ok(self)
    }

    /// Registers a fully-qualified name under its last segment.
    pub fn abbreviation(mut self, qualified: impl Into<String>) -> Result<Self, EnvError> {
        self.container
            .add_abbreviation(qualified)
            .map_err(EnvError::InvalidDeclaration)?;
        Ok(self)
    }

    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, ty: CelType) -> Self {
        self.variables.push(VariableDecl {
            name: name.into(),
            ty,
        });
        self
    }

    #[must_use]
    pub fn function(mut self, decl: FunctionDecl) -> Self {
        self.functions.push(decl);
        self
    }

    /// Attaches an implementation to a declared overload id.
    #[must_use]
    pub fn binding(
        mut self,
        overload_id: impl Into<String>,
        function: impl Fn(&[Value]) -> EvalResult<Value> + Send + Sync + 'static,
    ) -> Self {
        self.bindings.push((overload_id.into(), Arc::new(function)));
        self
    }

    #[must_use]
    pub fn register_struct(mut self, decl: StructDecl) -> Self {
        self.types.add_struct(decl);
        self
    }

    #[must_use]
    pub fn register_enum(mut self, decl: EnumDecl) -> Self {
        self.types.add_enum(decl);
        self
    }

    /// Replaces the hand-populated type registry with a host provider.
    #[must_use]
    pub fn type_provider(mut self, provider: Arc<dyn TypeProvider>) -> Self {
        self.custom_provider = Some(provider);
        self
    }

    /// Requests a canonical extension; the highest implemented version at or
    /// below `version` is installed.
    #[must_use]
    pub fn extension(mut self, name: impl Into<String>, version: u32) -> Self {
        self.extensions.push((name.into(), version));
        self
    }

    #[must_use]
    pub fn stdlib_subset(mut self, subset: StdlibSubset) -> Self {
        self.stdlib = subset;
        self
    }

    pub fn build(self) -> Result<Env, EnvError> {
        self.stdlib.validate()?;

        let mut regs = Registrations::default();
        stdlib::install(&mut regs, &self.stdlib)?;

        let mut resolved = Vec::with_capacity(self.extensions.len());
        for (name, version) in &self.extensions {
            let actual = stdlib::install_extension(&mut regs, name, *version)?;
            resolved.push(ExtensionDecl {
                name: name.clone(),
                version: actual,
            });
        }

        for decl in &self.functions {
            for overload in decl.overloads.values() {
                regs.declare(&decl.name, overload.clone(), None)?;
            }
        }
        for (id, binding) in &self.bindings {
            if !regs.overload_index.contains_key(id) {
                return Err(EnvError::UnknownOverload(id.clone()));
            }
            regs.bindings.insert(id.clone(), binding.clone());
        }

        let mut variables = IndexMap::new();
        for decl in &self.variables {
            if variables.insert(decl.name.clone(), decl.clone()).is_some() {
                return Err(EnvError::DuplicateVariable(decl.name.clone()));
            }
        }

        let provider: Arc<dyn TypeProvider> = match self.custom_provider {
            Some(provider) => provider,
            None => Arc::new(self.types),
        };

        Ok(Env {
            name: self.name,
            description: self.description,
            container: self.container,
            variables,
            functions: regs.functions,
            overload_index: regs.overload_index,
            bindings: regs.bindings,
            provider,
            extensions: resolved,
            stdlib: self.stdlib,
            user_variables: self.variables,
            user_functions: self.functions,
        })
    }

    /// Rebuilds a builder from a serialized environment. Bindings and type
    /// declarations are code and do not round-trip; reattach them before
    /// building.
    pub fn from_export(export: EnvExport) -> Result<Self, EnvError> {
        let mut container = Container::new(export.container.name);
        for fq in &export.container.abbreviations {
            container
                .add_abbreviation(fq.clone())
                .map_err(EnvError::InvalidDeclaration)?;
        }
        for (short, fq) in &export.container.aliases {
            container
                .add_alias(short.clone(), fq.clone())
                .map_err(EnvError::InvalidDeclaration)?;
        }
        let mut builder = EnvBuilder::new()
            .name(export.name)
            .description(export.description)
            .stdlib_subset(export.stdlib);
        builder.container = container;
        for ext in export.extensions {
            builder = builder.extension(ext.name, ext.version);
        }
        for var in export.variables {
            let ty = parse_type(&var.ty, &[])
                .map_err(|e| EnvError::InvalidDeclaration(e.to_string()))?;
            builder = builder.variable(var.name, ty);
        }
        for function in export.functions {
            let mut decl = FunctionDecl::new(&function.name);
            for overload in function.overloads {
                decl = decl.overload(overload.into_decl()?);
            }
            builder = builder.function(decl);
        }
        Ok(builder)
    }
}

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

/// The serializable surface of an environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvExport {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub container: ContainerExport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ExtensionDecl>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableExport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionExport>,
    pub stdlib: StdlibSubset,
}

impl EnvExport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("environment export serializes")
    }

    pub fn from_json(text: &str) -> Result<Self, EnvError> {
        serde_json::from_str(text).map_err(|e| EnvError::InvalidDeclaration(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerExport {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub abbreviations: Vec<String>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub aliases: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableExport {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionExport {
    pub name: String,
    pub overloads: Vec<OverloadExport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverloadExport {
    pub id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub member: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_params: Vec<String>,
    pub params: Vec<String>,
    pub result: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub non_strict: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub late_bound: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub foldable: bool,
}

impl OverloadExport {
    fn from_decl(decl: &OverloadDecl) -> Self {
        Self {
            id: decl.id.clone(),
            member: decl.member,
            type_params: decl.type_params.clone(),
            params: decl.params.iter().map(ToString::to_string).collect(),
            result: decl.result.to_string(),
            non_strict: decl.non_strict,
            late_bound: decl.late_bound,
            foldable: decl.foldable,
        }
    }

    fn into_decl(self) -> Result<OverloadDecl, EnvError> {
        let params = self
            .params
            .iter()
            .map(|p| parse_type(p, &self.type_params))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EnvError::InvalidDeclaration(e.to_string()))?;
        let result = parse_type(&self.result, &self.type_params)
            .map_err(|e| EnvError::InvalidDeclaration(e.to_string()))?;
        Ok(OverloadDecl {
            id: self.id,
            member: self.member,
            params,
            result,
            type_params: self.type_params,
            non_strict: self.non_strict,
            late_bound: self.late_bound,
            foldable: self.foldable,
        })
    }
}

