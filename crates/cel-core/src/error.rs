use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::ast::ExprId;

/// Result type alias for operations that can produce an evaluation error.
pub type EvalResult<T> = Result<T, CelError>;

/// Evaluation error kinds.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>`
/// implementations. The string representation matches the variant name exactly
/// (e.g., `DivisionByZero` -> "DivisionByZero"). The kind is a routing surface;
/// hosts match on it, messages are for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Integer or uint division (or modulo) by zero.
    DivisionByZero,
    /// Checked 64-bit arithmetic overflowed, or a timestamp/duration left its range.
    Overflow,
    /// Map lookup on a key that is not present.
    NoSuchKey,
    /// Struct field access on an undeclared field.
    NoSuchField,
    /// A structurally valid call received a value it cannot operate on
    /// (bad regex, out-of-range index, repeated map key).
    InvalidArgument,
    /// A type conversion function could not represent its input.
    ConversionFailure,
    /// No overload of the function matches the runtime argument values.
    NoMatchingOverload,
    /// The comprehension iteration budget was exhausted.
    IterationLimitExceeded,
    /// An identifier did not resolve against the activation.
    AttributeNotFound,
    /// An invariant inside the evaluator broke. Always a bug.
    Internal,
}

/// A runtime evaluation fault.
///
/// Errors are first-class values inside the evaluator so they can flow through
/// the non-strict operators (`&&`, `||`, `?:`); at the public `eval` boundary
/// they surface as `Err(CelError)` with the originating expression id and,
/// when the AST carries source positions, a source offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CelError {
    kind: ErrorKind,
    message: String,
    /// Id of the expression node the fault originated at, if known.
    id: Option<ExprId>,
    /// Byte offset into the original source, looked up via the source overlay
    /// when the error crosses the public eval boundary.
    offset: Option<u32>,
}

impl CelError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            id: None,
            offset: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn expr_id(&self) -> Option<ExprId> {
        self.id
    }

    pub fn offset(&self) -> Option<u32> {
        self.offset
    }

    /// Attaches the originating expression id if none is recorded yet.
    ///
    /// Errors keep the id closest to the fault: a failure inside a nested call
    /// is reported at the nested node, not at every enclosing node it
    /// propagates through.
    #[must_use]
    pub fn with_id(mut self, id: ExprId) -> Self {
        if self.id.is_none() {
            self.id = Some(id);
        }
        self
    }

    #[must_use]
    pub(crate) fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn divide_by_zero() -> Self {
        Self::new(ErrorKind::DivisionByZero, "division by zero")
    }

    pub fn modulus_by_zero() -> Self {
        Self::new(ErrorKind::DivisionByZero, "modulus by zero")
    }

    pub fn overflow(op: &str) -> Self {
        Self::new(ErrorKind::Overflow, format!("{op} overflows"))
    }

    pub fn no_such_key(key: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NoSuchKey, format!("no such key: {key}"))
    }

    pub fn no_such_field(field: &str) -> Self {
        Self::new(ErrorKind::NoSuchField, format!("no such field: {field}"))
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConversionFailure, message)
    }

    pub fn no_matching_overload(function: &str) -> Self {
        Self::new(
            ErrorKind::NoMatchingOverload,
            format!("no matching overload for '{function}'"),
        )
    }

    pub fn no_matching_overload_value(function: &str, value: &crate::value::Value) -> Self {
        Self::new(
            ErrorKind::NoMatchingOverload,
            format!(
                "no matching overload for '{function}' applied to {}",
                value.runtime_type()
            ),
        )
    }

    pub fn iteration_limit(limit: u64) -> Self {
        Self::new(
            ErrorKind::IterationLimitExceeded,
            format!("iteration budget of {limit} exhausted"),
        )
    }

    pub fn attribute_not_found(names: &[String]) -> Self {
        Self::new(
            ErrorKind::AttributeNotFound,
            format!("no such attribute: {}", names.join(", ")),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for CelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(offset) = self.offset {
            write!(f, " (at offset {offset})")?;
        } else if let Some(id) = self.id {
            write!(f, " (at expression {id})")?;
        }
        Ok(())
    }
}

impl std::error::Error for CelError {}

/// A single type-checker finding, anchored to the offending expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckError {
    pub message: String,
    pub id: ExprId,
    pub offset: Option<u32>,
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{} (at offset {offset})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// All findings from one check pass. A program with any finding is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckErrors {
    pub errors: Vec<CheckError>,
}

impl fmt::Display for CheckErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CheckErrors {}

/// Error produced while translating a checked or parsed AST into a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanError {
    pub message: String,
    pub id: Option<ExprId>,
}

impl PlanError {
    pub fn new(message: impl Into<String>, id: ExprId) -> Self {
        Self {
            message: message.into(),
            id: Some(id),
        }
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{} (at expression {id})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for PlanError {}

/// Error produced while building an [`Env`](crate::Env).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// A variable with this fully-qualified name was declared twice.
    DuplicateVariable(String),
    /// An overload id was registered twice (possibly under different names).
    DuplicateOverload(String),
    /// A function binding names an overload id nothing declared.
    UnknownOverload(String),
    /// The standard-library subset both includes and excludes the same class.
    InvalidSubset(String),
    /// A canonical extension was requested that this build does not ship.
    UnsupportedExtension { name: String, version: u32 },
    /// An extension name outside the canonical set.
    UnknownExtension(String),
    /// A malformed declaration (bad name, bad type expression, bad overload id).
    InvalidDeclaration(String),
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateVariable(name) => write!(f, "duplicate variable declaration: {name}"),
            Self::DuplicateOverload(id) => write!(f, "duplicate overload id: {id}"),
            Self::UnknownOverload(id) => write!(f, "binding references undeclared overload: {id}"),
            Self::InvalidSubset(msg) => write!(f, "invalid standard library subset: {msg}"),
            Self::UnsupportedExtension { name, version } => {
                write!(f, "extension '{name}' version {version} is not available")
            }
            Self::UnknownExtension(name) => write!(f, "unknown extension: {name}"),
            Self::InvalidDeclaration(msg) => write!(f, "invalid declaration: {msg}"),
        }
    }
}

impl std::error::Error for EnvError {}
