//! The CEL type algebra.
//!
//! Types are a closed sum consulted by the checker (overload resolution,
//! assignability), the planner (constant folding of type identifiers), and the
//! environment (declaration serialization). The textual form produced by
//! `Display` and consumed by [`parse_type`] is the canonical serialized
//! spelling: `list(int)`, `map(string, dyn)`, `optional_type(T)`, `type(T)`,
//! and struct/enum names verbatim.

use std::{fmt, str::FromStr};

use ahash::AHashMap;
use serde::{Deserialize, Serialize, de, ser};

/// A CEL type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CelType {
    Null,
    Bool,
    Int,
    Uint,
    Double,
    String,
    Bytes,
    Duration,
    Timestamp,
    /// `google.protobuf.Any`; behaves like `dyn` for assignability.
    Any,
    /// The dynamic type: assignable to and from everything.
    Dyn,
    /// The absorbing error type.
    Error,
    /// The type of a type value. `Type(None)` is the bare `type` with no
    /// particular inner type (the type of `type(x)` results).
    Type(Option<Box<CelType>>),
    List(Box<CelType>),
    Map(Box<CelType>, Box<CelType>),
    Optional(Box<CelType>),
    /// A type parameter in a generic overload declaration, unified by
    /// substitution during overload resolution.
    TypeParam(String),
    /// A message type known to the type provider, by fully-qualified name.
    Struct(String),
    /// An enum type known to the type provider, by fully-qualified name.
    /// The number↔name mapping lives on the provider's declaration.
    Enum(String),
}

impl CelType {
    pub fn list(elem: CelType) -> Self {
        Self::List(Box::new(elem))
    }

    pub fn map(key: CelType, value: CelType) -> Self {
        Self::Map(Box::new(key), Box::new(value))
    }

    pub fn optional(inner: CelType) -> Self {
        Self::Optional(Box::new(inner))
    }

    pub fn type_of(inner: CelType) -> Self {
        Self::Type(Some(Box::new(inner)))
    }

    pub fn type_param(name: impl Into<String>) -> Self {
        Self::TypeParam(name.into())
    }

    /// True for `dyn`, `any`, and `error`, which are assignable to and from
    /// every type.
    pub fn is_dyn_like(&self) -> bool {
        matches!(self, Self::Dyn | Self::Any | Self::Error)
    }

    /// Whether a value of `self` can bind a parameter (or slot) of type `to`,
    /// unifying type parameters into `subs` as it goes.
    ///
    /// Rules: identical types; `dyn`/`any`/`error` to or from anything; type
    /// parameters bind by substitution; `optional`/`list` covariant in the
    /// element, `type` covariant in the inner type, maps covariant in the
    /// value and invariant in the key.
    pub fn assignable_to(&self, to: &CelType, subs: &mut Substitution) -> bool {
        let to = subs.resolved(to);
        if self == &to {
            return true;
        }
        if self.is_dyn_like() || to.is_dyn_like() {
            return true;
        }
        match (&to, self) {
            (CelType::TypeParam(name), _) => subs.bind(name, self),
            (_, CelType::TypeParam(name)) => subs.bind(name, &to),
            (CelType::Optional(t), CelType::Optional(s)) => s.assignable_to(t, subs),
            (CelType::List(t), CelType::List(s)) => s.assignable_to(t, subs),
            (CelType::Map(tk, tv), CelType::Map(sk, sv)) => {
                // key invariance still has to unify params and admit dyn
                let keys_ok = sk == tk
                    || sk.is_dyn_like()
                    || tk.is_dyn_like()
                    || matches!(tk.as_ref(), CelType::TypeParam(_))
                    || matches!(sk.as_ref(), CelType::TypeParam(_));
                keys_ok && sk.assignable_to(tk, subs) && sv.assignable_to(tv, subs)
            }
            (CelType::Type(Some(t)), CelType::Type(Some(s))) => s.assignable_to(t, subs),
            (CelType::Type(None), CelType::Type(_)) | (CelType::Type(_), CelType::Type(None)) => true,
            _ => false,
        }
    }

    /// Replaces every bound type parameter with its substitution.
    #[must_use]
    pub fn substitute(&self, subs: &Substitution) -> CelType {
        match self {
            Self::TypeParam(name) => subs.get(name).cloned().unwrap_or(Self::Dyn),
            Self::List(elem) => Self::list(elem.substitute(subs)),
            Self::Map(k, v) => Self::map(k.substitute(subs), v.substitute(subs)),
            Self::Optional(inner) => Self::optional(inner.substitute(subs)),
            Self::Type(Some(inner)) => Self::type_of(inner.substitute(subs)),
            other => other.clone(),
        }
    }

    /// How far `self` is from an exact match against an argument type:
    /// 0 = exact, 1 = concrete-but-promoted (or parameterized), 2 = dyn.
    ///
    /// Overload resolution prefers the least general total across all
    /// parameters, so `size(string)` beats `size(dyn)` for a string argument.
    pub(crate) fn generality_against(&self, arg: &CelType) -> u32 {
        if self == arg {
            0
        } else if self.is_dyn_like() {
            2
        } else {
            1
        }
    }

    /// The least upper bound used when two branches or list elements disagree:
    /// the common type if equal, otherwise `dyn`.
    #[must_use]
    pub fn join(&self, other: &CelType) -> CelType {
        if self == other {
            self.clone()
        } else if matches!(self, Self::Error) {
            other.clone()
        } else if matches!(other, Self::Error) {
            self.clone()
        } else {
            Self::Dyn
        }
    }
}

/// A type-parameter substitution map built up during overload resolution.
#[derive(Debug, Clone, Default)]
pub struct Substitution {
    bindings: AHashMap<String, CelType>,
}

impl Substitution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&CelType> {
        self.bindings.get(name)
    }

    /// Binds `name` to `ty`, or checks consistency against an existing
    /// binding. Binding a parameter to `dyn` keeps an existing concrete
    /// binding; a concrete binding replaces `dyn`.
    fn bind(&mut self, name: &str, ty: &CelType) -> bool {
        match self.bindings.get(name) {
            None => {
                self.bindings.insert(name.to_string(), ty.clone());
                true
            }
            Some(existing) => {
                if existing == ty || ty.is_dyn_like() {
                    true
                } else if existing.is_dyn_like() {
                    self.bindings.insert(name.to_string(), ty.clone());
                    true
                } else {
                    let mut inner = Substitution::new();
                    ty.assignable_to(&existing.clone(), &mut inner)
                }
            }
        }
    }

    /// Follows a top-level type-parameter reference into its binding, if any.
    fn resolved(&self, ty: &CelType) -> CelType {
        match ty {
            CelType::TypeParam(name) => self.bindings.get(name).cloned().unwrap_or_else(|| ty.clone()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for CelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null_type"),
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Uint => write!(f, "uint"),
            Self::Double => write!(f, "double"),
            Self::String => write!(f, "string"),
            Self::Bytes => write!(f, "bytes"),
            Self::Duration => write!(f, "duration"),
            Self::Timestamp => write!(f, "timestamp"),
            Self::Any => write!(f, "any"),
            Self::Dyn => write!(f, "dyn"),
            Self::Error => write!(f, "error"),
            Self::Type(None) => write!(f, "type"),
            Self::Type(Some(inner)) => write!(f, "type({inner})"),
            Self::List(elem) => write!(f, "list({elem})"),
            Self::Map(k, v) => write!(f, "map({k}, {v})"),
            Self::Optional(inner) => write!(f, "optional_type({inner})"),
            Self::TypeParam(name) => write!(f, "{name}"),
            Self::Struct(name) | Self::Enum(name) => write!(f, "{name}"),
        }
    }
}

/// Parses the canonical textual type form.
///
/// `type_params` names the identifiers that should parse as type parameters
/// rather than struct names; declaration loading passes the enclosing
/// overload's parameter list.
pub fn parse_type(input: &str, type_params: &[String]) -> Result<CelType, TypeParseError> {
    let mut parser = TypeParser {
        input: input.trim(),
        pos: 0,
        type_params,
    };
    let ty = parser.parse()?;
    parser.skip_ws();
    if parser.pos != parser.input.len() {
        return Err(TypeParseError(format!("trailing input in type '{input}'")));
    }
    Ok(ty)
}

/// Error from [`parse_type`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeParseError(pub String);

impl fmt::Display for TypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TypeParseError {}

struct TypeParser<'a> {
    input: &'a str,
    pos: usize,
    type_params: &'a [String],
}

impl TypeParser<'_> {
    fn parse(&mut self) -> Result<CelType, TypeParseError> {
        self.skip_ws();
        let name = self.ident()?;
        match name.as_str() {
            "null_type" => Ok(CelType::Null),
            "bool" => Ok(CelType::Bool),
            "int" => Ok(CelType::Int),
            "uint" => Ok(CelType::Uint),
            "double" => Ok(CelType::Double),
            "string" => Ok(CelType::String),
            "bytes" => Ok(CelType::Bytes),
            "duration" => Ok(CelType::Duration),
            "timestamp" => Ok(CelType::Timestamp),
            "any" => Ok(CelType::Any),
            "dyn" => Ok(CelType::Dyn),
            "error" => Ok(CelType::Error),
            "type" => {
                if self.eat('(') {
                    let inner = self.parse()?;
                    self.expect(')')?;
                    Ok(CelType::type_of(inner))
                } else {
                    Ok(CelType::Type(None))
                }
            }
            "list" => {
                self.expect('(')?;
                let elem = self.parse()?;
                self.expect(')')?;
                Ok(CelType::list(elem))
            }
            "map" => {
                self.expect('(')?;
                let key = self.parse()?;
                self.expect(',')?;
                let value = self.parse()?;
                self.expect(')')?;
                Ok(CelType::map(key, value))
            }
            "optional_type" => {
                self.expect('(')?;
                let inner = self.parse()?;
                self.expect(')')?;
                Ok(CelType::optional(inner))
            }
            other => {
                if self.type_params.iter().any(|p| p == other) {
                    Ok(CelType::type_param(other))
                } else {
                    Ok(CelType::Struct(other.to_string()))
                }
            }
        }
    }

    fn ident(&mut self) -> Result<String, TypeParseError> {
        let start = self.pos;
        let bytes = self.input.as_bytes();
        while self.pos < bytes.len() {
            let c = bytes[self.pos] as char;
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(TypeParseError(format!("expected type name in '{}'", self.input)));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn skip_ws(&mut self) {
        while self.input.as_bytes().get(self.pos) == Some(&b' ') {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.input[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), TypeParseError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(TypeParseError(format!("expected '{c}' in type '{}'", self.input)))
        }
    }
}

impl FromStr for CelType {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_type(s, &[])
    }
}

impl Serialize for CelType {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CelType {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(ty: &CelType) {
        let text = ty.to_string();
        let parsed: CelType = text.parse().expect("canonical form parses");
        assert_eq!(&parsed, ty, "round-trip of '{text}'");
    }

    #[test]
    fn textual_round_trips() {
        roundtrip(&CelType::Int);
        roundtrip(&CelType::list(CelType::String));
        roundtrip(&CelType::map(CelType::String, CelType::Dyn));
        roundtrip(&CelType::optional(CelType::list(CelType::Uint)));
        roundtrip(&CelType::type_of(CelType::Bool));
        roundtrip(&CelType::Struct("google.rpc.Status".to_string()));
    }

    #[test]
    fn type_params_parse_by_declaration() {
        let params = vec!["A".to_string()];
        assert_eq!(parse_type("list(A)", &params).unwrap(), CelType::list(CelType::type_param("A")));
        // without the declaration the same name is a struct reference
        assert_eq!(parse_type("A", &[]).unwrap(), CelType::Struct("A".to_string()));
    }

    #[test]
    fn dyn_is_assignable_both_ways() {
        let mut subs = Substitution::new();
        assert!(CelType::Dyn.assignable_to(&CelType::Int, &mut subs));
        assert!(CelType::Int.assignable_to(&CelType::Dyn, &mut subs));
        assert!(CelType::Any.assignable_to(&CelType::String, &mut subs));
    }

    #[test]
    fn type_param_unification_flows_into_result() {
        // index(list(A), int) -> A applied to (list(string), int)
        let mut subs = Substitution::new();
        let param = CelType::list(CelType::type_param("A"));
        let arg = CelType::list(CelType::String);
        assert!(arg.assignable_to(&param, &mut subs));
        assert_eq!(CelType::type_param("A").substitute(&subs), CelType::String);
    }

    #[test]
    fn conflicting_param_bindings_reject() {
        let mut subs = Substitution::new();
        assert!(CelType::Int.assignable_to(&CelType::type_param("A"), &mut subs));
        assert!(!CelType::String.assignable_to(&CelType::type_param("A"), &mut subs));
    }

    #[test]
    fn map_keys_are_invariant() {
        let mut subs = Substitution::new();
        let from = CelType::map(CelType::Int, CelType::Int);
        let to = CelType::map(CelType::String, CelType::Int);
        assert!(!from.assignable_to(&to, &mut subs));
        // values are covariant through dyn
        let to_dyn_value = CelType::map(CelType::Int, CelType::Dyn);
        assert!(from.assignable_to(&to_dyn_value, &mut subs));
    }

    #[test]
    fn optional_covariance() {
        let mut subs = Substitution::new();
        let from = CelType::optional(CelType::Int);
        assert!(from.assignable_to(&CelType::optional(CelType::Dyn), &mut subs));
        assert!(!from.assignable_to(&CelType::optional(CelType::String), &mut subs));
    }

    #[test]
    fn generality_ranks_exact_before_dyn() {
        assert_eq!(CelType::String.generality_against(&CelType::String), 0);
        assert_eq!(CelType::List(Box::new(CelType::Dyn)).generality_against(&CelType::list(CelType::Int)), 1);
        assert_eq!(CelType::Dyn.generality_against(&CelType::String), 2);
    }
}
