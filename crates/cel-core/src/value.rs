//! Runtime values.
//!
//! `Value` is a tagged union mirroring the type algebra plus two evaluator
//! internals: `Error` (faults flow through the non-strict operators as
//! values) and `Unknown` (merged attribute sets reserved for partial
//! evaluation). Aggregates are `Arc`-shared: one plan may be evaluated from
//! many threads, and values are immutable sums, so sharing is safe and
//! cloning is cheap.
//!
//! Arithmetic is checked 64-bit: overflow fails, it never wraps. Doubles are
//! IEEE-754 with the usual ±Inf/NaN results. Durations and timestamps are
//! fixed-range; leaving the range fails with an overflow error.

use std::{
    cmp::Ordering,
    fmt::{self, Write},
    hash::{Hash, Hasher},
    sync::Arc,
};

use chrono::{DateTime, SecondsFormat, TimeDelta, TimeZone, Utc};
use indexmap::IndexMap;

use crate::{
    error::{CelError, EvalResult},
    types::CelType,
};

/// Timestamp range in whole seconds since the epoch: 0001-01-01T00:00:00Z
/// through 9999-12-31T23:59:59Z, matching the well-known protobuf range.
pub const MIN_TIMESTAMP_SECONDS: i64 = -62_135_596_800;
pub const MAX_TIMESTAMP_SECONDS: i64 = 253_402_300_799;

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Primary runtime value type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    String(Arc<str>),
    Bytes(Arc<[u8]>),
    Duration(TimeDelta),
    Timestamp(DateTime<Utc>),
    List(Arc<Vec<Value>>),
    Map(Arc<MapValue>),
    Struct(Arc<StructValue>),
    /// A type as a first-class value, e.g. the result of `type(x)`.
    Type(CelType),
    Optional(OptionalValue),
    /// A fault as a value. Strict operators propagate it; `&&`, `||`, and
    /// `?:` may absorb it.
    Error(Box<CelError>),
    /// A merged set of unresolved attributes, reserved for partial
    /// evaluation.
    Unknown(Arc<UnknownSet>),
}

/// Discriminant-level kind used for runtime overload dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Uint,
    Double,
    String,
    Bytes,
    Duration,
    Timestamp,
    List,
    Map,
    Struct,
    Type,
    Optional,
    Error,
    Unknown,
}

/// The two states of an optional value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionalValue {
    Present(Box<Value>),
    Absent,
}

impl OptionalValue {
    pub fn of(value: Value) -> Self {
        Self::Present(Box::new(value))
    }
}

/// An insertion-ordered CEL map.
///
/// Keys admit `bool`, `int`, `uint`, and `string`; numerically equal `int`
/// and `uint` keys are the same key. Iteration order is insertion order,
/// which is also the order comprehensions observe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapValue {
    entries: IndexMap<MapKey, Value>,
}

impl MapValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
        }
    }

    /// Inserts an entry, returning the previous value when the key repeats.
    pub fn insert(&mut self, key: MapKey, value: Value) -> Option<Value> {
        self.entries.insert(key, value)
    }

    pub fn get(&self, key: &MapKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &MapKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MapKey, &Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &MapKey> {
        self.entries.keys()
    }
}

impl FromIterator<(MapKey, Value)> for MapValue {
    fn from_iter<T: IntoIterator<Item = (MapKey, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A CEL map key.
#[derive(Debug, Clone, Eq)]
pub enum MapKey {
    Bool(bool),
    Int(i64),
    Uint(u64),
    String(Arc<str>),
}

impl MapKey {
    /// Converts a runtime value into a key. Doubles, aggregates, and null are
    /// not valid key types.
    pub fn from_value(value: &Value) -> EvalResult<MapKey> {
        match value {
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Int(i) => Ok(Self::Int(*i)),
            Value::Uint(u) => Ok(Self::Uint(*u)),
            Value::String(s) => Ok(Self::String(s.clone())),
            other => Err(CelError::invalid_argument(format!(
                "unsupported map key type: {}",
                other.runtime_type()
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::Uint(u) => Value::Uint(*u),
            Self::String(s) => Value::String(s.clone()),
        }
    }
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Uint(a), Self::Uint(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            // numerically equal int and uint keys are the same key
            (Self::Int(i), Self::Uint(u)) | (Self::Uint(u), Self::Int(i)) => {
                *i >= 0 && u64::try_from(*i).is_ok_and(|iv| iv == *u)
            }
            _ => false,
        }
    }
}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Int and Uint must hash identically when numerically equal to keep
        // Hash consistent with Eq.
        match self {
            Self::Bool(b) => {
                state.write_u8(2);
                b.hash(state);
            }
            Self::Int(i) if *i >= 0 => {
                state.write_u8(0);
                state.write_u64(*i as u64);
            }
            Self::Int(i) => {
                state.write_u8(1);
                state.write_i64(*i);
            }
            Self::Uint(u) => {
                state.write_u8(0);
                state.write_u64(*u);
            }
            Self::String(s) => {
                state.write_u8(3);
                s.hash(state);
            }
        }
    }
}

/// A dynamically typed struct (message) value: a type name plus the fields
/// that were explicitly set, in declaration order of construction.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub type_name: String,
    pub fields: IndexMap<String, Value>,
}

impl StructValue {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: IndexMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// A set of attribute names that could not be resolved, merged across
/// sibling subexpressions as evaluation proceeds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnknownSet {
    pub attributes: Vec<String>,
}

impl UnknownSet {
    pub fn single(attribute: impl Into<String>) -> Self {
        Self {
            attributes: vec![attribute.into()],
        }
    }

    #[must_use]
    pub fn merged(&self, other: &UnknownSet) -> UnknownSet {
        let mut attributes = self.attributes.clone();
        for attr in &other.attributes {
            if !attributes.contains(attr) {
                attributes.push(attr.clone());
            }
        }
        UnknownSet { attributes }
    }
}

impl Value {
    pub fn error(err: CelError) -> Value {
        Value::Error(Box::new(err))
    }

    /// Promotes an AST literal into a runtime value.
    pub fn from_constant(constant: &crate::ast::Constant) -> Value {
        use crate::ast::Constant;
        match constant {
            Constant::Null => Value::Null,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Uint(u) => Value::Uint(*u),
            Constant::Double(d) => Value::Double(*d),
            Constant::String(s) => Value::String(s.as_str().into()),
            Constant::Bytes(b) => Value::Bytes(b.clone().into()),
        }
    }

    /// Demotes a runtime value back into an AST literal, when one exists.
    /// Aggregates and time values have no literal form and return `None`.
    pub fn to_constant(&self) -> Option<crate::ast::Constant> {
        use crate::ast::Constant;
        match self {
            Self::Null => Some(Constant::Null),
            Self::Bool(b) => Some(Constant::Bool(*b)),
            Self::Int(i) => Some(Constant::Int(*i)),
            Self::Uint(u) => Some(Constant::Uint(*u)),
            Self::Double(d) => Some(Constant::Double(*d)),
            Self::String(s) => Some(Constant::String(s.to_string())),
            Self::Bytes(b) => Some(Constant::Bytes(b.to_vec())),
            _ => None,
        }
    }

    pub fn unknown(set: UnknownSet) -> Value {
        Value::Unknown(Arc::new(set))
    }

    pub fn list(values: Vec<Value>) -> Value {
        Value::List(Arc::new(values))
    }

    pub fn map(map: MapValue) -> Value {
        Value::Map(Arc::new(map))
    }

    pub fn optional_of(value: Value) -> Value {
        Value::Optional(OptionalValue::of(value))
    }

    pub fn optional_none() -> Value {
        Value::Optional(OptionalValue::Absent)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Uint(_) => ValueKind::Uint,
            Self::Double(_) => ValueKind::Double,
            Self::String(_) => ValueKind::String,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Duration(_) => ValueKind::Duration,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::List(_) => ValueKind::List,
            Self::Map(_) => ValueKind::Map,
            Self::Struct(_) => ValueKind::Struct,
            Self::Type(_) => ValueKind::Type,
            Self::Optional(_) => ValueKind::Optional,
            Self::Error(_) => ValueKind::Error,
            Self::Unknown(_) => ValueKind::Unknown,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }

    /// The runtime type reported by `type(x)`. Aggregates report their
    /// dynamic element types as `dyn` since values carry no type arguments.
    pub fn runtime_type(&self) -> CelType {
        match self {
            Self::Null => CelType::Null,
            Self::Bool(_) => CelType::Bool,
            Self::Int(_) => CelType::Int,
            Self::Uint(_) => CelType::Uint,
            Self::Double(_) => CelType::Double,
            Self::String(_) => CelType::String,
            Self::Bytes(_) => CelType::Bytes,
            Self::Duration(_) => CelType::Duration,
            Self::Timestamp(_) => CelType::Timestamp,
            Self::List(_) => CelType::list(CelType::Dyn),
            Self::Map(_) => CelType::map(CelType::Dyn, CelType::Dyn),
            Self::Struct(s) => CelType::Struct(s.type_name.clone()),
            Self::Type(_) => CelType::Type(None),
            Self::Optional(_) => CelType::optional(CelType::Dyn),
            Self::Error(_) => CelType::Error,
            Self::Unknown(_) => CelType::Dyn,
        }
    }

    /// CEL equality. Heterogeneous comparisons are `false`, numeric
    /// comparisons are mathematical across `int`/`uint`/`double`, and NaN is
    /// unequal to everything including itself.
    pub fn cel_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Uint(a), Self::Uint(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::Int(i), Self::Uint(u)) | (Self::Uint(u), Self::Int(i)) => {
                cmp_int_uint(*i, *u) == Ordering::Equal
            }
            (Self::Int(i), Self::Double(d)) | (Self::Double(d), Self::Int(i)) => {
                cmp_int_double(*i, *d) == Some(Ordering::Equal)
            }
            (Self::Uint(u), Self::Double(d)) | (Self::Double(d), Self::Uint(u)) => {
                cmp_uint_double(*u, *d) == Some(Ordering::Equal)
            }
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Duration(a), Self::Duration(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.cel_eq(y))
            }
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|bv| v.cel_eq(bv)))
            }
            (Self::Struct(a), Self::Struct(b)) => {
                a.type_name == b.type_name
                    && a.fields.len() == b.fields.len()
                    && a.fields
                        .iter()
                        .all(|(k, v)| b.fields.get(k).is_some_and(|bv| v.cel_eq(bv)))
            }
            (Self::Type(a), Self::Type(b)) => a == b,
            (Self::Optional(a), Self::Optional(b)) => match (a, b) {
                (OptionalValue::Absent, OptionalValue::Absent) => true,
                (OptionalValue::Present(x), OptionalValue::Present(y)) => x.cel_eq(y),
                _ => false,
            },
            _ => false,
        }
    }

    /// CEL ordering across the comparable kinds. `None` means the pair has
    /// no defined order, which at the surface makes every comparison false
    /// (the NaN rule).
    pub fn cel_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Uint(a), Self::Uint(b)) => Some(a.cmp(b)),
            (Self::Double(a), Self::Double(b)) => a.partial_cmp(b),
            (Self::Int(i), Self::Uint(u)) => Some(cmp_int_uint(*i, *u)),
            (Self::Uint(u), Self::Int(i)) => Some(cmp_int_uint(*i, *u).reverse()),
            (Self::Int(i), Self::Double(d)) => cmp_int_double(*i, *d),
            (Self::Double(d), Self::Int(i)) => cmp_int_double(*i, *d).map(Ordering::reverse),
            (Self::Uint(u), Self::Double(d)) => cmp_uint_double(*u, *d),
            (Self::Double(d), Self::Uint(u)) => cmp_uint_double(*u, *d).map(Ordering::reverse),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            (Self::Duration(a), Self::Duration(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// The element count reported by `size`.
    pub fn size(&self) -> Option<i64> {
        match self {
            // code points, not bytes
            Self::String(s) => Some(s.chars().count() as i64),
            Self::Bytes(b) => Some(b.len() as i64),
            Self::List(l) => Some(l.len() as i64),
            Self::Map(m) => Some(m.len() as i64),
            _ => None,
        }
    }

    /// The zero-value test used by `optional.ofNonZeroValue`.
    pub fn is_zero_value(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(b) => !b,
            Self::Int(i) => *i == 0,
            Self::Uint(u) => *u == 0,
            Self::Double(d) => *d == 0.0,
            Self::String(s) => s.is_empty(),
            Self::Bytes(b) => b.is_empty(),
            Self::Duration(d) => d.is_zero(),
            Self::Timestamp(t) => t.timestamp() == 0 && t.timestamp_subsec_nanos() == 0,
            Self::List(l) => l.is_empty(),
            Self::Map(m) => m.is_empty(),
            Self::Struct(s) => s.fields.is_empty(),
            Self::Optional(o) => matches!(o, OptionalValue::Absent),
            Self::Type(_) | Self::Error(_) | Self::Unknown(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Numeric comparison helpers
// ---------------------------------------------------------------------------

fn cmp_int_uint(i: i64, u: u64) -> Ordering {
    if i < 0 {
        Ordering::Less
    } else {
        (i as u64).cmp(&u)
    }
}

/// Mathematical comparison of an i64 against a double, exact over the whole
/// 64-bit range. `None` iff the double is NaN.
fn cmp_int_double(i: i64, d: f64) -> Option<Ordering> {
    if d.is_nan() {
        return None;
    }
    // 2^63 is exactly representable; anything at or beyond it exceeds i64
    if d >= 9_223_372_036_854_775_808.0 {
        return Some(Ordering::Less);
    }
    if d < -9_223_372_036_854_775_808.0 {
        return Some(Ordering::Greater);
    }
    let trunc = d.trunc() as i64;
    match i.cmp(&trunc) {
        Ordering::Equal => {
            let frac = d - d.trunc();
            if frac > 0.0 {
                Some(Ordering::Less)
            } else if frac < 0.0 {
                Some(Ordering::Greater)
            } else {
                Some(Ordering::Equal)
            }
        }
        other => Some(other),
    }
}

fn cmp_uint_double(u: u64, d: f64) -> Option<Ordering> {
    if d.is_nan() {
        return None;
    }
    if d >= 18_446_744_073_709_551_616.0 {
        return Some(Ordering::Less);
    }
    if d < 0.0 {
        return Some(Ordering::Greater);
    }
    let trunc = d.trunc() as u64;
    match u.cmp(&trunc) {
        Ordering::Equal => {
            let frac = d - d.trunc();
            if frac > 0.0 {
                Some(Ordering::Less)
            } else {
                Some(Ordering::Equal)
            }
        }
        other => Some(other),
    }
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

impl Value {
    pub fn checked_add(&self, other: &Value) -> EvalResult<Value> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_add(*b)
                .map(Value::Int)
                .ok_or_else(|| CelError::overflow("addition")),
            (Self::Uint(a), Self::Uint(b)) => a
                .checked_add(*b)
                .map(Value::Uint)
                .ok_or_else(|| CelError::overflow("addition")),
            (Self::Double(a), Self::Double(b)) => Ok(Value::Double(a + b)),
            (Self::String(a), Self::String(b)) => {
                let mut out = String::with_capacity(a.len() + b.len());
                out.push_str(a);
                out.push_str(b);
                Ok(Value::String(out.into()))
            }
            (Self::Bytes(a), Self::Bytes(b)) => {
                let mut out = Vec::with_capacity(a.len() + b.len());
                out.extend_from_slice(a);
                out.extend_from_slice(b);
                Ok(Value::Bytes(out.into()))
            }
            (Self::List(a), Self::List(b)) => {
                let mut out = Vec::with_capacity(a.len() + b.len());
                out.extend(a.iter().cloned());
                out.extend(b.iter().cloned());
                Ok(Value::list(out))
            }
            (Self::Duration(a), Self::Duration(b)) => {
                duration_from_nanos(duration_nanos(a) + duration_nanos(b)).map(Value::Duration)
            }
            (Self::Timestamp(t), Self::Duration(d)) | (Self::Duration(d), Self::Timestamp(t)) => {
                timestamp_add_nanos(t, duration_nanos(d)).map(Value::Timestamp)
            }
            _ => Err(CelError::no_matching_overload("_+_")),
        }
    }

    pub fn checked_sub(&self, other: &Value) -> EvalResult<Value> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_sub(*b)
                .map(Value::Int)
                .ok_or_else(|| CelError::overflow("subtraction")),
            (Self::Uint(a), Self::Uint(b)) => a
                .checked_sub(*b)
                .map(Value::Uint)
                .ok_or_else(|| CelError::overflow("subtraction")),
            (Self::Double(a), Self::Double(b)) => Ok(Value::Double(a - b)),
            (Self::Duration(a), Self::Duration(b)) => {
                duration_from_nanos(duration_nanos(a) - duration_nanos(b)).map(Value::Duration)
            }
            (Self::Timestamp(t), Self::Duration(d)) => {
                timestamp_add_nanos(t, -duration_nanos(d)).map(Value::Timestamp)
            }
            (Self::Timestamp(a), Self::Timestamp(b)) => {
                let nanos = timestamp_nanos(a) - timestamp_nanos(b);
                duration_from_nanos(nanos).map(Value::Duration)
            }
            _ => Err(CelError::no_matching_overload("_-_")),
        }
    }

    pub fn checked_mul(&self, other: &Value) -> EvalResult<Value> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_mul(*b)
                .map(Value::Int)
                .ok_or_else(|| CelError::overflow("multiplication")),
            (Self::Uint(a), Self::Uint(b)) => a
                .checked_mul(*b)
                .map(Value::Uint)
                .ok_or_else(|| CelError::overflow("multiplication")),
            (Self::Double(a), Self::Double(b)) => Ok(Value::Double(a * b)),
            _ => Err(CelError::no_matching_overload("_*_")),
        }
    }

    pub fn checked_div(&self, other: &Value) -> EvalResult<Value> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                if *b == 0 {
                    Err(CelError::divide_by_zero())
                } else {
                    a.checked_div(*b)
                        .map(Value::Int)
                        .ok_or_else(|| CelError::overflow("division"))
                }
            }
            (Self::Uint(a), Self::Uint(b)) => {
                if *b == 0 {
                    Err(CelError::divide_by_zero())
                } else {
                    Ok(Value::Uint(a / b))
                }
            }
            // IEEE-754: ±Inf and NaN are results, not faults
            (Self::Double(a), Self::Double(b)) => Ok(Value::Double(a / b)),
            (Self::Duration(d), Self::Int(n)) => {
                if *n == 0 {
                    Err(CelError::divide_by_zero())
                } else {
                    // sub-second remainders are kept, nothing truncates to seconds
                    duration_from_nanos(duration_nanos(d) / i128::from(*n)).map(Value::Duration)
                }
            }
            _ => Err(CelError::no_matching_overload("_/_")),
        }
    }

    pub fn checked_rem(&self, other: &Value) -> EvalResult<Value> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                if *b == 0 {
                    Err(CelError::modulus_by_zero())
                } else {
                    a.checked_rem(*b)
                        .map(Value::Int)
                        .ok_or_else(|| CelError::overflow("modulus"))
                }
            }
            (Self::Uint(a), Self::Uint(b)) => {
                if *b == 0 {
                    Err(CelError::modulus_by_zero())
                } else {
                    Ok(Value::Uint(a % b))
                }
            }
            _ => Err(CelError::no_matching_overload("_%_")),
        }
    }

    pub fn checked_neg(&self) -> EvalResult<Value> {
        match self {
            Self::Int(a) => a
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| CelError::overflow("negation")),
            Self::Double(a) => Ok(Value::Double(-a)),
            _ => Err(CelError::no_matching_overload("-_")),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl Value {
    pub fn convert_to_int(&self) -> EvalResult<Value> {
        match self {
            Self::Int(i) => Ok(Value::Int(*i)),
            Self::Uint(u) => i64::try_from(*u)
                .map(Value::Int)
                .map_err(|_| CelError::conversion("uint out of int range")),
            Self::Double(d) => {
                if d.is_nan() || *d >= 9_223_372_036_854_775_808.0 || *d < -9_223_372_036_854_775_808.0 {
                    Err(CelError::conversion("double out of int range"))
                } else {
                    Ok(Value::Int(d.trunc() as i64))
                }
            }
            Self::String(s) => s
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| CelError::conversion(format!("cannot parse '{s}' as int"))),
            Self::Timestamp(t) => Ok(Value::Int(t.timestamp())),
            other => Err(CelError::conversion(format!(
                "cannot convert {} to int",
                other.runtime_type()
            ))),
        }
    }

    pub fn convert_to_uint(&self) -> EvalResult<Value> {
        match self {
            Self::Uint(u) => Ok(Value::Uint(*u)),
            Self::Int(i) => u64::try_from(*i)
                .map(Value::Uint)
                .map_err(|_| CelError::conversion("int out of uint range")),
            Self::Double(d) => {
                if d.is_nan() || *d >= 18_446_744_073_709_551_616.0 || *d < 0.0 {
                    Err(CelError::conversion("double out of uint range"))
                } else {
                    Ok(Value::Uint(d.trunc() as u64))
                }
            }
            Self::String(s) => s
                .parse::<u64>()
                .map(Value::Uint)
                .map_err(|_| CelError::conversion(format!("cannot parse '{s}' as uint"))),
            other => Err(CelError::conversion(format!(
                "cannot convert {} to uint",
                other.runtime_type()
            ))),
        }
    }

    pub fn convert_to_double(&self) -> EvalResult<Value> {
        match self {
            Self::Double(d) => Ok(Value::Double(*d)),
            Self::Int(i) => Ok(Value::Double(*i as f64)),
            Self::Uint(u) => Ok(Value::Double(*u as f64)),
            Self::String(s) => s
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|_| CelError::conversion(format!("cannot parse '{s}' as double"))),
            other => Err(CelError::conversion(format!(
                "cannot convert {} to double",
                other.runtime_type()
            ))),
        }
    }

    pub fn convert_to_string(&self) -> EvalResult<Value> {
        match self {
            Self::String(s) => Ok(Value::String(s.clone())),
            Self::Int(i) => Ok(Value::String(i.to_string().into())),
            Self::Uint(u) => Ok(Value::String(u.to_string().into())),
            Self::Double(d) => Ok(Value::String(format_double(*d).into())),
            Self::Bool(b) => Ok(Value::String(if *b { "true" } else { "false" }.into())),
            Self::Bytes(b) => std::str::from_utf8(b)
                .map(|s| Value::String(s.into()))
                .map_err(|_| CelError::conversion("bytes are not valid UTF-8")),
            Self::Timestamp(t) => Ok(Value::String(format_timestamp(t).into())),
            Self::Duration(d) => Ok(Value::String(format_duration(d).into())),
            other => Err(CelError::conversion(format!(
                "cannot convert {} to string",
                other.runtime_type()
            ))),
        }
    }

    pub fn convert_to_bytes(&self) -> EvalResult<Value> {
        match self {
            Self::Bytes(b) => Ok(Value::Bytes(b.clone())),
            Self::String(s) => Ok(Value::Bytes(s.as_bytes().to_vec().into())),
            other => Err(CelError::conversion(format!(
                "cannot convert {} to bytes",
                other.runtime_type()
            ))),
        }
    }

    pub fn convert_to_bool(&self) -> EvalResult<Value> {
        match self {
            Self::Bool(b) => Ok(Value::Bool(*b)),
            Self::String(s) => match s.as_ref() {
                "true" | "True" | "TRUE" | "t" | "1" => Ok(Value::Bool(true)),
                "false" | "False" | "FALSE" | "f" | "0" => Ok(Value::Bool(false)),
                _ => Err(CelError::conversion(format!("cannot parse '{s}' as bool"))),
            },
            other => Err(CelError::conversion(format!(
                "cannot convert {} to bool",
                other.runtime_type()
            ))),
        }
    }

    pub fn convert_to_timestamp(&self) -> EvalResult<Value> {
        match self {
            Self::Timestamp(t) => Ok(Value::Timestamp(*t)),
            Self::String(s) => parse_timestamp(s).map(Value::Timestamp),
            Self::Int(secs) => timestamp_from_parts(*secs, 0).map(Value::Timestamp),
            other => Err(CelError::conversion(format!(
                "cannot convert {} to timestamp",
                other.runtime_type()
            ))),
        }
    }

    pub fn convert_to_duration(&self) -> EvalResult<Value> {
        match self {
            Self::Duration(d) => Ok(Value::Duration(*d)),
            Self::String(s) => parse_duration(s).map(Value::Duration),
            other => Err(CelError::conversion(format!(
                "cannot convert {} to duration",
                other.runtime_type()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Duration and timestamp helpers
// ---------------------------------------------------------------------------

pub(crate) fn duration_nanos(d: &TimeDelta) -> i128 {
    i128::from(d.num_seconds()) * NANOS_PER_SECOND + i128::from(d.subsec_nanos())
}

pub(crate) fn duration_from_nanos(nanos: i128) -> EvalResult<TimeDelta> {
    if i64::try_from(nanos).is_err() {
        return Err(CelError::overflow("duration arithmetic"));
    }
    let secs = nanos.div_euclid(NANOS_PER_SECOND) as i64;
    let sub = nanos.rem_euclid(NANOS_PER_SECOND) as u32;
    TimeDelta::new(secs, sub).ok_or_else(|| CelError::overflow("duration arithmetic"))
}

fn timestamp_nanos(t: &DateTime<Utc>) -> i128 {
    i128::from(t.timestamp()) * NANOS_PER_SECOND + i128::from(t.timestamp_subsec_nanos())
}

fn timestamp_add_nanos(t: &DateTime<Utc>, nanos: i128) -> EvalResult<DateTime<Utc>> {
    let total = timestamp_nanos(t) + nanos;
    let secs = total.div_euclid(NANOS_PER_SECOND);
    let sub = total.rem_euclid(NANOS_PER_SECOND) as u32;
    let secs = i64::try_from(secs).map_err(|_| CelError::overflow("timestamp arithmetic"))?;
    timestamp_from_parts(secs, sub)
}

pub(crate) fn timestamp_from_parts(secs: i64, nanos: u32) -> EvalResult<DateTime<Utc>> {
    if !(MIN_TIMESTAMP_SECONDS..=MAX_TIMESTAMP_SECONDS).contains(&secs) {
        return Err(CelError::overflow("timestamp out of range"));
    }
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| CelError::overflow("timestamp out of range"))
}

pub(crate) fn parse_timestamp(s: &str) -> EvalResult<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(s)
        .map_err(|e| CelError::conversion(format!("cannot parse timestamp '{s}': {e}")))?
        .with_timezone(&Utc);
    timestamp_from_parts(parsed.timestamp(), parsed.timestamp_subsec_nanos())
}

pub(crate) fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Formats a duration as decimal seconds with a trailing `s`, trimming
/// trailing zeros from the fraction: `3s`, `0.5s`, `-1.25s`.
pub(crate) fn format_duration(d: &TimeDelta) -> String {
    let total = duration_nanos(d);
    let negative = total < 0;
    let magnitude = total.unsigned_abs();
    let secs = magnitude / NANOS_PER_SECOND as u128;
    let sub = (magnitude % NANOS_PER_SECOND as u128) as u64;
    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if sub == 0 {
        let _ = write!(out, "{secs}s");
    } else {
        let frac = format!("{sub:09}");
        let frac = frac.trim_end_matches('0');
        let _ = write!(out, "{secs}.{frac}s");
    }
    out
}

/// Parses a duration literal: an optional sign followed by one or more
/// `<decimal><unit>` segments with units `h`, `m`, `s`, `ms`, `us`, `ns`.
/// The bare string `0` is also accepted.
pub(crate) fn parse_duration(s: &str) -> EvalResult<TimeDelta> {
    let original = s;
    let mut rest = s;
    let mut sign: i128 = 1;
    if let Some(stripped) = rest.strip_prefix('-') {
        sign = -1;
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped;
    }
    if rest == "0" {
        return Ok(TimeDelta::zero());
    }
    if rest.is_empty() {
        return Err(CelError::conversion(format!("cannot parse duration '{original}'")));
    }
    let mut total: i128 = 0;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| CelError::conversion(format!("missing unit in duration '{original}'")))?;
        if digits_end == 0 {
            return Err(CelError::conversion(format!("cannot parse duration '{original}'")));
        }
        let (number, tail) = rest.split_at(digits_end);
        let (unit, tail) = duration_unit(tail)
            .ok_or_else(|| CelError::conversion(format!("bad unit in duration '{original}'")))?;
        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        let whole: i128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| CelError::conversion(format!("cannot parse duration '{original}'")))?
        };
        total += whole * unit;
        if !frac_part.is_empty() {
            let mut frac_nanos: i128 = 0;
            let mut scale = unit;
            for c in frac_part.chars() {
                let digit = c
                    .to_digit(10)
                    .ok_or_else(|| CelError::conversion(format!("cannot parse duration '{original}'")))?;
                scale /= 10;
                frac_nanos += i128::from(digit) * scale;
            }
            total += frac_nanos;
        }
        rest = tail;
    }
    duration_from_nanos(sign * total)
}

fn duration_unit(s: &str) -> Option<(i128, &str)> {
    // longest units first so "ms" is not read as minutes
    for (unit, nanos) in [
        ("ms", 1_000_000_i128),
        ("us", 1_000),
        ("ns", 1),
        ("h", 3_600_000_000_000),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
    ] {
        if let Some(rest) = s.strip_prefix(unit) {
            return Some((nanos, rest));
        }
    }
    None
}

/// Canonical double formatting: `ryu` shortest form, which always keeps a
/// fractional part or exponent (`1.0`, `6e22`).
pub(crate) fn format_double(d: f64) -> String {
    if d.is_nan() {
        return "nan".to_string();
    }
    if d.is_infinite() {
        return if d > 0.0 { "+inf" } else { "-inf" }.to_string();
    }
    let mut buf = ryu::Buffer::new();
    buf.format(d).to_string()
}

// ---------------------------------------------------------------------------
// Strictness helpers
// ---------------------------------------------------------------------------

/// Returns the propagated value for a strict operation: merged unknowns if
/// any argument is unknown, otherwise the first error, otherwise `None`.
pub(crate) fn strict_precondition(args: &[Value]) -> Option<Value> {
    let mut unknowns: Option<UnknownSet> = None;
    for arg in args {
        if let Value::Unknown(set) = arg {
            unknowns = Some(match unknowns {
                Some(acc) => acc.merged(set),
                None => set.as_ref().clone(),
            });
        }
    }
    if let Some(set) = unknowns {
        return Some(Value::unknown(set));
    }
    args.iter().find(|a| a.is_error()).cloned()
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v.into())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Uint(u) => write!(f, "{u}u"),
            Self::Double(d) => write!(f, "{}", format_double(*d)),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => {
                write!(f, "b\"")?;
                for byte in b.iter() {
                    if byte.is_ascii_graphic() || *byte == b' ' {
                        f.write_char(*byte as char)?;
                    } else {
                        write!(f, "\\x{byte:02x}")?;
                    }
                }
                write!(f, "\"")
            }
            Self::Duration(d) => write!(f, "duration(\"{}\")", format_duration(d)),
            Self::Timestamp(t) => write!(f, "timestamp(\"{}\")", format_timestamp(t)),
            Self::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Self::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {v}", k.to_value())?;
                }
                write!(f, "}}")
            }
            Self::Struct(s) => {
                write!(f, "{}{{", s.type_name)?;
                for (i, (k, v)) in s.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Type(t) => write!(f, "{t}"),
            Self::Optional(OptionalValue::Present(v)) => write!(f, "optional.of({v})"),
            Self::Optional(OptionalValue::Absent) => write!(f, "optional.none()"),
            Self::Error(e) => write!(f, "{e}"),
            Self::Unknown(u) => write!(f, "unknown({})", u.attributes.join(", ")),
        }
    }
}
