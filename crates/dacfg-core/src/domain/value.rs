//! Typed configuration values and the closed set of declarable types.
//!
//! Every configuration key is declared in the schema with exactly one
//! [`ValueType`].  Values travelling through the client are represented as a
//! [`TypedValue`]: a tagged variant whose tag must agree with the declared
//! type before anything reaches a backend.
//!
//! # Why a closed enum? (for beginners)
//!
//! A dynamically-typed configuration API usually picks an accessor by
//! building a method name at runtime (`"get_" + type_name`).  In Rust the
//! natural replacement is a `match` over an enum: the compiler checks that
//! every type is handled, and adding a new type forces every `match` to be
//! revisited.
//!
//! Lists are homogeneous: a `list<int>` key only ever holds
//! `TypedValue::Int` elements.  The list itself is stored as
//! `Vec<TypedValue>` so that a mismatched element can be *detected* and
//! reported rather than being unrepresentable, which matters for values
//! parsed from text (CLI input, backend contents).

use std::fmt;

/// Element types a list may be declared with.  Lists of lists are not
/// expressible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarType {
    Bool,
    Int,
    Float,
    String,
}

impl ScalarType {
    /// Canonical schema spelling of the type.
    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Bool => "bool",
            ScalarType::Int => "int",
            ScalarType::Float => "float",
            ScalarType::String => "string",
        }
    }

    /// Parses a schema type tag.  Long aliases (`boolean`, `integer`) are
    /// accepted alongside the canonical names.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Some(ScalarType::Bool),
            "int" | "integer" => Some(ScalarType::Int),
            "float" | "double" => Some(ScalarType::Float),
            "string" | "str" => Some(ScalarType::String),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The declared type of a schema entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    String,
    /// Homogeneous list whose elements all have the given scalar type.
    List(ScalarType),
}

impl ValueType {
    /// Parses `bool`, `int`, `float`, `string`, or `list<scalar>`.
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        if let Some(inner) = tag
            .strip_prefix("list<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            return ScalarType::parse(inner).map(ValueType::List);
        }
        ScalarType::parse(tag).map(ValueType::from)
    }

    /// Returns the scalar type for non-list types.
    pub fn as_scalar(self) -> Option<ScalarType> {
        match self {
            ValueType::Bool => Some(ScalarType::Bool),
            ValueType::Int => Some(ScalarType::Int),
            ValueType::Float => Some(ScalarType::Float),
            ValueType::String => Some(ScalarType::String),
            ValueType::List(_) => None,
        }
    }

    pub fn is_list(self) -> bool {
        matches!(self, ValueType::List(_))
    }
}

impl From<ScalarType> for ValueType {
    fn from(scalar: ScalarType) -> Self {
        match scalar {
            ScalarType::Bool => ValueType::Bool,
            ScalarType::Int => ValueType::Int,
            ScalarType::Float => ValueType::Float,
            ScalarType::String => ValueType::String,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::List(elem) => write!(f, "list<{elem}>"),
            other => match other.as_scalar() {
                Some(scalar) => f.write_str(scalar.name()),
                None => Ok(()),
            },
        }
    }
}

/// A strongly-typed configuration value.
///
/// Constructed fresh on every read; nothing caches it beyond the call.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<TypedValue>),
}

impl TypedValue {
    /// Short name of the variant, used in type-mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            TypedValue::Bool(_) => "bool",
            TypedValue::Int(_) => "int",
            TypedValue::Float(_) => "float",
            TypedValue::String(_) => "string",
            TypedValue::List(_) => "list",
        }
    }

    /// Returns the scalar type of a non-list value.
    pub fn scalar_type(&self) -> Option<ScalarType> {
        match self {
            TypedValue::Bool(_) => Some(ScalarType::Bool),
            TypedValue::Int(_) => Some(ScalarType::Int),
            TypedValue::Float(_) => Some(ScalarType::Float),
            TypedValue::String(_) => Some(ScalarType::String),
            TypedValue::List(_) => None,
        }
    }

    /// `true` when the value can be stored under a key of type `ty`.
    ///
    /// For lists every element must be a scalar of the declared element type.
    pub fn matches(&self, ty: ValueType) -> bool {
        match (self, ty) {
            (TypedValue::List(items), ValueType::List(elem)) => {
                items.iter().all(|item| item.scalar_type() == Some(elem))
            }
            (TypedValue::List(_), _) | (_, ValueType::List(_)) => false,
            (value, scalar) => value.scalar_type().map(ValueType::from) == Some(scalar),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            TypedValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            TypedValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[TypedValue]> {
        match self {
            TypedValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Compares two values with floats (including list elements) rounded to
    /// `decimals` places.
    ///
    /// Floating-point values only survive storage to 3 decimal places, so
    /// callers comparing a written float with the value read back should use
    /// this instead of `==`.
    pub fn approx_eq(&self, other: &TypedValue, decimals: i32) -> bool {
        match (self, other) {
            (TypedValue::Float(a), TypedValue::Float(b)) => {
                round_to(*a, decimals) == round_to(*b, decimals)
            }
            (TypedValue::List(a), TypedValue::List(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x.approx_eq(y, decimals))
            }
            (a, b) => a == b,
        }
    }

    /// Equality under which a NaN float equals another NaN.
    ///
    /// `==` on floats never considers NaN equal to itself, so a stored NaN
    /// would look changed on every comparison.
    pub fn same_value(&self, other: &TypedValue) -> bool {
        match (self, other) {
            (TypedValue::Float(a), TypedValue::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (TypedValue::List(a), TypedValue::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_value(y))
            }
            (a, b) => a == b,
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Bool(b) => write!(f, "{b}"),
            TypedValue::Int(i) => write!(f, "{i}"),
            TypedValue::Float(v) => write!(f, "{v}"),
            TypedValue::String(s) => f.write_str(s),
            TypedValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match item {
                        TypedValue::String(s) => write!(f, "{s:?}")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("]")
            }
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl From<bool> for TypedValue {
    fn from(b: bool) -> Self {
        TypedValue::Bool(b)
    }
}

impl From<i64> for TypedValue {
    fn from(i: i64) -> Self {
        TypedValue::Int(i)
    }
}

impl From<i32> for TypedValue {
    fn from(i: i32) -> Self {
        TypedValue::Int(i64::from(i))
    }
}

impl From<f64> for TypedValue {
    fn from(v: f64) -> Self {
        TypedValue::Float(v)
    }
}

impl From<&str> for TypedValue {
    fn from(s: &str) -> Self {
        TypedValue::String(s.to_string())
    }
}

impl From<String> for TypedValue {
    fn from(s: String) -> Self {
        TypedValue::String(s)
    }
}

impl<T: Into<TypedValue>> From<Vec<T>> for TypedValue {
    fn from(items: Vec<T>) -> Self {
        TypedValue::List(items.into_iter().map(Into::into).collect())
    }
}
