//! Textual encoding of typed configuration values.
//!
//! Encoding rules:
//! ```text
//! bool    true | false
//! int     decimal digits, optional leading '-', no separators
//! float   shortest decimal that reconstructs the f64 ("3.14", "-0.5", "NaN")
//! string  the string itself
//! list    each element encoded, '\' and ';' escaped, terminated by ';'
//!         ["a", "b;c"]  ->  a;b\;c;
//!         []            ->  []
//! ```
//!
//! The empty-list marker `[]` can never collide with a non-empty list because
//! every non-empty encoding ends with the `;` terminator.  It is also distinct
//! from "no value", which backends express as the absence of a raw value.
//!
//! Decoding is deliberately more lenient than encoding so that stores written
//! by other tools are readable: booleans accept `1/0`, `yes/no`, `on/off` in
//! any case; floats accept exponents and a lone decimal comma; list elements
//! may omit the final terminator and may use `\n`, `\t`, `\r`, `\s` escapes.
//!
//! Floats are only guaranteed to round-trip to 3 decimal places.  This
//! encoder happens to preserve more, but callers must not rely on it.
//!
//! Nothing here performs I/O; every failure is a validation failure.

use thiserror::Error;

use crate::backend::RawValue;
use crate::domain::schema::SchemaEntry;
use crate::domain::value::{ScalarType, TypedValue, ValueType};

/// Terminates every list element.
pub const LIST_DELIMITER: char = ';';
/// Escapes the delimiter and itself inside list elements.
pub const ESCAPE: char = '\\';
/// Encoding of a list with no elements.
pub const EMPTY_LIST: &str = "[]";

/// Errors produced while encoding or decoding a value.
#[derive(Debug, Error, PartialEq)]
pub enum MarshalError {
    /// The value's tag does not match the declared type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: ValueType, found: String },

    /// The raw text cannot be decoded as the declared type.
    #[error("malformed {expected} value {raw:?}: {reason}")]
    Malformed {
        expected: ValueType,
        raw: String,
        reason: String,
    },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `value` for storage under `entry`.
///
/// # Errors
///
/// [`MarshalError::TypeMismatch`] if the value's tag (or any list element's
/// tag) differs from the entry's declared type.
pub fn encode(entry: &SchemaEntry, value: &TypedValue) -> Result<RawValue, MarshalError> {
    encode_as(entry.value_type, value)
}

/// Decodes a stored raw value for `entry`.
///
/// # Errors
///
/// [`MarshalError::Malformed`] if the raw text is not a valid encoding of the
/// entry's declared type.
pub fn decode(entry: &SchemaEntry, raw: &RawValue) -> Result<TypedValue, MarshalError> {
    decode_as(entry.value_type, raw.as_str())
}

/// Encodes `value` as type `ty`.
///
/// # Errors
///
/// See [`encode`].
pub fn encode_as(ty: ValueType, value: &TypedValue) -> Result<RawValue, MarshalError> {
    if !value.matches(ty) {
        return Err(MarshalError::TypeMismatch {
            expected: ty,
            found: describe(value, ty),
        });
    }

    let text = match value {
        TypedValue::List(items) if items.is_empty() => EMPTY_LIST.to_string(),
        TypedValue::List(items) => {
            let mut buf = String::new();
            for item in items {
                escape_into(&mut buf, &encode_scalar(item));
                buf.push(LIST_DELIMITER);
            }
            buf
        }
        scalar => encode_scalar(scalar),
    };
    Ok(RawValue::new(text))
}

/// Decodes `raw` as type `ty`.  Also used to parse user-typed text.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_as(ty: ValueType, raw: &str) -> Result<TypedValue, MarshalError> {
    let malformed = |reason: String| MarshalError::Malformed {
        expected: ty,
        raw: raw.to_string(),
        reason,
    };

    match ty {
        ValueType::List(elem) => {
            let parts = split_list(raw).map_err(malformed)?;
            parts
                .iter()
                .enumerate()
                .map(|(i, part)| {
                    decode_scalar(elem, part).map_err(|e| malformed(format!("element {i}: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(TypedValue::List)
        }
        scalar => match scalar.as_scalar() {
            Some(scalar) => decode_scalar(scalar, raw).map_err(malformed),
            None => Err(malformed("unsupported type".to_string())),
        },
    }
}

// ── Scalars ───────────────────────────────────────────────────────────────────

fn encode_scalar(value: &TypedValue) -> String {
    match value {
        TypedValue::Bool(true) => "true".to_string(),
        TypedValue::Bool(false) => "false".to_string(),
        TypedValue::Int(i) => i.to_string(),
        // `Display` for f64 is the shortest text that parses back to the
        // same value and never uses exponent notation or locale separators.
        TypedValue::Float(v) => v.to_string(),
        TypedValue::String(s) => s.clone(),
        TypedValue::List(_) => String::new(),
    }
}

fn decode_scalar(ty: ScalarType, text: &str) -> Result<TypedValue, String> {
    match ty {
        ScalarType::Bool => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(TypedValue::Bool(true)),
            "false" | "0" | "no" | "off" => Ok(TypedValue::Bool(false)),
            other => Err(format!("`{other}` is not a boolean")),
        },
        ScalarType::Int => text
            .trim()
            .parse::<i64>()
            .map(TypedValue::Int)
            .map_err(|e| e.to_string()),
        ScalarType::Float => parse_float(text.trim()).map(TypedValue::Float),
        ScalarType::String => Ok(TypedValue::String(text.to_string())),
    }
}

fn parse_float(text: &str) -> Result<f64, String> {
    match text.parse::<f64>() {
        Ok(v) => Ok(v),
        // Locale-aware writers emit "3,14".
        Err(e) if text.matches(',').count() == 1 && !text.contains('.') => {
            text.replace(',', ".").parse::<f64>().map_err(|_| e.to_string())
        }
        Err(e) => Err(e.to_string()),
    }
}

// ── Lists ─────────────────────────────────────────────────────────────────────

fn escape_into(buf: &mut String, element: &str) {
    for c in element.chars() {
        if c == ESCAPE || c == LIST_DELIMITER {
            buf.push(ESCAPE);
        }
        buf.push(c);
    }
}

/// Splits an encoded list into unescaped element texts.
fn split_list(raw: &str) -> Result<Vec<String>, String> {
    if raw.is_empty() || raw == EMPTY_LIST {
        return Ok(Vec::new());
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(ESCAPE) => current.push(ESCAPE),
                Some(LIST_DELIMITER) => current.push(LIST_DELIMITER),
                Some('n') => current.push('\n'),
                Some('t') => current.push('\t'),
                Some('r') => current.push('\r'),
                Some('s') => current.push(' '),
                Some(other) => return Err(format!("unknown escape sequence `\\{other}`")),
                None => return Err("dangling escape at end of list".to_string()),
            },
            LIST_DELIMITER => parts.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    // Tolerate a missing terminator after the last element.
    if !current.is_empty() {
        parts.push(current);
    }
    Ok(parts)
}

fn describe(value: &TypedValue, expected: ValueType) -> String {
    match (value, expected) {
        (TypedValue::List(items), ValueType::List(elem)) => items
            .iter()
            .enumerate()
            .find(|(_, item)| item.scalar_type() != Some(elem))
            .map(|(i, item)| format!("list with {} element at index {i}", item.kind()))
            .unwrap_or_else(|| "list".to_string()),
        (value, _) => value.kind().to_string(),
    }
}
