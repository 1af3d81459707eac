//! Schema Registry: the declarative description of every configuration key.
//!
//! A schema is a TOML document.  Each top-level table is a *group*; each
//! table nested inside it declares one *key*:
//!
//! ```toml
//! [numeric.float]
//! type = "float"
//! default = 3.14
//! description = "An approximation of pi."
//!
//! [list.string]
//! type = "list<string>"
//! default = ["foo", "bar"]
//! ```
//!
//! Recognised type tags are `bool`, `int`, `float`, `string` and
//! `list<scalar>`.  A list may alternatively be declared as
//! `type = "list"` plus `element = "<scalar>"`.
//!
//! The registry is loaded once when a client is built and is immutable
//! afterwards, so it is shared behind an `Arc` by every reader.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::domain::value::{ScalarType, TypedValue, ValueType};

/// Error type for schema loading and lookup.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The schema source could not be read.
    #[error("schema not found at {path}: {source}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The schema source is malformed.  `group`/`key` identify the offending
    /// declaration when the failure can be attributed to one.
    #[error("schema syntax error{}: {reason}", schema_location(.group, .key))]
    Syntax {
        group: Option<String>,
        key: Option<String>,
        reason: String,
    },

    /// The (group, key) pair is not declared in the schema.
    #[error("unknown configuration key {group}/{key}")]
    UnknownKey { group: String, key: String },
}

/// ` in group/key` suffix for syntax errors, empty when unattributed.
pub(crate) fn schema_location(group: &Option<String>, key: &Option<String>) -> String {
    match (group, key) {
        (Some(g), Some(k)) => format!(" in {g}/{k}"),
        (Some(g), None) => format!(" in group {g}"),
        _ => String::new(),
    }
}

impl SchemaError {
    fn syntax(group: &str, key: Option<&str>, reason: impl Into<String>) -> Self {
        SchemaError::Syntax {
            group: Some(group.to_string()),
            key: key.map(str::to_string),
            reason: reason.into(),
        }
    }
}

/// Fully-qualified name of a configuration key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath {
    pub group: String,
    pub key: String,
}

impl KeyPath {
    pub fn new(group: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.key)
    }
}

/// One declared key: its type, default, and optional description.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEntry {
    pub path: KeyPath,
    pub value_type: ValueType,
    pub default: TypedValue,
    pub description: Option<String>,
}

impl SchemaEntry {
    pub fn group(&self) -> &str {
        &self.path.group
    }

    pub fn key(&self) -> &str {
        &self.path.key
    }
}

/// Immutable registry of every declared (group, key) pair.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entries: BTreeMap<KeyPath, SchemaEntry>,
}

impl SchemaRegistry {
    /// Reads and parses the schema file at `path`.
    ///
    /// # Errors
    ///
    /// [`SchemaError::NotFound`] if the file cannot be read and
    /// [`SchemaError::Syntax`] if its contents are malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SchemaError::NotFound {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::parse(&text)?;
        info!(
            "loaded schema {} ({} keys)",
            path.display(),
            registry.entries.len()
        );
        Ok(registry)
    }

    /// Parses schema text.
    ///
    /// # Errors
    ///
    /// [`SchemaError::Syntax`] naming the group/key at fault when possible.
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let document: toml::Table = toml::from_str(text).map_err(|e| SchemaError::Syntax {
            group: None,
            key: None,
            reason: e.to_string(),
        })?;

        let mut entries = BTreeMap::new();
        for (group, keys) in document {
            let keys = match keys {
                toml::Value::Table(keys) => keys,
                other => {
                    return Err(SchemaError::syntax(
                        &group,
                        None,
                        format!("expected a table of keys, found {}", other.type_str()),
                    ))
                }
            };
            for (key, decl) in keys {
                let entry = parse_entry(&group, &key, decl)?;
                debug!("schema declares {} as {}", entry.path, entry.value_type);
                entries.insert(entry.path.clone(), entry);
            }
        }
        Ok(Self { entries })
    }

    /// Returns the declaration for `group`/`key`.
    ///
    /// # Errors
    ///
    /// [`SchemaError::UnknownKey`] if the pair is undeclared.
    pub fn lookup(&self, group: &str, key: &str) -> Result<&SchemaEntry, SchemaError> {
        self.entries
            .get(&KeyPath::new(group, key))
            .ok_or_else(|| SchemaError::UnknownKey {
                group: group.to_string(),
                key: key.to_string(),
            })
    }

    /// Returns the declared default without touching any backend.
    pub fn default_of(&self, group: &str, key: &str) -> Result<TypedValue, SchemaError> {
        self.lookup(group, key).map(|entry| entry.default.clone())
    }

    pub fn contains(&self, group: &str, key: &str) -> bool {
        self.entries.contains_key(&KeyPath::new(group, key))
    }

    /// All entries, sorted by group then key.
    pub fn entries(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.entries.values()
    }

    /// Distinct group names, sorted.
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = self.entries.keys().map(|p| p.group.as_str()).collect();
        groups.dedup();
        groups
    }

    /// Key names declared in `group`, sorted.
    pub fn keys<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .keys()
            .filter(move |p| p.group == group)
            .map(|p| p.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Declaration parsing ───────────────────────────────────────────────────────

fn parse_entry(group: &str, key: &str, decl: toml::Value) -> Result<SchemaEntry, SchemaError> {
    let err = |reason: String| SchemaError::syntax(group, Some(key), reason);

    let mut table = match decl {
        toml::Value::Table(table) => table,
        other => {
            return Err(err(format!(
                "expected a key declaration table, found {}",
                other.type_str()
            )))
        }
    };

    let type_tag = match table.remove("type") {
        Some(toml::Value::String(tag)) => tag,
        Some(other) => return Err(err(format!("`type` must be a string, found {}", other.type_str()))),
        None => return Err(err("missing `type`".to_string())),
    };
    let element = match table.remove("element") {
        Some(toml::Value::String(tag)) => Some(tag),
        Some(other) => {
            return Err(err(format!("`element` must be a string, found {}", other.type_str())))
        }
        None => None,
    };
    let value_type = resolve_type(&type_tag, element.as_deref()).map_err(err)?;

    let default = table
        .remove("default")
        .ok_or_else(|| err("missing `default`".to_string()))?;
    let default = default_from_toml(value_type, default).map_err(err)?;

    let description = match table.remove("description") {
        Some(toml::Value::String(text)) => Some(text),
        Some(other) => {
            return Err(err(format!(
                "`description` must be a string, found {}",
                other.type_str()
            )))
        }
        None => None,
    };

    if let Some(unknown) = table.keys().next() {
        return Err(err(format!("unknown field `{unknown}`")));
    }

    Ok(SchemaEntry {
        path: KeyPath::new(group, key),
        value_type,
        default,
        description,
    })
}

fn resolve_type(tag: &str, element: Option<&str>) -> Result<ValueType, String> {
    if tag.trim() == "list" {
        let element = element.ok_or("list type requires an `element` type")?;
        return ScalarType::parse(element)
            .map(ValueType::List)
            .ok_or_else(|| format!("unknown list element type `{element}`"));
    }
    if element.is_some() {
        return Err(format!("`element` is only valid for lists, not `{tag}`"));
    }
    ValueType::parse(tag).ok_or_else(|| format!("unknown type `{tag}`"))
}

fn default_from_toml(ty: ValueType, literal: toml::Value) -> Result<TypedValue, String> {
    match ty {
        ValueType::List(elem) => match literal {
            toml::Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    scalar_from_toml(elem, item).map_err(|e| format!("default[{i}]: {e}"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(TypedValue::List),
            other => Err(format!(
                "default for {ty} must be an array, found {}",
                other.type_str()
            )),
        },
        scalar => match scalar.as_scalar() {
            Some(scalar) => scalar_from_toml(scalar, literal).map_err(|e| format!("default: {e}")),
            None => Err(format!("unsupported type {ty}")),
        },
    }
}

fn scalar_from_toml(ty: ScalarType, literal: toml::Value) -> Result<TypedValue, String> {
    match (ty, literal) {
        (ScalarType::Bool, toml::Value::Boolean(b)) => Ok(TypedValue::Bool(b)),
        (ScalarType::Int, toml::Value::Integer(i)) => Ok(TypedValue::Int(i)),
        (ScalarType::Float, toml::Value::Float(v)) => Ok(TypedValue::Float(v)),
        // `default = 3` is a natural way to write a whole-number float.
        (ScalarType::Float, toml::Value::Integer(i)) => Ok(TypedValue::Float(i as f64)),
        (ScalarType::String, toml::Value::String(s)) => Ok(TypedValue::String(s)),
        (ty, other) => Err(format!("expected {ty}, found {}", other.type_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
[numeric.boolean]
type = "bool"
default = true
description = "A boolean value."

[numeric.integer]
type = "int"
default = 3

[numeric.float]
type = "float"
default = 3.14

[misc.string]
type = "string"
default = "Foo bar"

[list.integer]
type = "list"
element = "integer"
default = [1, 2, 3]

[list.string]
type = "list<string>"
default = ["foo", "bar"]
"#;

    fn syntax_location(err: SchemaError) -> (Option<String>, Option<String>, String) {
        match err {
            SchemaError::Syntax { group, key, reason } => (group, key, reason),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_declares_every_key() {
        // Arrange / Act
        let registry = SchemaRegistry::parse(SCHEMA).expect("schema must parse");

        // Assert
        assert_eq!(registry.len(), 6);
        assert_eq!(registry.groups(), vec!["list", "misc", "numeric"]);
        let numeric: Vec<&str> = registry.keys("numeric").collect();
        assert_eq!(numeric, vec!["boolean", "float", "integer"]);
    }

    #[test]
    fn test_lookup_returns_type_default_and_description() {
        let registry = SchemaRegistry::parse(SCHEMA).unwrap();

        let entry = registry.lookup("numeric", "boolean").unwrap();

        assert_eq!(entry.value_type, ValueType::Bool);
        assert_eq!(entry.default, TypedValue::Bool(true));
        assert_eq!(entry.description.as_deref(), Some("A boolean value."));
    }

    #[test]
    fn test_list_declared_with_element_field() {
        let registry = SchemaRegistry::parse(SCHEMA).unwrap();
        let entry = registry.lookup("list", "integer").unwrap();
        assert_eq!(entry.value_type, ValueType::List(ScalarType::Int));
        assert_eq!(entry.default, TypedValue::from(vec![1i64, 2, 3]));
    }

    #[test]
    fn test_default_of_returns_declared_default() {
        let registry = SchemaRegistry::parse(SCHEMA).unwrap();
        assert_eq!(
            registry.default_of("misc", "string").unwrap(),
            TypedValue::from("Foo bar")
        );
    }

    #[test]
    fn test_lookup_unknown_key_is_error() {
        let registry = SchemaRegistry::parse(SCHEMA).unwrap();

        let result = registry.lookup("numeric", "missing");

        assert!(matches!(
            result,
            Err(SchemaError::UnknownKey { ref group, ref key }) if group == "numeric" && key == "missing"
        ));
    }

    #[test]
    fn test_integer_literal_accepted_as_float_default() {
        let registry = SchemaRegistry::parse("[a.b]\ntype = \"float\"\ndefault = 2\n").unwrap();
        assert_eq!(registry.default_of("a", "b").unwrap(), TypedValue::Float(2.0));
    }

    #[test]
    fn test_malformed_toml_is_syntax_error_without_location() {
        let err = SchemaRegistry::parse("[[[ not toml").unwrap_err();
        let (group, key, _) = syntax_location(err);
        assert_eq!(group, None);
        assert_eq!(key, None);
    }

    #[test]
    fn test_default_type_mismatch_names_group_and_key() {
        // Arrange
        let text = "[numeric.integer]\ntype = \"int\"\ndefault = \"three\"\n";

        // Act
        let err = SchemaRegistry::parse(text).unwrap_err();

        // Assert
        let (group, key, reason) = syntax_location(err);
        assert_eq!(group.as_deref(), Some("numeric"));
        assert_eq!(key.as_deref(), Some("integer"));
        assert!(reason.contains("expected int"), "reason was: {reason}");
    }

    #[test]
    fn test_heterogeneous_list_default_is_rejected() {
        let text = "[list.integer]\ntype = \"list<int>\"\ndefault = [1, \"two\"]\n";
        let (_, key, reason) = syntax_location(SchemaRegistry::parse(text).unwrap_err());
        assert_eq!(key.as_deref(), Some("integer"));
        assert!(reason.contains("default[1]"), "reason was: {reason}");
    }

    #[test]
    fn test_missing_type_and_missing_default_are_rejected() {
        assert!(SchemaRegistry::parse("[a.b]\ndefault = 1\n").is_err());
        assert!(SchemaRegistry::parse("[a.b]\ntype = \"int\"\n").is_err());
    }

    #[test]
    fn test_unknown_type_and_unknown_field_are_rejected() {
        let (_, _, reason) =
            syntax_location(SchemaRegistry::parse("[a.b]\ntype = \"color\"\ndefault = 1\n").unwrap_err());
        assert!(reason.contains("unknown type"));

        let text = "[a.b]\ntype = \"int\"\ndefault = 1\nper_instance = true\n";
        let (_, _, reason) = syntax_location(SchemaRegistry::parse(text).unwrap_err());
        assert!(reason.contains("per_instance"));
    }

    #[test]
    fn test_group_that_is_not_a_table_is_rejected() {
        let (group, key, _) = syntax_location(SchemaRegistry::parse("numeric = 3\n").unwrap_err());
        assert_eq!(group.as_deref(), Some("numeric"));
        assert_eq!(key, None);
    }

    #[test]
    fn test_load_missing_file_is_not_found() {
        let result = SchemaRegistry::load("/nonexistent/path/test-config.schema.toml");
        assert!(matches!(result, Err(SchemaError::NotFound { .. })));
    }

    #[test]
    fn test_syntax_error_display_includes_location() {
        let err = SchemaError::Syntax {
            group: Some("misc".into()),
            key: Some("string".into()),
            reason: "missing `default`".into(),
        };
        assert_eq!(
            err.to_string(),
            "schema syntax error in misc/string: missing `default`"
        );
    }
}
