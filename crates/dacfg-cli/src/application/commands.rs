//! One-shot commands: `get`, `set`, `unset`, `reset`, `list`.
//!
//! Output goes to any [`Write`] so tests can capture it.

use std::io::Write;

use anyhow::Context;
use dacfg_core::{decode_as, Client};
use tracing::info;

/// Prints the effective value of `group/key`.
pub fn get(client: &Client, group: &str, key: &str, out: &mut impl Write) -> anyhow::Result<()> {
    let value = client.get(group, key)?;
    writeln!(out, "{value}")?;
    Ok(())
}

/// Parses `text` as the key's declared type and stores it.
///
/// Text uses the store's encoding: `true`/`false` for booleans, decimal
/// numbers, raw strings, and `;`-terminated elements for lists.
pub fn set(client: &Client, group: &str, key: &str, text: &str) -> anyhow::Result<()> {
    let entry = client.schema().lookup(group, key)?;
    let value = decode_as(entry.value_type, text)
        .with_context(|| format!("`{text}` is not a valid {}", entry.value_type))?;
    client.set(group, key, value)?;
    info!("{group}/{key} updated");
    Ok(())
}

pub fn unset(client: &Client, group: &str, key: &str) -> anyhow::Result<()> {
    client.unset(group, key)?;
    Ok(())
}

pub fn reset(client: &Client, instance_only: bool, out: &mut impl Write) -> anyhow::Result<()> {
    let erased = client.reset(instance_only)?;
    writeln!(out, "{erased} override(s) removed")?;
    Ok(())
}

/// Prints `group/key (type) = value` for every declared key, grouped and
/// sorted.  Keys whose stored value cannot be read are reported inline.
pub fn list(client: &Client, out: &mut impl Write) -> anyhow::Result<()> {
    for entry in client.schema().entries() {
        match client.get(entry.group(), entry.key()) {
            Ok(value) => writeln!(out, "{} ({}) = {value}", entry.path, entry.value_type)?,
            Err(e) => writeln!(out, "{} ({}) ! {e}", entry.path, entry.value_type)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dacfg_core::TypedValue;

    const SCHEMA: &str = r#"
[numeric.integer]
type = "int"
default = 3

[list.string]
type = "list<string>"
default = ["foo", "bar"]
"#;

    fn client() -> Client {
        Client::builder_from_str(SCHEMA).build().unwrap()
    }

    fn output(f: impl FnOnce(&mut Vec<u8>) -> anyhow::Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_get_prints_default() {
        let client = client();
        let text = output(|out| get(&client, "numeric", "integer", out));
        assert_eq!(text, "3\n");
    }

    #[test]
    fn test_set_parses_list_text() {
        // Arrange
        let client = client();

        // Act
        set(&client, "list", "string", "a;b\\;c;").unwrap();

        // Assert
        assert_eq!(
            client.get("list", "string").unwrap(),
            TypedValue::from(vec!["a", "b;c"])
        );
    }

    #[test]
    fn test_set_rejects_text_of_wrong_type() {
        let client = client();
        let err = set(&client, "numeric", "integer", "three").unwrap_err();
        assert!(err.to_string().contains("not a valid int"), "got {err}");
        assert_eq!(client.get_int("numeric", "integer").unwrap(), 3);
    }

    #[test]
    fn test_list_prints_every_key() {
        let client = client();
        client.set_int("numeric", "integer", 9).unwrap();

        let text = output(|out| list(&client, out));

        assert_eq!(
            text,
            "list/string (list<string>) = [\"foo\", \"bar\"]\nnumeric/integer (int) = 9\n"
        );
    }

    #[test]
    fn test_reset_reports_count() {
        let client = client();
        client.set_int("numeric", "integer", 9).unwrap();
        unset(&client, "list", "string").unwrap();

        let text = output(|out| reset(&client, false, out));

        assert_eq!(text, "1 override(s) removed\n");
    }
}
