//! `dacfg` argument definitions.
//!
//! The `#[derive(Parser)]` macro from `clap` generates the argument parser
//! from the struct fields and their `#[arg(...)]` attributes.  Options that
//! pick the store fall back to the engine settings file and its environment
//! overrides when omitted.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dacfg_core::settings::{load_settings, BackendKind, EngineSettings};
use dacfg_core::{Client, KeyPath, LoopHandle, NotifyPolicy};

#[derive(Debug, Parser)]
#[command(
    name = "dacfg",
    about = "Read, write and watch schema-typed configuration values",
    version
)]
pub struct Cli {
    /// Schema file declaring every group, key, type and default.
    #[arg(long, env = "DACFG_SCHEMA")]
    pub schema: PathBuf,

    /// Flat-file store to use.  Overrides the settings file.
    #[arg(long, conflicts_with = "memory")]
    pub store: Option<PathBuf>,

    /// Use a throwaway in-memory store.  Mostly useful with `list`.
    #[arg(long)]
    pub memory: bool,

    /// Per-instance overlay to read and write through.
    #[arg(long)]
    pub instance: Option<String>,

    /// Delivery policy for `watch`: `always` or `on-change`.
    #[arg(long)]
    pub notify_policy: Option<NotifyPolicy>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the effective value of a key.
    Get { group: String, key: String },

    /// Store a value.  List elements are each terminated by `;`, with `;`
    /// and `\` escaped by a backslash: `set list string 'a;b\;c;'`.
    Set {
        group: String,
        key: String,
        value: String,
    },

    /// Drop the stored override of a key.
    Unset { group: String, key: String },

    /// Drop stored overrides.
    Reset {
        /// Clear only the `--instance` overlay.
        #[arg(long)]
        instance_only: bool,
    },

    /// Print every declared key with its type and effective value.
    List,

    /// Print changes to the given `group/key` paths until Ctrl-C.
    Watch {
        #[arg(required = true, value_parser = parse_key_path)]
        keys: Vec<KeyPath>,

        /// How often to drain pending notifications, in milliseconds.
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
    },
}

fn parse_key_path(text: &str) -> Result<KeyPath, String> {
    match text.split_once('/') {
        Some((group, key)) if !group.is_empty() && !key.is_empty() && !key.contains('/') => {
            Ok(KeyPath::new(group, key))
        }
        _ => Err(format!("expected `group/key`, got `{text}`")),
    }
}

impl Cli {
    /// Merges the command line over the settings file and environment.
    pub fn effective_settings(&self) -> anyhow::Result<EngineSettings> {
        let mut settings = load_settings().context("failed to load engine settings")?;
        self.apply_to(&mut settings);
        Ok(settings)
    }

    fn apply_to(&self, settings: &mut EngineSettings) {
        if self.memory {
            settings.backend.kind = BackendKind::Memory;
        } else if let Some(store) = &self.store {
            settings.backend.kind = BackendKind::FlatFile;
            settings.backend.path = Some(store.clone());
        }
        if let Some(policy) = self.notify_policy {
            settings.notify.policy = policy;
        }
    }

    /// Builds the client described by the arguments and `settings`.
    pub fn build_client(
        &self,
        settings: &EngineSettings,
        event_loop: Option<LoopHandle>,
    ) -> anyhow::Result<Client> {
        let backend = settings.open_backend().context("failed to open store")?;
        let mut builder = Client::builder(&self.schema)
            .backend(backend)
            .notify_policy(settings.notify.policy);
        if let Some(id) = &self.instance {
            let overlay = settings
                .open_instance_backend(id)
                .with_context(|| format!("failed to open instance store for {id}"))?;
            builder = builder.instance(id.clone(), overlay);
        }
        if let Some(handle) = event_loop {
            builder = builder.event_loop(handle);
        }
        builder.build().map_err(anyhow::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_command() {
        let cli = Cli::parse_from(["dacfg", "--schema", "s.toml", "get", "misc", "string"]);
        assert_eq!(cli.schema, PathBuf::from("s.toml"));
        assert!(matches!(
            cli.command,
            Command::Get { ref group, ref key } if group == "misc" && key == "string"
        ));
    }

    #[test]
    fn test_parse_watch_keys() {
        let cli = Cli::parse_from([
            "dacfg",
            "--schema",
            "s.toml",
            "watch",
            "misc/string",
            "numeric/integer",
            "--interval-ms",
            "50",
        ]);
        match cli.command {
            Command::Watch { keys, interval_ms } => {
                assert_eq!(
                    keys,
                    vec![
                        KeyPath::new("misc", "string"),
                        KeyPath::new("numeric", "integer")
                    ]
                );
                assert_eq!(interval_ms, 50);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_watch_rejects_malformed_key_path() {
        let result = Cli::try_parse_from(["dacfg", "--schema", "s.toml", "watch", "nogroup"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_store_and_memory_conflict() {
        let result = Cli::try_parse_from([
            "dacfg", "--schema", "s.toml", "--store", "x.toml", "--memory", "list",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_store_flag_selects_flat_file() {
        // Arrange
        let cli = Cli::parse_from([
            "dacfg",
            "--schema",
            "s.toml",
            "--store",
            "/tmp/x.toml",
            "--notify-policy",
            "on-change",
            "list",
        ]);
        let mut settings = EngineSettings::default();

        // Act
        cli.apply_to(&mut settings);

        // Assert
        assert_eq!(settings.backend.kind, BackendKind::FlatFile);
        assert_eq!(settings.backend.path, Some(PathBuf::from("/tmp/x.toml")));
        assert_eq!(settings.notify.policy, NotifyPolicy::OnChange);
    }
}
