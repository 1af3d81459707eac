//! Engine settings: which backend to use and how to notify.
//!
//! Read from the platform-appropriate settings file:
//! - Windows:  `%APPDATA%\dacfg\settings.toml`
//! - Linux:    `~/.config/dacfg/settings.toml`
//! - macOS:    `~/Library/Application Support/dacfg/settings.toml`
//!
//! ```toml
//! [backend]
//! kind = "flat-file"          # or "memory"
//! path = "/var/lib/app/store.toml"
//!
//! [notify]
//! policy = "on-change"        # or "always"
//! ```
//!
//! Every field has a default, so a missing file (or a missing section) is
//! fine.  The environment variables `DACFG_BACKEND`, `DACFG_STORE_PATH` and
//! `DACFG_NOTIFY_POLICY` override the file.
//!
//! These settings configure the engine itself; they are unrelated to the
//! schema-typed values the engine stores.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::backend::{Backend, BackendError, FlatFileBackend, MemoryBackend};
use crate::notify::NotifyPolicy;

pub const ENV_BACKEND: &str = "DACFG_BACKEND";
pub const ENV_STORE_PATH: &str = "DACFG_STORE_PATH";
pub const ENV_NOTIFY_POLICY: &str = "DACFG_NOTIFY_POLICY";

/// Error type for settings loading and backend construction.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing settings at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse settings TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override holds an unusable value.
    #[error("invalid value {value:?} for {var}")]
    InvalidOverride { var: &'static str, value: String },

    /// The configured backend could not be opened.
    #[error("failed to open backend: {0}")]
    Backend(#[from] BackendError),
}

// ── Settings types ────────────────────────────────────────────────────────────

/// Storage variant selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Memory,
    FlatFile,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "flat-file" | "flat_file" | "file" => Ok(BackendKind::FlatFile),
            other => Err(format!("unknown backend kind {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub notify: NotifySettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackendSettings {
    #[serde(default)]
    pub kind: BackendKind,
    /// Store file for the flat-file backend.  Defaults to `store.toml` in
    /// the platform config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotifySettings {
    #[serde(default)]
    pub policy: NotifyPolicy,
}

impl EngineSettings {
    /// Parses settings text.
    pub fn parse(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    /// Applies overrides looked up through `var`, normally
    /// `|name| std::env::var(name).ok()`.
    pub fn apply_overrides(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), SettingsError> {
        if let Some(value) = var(ENV_BACKEND) {
            self.backend.kind = value.parse().map_err(|_| SettingsError::InvalidOverride {
                var: ENV_BACKEND,
                value,
            })?;
        }
        if let Some(value) = var(ENV_STORE_PATH) {
            if value.is_empty() {
                return Err(SettingsError::InvalidOverride {
                    var: ENV_STORE_PATH,
                    value,
                });
            }
            self.backend.path = Some(PathBuf::from(value));
        }
        if let Some(value) = var(ENV_NOTIFY_POLICY) {
            self.notify.policy = value.parse().map_err(|_| SettingsError::InvalidOverride {
                var: ENV_NOTIFY_POLICY,
                value,
            })?;
        }
        Ok(())
    }

    /// Resolved flat-file store path.
    pub fn store_path(&self) -> Result<PathBuf, SettingsError> {
        match &self.backend.path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("store.toml")),
        }
    }

    /// Opens the shared store described by these settings.
    pub fn open_backend(&self) -> Result<Arc<dyn Backend>, SettingsError> {
        match self.backend.kind {
            BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
            BackendKind::FlatFile => {
                let path = self.store_path()?;
                debug!("opening flat-file store at {}", path.display());
                Ok(Arc::new(FlatFileBackend::open(path)?))
            }
        }
    }

    /// Opens the overlay store for instance `id`.  For the flat-file backend
    /// this is a sibling of the shared store named `<stem>.<id>.toml`.
    pub fn open_instance_backend(&self, id: &str) -> Result<Arc<dyn Backend>, SettingsError> {
        match self.backend.kind {
            BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
            BackendKind::FlatFile => {
                let path = instance_store_path(&self.store_path()?, id);
                debug!("opening instance store at {}", path.display());
                Ok(Arc::new(FlatFileBackend::open(path)?))
            }
        }
    }
}

fn instance_store_path(shared: &Path, id: &str) -> PathBuf {
    let stem = shared
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    shared.with_file_name(format!("{stem}.{id}.toml"))
}

// ── Settings file ─────────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for settings and stores.
///
/// # Errors
///
/// Returns [`SettingsError::NoPlatformConfigDir`] when the platform config
/// base directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, SettingsError> {
    platform_config_dir().ok_or(SettingsError::NoPlatformConfigDir)
}

pub fn settings_file_path() -> Result<PathBuf, SettingsError> {
    Ok(config_dir()?.join("settings.toml"))
}

/// Loads settings from `path`, falling back to defaults when the file does
/// not exist.  Environment overrides are not applied.
pub fn load_settings_from(path: &Path) -> Result<EngineSettings, SettingsError> {
    match std::fs::read_to_string(path) {
        Ok(content) => EngineSettings::parse(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EngineSettings::default()),
        Err(source) => Err(SettingsError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Loads the platform settings file and applies environment overrides.
///
/// A missing platform config directory is not an error here: defaults are
/// used, and only a flat-file backend without an explicit path will fail
/// later in [`EngineSettings::store_path`].
pub fn load_settings() -> Result<EngineSettings, SettingsError> {
    let mut settings = match settings_file_path() {
        Ok(path) => load_settings_from(&path)?,
        Err(SettingsError::NoPlatformConfigDir) => EngineSettings::default(),
        Err(e) => return Err(e),
    };
    settings.apply_overrides(|name| std::env::var(name).ok())?;
    Ok(settings)
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("dacfg"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("dacfg"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("dacfg")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}
