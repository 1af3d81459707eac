//! dacfg-cli library entry point.
//!
//! Re-exports the argument definitions and command handlers so that
//! integration tests in `tests/` and the binary entry point in `main.rs`
//! share the same module tree.
//!
//! # What does dacfg do? (for beginners)
//!
//! `dacfg` is a thin shell over [`dacfg_core::Client`].  Given a schema file
//! it can read, write and reset typed values in a store, list every declared
//! key with its effective value, or sit in a loop printing changes other
//! processes make to the store.
//!
//! ```text
//! dacfg --schema app.schema.toml --store ~/.config/app/store.toml get misc string
//! dacfg --schema app.schema.toml set list string 'a;b;c;'
//! dacfg --schema app.schema.toml watch misc/string numeric/integer
//! ```

/// Command-line argument definitions.
pub mod cli;

/// Application layer: command handlers.
pub mod application;
