//! Domain types: the declared value types and the schema that binds every
//! (group, key) pair to one of them.
//!
//! Nothing in here performs I/O except [`schema::SchemaRegistry::load`],
//! which reads the schema source once at client construction.

pub mod schema;
pub mod value;
