//! dynsql Core - Shared types for the dynamic SQL template engine
//!
//! This crate provides the types every other dynsql crate depends on:
//!
//! - `Value` - A dynamic value (scalar, sequence or nested mapping)
//! - `ParameterContext` - The per-call mapping of names to values
//! - `EngineConfig` - Declarative engine configuration (TOML)
//! - `CoreError` - Errors raised while building contexts or loading config

mod config;
mod context;
mod error;
mod types;

pub use config::*;
pub use context::*;
pub use error::*;
pub use types::*;
