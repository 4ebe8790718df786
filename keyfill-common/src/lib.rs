//! # keyfill common library
//!
//! Shared code for the keyfill workspace:
//! - Error type and `Result` alias
//! - TOML configuration model, defaults and validation
//! - Configuration file resolution

pub mod config;
pub mod error;

pub use config::{FieldRule, LoggingConfig, MergeConfig, ResolverConfig, RetryConfig, RunConfig, TomlConfig};
pub use error::{Error, Result};
