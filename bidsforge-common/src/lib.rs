//! # BIDSforge Common Library
//!
//! Shared code for the BIDSforge workspace:
//! - Error type used across crates
//! - TOML bootstrap configuration and root folder resolution

pub mod config;
pub mod error;

pub use config::TomlConfig;
pub use error::{Error, Result};
