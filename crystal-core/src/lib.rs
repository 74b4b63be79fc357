//! Core shared library for the Crystal policy engine.
//!
//! This crate exposes reusable primitives that the engine and its tools
//! depend on: common errors, configuration loading, the Postgres pool
//! wrapper, JSON helpers and logging setup.

pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod serde_utils;

pub use config::{CoreConfig, Environment, LogFormat};
pub use errors::{CrystalError, Result as CoreResult};
