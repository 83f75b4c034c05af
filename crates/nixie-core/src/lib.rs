//! Core types for Nixie: errors, limits, configuration, validation, time.
//!
//! Leaf crate of the workspace; everything else builds on it.

pub mod config;
pub mod constants;
pub mod error;
pub mod ident;
pub mod time;

pub use config::{DurabilityMode, NixieConfig, NodeConfig, RuntimeConfig, StoreConfig};
pub use error::{Error, Result};
pub use ident::{validate_actor_id, validate_key};
pub use time::now_ms;
