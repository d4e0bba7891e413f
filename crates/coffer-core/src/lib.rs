//! Coffer Core - the vault service
//!
//! This crate is the only surface hosts need: lifecycle (`start`/`stop`),
//! per-agent encrypt/decrypt, status, key rotation, the transparent
//! message transform and the tool-call adapters.

pub mod config;
pub mod service;
pub mod tools;
pub mod transform;

pub use config::{ConfigError, VaultConfig};
pub use service::{RotationReport, VaultError, VaultService, VaultStatus};
pub use tools::{execute_tool, tool_schemas};
pub use transform::{is_wrapped, DEFAULT_AGENT_ID, ENCRYPTED_PLACEHOLDER};
