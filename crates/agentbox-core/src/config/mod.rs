//! Unified configuration layer.
//!
//! All environment variable reads are centralised here; business code goes
//! through the structured configs instead of calling `std::env::var`
//! directly.
//!
//! - `loader`: `env_or`, `env_optional`, `env_bool` helpers
//! - `schema`: `SandboxSettings`, `ObservabilityConfig`
//! - `env_keys`: key constants

pub mod env_keys;
pub mod loader;
pub mod schema;

pub use loader::{env_bool, env_optional, env_or, ScopedEnvGuard};
pub use schema::{BackendPreference, ObservabilityConfig, SandboxSettings};
