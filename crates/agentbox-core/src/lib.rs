pub mod config;
pub mod error;
pub mod observability;
pub mod path_guard;
pub mod path_resolver;
pub mod protocol;

pub use error::{SandboxError, SandboxResult};
