pub mod adapter;
pub mod bootstrap;
pub mod bridge;
pub mod convert;
pub mod executor;
pub mod lima;
pub mod native;
pub mod rpc;
pub mod sync;
pub mod wsl;

pub use adapter::{SandboxAdapter, SandboxMode};
pub use executor::{ExecutorConfig, SandboxExecutor};
