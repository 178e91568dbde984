//! Environment variable loading helpers.
//!
//! Centralises the fallback chains so business code never repeats
//! `or_else` ladders.

use std::env;

/// Read from the primary variable or an alias chain, with a default.
pub fn env_or<F>(primary: &str, aliases: &[&str], default: F) -> String
where
    F: FnOnce() -> String,
{
    env::var(primary)
        .ok()
        .or_else(|| aliases.iter().find_map(|a| env::var(a).ok()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(default)
}

/// Read from the primary variable or an alias chain; empty counts as unset.
pub fn env_optional(primary: &str, aliases: &[&str]) -> Option<String> {
    env::var(primary)
        .ok()
        .or_else(|| aliases.iter().find_map(|a| env::var(a).ok()))
        .and_then(|s| {
            let s = s.trim().to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        })
}

/// Parse a boolean variable: 1/true/yes/on are true, 0/false/no/off false.
pub fn env_bool(primary: &str, aliases: &[&str], default: bool) -> bool {
    let v = env::var(primary)
        .ok()
        .or_else(|| aliases.iter().find_map(|a| env::var(a).ok()));
    match v.as_deref() {
        Some(s) => !matches!(
            s.trim().to_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        ),
        None => default,
    }
}

/// Parse an unsigned integer variable, falling back on missing or invalid.
pub fn env_u64(primary: &str, default: u64) -> u64 {
    env::var(primary)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// RAII guard that sets an env var for a test and restores the previous
/// value on drop. Tests touching the environment must be serialized by the
/// caller (Rust runs tests in one process).
pub struct ScopedEnvGuard {
    key: String,
    previous: Option<String>,
}

impl ScopedEnvGuard {
    pub fn set(key: &str, value: &str) -> Self {
        let previous = env::var(key).ok();
        env::set_var(key, value);
        Self {
            key: key.to_string(),
            previous,
        }
    }

    pub fn unset(key: &str) -> Self {
        let previous = env::var(key).ok();
        env::remove_var(key);
        Self {
            key: key.to_string(),
            previous,
        }
    }
}

impl Drop for ScopedEnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(v) => env::set_var(&self.key, v),
            None => env::remove_var(&self.key),
        }
    }
}
