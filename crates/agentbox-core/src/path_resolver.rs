//! Per-session virtual mount tables.
//!
//! Tools address a session's workspace through stable virtual prefixes
//! (e.g. `/workspace`); the resolver substitutes the registered real path.
//! Resolution fails closed: a path under no registered mount is an error,
//! never a guess.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{SandboxError, SandboxResult};
use crate::path_guard::normalize_lexically;

/// A virtual prefix mapped to a canonicalized real path.
///
/// `real` is always absolute and canonicalized. Uniqueness of
/// `virtual_prefix` within one session is assumed, not enforced; the first
/// matching entry wins.
#[derive(Debug, Clone)]
pub struct MountedPath {
    pub virtual_prefix: String,
    pub real: PathBuf,
}

/// Session-keyed mount tables. Created when a session's workspace is
/// configured, discarded when the session ends.
#[derive(Debug, Default)]
pub struct PathResolver {
    tables: Mutex<HashMap<String, Vec<MountedPath>>>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mount for a session. The real path must exist; it is
    /// canonicalized on entry so later prefix checks compare real forms.
    pub fn register_mount(
        &self,
        session_id: &str,
        virtual_prefix: &str,
        real: &Path,
    ) -> SandboxResult<()> {
        if virtual_prefix.is_empty() {
            return Err(SandboxError::Configuration(
                "virtual prefix must not be empty".to_string(),
            ));
        }
        let real = real.canonicalize().map_err(|e| {
            SandboxError::Configuration(format!(
                "mount target {} is not usable: {}",
                real.display(),
                e
            ))
        })?;
        tracing::debug!(
            session = session_id,
            prefix = virtual_prefix,
            real = %real.display(),
            "mount registered"
        );
        let mut tables = self.tables.lock().expect("mount table lock");
        tables
            .entry(session_id.to_string())
            .or_default()
            .push(MountedPath {
                virtual_prefix: virtual_prefix.trim_end_matches('/').to_string(),
                real,
            });
        Ok(())
    }

    /// Resolve a virtual path to a real one via the session's mount table.
    ///
    /// The first entry whose prefix matches on a component boundary is
    /// substituted. Traversal in the remainder is normalized and the
    /// result must stay under the mount's real path — fail closed.
    pub fn resolve(&self, session_id: &str, virtual_path: &str) -> SandboxResult<PathBuf> {
        let tables = self.tables.lock().expect("mount table lock");
        let mounts = tables.get(session_id).ok_or_else(|| {
            SandboxError::Configuration(format!("no mounts registered for session {}", session_id))
        })?;

        for mount in mounts {
            let Some(rest) = strip_virtual_prefix(virtual_path, &mount.virtual_prefix) else {
                continue;
            };
            let candidate = normalize_lexically(&mount.real.join(rest.trim_start_matches('/')));
            if !candidate.starts_with(&mount.real) {
                return Err(SandboxError::SecurityViolation(format!(
                    "virtual path escapes its mount: {}",
                    virtual_path
                )));
            }
            return Ok(candidate);
        }

        Err(SandboxError::SecurityViolation(format!(
            "path is outside every registered mount: {}",
            virtual_path
        )))
    }

    /// Inverse of [`resolve`](Self::resolve): map a real path back to its
    /// virtual form for display. Returns `None` when no mount covers it.
    pub fn virtualize(&self, session_id: &str, real: &Path) -> Option<String> {
        let tables = self.tables.lock().expect("mount table lock");
        let mounts = tables.get(session_id)?;
        for mount in mounts {
            if let Ok(rest) = real.strip_prefix(&mount.real) {
                let rest = rest.to_string_lossy().replace('\\', "/");
                return Some(if rest.is_empty() {
                    mount.virtual_prefix.clone()
                } else {
                    format!("{}/{}", mount.virtual_prefix, rest)
                });
            }
        }
        None
    }

    /// Snapshot of a session's mounts, for diagnostics.
    pub fn mounts(&self, session_id: &str) -> Vec<MountedPath> {
        let tables = self.tables.lock().expect("mount table lock");
        tables.get(session_id).cloned().unwrap_or_default()
    }

    /// Virtual prefixes registered for a session, for command validation.
    pub fn mount_prefixes(&self, session_id: &str) -> Vec<String> {
        self.mounts(session_id)
            .into_iter()
            .map(|m| m.virtual_prefix)
            .collect()
    }

    /// Drop a session's mount table.
    pub fn remove_session(&self, session_id: &str) {
        let mut tables = self.tables.lock().expect("mount table lock");
        tables.remove(session_id);
    }
}

fn strip_virtual_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver_with_mount(dir: &TempDir) -> PathResolver {
        let resolver = PathResolver::new();
        resolver
            .register_mount("s1", "/workspace", dir.path())
            .unwrap();
        resolver
    }

    #[test]
    fn resolves_paths_under_the_mount() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver_with_mount(&dir);
        let real = resolver.resolve("s1", "/workspace/src/main.rs").unwrap();
        assert_eq!(
            real,
            dir.path().canonicalize().unwrap().join("src/main.rs")
        );
    }

    #[test]
    fn fails_closed_outside_every_mount() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver_with_mount(&dir);
        assert!(resolver.resolve("s1", "/etc/passwd").is_err());
        assert!(resolver.resolve("s1", "/workspace2/file").is_err());
        assert!(resolver.resolve("unknown-session", "/workspace/a").is_err());
    }

    #[test]
    fn traversal_inside_virtual_path_cannot_escape() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver_with_mount(&dir);
        let err = resolver
            .resolve("s1", "/workspace/../../etc/passwd")
            .unwrap_err();
        assert_eq!(err.tag(), "security_violation");
    }

    #[test]
    fn first_matching_mount_wins() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let resolver = PathResolver::new();
        resolver.register_mount("s1", "/ws", dir_a.path()).unwrap();
        resolver.register_mount("s1", "/ws", dir_b.path()).unwrap();
        let real = resolver.resolve("s1", "/ws/x").unwrap();
        assert!(real.starts_with(dir_a.path().canonicalize().unwrap()));
    }

    #[test]
    fn virtualize_round_trips() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver_with_mount(&dir);
        let real = resolver.resolve("s1", "/workspace/a/b.txt").unwrap();
        assert_eq!(
            resolver.virtualize("s1", &real).unwrap(),
            "/workspace/a/b.txt"
        );
    }

    #[test]
    fn remove_session_discards_the_table() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver_with_mount(&dir);
        resolver.remove_session("s1");
        assert!(resolver.resolve("s1", "/workspace/a").is_err());
        assert!(resolver.mounts("s1").is_empty());
    }
}
