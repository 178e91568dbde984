//! Path and command validation.
//!
//! Ensures paths stay within the workspace root (traversal and symlink
//! escape prevention) and rejects destructive command patterns before
//! anything is spawned. Validation runs both on the host side and again
//! inside the agent — the agent never trusts the host's checks.
//!
//! ## Layers
//!
//! 1. **Path containment** — canonicalize, case-fold on case-insensitive
//!    filesystems, prefix check; existing paths are re-checked through
//!    their symlink-resolved real form.
//! 2. **Traversal substrings** — `../` / `..\` anywhere in a command.
//! 3. **Destructive patterns** — recursive delete of `/` or `~`, raw
//!    device writes, `mkfs`, pipe-to-shell downloads, privilege
//!    escalation, fork bombs, and Windows equivalents (format, registry,
//!    user management, encoded PowerShell).
//! 4. **Absolute-token containment** — absolute-path-looking tokens that
//!    start with a known mount prefix must resolve inside the workspace.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{SandboxError, SandboxResult};

/// Outcome of a validation pass. Never carries partial success: either
/// `valid` is true and `errors` is empty, or every failed check is listed.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn fail(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }

    /// Convert into a `SandboxResult`, mapping failure to a
    /// `SecurityViolation` carrying all collected errors.
    pub fn into_result(self) -> SandboxResult<()> {
        if self.valid {
            Ok(())
        } else {
            Err(SandboxError::SecurityViolation(self.errors.join("; ")))
        }
    }
}

/// Destructive command patterns, POSIX side.
const POSIX_PATTERNS: &[(&str, &str)] = &[
    (
        r"\brm\s+(?:-[a-zA-Z]+\s+)*-[a-zA-Z]*[rR][a-zA-Z]*(?:\s+-[a-zA-Z]+)*\s+(?:/|~)/?(?:\s|$|\*)",
        "recursive delete of filesystem root or home",
    ),
    (
        r"\bdd\b[^|;&]*\bof=/dev/(?:sd|hd|nvme|mmcblk|disk)",
        "raw write to a block device",
    ),
    (r">\s*/dev/(?:sd|hd|nvme|mmcblk|disk)", "redirect to a block device"),
    (r"\bmkfs(?:\.[a-z0-9]+)?\b", "filesystem format"),
    (
        r"\b(?:curl|wget)\b[^|;&]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b",
        "piping a download into a shell",
    ),
    (r"\bsudo\b", "privilege escalation (sudo)"),
    (r"\bsu\s+(?:-|root)\b", "privilege escalation (su)"),
    (r"\bdoas\b", "privilege escalation (doas)"),
    (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;", "fork bomb"),
    (
        r"\bchmod\s+(?:-[a-zA-Z]+\s+)*777\s+/(?:\s|$)",
        "world-writable filesystem root",
    ),
];

/// Destructive command patterns, Windows side. Checked on every platform:
/// a command can be destined for the other platform via a bridge, and
/// cross-checking costs one regex scan.
const WINDOWS_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)\bformat\s+[a-z]:", "drive format"),
    (
        r"(?i)\breg(?:\.exe)?\s+(?:delete|add)\s+hklm",
        "machine-level registry modification",
    ),
    (r"(?i)\bnet\s+(?:user|localgroup)\b", "user/group management"),
    (
        r"(?i)powershell(?:\.exe)?[^|\n]*\s-(?:e|en|enc|encodedcommand)\b",
        "encoded PowerShell payload",
    ),
    (
        r"(?i)\b(?:rd|rmdir)\s+/s(?:\s+/q)?\s+[a-z]:\\?(?:\s|$)",
        "recursive delete of a drive root",
    ),
    (
        r"(?i)\bdel\s+(?:/[fsqa]\s+)+[a-z]:\\(?:\s|$|\*)",
        "forced recursive delete of a drive root",
    ),
];

fn destructive_patterns() -> &'static Vec<(Regex, &'static str)> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        POSIX_PATTERNS
            .iter()
            .chain(WINDOWS_PATTERNS.iter())
            .map(|(p, why)| (Regex::new(p).expect("static pattern"), *why))
            .collect()
    })
}

/// Absolute-path-looking tokens inside a command string: POSIX absolute
/// paths and Windows drive paths.
fn absolute_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?:^|[\s"'=(])((?:/[^\s"';|&)]+)|(?:[A-Za-z]:\\[^\s"';|&)]*))"#)
            .expect("static pattern")
    })
}

/// True when the filesystem compares paths case-insensitively.
const fn case_insensitive_fs() -> bool {
    cfg!(any(target_os = "windows", target_os = "macos"))
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Prefix check, case-folded on case-insensitive filesystems.
fn is_within(path: &Path, root: &Path) -> bool {
    if !case_insensitive_fs() {
        return path.starts_with(root);
    }
    let fold = |p: &Path| -> Vec<String> {
        p.components()
            .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
            .collect()
    };
    let path = fold(path);
    let root = fold(root);
    path.len() >= root.len() && path[..root.len()] == root[..]
}

/// Validate that `target` stays under `workspace_root`.
///
/// Relative targets are resolved against the root. Lexically out-of-bounds
/// targets are refused before the target is ever touched on the
/// filesystem. For contained targets, the symlink-resolved real form (of
/// the target, or of its deepest existing ancestor) is re-checked against
/// the root — a symlink inside the workspace pointing outside is rejected
/// even though the lexical path looks contained.
///
/// Returns the validated absolute path (real form when it exists).
pub fn validate_path(target: &Path, workspace_root: &Path) -> SandboxResult<PathBuf> {
    let root = workspace_root.canonicalize().map_err(|e| {
        SandboxError::Configuration(format!(
            "workspace root {} is not usable: {}",
            workspace_root.display(),
            e
        ))
    })?;

    let absolute = if target.is_absolute() {
        target.to_path_buf()
    } else {
        root.join(target)
    };
    let normalized = normalize_lexically(&absolute);

    // Containment is judged before any filesystem access on the target.
    // Both spellings of the root count: the workspace may be addressed
    // through a symlinked parent, so the given form and the real form can
    // legitimately differ.
    let root_lexical = if workspace_root.is_absolute() {
        normalize_lexically(workspace_root)
    } else {
        root.clone()
    };
    if !is_within(&normalized, &root) && !is_within(&normalized, &root_lexical) {
        return Err(SandboxError::SecurityViolation(format!(
            "path escapes workspace: {}",
            target.display()
        )));
    }

    // An existing target is additionally judged by its symlink-resolved
    // real form: a link inside the workspace may point outside it.
    if normalized.exists() {
        let real = normalized.canonicalize()?;
        if !is_within(&real, &root) {
            return Err(SandboxError::SecurityViolation(format!(
                "path escapes workspace: {} -> {}",
                target.display(),
                real.display()
            )));
        }
        return Ok(real);
    }

    // The target does not exist yet (e.g. a file about to be written).
    // Its deepest existing ancestor must still resolve inside the root,
    // otherwise a symlinked parent directory smuggles the write out.
    let mut ancestor = normalized.as_path();
    while let Some(parent) = ancestor.parent() {
        if parent.exists() {
            let real_parent = parent.canonicalize()?;
            if !is_within(&real_parent, &root) {
                return Err(SandboxError::SecurityViolation(format!(
                    "parent directory escapes workspace: {}",
                    target.display()
                )));
            }
            break;
        }
        ancestor = parent;
    }

    Ok(normalized)
}

/// Validate a shell command before execution.
///
/// `mount_prefixes` lists the virtual prefixes under which the workspace
/// is exposed to tools (see `PathResolver`); absolute tokens starting with
/// one of them must land back inside the workspace after substitution.
pub fn validate_command(
    command: &str,
    cwd: &Path,
    workspace_root: &Path,
    mount_prefixes: &[String],
) -> ValidationResult {
    let mut errors = Vec::new();

    if command.trim().is_empty() {
        return ValidationResult::fail(vec!["empty command".to_string()]);
    }
    if command.contains('\0') {
        return ValidationResult::fail(vec!["command contains null byte".to_string()]);
    }

    if let Err(e) = validate_path(cwd, workspace_root) {
        errors.push(format!("invalid cwd: {}", e));
    }

    if command.contains("../") || command.contains("..\\") {
        errors.push("command contains path traversal".to_string());
    }

    for (pattern, why) in destructive_patterns() {
        if pattern.is_match(command) {
            errors.push(format!("destructive command pattern: {}", why));
        }
    }

    // Absolute tokens under a known mount prefix must map back inside the
    // workspace. Tokens outside every mount prefix are left to the
    // executing backend's own containment checks.
    for caps in absolute_token_pattern().captures_iter(command) {
        let token = &caps[1];
        for prefix in mount_prefixes {
            if let Some(rest) = strip_mount_prefix(token, prefix) {
                let candidate =
                    normalize_lexically(&workspace_root.join(rest.trim_start_matches(['/', '\\'])));
                if !is_within(&candidate, workspace_root) {
                    errors.push(format!("path argument escapes workspace: {}", token));
                }
                break;
            }
        }
    }

    if errors.is_empty() {
        ValidationResult::ok()
    } else {
        ValidationResult::fail(errors)
    }
}

fn strip_mount_prefix<'a>(token: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = token.strip_prefix(prefix)?;
    // Require a component boundary so "/workspace2" does not match the
    // "/workspace" mount.
    if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') {
        Some(rest)
    } else {
        None
    }
}
