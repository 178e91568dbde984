//! PathConverter: bidirectional host ↔ VM path mapping.
//!
//! Paths meaningful on the host (e.g. a Windows drive path) differ from
//! the VM's mount namespace (e.g. a POSIX mount prefix). Every call
//! crossing a bridge is converted in, and every returned path is converted
//! back out before being shown to the caller. The mapping is pure: no
//! filesystem access, and `to_host(to_vm(p)) == p` for every path under
//! the configured roots.

use std::path::{Path, PathBuf};

use agentbox_core::error::{SandboxError, SandboxResult};

/// Pure mapping between one host root and one VM root.
#[derive(Debug, Clone)]
pub struct PathConverter {
    host_root: PathBuf,
    vm_root: String,
}

impl PathConverter {
    /// `vm_root` is a POSIX-style absolute path inside the VM.
    pub fn new(host_root: impl Into<PathBuf>, vm_root: impl Into<String>) -> Self {
        Self {
            host_root: host_root.into(),
            vm_root: normalize_vm_root(vm_root.into()),
        }
    }

    /// Converter for a WSL mount of a Windows path: `C:\work` maps to
    /// `/mnt/c/work`.
    pub fn wsl(host_root: impl Into<PathBuf>) -> SandboxResult<Self> {
        let host_root = host_root.into();
        let vm_root = windows_to_wsl_path(&host_root)?;
        Ok(Self::new(host_root, vm_root))
    }

    pub fn vm_root(&self) -> &str {
        &self.vm_root
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    /// Map a host path into the VM namespace.
    pub fn to_vm(&self, host_path: &Path) -> SandboxResult<String> {
        let rel = host_path.strip_prefix(&self.host_root).map_err(|_| {
            SandboxError::Configuration(format!(
                "path {} is outside the mapped host root {}",
                host_path.display(),
                self.host_root.display()
            ))
        })?;
        if rel.as_os_str().is_empty() {
            return Ok(self.vm_root.clone());
        }
        let rel = rel.to_string_lossy().replace('\\', "/");
        Ok(format!("{}/{}", self.vm_root, rel))
    }

    /// Map a VM path back into the host namespace.
    pub fn to_host(&self, vm_path: &str) -> SandboxResult<PathBuf> {
        let rest = vm_path.strip_prefix(&self.vm_root).ok_or_else(|| {
            SandboxError::Configuration(format!(
                "path {} is outside the mapped VM root {}",
                vm_path, self.vm_root
            ))
        })?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return Err(SandboxError::Configuration(format!(
                "path {} is outside the mapped VM root {}",
                vm_path, self.vm_root
            )));
        }
        let mut host = self.host_root.clone();
        for part in rest.split('/').filter(|p| !p.is_empty()) {
            host.push(part);
        }
        Ok(host)
    }
}

fn normalize_vm_root(mut root: String) -> String {
    while root.len() > 1 && root.ends_with('/') {
        root.pop();
    }
    root
}

/// Convert a Windows drive path to its WSL mount form
/// (`C:\foo\bar` → `/mnt/c/foo/bar`). UNC paths are not supported.
pub fn windows_to_wsl_path(path: &Path) -> SandboxResult<String> {
    let s = path.to_string_lossy();
    if s.starts_with("\\\\") {
        return Err(SandboxError::Configuration(format!(
            "UNC paths are not supported in WSL: {}",
            s
        )));
    }
    let mut chars = s.chars();
    let drive = chars.next().ok_or_else(|| {
        SandboxError::Configuration("empty path".to_string())
    })?;
    if chars.next() != Some(':') || !drive.is_ascii_alphabetic() {
        // Already POSIX-shaped (running on a non-Windows host); pass
        // through with separators normalized.
        return Ok(s.replace('\\', "/"));
    }
    let rest: String = chars.collect::<String>().replace('\\', "/");
    Ok(format!(
        "/mnt/{}{}",
        drive.to_ascii_lowercase(),
        if rest.is_empty() { "/".to_string() } else { rest }
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_host_paths_into_the_vm() {
        let conv = PathConverter::new("/Users/dev/project", "/tmp/agentbox-sync/s1");
        assert_eq!(
            conv.to_vm(Path::new("/Users/dev/project/src/main.rs")).unwrap(),
            "/tmp/agentbox-sync/s1/src/main.rs"
        );
        assert_eq!(
            conv.to_vm(Path::new("/Users/dev/project")).unwrap(),
            "/tmp/agentbox-sync/s1"
        );
    }

    #[test]
    fn round_trips_every_path_under_the_mapping() {
        let conv = PathConverter::new("/home/u/ws", "/work");
        for p in ["/home/u/ws", "/home/u/ws/a", "/home/u/ws/a/b c/d.txt"] {
            let vm = conv.to_vm(Path::new(p)).unwrap();
            assert_eq!(conv.to_host(&vm).unwrap(), PathBuf::from(p));
        }
    }

    #[test]
    fn rejects_paths_outside_the_mapping() {
        let conv = PathConverter::new("/home/u/ws", "/work");
        assert!(conv.to_vm(Path::new("/etc/passwd")).is_err());
        assert!(conv.to_host("/other/place").is_err());
        // Sibling prefix is not the root.
        assert!(conv.to_host("/workspace/a").is_err());
    }

    #[test]
    fn converts_windows_drive_paths_to_wsl_mounts() {
        assert_eq!(
            windows_to_wsl_path(Path::new("C:\\work\\proj")).unwrap(),
            "/mnt/c/work/proj"
        );
        assert_eq!(
            windows_to_wsl_path(Path::new("d:\\")).unwrap(),
            "/mnt/d/"
        );
        assert!(windows_to_wsl_path(Path::new("\\\\server\\share")).is_err());
    }

    #[test]
    fn posix_paths_pass_through_the_wsl_conversion() {
        assert_eq!(
            windows_to_wsl_path(Path::new("/home/u/ws")).unwrap(),
            "/home/u/ws"
        );
    }
}
