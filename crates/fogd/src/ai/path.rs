//! Assistant executable resolution.
//!
//! Daemons inherit a much thinner PATH than login shells, so after PATH we
//! probe the usual tool-manager install locations, including every nvm
//! node version. Results are memoized per command name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Fallback directories relative to the home directory.
const HOME_FALLBACK_DIRS: [&str; 7] = [
    ".local/bin",
    "bin",
    ".cargo/bin",
    ".bun/bin",
    ".npm-global/bin",
    "Library/pnpm",
    ".nvm/versions/node",
];

/// System fallback directories.
const SYSTEM_FALLBACK_DIRS: [&str; 2] = ["/opt/homebrew/bin", "/usr/local/bin"];

fn cache() -> &'static Mutex<HashMap<String, Option<PathBuf>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Option<PathBuf>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Resolve a command to an absolute path, memoized.
pub fn command_path(name: &str) -> Option<PathBuf> {
    if let Ok(cached) = cache().lock() {
        if let Some(hit) = cached.get(name) {
            return hit.clone();
        }
    }

    let resolved = resolve(name);
    if let Ok(mut cached) = cache().lock() {
        cached.insert(name.to_string(), resolved.clone());
    }
    resolved
}

fn resolve(name: &str) -> Option<PathBuf> {
    // PATH first.
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Some(candidate);
            }
        }
    }

    for dir in SYSTEM_FALLBACK_DIRS {
        let candidate = Path::new(dir).join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    let home = dirs::home_dir()?;
    for dir in HOME_FALLBACK_DIRS {
        if dir == ".nvm/versions/node" {
            if let Some(candidate) = nvm_bin_candidate(&home.join(dir), name) {
                return Some(candidate);
            }
            continue;
        }
        let candidate = home.join(dir).join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    None
}

/// Probe `<nvm>/versions/node/*/bin/<name>`.
fn nvm_bin_candidate(versions_dir: &Path, name: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(versions_dir).ok()?;
    for entry in entries.flatten() {
        let candidate = entry.path().join("bin").join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && path
            .metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Serializes tests that mutate PATH/HOME.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[cfg(unix)]
    fn write_executable(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn finds_command_in_path() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let expected = write_executable(dir.path(), "fog-test-cmd-path");

        let old_path = std::env::var_os("PATH");
        std::env::set_var("PATH", dir.path());
        let got = command_path("fog-test-cmd-path");
        if let Some(old) = old_path {
            std::env::set_var("PATH", old);
        }

        assert_eq!(got, Some(expected));
    }

    #[cfg(unix)]
    #[test]
    fn finds_fallback_in_home_local_bin() {
        let _guard = ENV_LOCK.lock().unwrap();
        let home = TempDir::new().unwrap();
        let fallback = home.path().join(".local/bin");
        std::fs::create_dir_all(&fallback).unwrap();
        let expected = write_executable(&fallback, "fog-test-cmd-fallback");

        let old_home = std::env::var_os("HOME");
        let old_path = std::env::var_os("PATH");
        std::env::set_var("HOME", home.path());
        std::env::set_var("PATH", "/usr/bin:/bin");
        let got = command_path("fog-test-cmd-fallback");
        if let Some(old) = old_home {
            std::env::set_var("HOME", old);
        }
        if let Some(old) = old_path {
            std::env::set_var("PATH", old);
        }

        assert_eq!(got, Some(expected));
    }

    #[cfg(unix)]
    #[test]
    fn finds_nvm_node_bin() {
        let _guard = ENV_LOCK.lock().unwrap();
        let home = TempDir::new().unwrap();
        let nvm_bin = home.path().join(".nvm/versions/node/v22.1.0/bin");
        std::fs::create_dir_all(&nvm_bin).unwrap();
        let expected = write_executable(&nvm_bin, "fog-test-cmd-nvm");

        let old_home = std::env::var_os("HOME");
        let old_path = std::env::var_os("PATH");
        std::env::set_var("HOME", home.path());
        std::env::set_var("PATH", "/usr/bin:/bin");
        let got = command_path("fog-test-cmd-nvm");
        if let Some(old) = old_home {
            std::env::set_var("HOME", old);
        }
        if let Some(old) = old_path {
            std::env::set_var("PATH", old);
        }

        assert_eq!(got, Some(expected));
    }

    #[test]
    fn missing_command_resolves_to_none_and_memoizes() {
        assert_eq!(command_path("fog-test-cmd-definitely-missing"), None);
        // Second lookup hits the cache.
        assert_eq!(command_path("fog-test-cmd-definitely-missing"), None);
    }
}
