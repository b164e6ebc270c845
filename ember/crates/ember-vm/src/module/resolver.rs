//! Module name validation and path resolution.
//!
//! Resolution tries, in order: the VM's custom search paths, the current
//! directory (or the importing module's directory for relative names),
//! the user packages directory under the home dir, the system packages
//! directory, the standard-library directory, and a `lib/` directory
//! next to the running executable. At each location both `P/M.ember` and
//! `P/M/package.ember` are tried.

use std::path::{Path, PathBuf};

use crate::VmError;

/// Source file extension for Ember modules.
pub const MODULE_EXT: &str = "ember";

/// Entry-point file for directory modules.
pub const PACKAGE_FILE: &str = "package.ember";

/// User packages directory under the home dir.
const USER_PACKAGES: &str = ".ember/packages";

/// System-wide packages directory.
const SYSTEM_PACKAGES: &str = "/usr/lib/ember/packages";

/// Standard-library directory.
const STDLIB_DIR: &str = "/usr/lib/ember/lib";

/// Validates a module name: identifier-ish segments, optional relative
/// prefix, and no path traversal.
pub fn validate_module_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("empty module name".to_string());
    }
    if name.len() > 256 {
        return Err("module name too long".to_string());
    }
    // Path traversal is rejected outright, including disguised forms
    // like "a/../b".
    if name == ".." || name.split('/').any(|segment| segment == "..") {
        return Err("path traversal ('..') is not allowed".to_string());
    }
    let acceptable = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/');
    if let Some(bad) = name.chars().find(|&c| !acceptable(c)) {
        return Err(format!("invalid character '{bad}' in module name"));
    }
    Ok(())
}

/// Validates a directory for use as a custom search path.
pub fn validate_search_path(dir: &Path) -> Result<(), VmError> {
    let display = dir.display();
    if dir.to_string_lossy().contains("..") {
        log::error!("[SECURITY] rejected module path with traversal: {display}");
        return Err(VmError::Security(format!(
            "module path must not contain '..': {display}"
        )));
    }
    if !dir.exists() {
        return Err(VmError::Security(format!(
            "module path does not exist: {display}"
        )));
    }
    if !dir.is_dir() {
        return Err(VmError::Security(format!(
            "module path is not a directory: {display}"
        )));
    }
    if std::fs::read_dir(dir).is_err() {
        return Err(VmError::Security(format!(
            "module path is not readable: {display}"
        )));
    }
    Ok(())
}

/// Resolves a module name to a canonical file path, or `None` when no
/// candidate exists.
///
/// `base_dir` is the importing module's directory; relative names (those
/// starting with `./`) resolve against it, falling back to the current
/// working directory at the top level.
pub fn resolve(name: &str, base_dir: Option<&Path>, custom_paths: &[PathBuf]) -> Option<PathBuf> {
    // Relative and absolute names resolve directly, not through the
    // search directories.
    if name.starts_with("./") || name.starts_with('/') {
        let trimmed = name.trim_start_matches("./");
        let root = if name.starts_with('/') {
            PathBuf::from("/")
        } else {
            base_dir
                .map(Path::to_path_buf)
                .or_else(|| std::env::current_dir().ok())?
        };
        return try_candidates(&root, trimmed);
    }

    for dir in search_dirs(custom_paths) {
        log::trace!("[RESOLVE] trying '{name}' under {}", dir.display());
        if let Some(found) = try_candidates(&dir, name) {
            if dir == Path::new(STDLIB_DIR) {
                log::debug!("[LIBRARY] '{name}' -> {}", found.display());
            } else {
                log::debug!("[RESOLVE] '{name}' -> {}", found.display());
            }
            return Some(found);
        }
    }
    None
}

/// The ordered list of directories bare names are searched in.
fn search_dirs(custom_paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = custom_paths.to_vec();

    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd.clone());
        dirs.push(cwd.join("modules"));
    }
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(USER_PACKAGES));
    }
    dirs.push(PathBuf::from(SYSTEM_PACKAGES));
    dirs.push(PathBuf::from(STDLIB_DIR));
    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.join("lib"));
        }
    }
    dirs
}

/// Tries `dir/name.ember` then `dir/name/package.ember`, canonicalizing
/// the winner so registry keys are stable across spellings.
fn try_candidates(dir: &Path, name: &str) -> Option<PathBuf> {
    let file = dir.join(format!("{name}.{MODULE_EXT}"));
    if file.is_file() {
        return file.canonicalize().ok();
    }
    let package = dir.join(name).join(PACKAGE_FILE);
    if package.is_file() {
        return package.canonicalize().ok();
    }
    // A literal path including the extension also works.
    let literal = dir.join(name);
    if literal.is_file() && literal.extension().is_some_and(|ext| ext == MODULE_EXT) {
        return literal.canonicalize().ok();
    }
    None
}
