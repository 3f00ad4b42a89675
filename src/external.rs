use std::borrow::Cow;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Resolve a command path the way a typical shell would.
///
/// Behavior:
/// - Absolute path: returns it if it exists.
/// - `./foo` or a relative path with multiple components (e.g., `bin/sh`): resolved
///   against `base_dir` and returned if it exists.
/// - Single path component (no separators): search each directory in `search_paths`
///   (PATH) and return the first executable regular file.
/// - Empty path: returns `None`.
///
/// Returns either a borrowed reference to the provided `path` or an owned `PathBuf`
/// when the result is discovered relative to `base_dir` or via PATH lookup.
pub fn find_command_path<'a>(
    search_paths: &OsStr,
    base_dir: &Path,
    path: &'a Path,
) -> Option<Cow<'a, Path>> {
    if path.is_absolute() {
        return find_by_path(path).map(Cow::Borrowed);
    }

    let mut components = path.components();
    let first = components.next();
    let second = components.next();
    match (first, second) {
        // Empty path -> not found
        (None, None) => None,
        (Some(std::path::Component::Normal(x)), None) => {
            find_in_path(search_paths, base_dir, x).map(Cow::Owned)
        }
        // `./foo`, `bin/sh`, `../x`: relative to the working directory
        _ => {
            let joined = base_dir.join(path);
            find_by_path(&joined).map(|p| Cow::Owned(p.to_path_buf()))
        }
    }
}

fn find_in_path(search_paths: &OsStr, base_dir: &Path, cmd: &OsStr) -> Option<PathBuf> {
    for dir in std::env::split_paths(search_paths) {
        let dir = if dir.is_absolute() {
            dir
        } else {
            base_dir.join(dir)
        };
        let path = dir.join(cmd);
        if is_executable_file(&path) {
            return Some(path);
        }
    }
    None
}

/// Names of the executables along `search_paths` that start with `prefix`, sorted.
pub(crate) fn executables_in_path(search_paths: &OsStr, base_dir: &Path, prefix: &str) -> Vec<String> {
    let mut names = Vec::new();
    for dir in std::env::split_paths(search_paths) {
        let Ok(entries) = std::fs::read_dir(base_dir.join(dir)) else {
            continue;
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with(prefix) && is_executable_file(&entry.path()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    names.dedup();
    names
}

fn find_by_path(path: &Path) -> Option<&Path> {
    if path.exists() { Some(path) } else { None }
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}
