//! Executable path resolution.
//!
//! Rewrites a command's first argument to an absolute executable path when
//! one can be found, searching the current directory rule and PATH the way
//! the host OS does.

use std::env;
use std::path::{Path, PathBuf};

use crate::args::CmdContext;

/// Try to resolve the first argument of `cmd` to an executable on disk.
/// On success the argument is rewritten in place to the absolute path and
/// true is returned; on failure the context is untouched.
pub fn resolve_command_path(cmd: &mut CmdContext) -> bool {
    let Some(name) = cmd.command_name().map(|n| n.into_owned()) else {
        return false;
    };
    let Some(found) = locate_executable(&name) else {
        return false;
    };
    let first = &mut cmd.args[0];
    first.text = found.to_string_lossy().into_owned();
    first.has_escapes = false;
    true
}

/// Find an executable for `name`.  A name containing a path separator is
/// probed directly; a bare name walks the PATH directories.
pub fn locate_executable(name: &str) -> Option<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
        let candidate = PathBuf::from(name);
        return probe(&candidate).map(|p| absolutize(p));
    }
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        if let Some(found) = probe(&dir.join(name)) {
            return Some(absolutize(found));
        }
    }
    None
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

#[cfg(unix)]
fn probe(candidate: &Path) -> Option<PathBuf> {
    if candidate.is_file() && crate::posix::is_executable(candidate.as_os_str()) {
        Some(candidate.to_owned())
    } else {
        None
    }
}

#[cfg(windows)]
fn probe(candidate: &Path) -> Option<PathBuf> {
    // A name that already carries an extension is probed as-is; otherwise
    // each PATHEXT extension is tried in order.
    if candidate.extension().is_some() && candidate.is_file() {
        return Some(candidate.to_owned());
    }
    let exts = env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_owned());
    for ext in exts.split(';').filter(|e| !e.is_empty()) {
        let mut probed = candidate.as_os_str().to_owned();
        probed.push(ext);
        let probed = PathBuf::from(probed);
        if probed.is_file() {
            return Some(probed);
        }
    }
    None
}
