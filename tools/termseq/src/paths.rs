//! Directory comparison and `cd` parsing shared by capture and playback.

use std::path::{Component, Path, PathBuf};

/// Expand a leading `~`, make `value` absolute against `base`, fold `.`/`..`
/// lexically, then resolve symlinks when the path exists.
pub fn normalize_directory(value: &str, base: &Path) -> PathBuf {
    let expanded = expand_tilde(value.trim());
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };
    let cleaned = lexical_clean(&absolute);
    std::fs::canonicalize(&cleaned).unwrap_or(cleaned)
}

pub fn same_directory(a: &Path, b: &Path) -> bool {
    let root = Path::new("/");
    normalize_directory(&a.to_string_lossy(), root)
        == normalize_directory(&b.to_string_lossy(), root)
}

pub fn expand_tilde(value: &str) -> PathBuf {
    if value == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(value)
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn is_cd_command(command: &str) -> bool {
    let trimmed = command.trim();
    trimmed == "cd" || trimmed.starts_with("cd ")
}

/// Target of a `cd` command, or `None` for anything else. A bare `cd` targets `~`.
pub fn cd_target(command: &str) -> Option<String> {
    if !is_cd_command(command) {
        return None;
    }
    let target = command.trim()[2..].trim();
    let target = target.trim_matches(|c| c == '"' || c == '\'');
    if target.is_empty() {
        Some("~".to_string())
    } else {
        Some(target.to_string())
    }
}

/// Directory a shell would be in after running `command` from `current`,
/// assuming it succeeds. `None` when the command is not a `cd` or the target
/// cannot be predicted (`cd -`).
pub fn predict_directory_after(command: &str, current: &Path) -> Option<PathBuf> {
    let target = cd_target(command)?;
    if target == "-" {
        return None;
    }
    Some(normalize_directory(&target, current))
}

pub fn cd_command_for(directory: &str) -> String {
    if directory.contains(char::is_whitespace) && !directory.starts_with('"') {
        format!("cd \"{directory}\"")
    } else {
        format!("cd {directory}")
    }
}
