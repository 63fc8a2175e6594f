use std::path::{Path, PathBuf};

/// Environment variable overriding the config directory
pub const HOME_ENV: &str = "INFERMESH_HOME";

/// `$INFERMESH_HOME`, else `~/.infermesh`, else `./.infermesh`
pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        if !dir.is_empty() {
            return expand_path(Path::new(&dir));
        }
    }
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home).join(".infermesh"),
        _ => PathBuf::from(".infermesh"),
    }
}

/// Expand a leading `~` and `$VAR` components. Unset variables are left as
/// written.
pub fn expand_path(path: &Path) -> PathBuf {
    let mut expanded = PathBuf::new();
    for (i, component) in path.components().enumerate() {
        let part = component.as_os_str().to_string_lossy();
        if i == 0 && part == "~" {
            match std::env::var("HOME") {
                Ok(home) => expanded.push(home),
                Err(_) => expanded.push(component.as_os_str()),
            }
        } else if let Some(var) = part.strip_prefix('$') {
            match std::env::var(var) {
                Ok(value) => expanded.push(value),
                Err(_) => expanded.push(component.as_os_str()),
            }
        } else {
            expanded.push(component.as_os_str());
        }
    }
    expanded
}
