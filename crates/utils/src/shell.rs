use std::path::PathBuf;

/// Locate an executable on PATH.
pub fn resolve_executable_path(name: &str) -> Option<PathBuf> {
    match which::which(name) {
        Ok(path) => Some(path),
        Err(err) => {
            tracing::debug!("could not resolve `{name}` on PATH: {err}");
            None
        }
    }
}
