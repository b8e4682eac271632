use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

/// Resolves a binary either from an explicitly configured path or from `PATH`
#[instrument(level = "debug", ret, err)]
pub fn resolve_binary_path(configured: Option<&str>, name: &str) -> Result<PathBuf> {
    if let Some(configured) = configured.filter(|p| !p.is_empty()) {
        let path = Path::new(configured);
        if path.is_file() {
            debug!(path = %path.display(), "Using configured binary path");
            return Ok(path.to_path_buf());
        }
        // Could also be a bare name like "adb"
        return which::which(configured)
            .with_context(|| format!("Configured binary '{configured}' not found"));
    }
    which::which(name).with_context(|| format!("'{name}' not found in PATH"))
}

/// Text with ASCII control noise removed, ready to show to a user
pub fn sanitize_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn configured_file_wins_over_path_lookup() {
        let dir = tempdir().unwrap();
        let fake = dir.path().join("my-adb");
        std::fs::write(&fake, b"").unwrap();

        let resolved = resolve_binary_path(Some(fake.to_str().unwrap()), "adb").unwrap();
        assert_eq!(resolved, fake);
    }

    #[test]
    fn missing_binary_is_an_error() {
        let err = resolve_binary_path(None, "definitely-not-a-real-binary-1f3c").unwrap_err();
        assert!(format!("{err:#}").contains("not found in PATH"));
    }

    #[test]
    fn sanitize_output_strips_control_characters() {
        assert_eq!(sanitize_output(b"\x1b[0mSuccess\r\n"), "[0mSuccess");
        assert_eq!(sanitize_output(b"  Failure [INSTALL_FAILED]\n"), "Failure [INSTALL_FAILED]");
    }
}
