//! Process presence checks

use std::path::Path;

use eyre::{Result, eyre};
use tracing::debug;

/// Check if a program is available via the standard PATH lookup
///
/// Paths containing a separator are checked directly; bare names are looked
/// up on `PATH`.
pub fn is_installed(cmd: impl AsRef<Path>) -> bool {
    let cmd = cmd.as_ref();
    let found = which::which(cmd);
    debug!(?cmd, found = found.is_ok(), "is_installed: lookup complete");
    found.is_ok()
}

/// Error unless the program is installed
pub fn assert_is_installed(cmd: impl AsRef<Path>) -> Result<()> {
    let cmd = cmd.as_ref();
    if is_installed(cmd) {
        Ok(())
    } else {
        Err(eyre!("Cannot find {} in your system", cmd.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_sh_is_installed() {
        assert!(is_installed("sh"));
        assert!(assert_is_installed("sh").is_ok());
    }

    #[test]
    fn test_missing_program() {
        assert!(!is_installed("definitely-not-a-real-program-4711"));
        let err = assert_is_installed("definitely-not-a-real-program-4711").unwrap_err();
        assert!(err.to_string().contains("Cannot find"));
    }

    #[cfg(unix)]
    #[test]
    fn test_explicit_path_requires_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let script = temp.path().join("driver");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!is_installed(&script));

        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_installed(&script));
    }
}
