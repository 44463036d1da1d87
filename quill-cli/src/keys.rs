//! Encryption key resolution for session records.
//!
//! Resolution order: `QUILL_SESSION_KEY` (hex in the environment), then the
//! key file in the config directory. The key itself never appears in a
//! persisted record.

use std::fs;
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use quill_common::security::{generate_key, key_from_hex};
use quill_common::{Error, Result};

/// Environment variable carrying a hex-encoded 32-byte key.
pub const KEY_ENV: &str = "QUILL_SESSION_KEY";

const KEY_FILE: &str = "session.key";

/// Location of the key file inside the config directory.
pub fn key_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(KEY_FILE)
}

/// Resolve the session key, if any is configured.
pub fn resolve_key(config_dir: &Path) -> Result<Option<Zeroizing<[u8; 32]>>> {
    if let Ok(value) = std::env::var(KEY_ENV) {
        if !value.trim().is_empty() {
            return key_from_hex(&value).map(Some);
        }
    }

    let path = key_file_path(config_dir);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)?;
    key_from_hex(&raw).map(Some)
}

/// Generate a fresh key file (0600 on unix). Refuses to overwrite an
/// existing one - losing a key means losing every record sealed with it.
pub fn write_key_file(config_dir: &Path) -> Result<PathBuf> {
    let path = key_file_path(config_dir);
    if path.exists() {
        return Err(Error::Config(format!(
            "{} already exists; delete it first to rotate",
            path.display()
        )));
    }

    fs::create_dir_all(config_dir)?;
    let key = generate_key();
    fs::write(&path, hex::encode(*key))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms)?;
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_keygen_and_resolve_roundtrip() {
        std::env::remove_var(KEY_ENV);
        let tmp = TempDir::new().unwrap();

        assert!(resolve_key(tmp.path()).unwrap().is_none());

        let path = write_key_file(tmp.path()).unwrap();
        assert!(path.exists());

        let key = resolve_key(tmp.path()).unwrap().expect("key file written");
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn test_keygen_refuses_overwrite() {
        let tmp = TempDir::new().unwrap();
        write_key_file(tmp.path()).unwrap();
        assert!(matches!(
            write_key_file(tmp.path()).unwrap_err(),
            Error::Config(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let path = write_key_file(tmp.path()).unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
