use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{validate_key, KeyValueStore};

/// Owner read/write only
#[cfg(unix)]
const PRIVATE_MODE: u32 = 0o600;

/// One JSON file per key inside `dir`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

/// Write through a sibling temp file so readers never see a torn value.
///
/// On unix the temp file is owner-only from the moment it exists, and a
/// leftover temp file is narrowed before any byte is written.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(PRIVATE_MODE);
    }
    let mut file = options
        .open(&tmp)
        .with_context(|| format!("Failed to create {}", tmp.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(PRIVATE_MODE))
            .context("Failed to restrict storage file permissions")?;
    }

    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    drop(file);

    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read storage file: {}", key))?;
        Ok(Some(contents))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key)?;
        write_private(&path, value.as_bytes())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        remove_if_exists(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path().to_path_buf()).expect("store");
        store.set("dashauth.session", r#"{"a":1}"#).expect("set");

        let reopened = FileStore::new(dir.path().to_path_buf()).expect("store");
        assert_eq!(
            reopened.get("dashauth.session").expect("get").as_deref(),
            Some(r#"{"a":1}"#)
        );
        assert!(dir.path().join("dashauth.session.json").exists());
        assert!(!dir.path().join("dashauth.session.tmp").exists());
    }

    #[test]
    fn test_file_store_remove_missing_is_ok() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path().to_path_buf()).expect("store");
        store.remove("dashauth.user").expect("remove");
        store.set("dashauth.user", "x").expect("set");
        store.remove("dashauth.user").expect("remove");
        assert!(store.get("dashauth.user").expect("get").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_private_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path().to_path_buf()).expect("store");
        store.set("dashauth.session", "secret").expect("set");
        let mode = std::fs::metadata(dir.path().join("dashauth.session.json"))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_leftover_temp_file_is_narrowed_before_write() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("temp dir");
        let target = dir.path().join("dashauth.session.json");
        let tmp = dir.path().join("dashauth.session.tmp");
        std::fs::write(&tmp, "stale").expect("write stale");
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).expect("chmod");

        write_private(&target, b"secret").expect("write");

        let mode = std::fs::metadata(&target).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&target).expect("read"), "secret");
        assert!(!tmp.exists());
    }

    #[test]
    fn test_file_store_rejects_path_keys() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path().to_path_buf()).expect("store");
        assert!(store.set("../escape", "x").is_err());
    }
}
