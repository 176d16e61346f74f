use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::errors::{EngineError, Result};

/// Atomic write via a temp sibling and rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, path)?;
    Ok(())
}

/// Probe write access on a destination by creating and deleting a marker
/// file. Runs before any download starts so permission failures are cheap.
pub fn probe_write_permission(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|err| {
        EngineError::Permission(format!("cannot create {}: {}", dir.display(), err))
    })?;
    let probe = dir.join(".write-probe");
    File::create(&probe)
        .and_then(|mut file| file.write_all(b"probe"))
        .map_err(|err| {
            EngineError::Permission(format!("no write access to {}: {}", dir.display(), err))
        })?;
    fs::remove_file(&probe).map_err(|err| {
        EngineError::Permission(format!("cannot delete probe in {}: {}", dir.display(), err))
    })?;
    Ok(())
}

pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

/// Remove now-empty parent directories up to (not including) `root`.
pub fn prune_empty_dirs(root: &Path, from: &Path) {
    let mut current = from.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("chunkforge-file-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create temp directory");
        dir
    }

    #[test]
    fn atomic_write_creates_parents() {
        let root = temp_dir();
        let target = root.join("a/b/config.json");
        write_atomic(&target, b"{}").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"{}");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn probe_succeeds_on_writable_dir() {
        let root = temp_dir();
        probe_write_permission(&root).unwrap();
        assert!(!root.join(".write-probe").exists());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn prunes_empty_parents_only() {
        let root = temp_dir();
        let file = root.join("x/y/z.bin");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"data").unwrap();
        fs::remove_file(&file).unwrap();
        prune_empty_dirs(&root, &file);
        assert!(!root.join("x").exists());
        assert!(root.exists());
        let _ = fs::remove_dir_all(&root);
    }
}
