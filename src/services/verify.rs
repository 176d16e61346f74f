use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use sha1::{Digest, Sha1};

use crate::errors::{EngineError, Result};
use crate::manifest::file_list::{FileManifest, FileManifestList};
use crate::utils::env_usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyFailure {
    pub filename: String,
    pub reason: String,
}

fn resolve_verify_workers() -> usize {
    if let Some(value) = env_usize("CHUNKFORGE_WORKER_COUNT") {
        return value.clamp(1, 64);
    }
    thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(4)
        .clamp(1, 64)
}

fn sha1_file_hex(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0_u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn verify_file(install_dir: &Path, file: &FileManifest) -> Option<VerifyFailure> {
    // Symlinks carry no content hash; existence is all that can be checked.
    if !file.symlink_target.is_empty() {
        return None;
    }

    let target = install_dir.join(&file.filename);
    if !target.exists() || !target.is_file() {
        return Some(VerifyFailure {
            filename: file.filename.clone(),
            reason: "missing_file".to_string(),
        });
    }

    let actual = match sha1_file_hex(&target) {
        Ok(value) => value,
        Err(err) => {
            return Some(VerifyFailure {
                filename: file.filename.clone(),
                reason: format!("hash_read_failed: {err}"),
            });
        }
    };

    if !actual.eq_ignore_ascii_case(&file.hash_hex()) {
        return Some(VerifyFailure {
            filename: file.filename.clone(),
            reason: "hash_mismatch".to_string(),
        });
    }

    None
}

fn verify_install_blocking(
    install_dir: PathBuf,
    files: Vec<FileManifest>,
) -> Result<Vec<VerifyFailure>> {
    let worker_count = resolve_verify_workers().min(files.len().max(1));
    let entries = Arc::new(files);
    let next_index = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(Mutex::new(Vec::<VerifyFailure>::new()));

    let mut workers = Vec::new();
    for _ in 0..worker_count {
        let root = install_dir.clone();
        let files_ref = Arc::clone(&entries);
        let index_ref = Arc::clone(&next_index);
        let failures_ref = Arc::clone(&failures);
        workers.push(thread::spawn(move || loop {
            let index = index_ref.fetch_add(1, Ordering::SeqCst);
            if index >= files_ref.len() {
                break;
            }
            if let Some(failure) = verify_file(&root, &files_ref[index]) {
                if let Ok(mut guard) = failures_ref.lock() {
                    guard.push(failure);
                }
            }
        }));
    }

    for handle in workers {
        let _ = handle.join();
    }

    let mut failures = failures
        .lock()
        .map_err(|_| EngineError::Config("verify results lock poisoned".to_string()))?
        .clone();
    failures.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(failures)
}

/// Recompute every file's SHA-1 against the manifest with bounded
/// parallelism. A non-empty result fails the install outright; partial
/// success is not an outcome.
pub async fn verify_install(
    install_dir: &Path,
    files: &FileManifestList,
) -> Result<Vec<VerifyFailure>> {
    let install_dir = install_dir.to_path_buf();
    let files = files.files.clone();
    tokio::task::spawn_blocking(move || verify_install_blocking(install_dir, files))
        .await
        .map_err(|err| EngineError::Config(format!("verify join error: {err}")))?
}
