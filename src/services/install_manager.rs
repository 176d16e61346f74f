use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::errors::{EngineError, Result};
use crate::manifest::Manifest;
use crate::models::{
    EngineEvent, InstallAction, InstallItem, InstallRequest, InstallStatus, InstalledRecord,
    INSTALL_RECORD_FILE,
};
use crate::services::io_worker::{
    run_io_worker, CopyTarget, DownloadTask, InstallSession, IoTask,
};
use crate::services::mirror_pool::MirrorPool;
use crate::services::repository::ManifestRepository;
use crate::services::verify::verify_install;
use crate::services::{cancel_pair, CancelToken};
use crate::utils::env_usize;
use crate::utils::file::{dir_size, probe_write_permission, write_atomic};

const TEMP_DIR_NAME: &str = ".temp";
const PUMP_POLL_MS: u64 = 200;
const DRAIN_POLL_MS: u64 = 100;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Download and I/O pool size; defaults to host parallelism.
    pub worker_count: usize,
    /// Optional ceiling on full mirror passes before a chunk fetch gives up.
    /// `None` keeps the original retry-forever behavior.
    pub mirror_max_passes: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let worker_count = env_usize("CHUNKFORGE_WORKER_COUNT")
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|value| value.get())
                    .unwrap_or(4)
            })
            .clamp(1, 32);
        Self {
            worker_count,
            mirror_max_passes: None,
        }
    }
}

/// Install orchestrator: owns the request queue, runs one install at a
/// time, and drives the download and reconstruction worker pools.
#[derive(Clone)]
pub struct InstallManager {
    repository: Arc<dyn ManifestRepository>,
    config: EngineConfig,
    pending: Arc<Mutex<VecDeque<(InstallRequest, InstallItem)>>>,
    current: Arc<Mutex<Option<Arc<InstallSession>>>>,
    history: Arc<Mutex<Vec<InstallItem>>>,
    events: broadcast::Sender<EngineEvent>,
    pump_started: Arc<AtomicBool>,
}

impl InstallManager {
    pub fn new(repository: Arc<dyn ManifestRepository>, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            repository,
            config,
            pending: Arc::new(Mutex::new(VecDeque::new())),
            current: Arc::new(Mutex::new(None)),
            history: Arc::new(Mutex::new(Vec::new())),
            events,
            pump_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Queue a new operation. Requests are de-duplicated by target app id
    /// against both the running item and the queue.
    pub fn enqueue(&self, request: InstallRequest) -> Result<InstallItem> {
        if let Some(session) = self.current.lock().expect("current slot lock").as_ref() {
            if session.snapshot().app_id == request.app_id {
                return Err(EngineError::Config(format!(
                    "operation already running for app {}",
                    request.app_id
                )));
            }
        }

        let mut pending = self.pending.lock().expect("pending queue lock");
        if pending.iter().any(|(queued, _)| queued.app_id == request.app_id) {
            return Err(EngineError::Config(format!(
                "operation already queued for app {}",
                request.app_id
            )));
        }

        let item = InstallItem::new(&request);
        tracing::info!(
            "enqueued app_id={} action={:?} path={}",
            item.app_id,
            item.action,
            item.install_path.display()
        );
        let _ = self.events.send(EngineEvent::StatusChanged(item.clone()));
        pending.push_back((request, item.clone()));
        Ok(item)
    }

    /// Start the queue pump. Idempotent; the pump runs for the lifetime of
    /// the process and executes items strictly one at a time.
    pub fn start(&self) {
        if self.pump_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let next = manager
                    .pending
                    .lock()
                    .expect("pending queue lock")
                    .pop_front();
                match next {
                    Some((request, item)) => manager.run_item(request, item).await,
                    None => sleep(Duration::from_millis(PUMP_POLL_MS)).await,
                }
            }
        });
    }

    /// Cancel the running operation for `app_id`, or drop it from the queue
    /// when it has not started yet.
    pub fn cancel(&self, app_id: &str) -> Result<()> {
        if let Some(session) = self.current.lock().expect("current slot lock").as_ref() {
            if session.snapshot().app_id == app_id {
                session.request_cancel();
                return Ok(());
            }
        }

        let mut pending = self.pending.lock().expect("pending queue lock");
        if let Some(pos) = pending.iter().position(|(queued, _)| queued.app_id == app_id) {
            let (_, mut item) = pending.remove(pos).expect("position just found");
            item.status = InstallStatus::Cancelled;
            item.updated_at = chrono::Utc::now().timestamp();
            let _ = self.events.send(EngineEvent::StatusChanged(item.clone()));
            self.history.lock().expect("history lock").push(item);
            return Ok(());
        }

        Err(EngineError::Config(format!(
            "no pending or running operation for app {app_id}"
        )))
    }

    pub fn current_item(&self) -> Option<InstallItem> {
        self.current
            .lock()
            .expect("current slot lock")
            .as_ref()
            .map(|session| session.snapshot())
    }

    pub fn queued_items(&self) -> Vec<InstallItem> {
        self.pending
            .lock()
            .expect("pending queue lock")
            .iter()
            .map(|(_, item)| item.clone())
            .collect()
    }

    pub fn history(&self) -> Vec<InstallItem> {
        self.history.lock().expect("history lock").clone()
    }

    async fn run_item(&self, request: InstallRequest, item: InstallItem) {
        let (cancel_handle, cancel_token) = cancel_pair();
        let session = Arc::new(InstallSession::new(item, cancel_handle, self.events.clone()));
        *self.current.lock().expect("current slot lock") = Some(session.clone());
        session.set_status(InstallStatus::Processing);

        let outcome = self
            .execute(&request, session.clone(), cancel_token)
            .await;

        let final_status = if session.status() == InstallStatus::Cancelling {
            InstallStatus::Cancelled
        } else {
            match outcome {
                Ok(()) => InstallStatus::Success,
                Err(EngineError::Cancelled) => InstallStatus::Cancelled,
                Err(err) => {
                    session.set_error_message(&err.to_string());
                    InstallStatus::Failed
                }
            }
        };
        session.set_status(final_status);

        let snapshot = session.snapshot();
        tracing::info!(
            "install finished app_id={} action={:?} status={:?} downloaded={} written={}",
            snapshot.app_id,
            snapshot.action,
            snapshot.status,
            snapshot.downloaded_bytes,
            snapshot.written_bytes
        );
        self.history.lock().expect("history lock").push(snapshot);
        *self.current.lock().expect("current slot lock") = None;
    }

    async fn execute(
        &self,
        request: &InstallRequest,
        session: Arc<InstallSession>,
        cancel: CancelToken,
    ) -> Result<()> {
        let resolved = self
            .repository
            .resolve_manifest(&request.namespace, &request.catalog_id, &request.app_name)
            .await?;
        let manifest = Manifest::parse(&resolved.manifest_bytes)?;
        tracing::info!(
            "manifest parsed app={} build={} files={} chunks={} total={}",
            manifest.meta.app_name,
            manifest.meta.build_version,
            manifest.files.len(),
            manifest.chunks.len(),
            crate::utils::format_bytes(manifest.files.total_size())
        );

        match request.action {
            InstallAction::Verify => {
                let failures = verify_install(&request.install_path, &manifest.files).await?;
                if failures.is_empty() {
                    return Ok(());
                }
                return Err(EngineError::Integrity(format!(
                    "{} files failed verification, first: {} ({})",
                    failures.len(),
                    failures[0].filename,
                    failures[0].reason
                )));
            }
            InstallAction::Move => {
                return self.execute_move(request, &manifest).await;
            }
            _ => {}
        }

        probe_write_permission(&request.install_path)?;

        let file_filter: Option<HashSet<String>> = match request.action {
            InstallAction::Repair => {
                let failures = verify_install(&request.install_path, &manifest.files).await?;
                if failures.is_empty() {
                    tracing::info!("repair found nothing to fix app_id={}", request.app_id);
                    return Ok(());
                }
                Some(failures.into_iter().map(|f| f.filename).collect())
            }
            _ => None,
        };

        if request.action == InstallAction::Uninstall {
            self.plan_uninstall(&session, request, &manifest);
        } else {
            self.plan_download(&session, request, &manifest, file_filter.as_ref())?;
        }

        let pool = {
            let base = MirrorPool::new(self.repository.clone(), resolved.base_urls.clone());
            match self.config.mirror_max_passes {
                Some(passes) => base.with_max_passes(passes),
                None => base,
            }
        };

        let mut workers = Vec::new();
        for _ in 0..self.config.worker_count {
            workers.push(tokio::spawn(run_download_worker(
                session.clone(),
                pool.clone(),
                cancel.clone(),
            )));
            workers.push(tokio::spawn(run_io_worker(
                session.clone(),
                cancel.clone(),
            )));
        }

        // Workers check the drain condition after each task, but the last
        // in-flight decrement can land after the last io completion; this
        // loop re-checks so that window cannot stall the install.
        while !session.has_error() && !cancel.is_cancelled() {
            session.check_drained();
            if session.is_drained() {
                break;
            }
            sleep(Duration::from_millis(DRAIN_POLL_MS)).await;
        }
        join_all(workers).await;

        if let Some(err) = session.take_error() {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        self.finalize(request, &manifest).await
    }

    /// Build the chunk download plan: one download task per distinct chunk
    /// guid, a reverse index guid -> copy targets, and a reference count
    /// equal to the number of pending writes against each chunk.
    fn plan_download(
        &self,
        session: &Arc<InstallSession>,
        request: &InstallRequest,
        manifest: &Manifest,
        file_filter: Option<&HashSet<String>>,
    ) -> Result<()> {
        let temp_dir = request.install_path.join(TEMP_DIR_NAME);
        std::fs::create_dir_all(&temp_dir)?;

        let mut copy_targets: HashMap<[u32; 4], Vec<CopyTarget>> = HashMap::new();
        let mut download_order: Vec<[u32; 4]> = Vec::new();
        let mut total_bytes = 0_u64;

        for file in &manifest.files.files {
            if let Some(filter) = file_filter {
                if !filter.contains(&file.filename) {
                    continue;
                }
            }
            if !file.symlink_target.is_empty() {
                continue;
            }
            let dest_path = request.install_path.join(&file.filename);
            let expected_len = file.file_size();
            for part in &file.chunk_parts {
                if !copy_targets.contains_key(&part.guid) {
                    // Validate the guid up front so unknown chunks fail the
                    // plan rather than a worker.
                    manifest.chunks.resolve(&part.guid)?;
                    download_order.push(part.guid);
                }
                copy_targets
                    .entry(part.guid)
                    .or_default()
                    .push(CopyTarget {
                        dest_path: dest_path.clone(),
                        chunk_offset: part.offset,
                        file_offset: part.file_offset,
                        size: part.size,
                        file_size: expected_len,
                    });
                total_bytes += part.size as u64;
            }
        }

        for guid in &download_order {
            let info = manifest.chunks.resolve(guid)?;
            session.set_ref_count(*guid, copy_targets[guid].len());
            session.push_download(DownloadTask {
                guid: *guid,
                remote_path: info.path(manifest.meta.feature_level),
                temp_path: temp_dir.join(format!("{}.chunk", info.guid_hex())),
                expected_sha: info.sha_hash,
            });
        }

        {
            let mut item = session.item.lock().expect("install item lock");
            item.total_bytes = total_bytes;
        }

        session.install_copy_targets(copy_targets);

        tracing::info!(
            "chunk plan app_id={} chunks={} size={}",
            request.app_id,
            download_order.len(),
            crate::utils::format_bytes(total_bytes)
        );
        Ok(())
    }

    fn plan_uninstall(
        &self,
        session: &Arc<InstallSession>,
        request: &InstallRequest,
        manifest: &Manifest,
    ) {
        let reclaimed = dir_size(&request.install_path).unwrap_or(0);
        let mut count = 0_usize;
        for file in &manifest.files.files {
            session.push_io(IoTask::Delete {
                dest_path: request.install_path.join(&file.filename),
                install_root: request.install_path.clone(),
            });
            count += 1;
        }
        tracing::info!(
            "uninstall plan app_id={} files={} reclaiming={}",
            request.app_id,
            count,
            crate::utils::format_bytes(reclaimed)
        );
    }

    async fn finalize(&self, request: &InstallRequest, manifest: &Manifest) -> Result<()> {
        if request.action == InstallAction::Uninstall {
            let record_path = request.install_path.join(INSTALL_RECORD_FILE);
            let _ = std::fs::remove_file(&record_path);
            let _ = std::fs::remove_dir_all(request.install_path.join(TEMP_DIR_NAME));
            let _ = std::fs::remove_dir(&request.install_path);
            return Ok(());
        }

        apply_file_attributes(&request.install_path, manifest)?;

        let failures = verify_install(&request.install_path, &manifest.files).await?;
        if !failures.is_empty() {
            return Err(EngineError::Integrity(format!(
                "{} files failed post-install verification, first: {} ({})",
                failures.len(),
                failures[0].filename,
                failures[0].reason
            )));
        }

        let _ = std::fs::remove_dir_all(request.install_path.join(TEMP_DIR_NAME));
        self.persist_record(request, manifest)?;
        Ok(())
    }

    async fn execute_move(&self, request: &InstallRequest, manifest: &Manifest) -> Result<()> {
        let target = request.move_target.as_ref().ok_or_else(|| {
            EngineError::Config("move requested without a target path".to_string())
        })?;
        if let Some(parent) = target.parent() {
            probe_write_permission(parent)?;
        }
        std::fs::rename(&request.install_path, target)?;

        let moved = InstallRequest {
            install_path: target.clone(),
            ..request.clone()
        };
        self.persist_record(&moved, manifest)?;
        tracing::info!(
            "moved install app_id={} from={} to={}",
            request.app_id,
            request.install_path.display(),
            target.display()
        );
        Ok(())
    }

    fn persist_record(&self, request: &InstallRequest, manifest: &Manifest) -> Result<()> {
        let record = InstalledRecord {
            app_id: request.app_id.clone(),
            app_name: manifest.meta.app_name.clone(),
            build_version: manifest.meta.build_version.clone(),
            install_path: request.install_path.clone(),
            launch_exe: manifest.meta.launch_exe.clone(),
            launch_command: manifest.meta.launch_command.clone(),
            installed_at: chrono::Utc::now().timestamp(),
        };
        let json = serde_json::to_vec_pretty(&record)?;
        write_atomic(&request.install_path.join(INSTALL_RECORD_FILE), &json)?;
        Ok(())
    }
}

/// Symlinks and executable bits cannot be expressed as chunk writes; they
/// are applied once the byte content is in place.
fn apply_file_attributes(install_root: &Path, manifest: &Manifest) -> Result<()> {
    for file in &manifest.files.files {
        let dest = install_root.join(&file.filename);
        if !file.symlink_target.is_empty() {
            #[cfg(unix)]
            {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                match std::os::unix::fs::symlink(&file.symlink_target, &dest) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(err) => return Err(err.into()),
                }
            }
            #[cfg(not(unix))]
            tracing::warn!(
                "skipping symlink {} -> {} on this platform",
                dest.display(),
                file.symlink_target
            );
            continue;
        }
        #[cfg(unix)]
        if file.is_executable() {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&dest)?.permissions();
            perms.set_mode(perms.mode() | 0o755);
            std::fs::set_permissions(&dest, perms)?;
        }
        if file.is_read_only() {
            let mut perms = std::fs::metadata(&dest)?.permissions();
            perms.set_readonly(true);
            std::fs::set_permissions(&dest, perms)?;
        }
    }
    Ok(())
}

/// One download worker: drains the download queue through the mirror pool
/// and fans each fetched chunk out into copy tasks.
async fn run_download_worker(
    session: Arc<InstallSession>,
    pool: MirrorPool,
    cancel: CancelToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        // The plan is fully enqueued before workers spawn; empty means done.
        let task = match session.take_download() {
            Some(task) => task,
            None => return,
        };

        match pool
            .fetch_with_retry(&task.remote_path, Some(&task.expected_sha), &cancel)
            .await
        {
            Ok(bytes) => {
                let byte_count = bytes.len() as u64;
                if let Err(err) = tokio::fs::write(&task.temp_path, &bytes).await {
                    session.download_finished();
                    session.fail(err.into());
                    return;
                }
                session.add_downloaded_bytes(byte_count);
                for target in session.copy_targets_for(&task.guid) {
                    session.push_io(IoTask::Copy {
                        guid: task.guid,
                        temp_path: task.temp_path.clone(),
                        target,
                    });
                }
                session.download_finished();
            }
            Err(EngineError::Cancelled) => {
                session.download_finished();
                return;
            }
            Err(err) => {
                session.download_finished();
                session.fail(err);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::chunk::Chunk;
    use crate::manifest::file_list::ChunkPart;
    use crate::manifest::reader::sha1_digest;
    use crate::manifest::test_support::{chunk_info, file_of_parts, manifest_with};
    use crate::services::repository::testing::MemoryRepository;
    use uuid::Uuid;

    fn request(action: InstallAction, root: &Path) -> InstallRequest {
        InstallRequest {
            app_id: "app-1".to_string(),
            app_name: "sampleapp".to_string(),
            namespace: "ns".to_string(),
            catalog_id: "cat".to_string(),
            action,
            install_path: root.to_path_buf(),
            move_target: None,
        }
    }

    fn test_session(request: &InstallRequest) -> Arc<InstallSession> {
        let (handle, _token) = cancel_pair();
        let (events, _rx) = broadcast::channel(64);
        Arc::new(InstallSession::new(InstallItem::new(request), handle, events))
    }

    /// Two files referencing the same chunk plan exactly one download and
    /// two copy targets.
    #[tokio::test]
    async fn shared_chunk_downloads_once() {
        let root = std::env::temp_dir().join(format!("chunkforge-plan-{}", Uuid::new_v4()));
        let info = chunk_info(7, 1024 * 1024);
        let guid = info.guid;
        let manifest = manifest_with(
            vec![info],
            vec![
                file_of_parts(
                    "a.bin",
                    vec![ChunkPart {
                        guid,
                        offset: 0,
                        size: 8,
                        file_offset: 0,
                    }],
                ),
                file_of_parts(
                    "b.bin",
                    vec![ChunkPart {
                        guid,
                        offset: 8,
                        size: 8,
                        file_offset: 0,
                    }],
                ),
            ],
        );

        let manager = InstallManager::new(
            Arc::new(MemoryRepository::default()),
            EngineConfig::default(),
        );
        let request = request(InstallAction::Install, &root);
        let session = test_session(&request);
        manager
            .plan_download(&session, &request, &manifest, None)
            .unwrap();

        assert!(session.take_download().is_some());
        assert!(session.take_download().is_none());
        assert_eq!(session.copy_targets_for(&guid).len(), 2);
        assert_eq!(session.snapshot().total_bytes, 16);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn install_reconstructs_files_end_to_end() {
        let root = std::env::temp_dir().join(format!("chunkforge-e2e-{}", Uuid::new_v4()));
        let install_path = root.join("game");

        let mut info = chunk_info(3, 1024 * 1024);
        let guid = info.guid;
        let mut chunk = Chunk::new(guid);
        chunk.set_payload(b"AAAAAAAABBBBBBBB").unwrap();
        info.sha_hash = chunk.sha_hash;

        let mut file_a = file_of_parts(
            "a.bin",
            vec![ChunkPart {
                guid,
                offset: 0,
                size: 8,
                file_offset: 0,
            }],
        );
        file_a.hash = sha1_digest(b"AAAAAAAA");
        let mut file_b = file_of_parts(
            "sub/b.bin",
            vec![ChunkPart {
                guid,
                offset: 8,
                size: 8,
                file_offset: 0,
            }],
        );
        file_b.hash = sha1_digest(b"BBBBBBBB");

        let manifest = manifest_with(vec![info.clone()], vec![file_a, file_b]);
        let chunk_url = format!("https://cdn/{}", info.path(manifest.meta.feature_level));

        let repo = Arc::new(MemoryRepository::default());
        repo.set_manifest(vec!["https://cdn".to_string()], manifest.serialize());
        repo.put(&chunk_url, chunk.serialize());

        let manager = InstallManager::new(
            repo,
            EngineConfig {
                worker_count: 2,
                mirror_max_passes: Some(2),
            },
        );
        manager.start();
        manager
            .enqueue(request(InstallAction::Install, &install_path))
            .unwrap();

        let done = wait_for_terminal(&manager).await;
        assert_eq!(done.status, InstallStatus::Success, "error: {:?}", done.error);

        let a = tokio::fs::read(install_path.join("a.bin")).await.unwrap();
        assert_eq!(&a, b"AAAAAAAA");
        let b = tokio::fs::read(install_path.join("sub/b.bin")).await.unwrap();
        assert_eq!(&b, b"BBBBBBBB");
        assert!(install_path.join(INSTALL_RECORD_FILE).exists());
        assert!(!install_path.join(TEMP_DIR_NAME).exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_chunk_fails_the_install() {
        let root = std::env::temp_dir().join(format!("chunkforge-fail-{}", Uuid::new_v4()));
        let install_path = root.join("game");

        let info = chunk_info(5, 1024 * 1024);
        let guid = info.guid;
        let file = file_of_parts(
            "a.bin",
            vec![ChunkPart {
                guid,
                offset: 0,
                size: 4,
                file_offset: 0,
            }],
        );
        let manifest = manifest_with(vec![info], vec![file]);

        let repo = Arc::new(MemoryRepository::default());
        repo.set_manifest(vec!["https://cdn".to_string()], manifest.serialize());
        // No chunk object published: every mirror pass 404s.

        let manager = InstallManager::new(
            repo,
            EngineConfig {
                worker_count: 1,
                mirror_max_passes: Some(1),
            },
        );
        manager.start();
        manager
            .enqueue(request(InstallAction::Install, &install_path))
            .unwrap();

        let done = wait_for_terminal(&manager).await;
        assert_eq!(done.status, InstallStatus::Failed);
        assert!(done.error.is_some());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn repair_restores_a_corrupted_file() {
        let root = std::env::temp_dir().join(format!("chunkforge-repair-{}", Uuid::new_v4()));
        let install_path = root.join("game");

        let mut info = chunk_info(13, 1024 * 1024);
        let guid = info.guid;
        let mut chunk = Chunk::new(guid);
        chunk.set_payload(b"AAAAAAAABBBBBBBB").unwrap();
        info.sha_hash = chunk.sha_hash;

        let mut file_a = file_of_parts(
            "a.bin",
            vec![ChunkPart {
                guid,
                offset: 0,
                size: 8,
                file_offset: 0,
            }],
        );
        file_a.hash = sha1_digest(b"AAAAAAAA");
        let mut file_b = file_of_parts(
            "b.bin",
            vec![ChunkPart {
                guid,
                offset: 8,
                size: 8,
                file_offset: 0,
            }],
        );
        file_b.hash = sha1_digest(b"BBBBBBBB");
        let manifest = manifest_with(vec![info.clone()], vec![file_a, file_b]);

        // b.bin is intact; a.bin is corrupted on disk.
        tokio::fs::create_dir_all(&install_path).await.unwrap();
        tokio::fs::write(install_path.join("a.bin"), b"AXAAAAAA").await.unwrap();
        tokio::fs::write(install_path.join("b.bin"), b"BBBBBBBB").await.unwrap();

        let repo = Arc::new(MemoryRepository::default());
        repo.set_manifest(vec!["https://cdn".to_string()], manifest.serialize());
        repo.put(
            &format!("https://cdn/{}", info.path(manifest.meta.feature_level)),
            chunk.serialize(),
        );

        let manager = InstallManager::new(
            repo,
            EngineConfig {
                worker_count: 1,
                mirror_max_passes: Some(2),
            },
        );
        manager.start();
        manager
            .enqueue(request(InstallAction::Repair, &install_path))
            .unwrap();

        let done = wait_for_terminal(&manager).await;
        assert_eq!(done.status, InstallStatus::Success, "error: {:?}", done.error);
        let fixed = tokio::fs::read(install_path.join("a.bin")).await.unwrap();
        assert_eq!(&fixed, b"AAAAAAAA");
        let _ = std::fs::remove_dir_all(&root);
    }

    /// A file that shrank between builds leaves stale tail bytes on disk;
    /// the rewrite must truncate to the manifest length or verification
    /// keeps failing forever.
    #[tokio::test]
    async fn repair_truncates_an_overlong_file() {
        let root = std::env::temp_dir().join(format!("chunkforge-trunc-{}", Uuid::new_v4()));
        let install_path = root.join("game");

        let mut info = chunk_info(17, 1024 * 1024);
        let guid = info.guid;
        let mut chunk = Chunk::new(guid);
        chunk.set_payload(b"AAAAAAAA").unwrap();
        info.sha_hash = chunk.sha_hash;

        let mut file = file_of_parts(
            "a.bin",
            vec![ChunkPart {
                guid,
                offset: 0,
                size: 8,
                file_offset: 0,
            }],
        );
        file.hash = sha1_digest(b"AAAAAAAA");
        let manifest = manifest_with(vec![info.clone()], vec![file]);

        tokio::fs::create_dir_all(&install_path).await.unwrap();
        tokio::fs::write(install_path.join("a.bin"), b"AAAAAAAA-STALE-TAIL")
            .await
            .unwrap();

        let repo = Arc::new(MemoryRepository::default());
        repo.set_manifest(vec!["https://cdn".to_string()], manifest.serialize());
        repo.put(
            &format!("https://cdn/{}", info.path(manifest.meta.feature_level)),
            chunk.serialize(),
        );

        let manager = InstallManager::new(
            repo,
            EngineConfig {
                worker_count: 1,
                mirror_max_passes: Some(2),
            },
        );
        manager.start();
        manager
            .enqueue(request(InstallAction::Repair, &install_path))
            .unwrap();

        let done = wait_for_terminal(&manager).await;
        assert_eq!(done.status, InstallStatus::Success, "error: {:?}", done.error);
        let fixed = tokio::fs::read(install_path.join("a.bin")).await.unwrap();
        assert_eq!(&fixed, b"AAAAAAAA");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn move_relocates_install_and_record() {
        let root = std::env::temp_dir().join(format!("chunkforge-move-{}", Uuid::new_v4()));
        let old_path = root.join("old");
        let new_path = root.join("elsewhere/game");
        tokio::fs::create_dir_all(&old_path).await.unwrap();
        tokio::fs::write(old_path.join("a.bin"), b"AAAA").await.unwrap();

        let manifest = manifest_with(Vec::new(), Vec::new());
        let repo = Arc::new(MemoryRepository::default());
        repo.set_manifest(vec!["https://cdn".to_string()], manifest.serialize());

        let manager = InstallManager::new(
            repo,
            EngineConfig {
                worker_count: 1,
                mirror_max_passes: Some(1),
            },
        );
        manager.start();
        let mut req = request(InstallAction::Move, &old_path);
        req.move_target = Some(new_path.clone());
        manager.enqueue(req).unwrap();

        let done = wait_for_terminal(&manager).await;
        assert_eq!(done.status, InstallStatus::Success, "error: {:?}", done.error);
        assert!(!old_path.exists());
        let moved = tokio::fs::read(new_path.join("a.bin")).await.unwrap();
        assert_eq!(&moved, b"AAAA");

        let raw = tokio::fs::read(new_path.join(INSTALL_RECORD_FILE)).await.unwrap();
        let record: InstalledRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record.install_path, new_path);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn move_without_target_fails() {
        let root = std::env::temp_dir().join(format!("chunkforge-movefail-{}", Uuid::new_v4()));
        let manifest = manifest_with(Vec::new(), Vec::new());
        let repo = Arc::new(MemoryRepository::default());
        repo.set_manifest(vec!["https://cdn".to_string()], manifest.serialize());

        let manager = InstallManager::new(
            repo,
            EngineConfig {
                worker_count: 1,
                mirror_max_passes: Some(1),
            },
        );
        manager.start();
        manager
            .enqueue(request(InstallAction::Move, &root.join("old")))
            .unwrap();

        let done = wait_for_terminal(&manager).await;
        assert_eq!(done.status, InstallStatus::Failed);
        assert!(done.error.unwrap().contains("target"));
        let _ = std::fs::remove_dir_all(&root);
    }

    /// With no chunk published and no pass ceiling the install retries
    /// forever; cancellation is the only way out and must settle through
    /// Cancelling into Cancelled.
    #[tokio::test]
    async fn cancel_mid_install_settles_cancelled() {
        let root = std::env::temp_dir().join(format!("chunkforge-cancel-{}", Uuid::new_v4()));
        let install_path = root.join("game");

        let info = chunk_info(11, 1024 * 1024);
        let guid = info.guid;
        let file = file_of_parts(
            "a.bin",
            vec![ChunkPart {
                guid,
                offset: 0,
                size: 4,
                file_offset: 0,
            }],
        );
        let manifest = manifest_with(vec![info], vec![file]);

        let repo = Arc::new(MemoryRepository::default());
        repo.set_manifest(vec!["https://cdn".to_string()], manifest.serialize());

        let manager = InstallManager::new(
            repo,
            EngineConfig {
                worker_count: 1,
                mirror_max_passes: None,
            },
        );
        manager.start();
        manager
            .enqueue(request(InstallAction::Install, &install_path))
            .unwrap();

        for _ in 0..200 {
            if manager
                .current_item()
                .map(|item| item.status == InstallStatus::Processing)
                .unwrap_or(false)
            {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        manager.cancel("app-1").unwrap();

        let done = wait_for_terminal(&manager).await;
        assert_eq!(done.status, InstallStatus::Cancelled);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn duplicate_app_id_is_rejected() {
        let manager = InstallManager::new(
            Arc::new(MemoryRepository::default()),
            EngineConfig::default(),
        );
        let root = std::env::temp_dir().join(format!("chunkforge-dup-{}", Uuid::new_v4()));
        manager.enqueue(request(InstallAction::Install, &root)).unwrap();
        let second = manager.enqueue(request(InstallAction::Install, &root));
        assert!(matches!(second, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn cancelling_a_queued_item_removes_it() {
        let manager = InstallManager::new(
            Arc::new(MemoryRepository::default()),
            EngineConfig::default(),
        );
        let root = std::env::temp_dir().join(format!("chunkforge-cq-{}", Uuid::new_v4()));
        manager.enqueue(request(InstallAction::Install, &root)).unwrap();
        manager.cancel("app-1").unwrap();

        assert!(manager.queued_items().is_empty());
        let history = manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, InstallStatus::Cancelled);
        assert!(matches!(
            manager.cancel("app-1"),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn uninstall_removes_manifest_files() {
        let root = std::env::temp_dir().join(format!("chunkforge-un-{}", Uuid::new_v4()));
        let install_path = root.join("game");
        tokio::fs::create_dir_all(install_path.join("sub")).await.unwrap();
        tokio::fs::write(install_path.join("a.bin"), b"AAAA").await.unwrap();
        tokio::fs::write(install_path.join("sub/b.bin"), b"BBBB").await.unwrap();
        tokio::fs::write(install_path.join(INSTALL_RECORD_FILE), b"{}")
            .await
            .unwrap();

        let info = chunk_info(9, 1024);
        let guid = info.guid;
        let part = |offset| ChunkPart {
            guid,
            offset,
            size: 4,
            file_offset: 0,
        };
        let manifest = manifest_with(
            vec![info],
            vec![
                file_of_parts("a.bin", vec![part(0)]),
                file_of_parts("sub/b.bin", vec![part(4)]),
            ],
        );

        let repo = Arc::new(MemoryRepository::default());
        repo.set_manifest(vec!["https://cdn".to_string()], manifest.serialize());

        let manager = InstallManager::new(
            repo,
            EngineConfig {
                worker_count: 1,
                mirror_max_passes: Some(1),
            },
        );
        manager.start();
        manager
            .enqueue(request(InstallAction::Uninstall, &install_path))
            .unwrap();

        let done = wait_for_terminal(&manager).await;
        assert_eq!(done.status, InstallStatus::Success, "error: {:?}", done.error);
        assert!(!install_path.exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    async fn wait_for_terminal(manager: &InstallManager) -> InstallItem {
        for _ in 0..600 {
            if let Some(item) = manager.history().into_iter().next() {
                if item.status.is_terminal() {
                    return item;
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("operation did not reach a terminal status in time");
    }
}
