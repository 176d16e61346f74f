use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::time::sleep;

use crate::errors::{EngineError, Result};
use crate::manifest::chunk::Chunk;
use crate::manifest::reader::guid_hex;
use crate::models::{EngineEvent, InstallItem, InstallStatus};
use crate::services::{CancelHandle, CancelToken};
use crate::utils::file::prune_empty_dirs;

const IDLE_POLL_MS: u64 = 50;
const PROGRESS_THROTTLE_MS: u64 = 500;

/// One pending chunk download.
#[derive(Clone, Debug)]
pub struct DownloadTask {
    pub guid: [u32; 4],
    pub remote_path: String,
    pub temp_path: PathBuf,
    /// Payload SHA-1 from the chunk directory, checked against each mirror
    /// response before the blob is accepted.
    pub expected_sha: [u8; 20],
}

/// One write of a chunk byte range into a destination file.
#[derive(Clone, Debug)]
pub struct CopyTarget {
    pub dest_path: PathBuf,
    pub chunk_offset: u32,
    pub file_offset: u64,
    pub size: u32,
    /// Total length of the destination file per the manifest. Every write
    /// lands below this offset.
    pub file_size: u64,
}

#[derive(Clone, Debug)]
pub enum IoTask {
    Copy {
        guid: [u32; 4],
        temp_path: PathBuf,
        target: CopyTarget,
    },
    Delete {
        dest_path: PathBuf,
        install_root: PathBuf,
    },
}

/// Shared state for one running install operation. Owned by the
/// orchestrator, handed to every worker; nothing here is process-global.
pub struct InstallSession {
    pub item: Mutex<InstallItem>,
    pub download_queue: Mutex<VecDeque<DownloadTask>>,
    pub downloads_in_flight: AtomicUsize,
    pub io_queue: Mutex<VecDeque<IoTask>>,
    /// Reverse index from the chunk plan: guid -> every (file, part) write
    /// that reads from that chunk. Written once when the plan is built,
    /// before any worker spawns.
    copy_targets: Mutex<HashMap<[u32; 4], Vec<CopyTarget>>>,
    /// Remaining pending writes per downloaded chunk blob. Sole authority
    /// for temp blob deletion.
    ref_counts: Mutex<HashMap<[u32; 4], usize>>,
    file_locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
    error: Mutex<Option<EngineError>>,
    drained: AtomicBool,
    cancel: CancelHandle,
    events: broadcast::Sender<EngineEvent>,
    last_progress_emit: Mutex<Instant>,
    started: Instant,
}

impl InstallSession {
    pub fn new(
        item: InstallItem,
        cancel: CancelHandle,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            item: Mutex::new(item),
            download_queue: Mutex::new(VecDeque::new()),
            downloads_in_flight: AtomicUsize::new(0),
            io_queue: Mutex::new(VecDeque::new()),
            copy_targets: Mutex::new(HashMap::new()),
            ref_counts: Mutex::new(HashMap::new()),
            file_locks: Mutex::new(HashMap::new()),
            error: Mutex::new(None),
            drained: AtomicBool::new(false),
            cancel,
            events,
            last_progress_emit: Mutex::new(Instant::now() - Duration::from_secs(5)),
            started: Instant::now(),
        }
    }

    pub fn set_ref_count(&self, guid: [u32; 4], count: usize) {
        self.ref_counts
            .lock()
            .expect("ref count lock")
            .insert(guid, count);
    }

    /// Atomic decrement-and-test. Returns true exactly once per guid, when
    /// the last pending write completes.
    pub fn decrement_ref(&self, guid: &[u32; 4]) -> Result<bool> {
        let mut guard = self.ref_counts.lock().expect("ref count lock");
        let count = guard.get_mut(guid).ok_or_else(|| {
            EngineError::Integrity(format!(
                "reference count underflow for chunk {}",
                guid_hex(guid)
            ))
        })?;
        *count -= 1;
        if *count == 0 {
            guard.remove(guid);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn refs_remaining(&self) -> usize {
        self.ref_counts.lock().expect("ref count lock").len()
    }

    pub fn install_copy_targets(&self, targets: HashMap<[u32; 4], Vec<CopyTarget>>) {
        *self.copy_targets.lock().expect("copy target index lock") = targets;
    }

    pub fn copy_targets_for(&self, guid: &[u32; 4]) -> Vec<CopyTarget> {
        self.copy_targets
            .lock()
            .expect("copy target index lock")
            .get(guid)
            .cloned()
            .unwrap_or_default()
    }

    /// Pop the next download and mark it in flight while still holding the
    /// queue lock, so the drain check never sees an empty queue with a
    /// popped-but-untracked task.
    pub fn take_download(&self) -> Option<DownloadTask> {
        let mut queue = self.download_queue.lock().expect("download queue lock");
        let task = queue.pop_front()?;
        self.downloads_in_flight.fetch_add(1, Ordering::SeqCst);
        Some(task)
    }

    pub fn download_finished(&self) {
        self.downloads_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn push_download(&self, task: DownloadTask) {
        self.download_queue
            .lock()
            .expect("download queue lock")
            .push_back(task);
    }

    pub fn pop_io(&self) -> Option<IoTask> {
        self.io_queue.lock().expect("io queue lock").pop_front()
    }

    pub fn push_io(&self, task: IoTask) {
        self.io_queue.lock().expect("io queue lock").push_back(task);
    }

    fn file_lock(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut guard = self.file_locks.lock().expect("file lock map");
        guard
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// User-requested cancellation: flips to Cancelling and stops the
    /// workers. The orchestrator settles the terminal Cancelled status.
    pub fn request_cancel(&self) {
        self.set_status(InstallStatus::Cancelling);
        self.cancel.cancel();
    }

    /// Record the first worker error and cancel everyone else.
    pub fn fail(&self, err: EngineError) {
        {
            let mut guard = self.error.lock().expect("error slot lock");
            if guard.is_none() {
                tracing::error!("install worker failed: {}", err);
                *guard = Some(err);
            }
        }
        self.cancel.cancel();
    }

    pub fn take_error(&self) -> Option<EngineError> {
        self.error.lock().expect("error slot lock").take()
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().expect("error slot lock").is_some()
    }

    /// Both queues plus in-flight downloads and the reference table are
    /// empty: the reconstruction is complete. Only the first empty-check
    /// wins; finalize runs exactly once.
    pub fn check_drained(&self) -> bool {
        let download_empty = self
            .download_queue
            .lock()
            .expect("download queue lock")
            .is_empty();
        let io_empty = self.io_queue.lock().expect("io queue lock").is_empty();
        if download_empty
            && io_empty
            && self.downloads_in_flight.load(Ordering::SeqCst) == 0
            && self.refs_remaining() == 0
        {
            return self
                .drained
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
        }
        false
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> InstallItem {
        self.item.lock().expect("install item lock").clone()
    }

    pub fn set_status(&self, status: InstallStatus) {
        let snapshot = {
            let mut item = self.item.lock().expect("install item lock");
            item.status = status;
            item.updated_at = chrono::Utc::now().timestamp();
            item.clone()
        };
        tracing::info!(
            "install status changed app_id={} action={:?} status={:?}",
            snapshot.app_id,
            snapshot.action,
            snapshot.status
        );
        let _ = self.events.send(EngineEvent::StatusChanged(snapshot));
    }

    pub fn status(&self) -> InstallStatus {
        self.item.lock().expect("install item lock").status
    }

    pub fn set_error_message(&self, message: &str) {
        let mut item = self.item.lock().expect("install item lock");
        item.error = Some(message.to_string());
    }

    pub fn add_downloaded_bytes(&self, bytes: u64) {
        let mut item = self.item.lock().expect("install item lock");
        item.downloaded_bytes = item.downloaded_bytes.saturating_add(bytes);
        drop(item);
        self.maybe_emit_progress();
    }

    pub fn add_written_bytes(&self, bytes: u64) {
        let mut item = self.item.lock().expect("install item lock");
        item.written_bytes = item.written_bytes.saturating_add(bytes);
        drop(item);
        self.maybe_emit_progress();
    }

    /// Progress notifications are throttled; status changes are not.
    fn maybe_emit_progress(&self) {
        let now = Instant::now();
        {
            let mut last = self.last_progress_emit.lock().expect("progress throttle");
            if now.duration_since(*last) < Duration::from_millis(PROGRESS_THROTTLE_MS) {
                return;
            }
            *last = now;
        }

        let snapshot = {
            let mut item = self.item.lock().expect("install item lock");
            let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
            item.elapsed_seconds = elapsed as u64;
            item.download_bps = (item.downloaded_bytes as f64 / elapsed) as u64;
            if item.total_bytes > 0 {
                item.progress =
                    (item.written_bytes as f64 / item.total_bytes as f64 * 100.0).min(100.0);
                let remaining = item.total_bytes.saturating_sub(item.written_bytes);
                item.eta_seconds = if item.download_bps > 0 {
                    remaining / item.download_bps
                } else {
                    0
                };
            }
            item.updated_at = chrono::Utc::now().timestamp();
            item.clone()
        };
        let _ = self.events.send(EngineEvent::Progress(snapshot));
    }
}

/// One I/O reconstruction worker: drains the I/O queue, splicing chunk byte
/// ranges into destination files and deleting temp blobs once their last
/// reference is written.
pub async fn run_io_worker(session: Arc<InstallSession>, cancel: CancelToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let task = match session.pop_io() {
            Some(task) => task,
            None => {
                if session.is_drained() {
                    return;
                }
                sleep(Duration::from_millis(IDLE_POLL_MS)).await;
                continue;
            }
        };

        let result = match task {
            IoTask::Copy {
                guid,
                temp_path,
                target,
            } => apply_copy(&session, &guid, &temp_path, &target).await,
            IoTask::Delete {
                dest_path,
                install_root,
            } => apply_delete(&session, &dest_path, &install_root).await,
        };

        if let Err(err) = result {
            session.fail(err);
            return;
        }
        session.check_drained();
    }
}

async fn apply_copy(
    session: &InstallSession,
    guid: &[u32; 4],
    temp_path: &Path,
    target: &CopyTarget,
) -> Result<()> {
    let blob = tokio::fs::read(temp_path).await?;
    let chunk = Chunk::parse(&blob)?;
    let payload = chunk.payload()?;

    let start = target.chunk_offset as usize;
    let end = start + target.size as usize;
    if end > payload.len() {
        return Err(EngineError::Format(format!(
            "chunk part range {}..{} exceeds payload of {} bytes (chunk {})",
            start,
            end,
            payload.len(),
            guid_hex(guid)
        )));
    }

    if let Some(parent) = target.dest_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Writes to the same destination are serialized per file, not globally.
    let lock = session.file_lock(&target.dest_path);
    let _guard = lock.lock().await;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(&target.dest_path)
        .await?;
    // Size the file to its manifest length up front; a stale on-disk file
    // longer than the new version must not keep its tail bytes.
    file.set_len(target.file_size).await?;
    file.seek(SeekFrom::Start(target.file_offset)).await?;
    file.write_all(&payload[start..end]).await?;
    file.flush().await?;
    drop(file);
    drop(_guard);

    if session.decrement_ref(guid)? {
        if let Err(err) = tokio::fs::remove_file(temp_path).await {
            tracing::warn!(
                "failed to delete temp chunk {}: {}",
                temp_path.display(),
                err
            );
        }
    }

    session.add_written_bytes(target.size as u64);
    Ok(())
}

async fn apply_delete(
    session: &InstallSession,
    dest_path: &Path,
    install_root: &Path,
) -> Result<()> {
    match tokio::fs::remove_file(dest_path).await {
        Ok(()) => {}
        // A file already gone is fine for uninstall.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    prune_empty_dirs(install_root, dest_path);
    session.add_written_bytes(0);
    Ok(())
}
