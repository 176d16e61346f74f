use std::sync::Arc;

use tokio::sync::watch;

pub mod install_manager;
pub mod io_worker;
pub mod mirror_pool;
pub mod repository;
pub mod verify;

pub use install_manager::{EngineConfig, InstallManager};
pub use mirror_pool::MirrorPool;
pub use repository::{HttpRepository, ManifestRepository, ResolvedManifest};
pub use verify::{verify_install, VerifyFailure};

/// Cancellation for one running operation. The handle side flips the flag,
/// every worker holds a token and polls it between units of work.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}
