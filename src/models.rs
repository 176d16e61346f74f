use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstallAction {
    Install,
    Update,
    Repair,
    Uninstall,
    Move,
    Verify,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Pending,
    Processing,
    Cancelling,
    Success,
    Failed,
    Cancelled,
}

impl InstallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstallStatus::Success | InstallStatus::Failed | InstallStatus::Cancelled
        )
    }
}

/// One user-requested operation against a target app.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InstallRequest {
    pub app_id: String,
    pub app_name: String,
    pub namespace: String,
    pub catalog_id: String,
    pub action: InstallAction,
    pub install_path: PathBuf,
    /// Destination directory for `InstallAction::Move`, unused otherwise.
    #[serde(default)]
    pub move_target: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InstallItem {
    pub id: String,
    pub app_id: String,
    pub app_name: String,
    pub action: InstallAction,
    pub install_path: PathBuf,
    pub status: InstallStatus,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub written_bytes: u64,
    pub progress: f64,
    pub download_bps: u64,
    pub eta_seconds: u64,
    pub elapsed_seconds: u64,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl InstallItem {
    pub fn new(request: &InstallRequest) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            app_id: request.app_id.clone(),
            app_name: request.app_name.clone(),
            action: request.action,
            install_path: request.install_path.clone(),
            status: InstallStatus::Pending,
            total_bytes: 0,
            downloaded_bytes: 0,
            written_bytes: 0,
            progress: 0.0,
            download_bps: 0,
            eta_seconds: 0,
            elapsed_seconds: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Snapshot notifications pushed to whoever is observing the engine.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    StatusChanged(InstallItem),
    Progress(InstallItem),
}

/// Record persisted next to a completed install.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InstalledRecord {
    pub app_id: String,
    pub app_name: String,
    pub build_version: String,
    pub install_path: PathBuf,
    pub launch_exe: String,
    pub launch_command: String,
    pub installed_at: i64,
}

pub const INSTALL_RECORD_FILE: &str = "install.json";
