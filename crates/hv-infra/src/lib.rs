pub mod build;
pub mod config;
pub mod ip_pool;
pub mod nutanix;
pub mod registry;
pub mod task;
pub mod types;
pub mod vmware;

#[cfg(test)]
mod testing;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use build::BuildStage;
use types::{ConsoleInfo, VmConfig, VmCreated, VmInfo};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid vm config: {0}")]
    Validation(String),

    #[error("provider not available: {0}")]
    ProviderNotFound(String),

    #[error("provider is disabled: {0}")]
    ProviderDisabled(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("build failed, last attempt was the {stage} stage: {}", types::tail(.output, 500))]
    BuildFailed { stage: BuildStage, output: String },

    #[error("task {task_id} failed: {detail}")]
    TaskFailed { task_id: String, detail: String },

    #[error("task {task_id} did not finish in time, outcome unknown")]
    TaskTimedOut { task_id: String },

    #[error("{kind} not found: {name}")]
    EntityNotFound { kind: &'static str, name: String },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nutanix transport error: {0}")]
    Prism(#[from] prism_api::Error),

    #[error("vmware transport error: {0}")]
    Vmware(#[from] vmware_cli::Error),

    #[error("provisioning task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// The CLI process or HTTP call itself could not be completed.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Prism(_) | Self::Vmware(_))
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::EntityNotFound {
            kind,
            name: name.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Known hypervisor backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Vmware,
    Nutanix,
}

impl ProviderName {
    pub const ALL: [Self; 2] = [Self::Vmware, Self::Nutanix];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vmware => "vmware",
            Self::Nutanix => "nutanix",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vmware" => Ok(Self::Vmware),
            "nutanix" => Ok(Self::Nutanix),
            other => Err(Error::ProviderNotFound(other.to_string())),
        }
    }
}

/// Backend-agnostic VM operations.
///
/// Each backend (VMware Workstation, Nutanix AHV) implements this trait.
/// Lookups that find nothing return `Ok(None)`; mutations on a missing VM
/// return `Error::EntityNotFound`.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    fn name(&self) -> ProviderName;

    /// Cheap, repeatable liveness probe.
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn create_vm(&self, config: &VmConfig) -> Result<VmCreated>;

    async fn clone_vm(&self, source: &str, config: &VmConfig) -> Result<VmCreated>;

    async fn delete_vm(&self, name: &str) -> Result<()>;

    async fn start_vm(&self, name: &str) -> Result<()>;

    async fn stop_vm(&self, name: &str) -> Result<()>;

    async fn restart_vm(&self, name: &str) -> Result<()> {
        self.stop_vm(name).await?;
        self.start_vm(name).await
    }

    async fn get_vm_info(&self, name: &str) -> Result<Option<VmInfo>>;

    async fn list_vms(&self) -> Result<Vec<VmInfo>>;

    async fn templates(&self) -> Result<Vec<String>>;

    async fn clusters(&self) -> Result<Vec<String>>;

    async fn networks(&self) -> Result<Vec<String>>;

    async fn create_snapshot(&self, name: &str, snapshot: &str) -> Result<()>;

    async fn restore_snapshot(&self, name: &str, snapshot: &str) -> Result<()>;

    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()>;

    async fn open_console(&self, name: &str) -> Result<ConsoleInfo>;
}

/// Reject a malformed config before anything touches a backend.
pub fn validate_config(config: &VmConfig) -> Result<()> {
    let name = config.name.trim();
    if name.is_empty() {
        return Err(Error::Validation("name is required".into()));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(Error::Validation(format!(
            "name {name:?} must not contain path separators"
        )));
    }
    if config.cpu == 0 {
        return Err(Error::Validation("cpu count must be positive".into()));
    }
    if config.ram == 0 {
        return Err(Error::Validation("ram must be positive".into()));
    }
    if config.disk == 0 {
        return Err(Error::Validation("disk size must be positive".into()));
    }
    Ok(())
}
