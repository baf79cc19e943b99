use serde::{Deserialize, Serialize};

use crate::ProviderName;

/// Requested shape of a new VM. RAM is in MiB, disk in GiB.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub cpu: u32,
    pub ram: u64,
    pub disk: u64,
    #[serde(default = "default_os_type")]
    pub os_type: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub storage_container: Option<String>,
}

fn default_os_type() -> String {
    "ubuntu".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    Unknown,
}

/// Point-in-time view of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmInfo {
    pub name: String,
    /// Provider-scoped identifier (vmx path, Prism UUID).
    pub id: String,
    pub state: PowerState,
    pub cpu: u32,
    pub ram: u64,
    pub disk: u64,
    pub ip_address: Option<String>,
    pub provider: ProviderName,
    pub cluster: Option<String>,
}

/// Outcome of a successful create or clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmCreated {
    pub name: String,
    pub provider: ProviderName,
    pub id: Option<String>,
    pub ip_address: Option<String>,
    /// Build stage that produced the VM (desktop create only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Whether a requested static IP was applied. `None` when none was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_configured: Option<bool>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleKind {
    /// A local GUI window was launched.
    Desktop,
    /// Open `url` in a browser.
    Web,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleInfo {
    pub kind: ConsoleKind,
    pub url: Option<String>,
    pub message: String,
}

/// Last `max` bytes of `text`, cut on a char boundary.
pub fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
