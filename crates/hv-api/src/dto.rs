use hv_infra::types::VmConfig;
use serde::{Deserialize, Serialize};

// ── Requests ───────────────────────────────────────────────────────

/// `?provider=` on every route. Absent means the default provider, or every
/// provider for discovery routes.
#[derive(Debug, Default, Deserialize)]
pub struct ProviderQuery {
    pub provider: Option<String>,
}

impl ProviderQuery {
    pub fn name(&self) -> Option<&str> {
        self.provider.as_deref()
    }
}

#[derive(Debug, Deserialize)]
pub struct CloneVmRequest {
    pub source: String,
    #[serde(flatten)]
    pub config: VmConfig,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct DefaultProviderRequest {
    pub provider: String,
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub default_provider: String,
    pub providers: Vec<String>,
}
