use std::sync::Arc;

use hv_infra::registry::ProviderRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
}
