pub mod providers;
pub mod vms;

use axum::Router;
use axum::routing::{delete, get, post, put};

use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    Router::new()
        // Providers
        .route("/providers", get(providers::list_providers))
        .route("/providers/status", get(providers::provider_status))
        .route("/providers/default", put(providers::set_default_provider))
        .route("/providers/{name}", put(providers::update_provider))
        // Discovery
        .route("/templates", get(providers::templates))
        .route("/clusters", get(providers::clusters))
        .route("/networks", get(providers::networks))
        // VM lifecycle
        .route("/vms", get(vms::list_vms).post(vms::create_vm))
        .route("/vms/clone", post(vms::clone_vm))
        .route("/vms/{name}", get(vms::get_vm).delete(vms::delete_vm))
        .route("/vms/{name}/start", post(vms::start_vm))
        .route("/vms/{name}/stop", post(vms::stop_vm))
        .route("/vms/{name}/restart", post(vms::restart_vm))
        .route("/vms/{name}/console", get(vms::open_console))
        // Snapshots
        .route("/vms/{name}/snapshots", post(vms::create_snapshot))
        .route(
            "/vms/{name}/snapshots/{snapshot}",
            delete(vms::delete_snapshot),
        )
        .route(
            "/vms/{name}/snapshots/{snapshot}/restore",
            post(vms::restore_snapshot),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use hv_infra::config::{HypervisorConfig, NutanixSettings, ProviderEntry, VmwareSettings};
    use hv_infra::ip_pool::IpLeasePool;
    use hv_infra::registry::{BackendFactory, ProviderRegistry};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    /// Desktop backend pointed at a missing `vmrun`, cluster backend disabled.
    fn app(dir: &std::path::Path) -> Router {
        let vmware = VmwareSettings {
            vmrun_path: dir.join("missing/vmrun"),
            base_directory: dir.to_path_buf(),
            templates_directory: dir.join("templates"),
            ..Default::default()
        };
        let mut config = HypervisorConfig::builtin().unwrap();
        config.providers.insert(
            "vmware".into(),
            ProviderEntry::new(true, &vmware).unwrap(),
        );
        config.providers.insert(
            "nutanix".into(),
            ProviderEntry::new(false, &NutanixSettings::default()).unwrap(),
        );

        let registry = ProviderRegistry::new(
            dir.join("hypervisor_config.json"),
            config,
            Arc::new(IpLeasePool::in_memory("10.20.0", 10, 20).unwrap()),
            Arc::new(BackendFactory),
        );
        api_router(AppState {
            registry: Arc::new(registry),
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => req.body(Body::empty()),
        }
        .unwrap();

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn providers_and_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (status, body) = call(&app, "GET", "/providers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["default_provider"], "vmware");
        assert_eq!(body["providers"], json!(["nutanix", "vmware"]));

        let (status, body) = call(&app, "GET", "/templates?provider=vmware", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["results"],
            json!(["Ubuntu 64-bit (3)", "Windows Server 2019"])
        );

        let (_, body) = call(&app, "GET", "/clusters", None).await;
        assert_eq!(body["results"], json!({ "vmware": ["local"] }));
    }

    #[tokio::test]
    async fn status_reports_disabled_and_unreachable_providers() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (status, body) = call(&app, "GET", "/providers/status", None).await;
        assert_eq!(status, StatusCode::OK);
        let statuses = body.as_array().unwrap();
        let nutanix = statuses.iter().find(|s| s["name"] == "nutanix").unwrap();
        assert_eq!(nutanix["enabled"], false);
        assert_eq!(nutanix["connected"], false);
        let vmware = statuses.iter().find(|s| s["name"] == "vmware").unwrap();
        assert_eq!(vmware["enabled"], true);
        assert_eq!(vmware["connected"], false);
        assert!(vmware["error"].is_string());
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (status, body) = call(&app, "GET", "/vms?provider=xen", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("xen"));

        let (status, _) = call(&app, "GET", "/vms?provider=nutanix", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let bad = json!({ "name": "web", "cpu": 0, "ram": 1024, "disk": 10 });
        let (status, _) = call(&app, "POST", "/vms", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", "/vms/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "POST", "/vms/ghost/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            "PUT",
            "/providers/default",
            Some(json!({ "provider": "nutanix" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn provider_updates_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (status, _) = call(
            &app,
            "PUT",
            "/providers/nutanix",
            Some(json!({ "enabled": true, "prism_central_ip": "10.0.0.7" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let saved = HypervisorConfig::load_or_init(&dir.path().join("hypervisor_config.json"))
            .await
            .unwrap();
        let nutanix: NutanixSettings = saved.providers["nutanix"].settings().unwrap();
        assert_eq!(nutanix.prism_central_ip, "10.0.0.7");

        let (status, _) = call(
            &app,
            "PUT",
            "/providers/default",
            Some(json!({ "provider": "nutanix" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &app,
            "PUT",
            "/providers/nutanix",
            Some(json!({ "enabled": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "GET", "/vms/web?provider=nutanix", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
