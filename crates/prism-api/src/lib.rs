//! Typed Rust client for the Nutanix Prism Central v3 REST API.
//!
//! Covers the subset needed for VM orchestration: list-by-kind
//! (vms, clusters, subnets, images), VM create/clone/update/delete,
//! VM snapshots, and task status polling.
//!
//! Mutating endpoints answer `202 Accepted` with a task id; waiting on
//! the task is left to the caller.

mod types;

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

pub use types::*;

const API_PATH: &str = "/api/nutanix/v3";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("prism api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("prism api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("prism api {endpoint} accepted the request without a task id")]
    MissingTask { endpoint: &'static str },

    #[error("prism api returned an undecodable document: {0}")]
    Decode(#[from] serde_json::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status, .. } if status.as_u16() == 404)
    }

    /// Worth retrying: the request never completed, the gateway was briefly
    /// unhealthy, or the body was cut short. Other 4xx answers are final.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) | Self::Decode(_) => true,
            Self::Api { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Self::MissingTask { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where and how to reach Prism Central.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub verify_ssl: bool,
    pub username: String,
    pub password: String,
    pub request_timeout: Duration,
}

impl Endpoint {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}{API_PATH}", self.host, self.port)
    }
}

/// Client for the Prism v3 REST API (basic auth).
#[derive(Clone)]
pub struct PrismClient {
    base_url: String,
    auth: String,
    http: reqwest::Client,
}

impl PrismClient {
    pub fn new(endpoint: &Endpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!endpoint.verify_ssl)
            .timeout(endpoint.request_timeout)
            .build()?;

        Ok(Self {
            base_url: endpoint.base_url(),
            auth: basic_auth(&endpoint.username, &endpoint.password),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    /// Check a mutating call and pull the task id out of its 202 body.
    async fn accepted(resp: reqwest::Response, endpoint: &'static str) -> Result<String> {
        let body: AcceptedResponse = Self::check(resp, endpoint).await?.json().await?;
        body.task_uuid()
            .map(str::to_owned)
            .ok_or(Error::MissingTask { endpoint })
    }

    /// Like `accepted`, but a synchronous `200 OK` (no task) and a 404 are both done.
    async fn accepted_or_done(
        resp: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<Option<String>> {
        match resp.status().as_u16() {
            202 => Self::accepted(resp, endpoint).await.map(Some),
            404 => Ok(None),
            _ => {
                Self::check(resp, endpoint).await?;
                Ok(None)
            }
        }
    }

    async fn list<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        req: &ListRequest,
        endpoint: &'static str,
    ) -> Result<ListResponse<T>> {
        let resp = self
            .http
            .post(self.url(path))
            .header("Authorization", &self.auth)
            .json(req)
            .send()
            .await?;

        Self::check(resp, endpoint)
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── Listing ──────────────────────────────────────────────────────

    pub async fn list_vms(&self, req: &ListRequest) -> Result<ListResponse<Vm>> {
        self.list("/vms/list", req, "list vms").await
    }

    pub async fn list_clusters(&self, req: &ListRequest) -> Result<ListResponse<Entity>> {
        self.list("/clusters/list", req, "list clusters").await
    }

    pub async fn list_subnets(&self, req: &ListRequest) -> Result<ListResponse<Entity>> {
        self.list("/subnets/list", req, "list subnets").await
    }

    pub async fn list_images(&self, req: &ListRequest) -> Result<ListResponse<Entity>> {
        self.list("/images/list", req, "list images").await
    }

    // ── VMs ──────────────────────────────────────────────────────────

    /// Fetch a VM. A 404 is reported as `None`.
    pub async fn get_vm(&self, vm_uuid: &str) -> Result<Option<Vm>> {
        match self.get_vm_document(vm_uuid).await {
            Ok(doc) => Ok(Some(serde_json::from_value(doc)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch a VM as a raw document, preserving fields this crate does not model.
    pub async fn get_vm_document(&self, vm_uuid: &str) -> Result<Value> {
        let resp = self
            .http
            .get(self.url(&format!("/vms/{vm_uuid}")))
            .header("Authorization", &self.auth)
            .send()
            .await?;

        Self::check(resp, "get vm")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn create_vm(&self, req: &CreateVmRequest) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/vms"))
            .header("Authorization", &self.auth)
            .json(req)
            .send()
            .await?;

        Self::accepted(resp, "create vm").await
    }

    pub async fn clone_vm(&self, vm_uuid: &str, req: &CloneVmRequest) -> Result<String> {
        let resp = self
            .http
            .post(self.url(&format!("/vms/{vm_uuid}/clone")))
            .header("Authorization", &self.auth)
            .json(req)
            .send()
            .await?;

        Self::accepted(resp, "clone vm").await
    }

    /// Replace a VM's spec. The read-only `status` block is stripped first.
    pub async fn update_vm(&self, vm_uuid: &str, mut doc: Value) -> Result<String> {
        if let Some(obj) = doc.as_object_mut() {
            obj.remove("status");
        }

        let resp = self
            .http
            .put(self.url(&format!("/vms/{vm_uuid}")))
            .header("Authorization", &self.auth)
            .json(&doc)
            .send()
            .await?;

        Self::accepted(resp, "update vm").await
    }

    /// Delete a VM. Returns the task id when the deletion is asynchronous.
    pub async fn delete_vm(&self, vm_uuid: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .delete(self.url(&format!("/vms/{vm_uuid}")))
            .header("Authorization", &self.auth)
            .send()
            .await?;

        Self::accepted_or_done(resp, "delete vm").await
    }

    // ── Snapshots ────────────────────────────────────────────────────

    pub async fn list_snapshots(&self, vm_uuid: &str) -> Result<ListResponse<Entity>> {
        let resp = self
            .http
            .get(self.url(&format!("/vms/{vm_uuid}/snapshots")))
            .header("Authorization", &self.auth)
            .send()
            .await?;

        Self::check(resp, "list snapshots")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn create_snapshot(
        &self,
        vm_uuid: &str,
        req: &CreateSnapshotRequest,
    ) -> Result<String> {
        let resp = self
            .http
            .post(self.url(&format!("/vms/{vm_uuid}/snapshots")))
            .header("Authorization", &self.auth)
            .json(req)
            .send()
            .await?;

        Self::accepted(resp, "create snapshot").await
    }

    pub async fn restore_snapshot(&self, vm_uuid: &str, snapshot_uuid: &str) -> Result<String> {
        let resp = self
            .http
            .post(self.url(&format!(
                "/vms/{vm_uuid}/snapshots/{snapshot_uuid}/restore"
            )))
            .header("Authorization", &self.auth)
            .json(&serde_json::json!({ "api_version": API_VERSION }))
            .send()
            .await?;

        Self::accepted(resp, "restore snapshot").await
    }

    pub async fn delete_snapshot(
        &self,
        vm_uuid: &str,
        snapshot_uuid: &str,
    ) -> Result<Option<String>> {
        let resp = self
            .http
            .delete(self.url(&format!("/vms/{vm_uuid}/snapshots/{snapshot_uuid}")))
            .header("Authorization", &self.auth)
            .send()
            .await?;

        Self::accepted_or_done(resp, "delete snapshot").await
    }

    // ── Tasks ────────────────────────────────────────────────────────

    pub async fn get_task(&self, task_uuid: &str) -> Result<Task> {
        let resp = self
            .http
            .get(self.url(&format!("/tasks/{task_uuid}")))
            .header("Authorization", &self.auth)
            .send()
            .await?;

        Self::check(resp, "get task")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }
}

fn basic_auth(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::Json;
    use axum::Router;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};

    use super::*;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client(addr: SocketAddr) -> PrismClient {
        PrismClient::new(&Endpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
            use_ssl: false,
            verify_ssl: false,
            username: "admin".into(),
            password: "secret".into(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn base_url_follows_scheme() {
        let mut endpoint = Endpoint {
            host: "pc.local".into(),
            port: 9440,
            use_ssl: true,
            verify_ssl: false,
            username: String::new(),
            password: String::new(),
            request_timeout: Duration::from_secs(1),
        };
        assert_eq!(endpoint.base_url(), "https://pc.local:9440/api/nutanix/v3");
        endpoint.use_ssl = false;
        assert_eq!(endpoint.base_url(), "http://pc.local:9440/api/nutanix/v3");
    }

    #[test]
    fn basic_auth_header_is_base64() {
        assert_eq!(basic_auth("admin", "password"), "Basic YWRtaW46cGFzc3dvcmQ=");
    }

    #[test]
    fn only_gateway_and_transport_errors_are_transient() {
        let api = |status| Error::Api {
            endpoint: "tasks",
            status,
            body: String::new(),
        };
        assert!(api(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(api(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!api(StatusCode::NOT_FOUND).is_transient());
        assert!(!api(StatusCode::UNAUTHORIZED).is_transient());

        let truncated = serde_json::from_str::<Value>("{\"status\":").unwrap_err();
        assert!(Error::from(truncated).is_transient());
        assert!(!Error::MissingTask { endpoint: "vms" }.is_transient());
    }

    #[tokio::test]
    async fn create_vm_returns_task_id_and_sends_auth() {
        let app = Router::new().route(
            "/api/nutanix/v3/vms",
            post(|headers: HeaderMap| async move {
                assert_eq!(
                    headers.get("authorization").unwrap(),
                    "Basic YWRtaW46c2VjcmV0"
                );
                (
                    StatusCode::ACCEPTED,
                    Json(serde_json::json!({
                        "status": { "state": "QUEUED", "execution_context": { "task_uuid": "t-1" } }
                    })),
                )
            }),
        );
        let client = client(serve(app).await);

        let req = CreateVmRequest {
            api_version: API_VERSION.into(),
            metadata: CreateMetadata {
                kind: "vm".into(),
                categories: Default::default(),
            },
            spec: CreateVmSpec {
                name: "web".into(),
                description: None,
                resources: CreateVmResources {
                    power_state: "ON".into(),
                    num_vcpus_per_socket: 2,
                    num_sockets: 1,
                    memory_size_mib: 2048,
                    disk_list: vec![],
                    nic_list: vec![],
                    machine_type: "PC".into(),
                    hardware_clock_timezone: "UTC".into(),
                },
                cluster_reference: Reference::by_uuid("cluster", "c-1"),
            },
        };
        assert_eq!(client.create_vm(&req).await.unwrap(), "t-1");
    }

    #[tokio::test]
    async fn missing_vm_is_none_and_errors_carry_status() {
        let app = Router::new()
            .route(
                "/api/nutanix/v3/vms/{id}",
                get(|Path(id): Path<String>| async move {
                    (StatusCode::NOT_FOUND, format!("vm {id} not found"))
                }),
            )
            .route(
                "/api/nutanix/v3/tasks/{id}",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            );
        let client = client(serve(app).await);

        assert!(client.get_vm("nope").await.unwrap().is_none());

        let err = client.get_task("t-9").await.unwrap_err();
        match err {
            Error::Api { endpoint, status, body } => {
                assert_eq!(endpoint, "get task");
                assert_eq!(status.as_u16(), 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn accepted_without_task_id_is_an_error() {
        let app = Router::new().route(
            "/api/nutanix/v3/vms/{id}/clone",
            post(|| async { (StatusCode::ACCEPTED, Json(serde_json::json!({}))) }),
        );
        let client = client(serve(app).await);

        let req = CloneVmRequest {
            api_version: API_VERSION.into(),
            spec_list: vec![],
        };
        let err = client.clone_vm("src", &req).await.unwrap_err();
        assert!(matches!(err, Error::MissingTask { endpoint: "clone vm" }));
    }
}
