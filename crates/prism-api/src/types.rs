use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "3.1.0";

// ── Listing ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ListRequest {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub length: u32,
    pub offset: u32,
}

impl ListRequest {
    pub fn new(kind: impl Into<String>, length: u32) -> Self {
        Self {
            kind: kind.into(),
            filter: None,
            length,
            offset: 0,
        }
    }

    pub fn filtered(kind: impl Into<String>, filter: impl Into<String>, length: u32) -> Self {
        Self {
            filter: Some(filter.into()),
            ..Self::new(kind, length)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub entities: Vec<T>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityMetadata {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Generic entity (cluster, subnet, image, snapshot): only identity is read.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Entity {
    pub metadata: EntityMetadata,
    pub spec: NamedSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NamedSpec {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Reference {
    pub fn by_uuid(kind: &str, uuid: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            uuid: Some(uuid.into()),
            name: None,
        }
    }

    pub fn by_name(kind: &str, name: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            uuid: None,
            name: Some(name.into()),
        }
    }
}

// ── VMs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Vm {
    pub metadata: EntityMetadata,
    pub spec: VmSpec,
    pub status: VmStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmSpec {
    pub name: String,
    pub resources: VmResources,
    pub cluster_reference: Option<Reference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmResources {
    pub power_state: Option<String>,
    pub num_vcpus_per_socket: u32,
    pub num_sockets: Option<u32>,
    pub memory_size_mib: u64,
    pub disk_list: Vec<Disk>,
    pub nic_list: Vec<Nic>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmStatus {
    pub resources: VmStatusResources,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VmStatusResources {
    pub power_state: Option<String>,
    pub nic_list: Vec<Nic>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Disk {
    pub disk_size_mib: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Nic {
    pub ip_endpoint_list: Vec<IpEndpoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IpEndpoint {
    pub ip: Option<String>,
}

impl Vm {
    /// Spec power state, falling back to the observed status.
    pub fn power_state(&self) -> Option<&str> {
        self.spec
            .resources
            .power_state
            .as_deref()
            .or(self.status.resources.power_state.as_deref())
    }

    pub fn vcpus(&self) -> u32 {
        let r = &self.spec.resources;
        r.num_vcpus_per_socket
            .saturating_mul(r.num_sockets.unwrap_or(1))
    }

    pub fn disk_gib(&self) -> u64 {
        self.spec
            .resources
            .disk_list
            .iter()
            .filter_map(|d| d.disk_size_mib)
            .fold(0u64, u64::saturating_add)
            / 1024
    }

    /// First address reported on the first NIC, observed status first.
    pub fn first_ip(&self) -> Option<&str> {
        fn from(nics: &[Nic]) -> Option<&str> {
            nics.first()
                .and_then(|n| n.ip_endpoint_list.first())
                .and_then(|e| e.ip.as_deref())
        }
        from(&self.status.resources.nic_list).or_else(|| from(&self.spec.resources.nic_list))
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.spec
            .cluster_reference
            .as_ref()
            .and_then(|r| r.name.as_deref())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateVmRequest {
    pub api_version: String,
    pub metadata: CreateMetadata,
    pub spec: CreateVmSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateMetadata {
    pub kind: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub categories: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateVmSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub resources: CreateVmResources,
    pub cluster_reference: Reference,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateVmResources {
    pub power_state: String,
    pub num_vcpus_per_socket: u32,
    pub num_sockets: u32,
    pub memory_size_mib: u64,
    pub disk_list: Vec<DiskSpec>,
    pub nic_list: Vec<NicSpec>,
    pub machine_type: String,
    pub hardware_clock_timezone: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskSpec {
    pub device_properties: DeviceProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size_mib: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_source_reference: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_config: Option<StorageConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceProperties {
    pub device_type: String,
    pub disk_address: DiskAddress,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskAddress {
    pub device_index: u32,
    pub adapter_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageConfig {
    pub storage_container_reference: Reference,
}

#[derive(Debug, Clone, Serialize)]
pub struct NicSpec {
    pub nic_type: String,
    pub subnet_reference: Reference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip_endpoint_list: Vec<IpEndpointSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpEndpointSpec {
    pub ip: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl IpEndpointSpec {
    pub fn assigned(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            kind: "ASSIGNED".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CloneVmRequest {
    pub api_version: String,
    pub spec_list: Vec<CloneSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloneSpec {
    pub name: String,
    pub num_vcpus_per_socket: u32,
    pub num_sockets: u32,
    pub memory_size_mib: u64,
}

// ── Snapshots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateSnapshotRequest {
    pub api_version: String,
    pub metadata: EntityMetadata,
    pub spec: SnapshotSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSpec {
    pub name: String,
    pub description: String,
}

// ── Tasks ────────────────────────────────────────────────────────────

/// Body of a 202 response: the task tracking the accepted mutation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AcceptedResponse {
    pub status: AcceptedStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AcceptedStatus {
    pub state: Option<String>,
    pub execution_context: Option<ExecutionContext>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutionContext {
    pub task_uuid: Option<String>,
}

impl AcceptedResponse {
    pub fn task_uuid(&self) -> Option<&str> {
        self.status
            .execution_context
            .as_ref()
            .and_then(|c| c.task_uuid.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Task {
    pub status: TaskStatus,
    pub error_detail: Option<String>,
    pub progress_message: Option<String>,
    pub percentage_complete: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Aborted,
    #[default]
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_tolerates_unknown_states() {
        let task: Task = serde_json::from_str(r#"{"status":"PENDING_APPROVAL"}"#).unwrap();
        assert_eq!(task.status, TaskStatus::Unknown);
        assert!(!task.status.is_terminal());

        let task: Task =
            serde_json::from_str(r#"{"status":"FAILED","error_detail":"disk full"}"#).unwrap();
        assert!(task.status.is_terminal());
        assert_eq!(task.error_detail.as_deref(), Some("disk full"));
    }

    #[test]
    fn vm_accessors_read_sparse_documents() {
        let vm: Vm = serde_json::from_value(serde_json::json!({
            "metadata": { "uuid": "vm-1" },
            "spec": {
                "name": "web",
                "resources": {
                    "power_state": "ON",
                    "num_vcpus_per_socket": 2,
                    "num_sockets": 2,
                    "memory_size_mib": 4096,
                    "disk_list": [{ "disk_size_mib": 20480 }, { "disk_size_mib": 10240 }]
                },
                "cluster_reference": { "kind": "cluster", "name": "c1" }
            },
            "status": {
                "resources": {
                    "nic_list": [{ "ip_endpoint_list": [{ "ip": "10.0.0.5" }] }]
                }
            }
        }))
        .unwrap();

        assert_eq!(vm.power_state(), Some("ON"));
        assert_eq!(vm.vcpus(), 4);
        assert_eq!(vm.disk_gib(), 30);
        assert_eq!(vm.first_ip(), Some("10.0.0.5"));
        assert_eq!(vm.cluster_name(), Some("c1"));
    }

    #[test]
    fn oversized_sizing_saturates() {
        let vm: Vm = serde_json::from_value(serde_json::json!({
            "spec": {
                "resources": {
                    "num_vcpus_per_socket": u32::MAX,
                    "num_sockets": 4,
                    "disk_list": [{ "disk_size_mib": u64::MAX }, { "disk_size_mib": 1024 }]
                }
            }
        }))
        .unwrap();

        assert_eq!(vm.vcpus(), u32::MAX);
        assert_eq!(vm.disk_gib(), u64::MAX / 1024);
    }

    #[test]
    fn accepted_response_exposes_task_uuid() {
        let body: AcceptedResponse = serde_json::from_str(
            r#"{"status":{"state":"QUEUED","execution_context":{"task_uuid":"t-42"}}}"#,
        )
        .unwrap();
        assert_eq!(body.task_uuid(), Some("t-42"));

        let empty: AcceptedResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.task_uuid(), None);
    }
}
