//! Nutanix AHV backend over the Prism Central v3 API.
//!
//! Every mutation answers with a task id and is awaited through the
//! [`TaskPoller`] before the call returns. Names are resolved to UUIDs with a
//! filtered list call; no match is an ordinary `None`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use prism_api::{
    API_VERSION, CloneSpec, CloneVmRequest, CreateMetadata, CreateSnapshotRequest, CreateVmRequest,
    CreateVmResources, CreateVmSpec, DeviceProperties, DiskAddress, DiskSpec, Endpoint, Entity,
    EntityMetadata, IpEndpointSpec, ListRequest, NicSpec, PrismClient, Reference, SnapshotSpec,
    StorageConfig, Vm,
};
use rand::Rng;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::config::NutanixSettings;
use crate::task::TaskPoller;
use crate::types::{ConsoleInfo, ConsoleKind, PowerState, VmConfig, VmCreated, VmInfo};
use crate::{Error, Provider, ProviderName, Result, validate_config};

const VM_LIST_LENGTH: u32 = 500;
const INVENTORY_LIST_LENGTH: u32 = 100;
/// Name filters are exact on the server, but a page is read so the match can be checked locally.
const LOOKUP_LENGTH: u32 = 20;
const MAC_PREFIX: &str = "50:6b:8d";

pub struct NutanixProvider {
    settings: NutanixSettings,
    client: PrismClient,
    tasks: TaskPoller,
}

impl NutanixProvider {
    pub fn new(settings: NutanixSettings) -> Result<Self> {
        let client = PrismClient::new(&Endpoint {
            host: settings.prism_central_ip.clone(),
            port: settings.port,
            use_ssl: settings.use_ssl,
            verify_ssl: settings.verify_ssl,
            username: settings.username.clone(),
            password: settings.password.clone(),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
        })?;
        let tasks = TaskPoller::new(
            client.clone(),
            Duration::from_secs(settings.poll_interval_secs),
        );
        Ok(Self {
            settings,
            client,
            tasks,
        })
    }

    async fn finish(&self, task_id: &str) -> Result<()> {
        self.tasks
            .finish(task_id, Duration::from_secs(self.settings.task_timeout_secs))
            .await
    }

    // ── Name resolution ──────────────────────────────────────────────

    async fn vm_uuid(&self, name: &str) -> Result<Option<String>> {
        let req = ListRequest::filtered("vm", name_filter("vm_name", name), LOOKUP_LENGTH);
        let vms = self.client.list_vms(&req).await?;
        Ok(vms
            .entities
            .into_iter()
            .find(|vm| vm.spec.name == name)
            .map(|vm| vm.metadata.uuid))
    }

    async fn require_vm(&self, name: &str) -> Result<String> {
        self.vm_uuid(name)
            .await?
            .ok_or_else(|| Error::not_found("vm", name))
    }

    /// The named cluster, or the first one Prism reports when no name is given.
    async fn cluster_uuid(&self, name: Option<&str>) -> Result<String> {
        let req = match name {
            Some(name) => ListRequest::filtered("cluster", name_filter("name", name), LOOKUP_LENGTH),
            None => ListRequest::new("cluster", 1),
        };
        let clusters = self.client.list_clusters(&req).await?.entities;
        pick(clusters, name).ok_or_else(|| Error::not_found("cluster", name.unwrap_or("(any)")))
    }

    async fn subnet_uuid(&self, name: Option<&str>) -> Result<String> {
        let req = match name {
            Some(name) => ListRequest::filtered("subnet", name_filter("name", name), LOOKUP_LENGTH),
            None => ListRequest::new("subnet", 1),
        };
        let subnets = self.client.list_subnets(&req).await?.entities;
        pick(subnets, name).ok_or_else(|| Error::not_found("network", name.unwrap_or("(any)")))
    }

    async fn image_uuid(&self, name: &str) -> Result<Option<String>> {
        let req = ListRequest::filtered("image", name_filter("name", name), LOOKUP_LENGTH);
        let images = self.client.list_images(&req).await?.entities;
        Ok(pick(images, Some(name)))
    }

    async fn snapshot_uuid(&self, vm_uuid: &str, name: &str) -> Result<String> {
        let snapshots = self.client.list_snapshots(vm_uuid).await?.entities;
        pick(snapshots, Some(name)).ok_or_else(|| Error::not_found("snapshot", name))
    }

    // ── Updates ──────────────────────────────────────────────────────

    /// Read-modify-write of the VM document, awaited.
    async fn update(&self, vm_uuid: &str, edit: impl FnOnce(&mut Map<String, Value>)) -> Result<()> {
        let mut doc = self.client.get_vm_document(vm_uuid).await?;
        let resources = doc
            .pointer_mut("/spec/resources")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::not_found("vm resources", vm_uuid))?;
        edit(resources);
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("api_version".into(), json!(API_VERSION));
        }
        let task = self.client.update_vm(vm_uuid, doc).await?;
        self.finish(&task).await
    }

    async fn set_power(&self, vm_uuid: &str, state: &str) -> Result<()> {
        self.update(vm_uuid, |resources| {
            resources.insert("power_state".into(), json!(state));
        })
        .await
    }

    /// Pin `ip` on the first NIC, adding one when the VM has none.
    async fn apply_static_ip(&self, vm_uuid: &str, ip: &str) -> Result<()> {
        let endpoints = json!([IpEndpointSpec::assigned(ip)]);
        self.update(vm_uuid, |resources| {
            let nics = resources
                .entry("nic_list")
                .or_insert_with(|| json!([]));
            if let Some(nics) = nics.as_array_mut() {
                if nics.is_empty() {
                    nics.push(json!({ "nic_type": "NORMAL_NIC" }));
                }
                if let Some(nic) = nics.first_mut().and_then(Value::as_object_mut) {
                    nic.insert("ip_endpoint_list".into(), endpoints);
                }
            }
        })
        .await
    }

    fn create_request(
        &self,
        config: &VmConfig,
        cluster_uuid: String,
        subnet_uuid: String,
        image_uuid: Option<String>,
    ) -> CreateVmRequest {
        let container = config
            .storage_container
            .clone()
            .or_else(|| self.settings.storage_container.clone());
        let disk = DiskSpec {
            device_properties: DeviceProperties {
                device_type: "DISK".into(),
                disk_address: DiskAddress {
                    device_index: 0,
                    adapter_type: "SCSI".into(),
                },
            },
            disk_size_mib: Some(config.disk * 1024),
            data_source_reference: image_uuid.map(|uuid| Reference::by_uuid("image", uuid)),
            storage_config: container.map(|name| StorageConfig {
                storage_container_reference: Reference::by_name("storage_container", name),
            }),
        };
        let nic = NicSpec {
            nic_type: "NORMAL_NIC".into(),
            subnet_reference: Reference::by_uuid("subnet", subnet_uuid),
            mac_address: Some(generate_mac()),
            ip_endpoint_list: config
                .ip_address
                .iter()
                .map(|ip| IpEndpointSpec::assigned(ip.clone()))
                .collect(),
        };

        let mut categories = BTreeMap::new();
        categories.insert("OS".to_string(), vec![config.os_type.clone()]);
        categories.insert("DataPersistence".to_string(), vec!["Enabled".to_string()]);

        CreateVmRequest {
            api_version: API_VERSION.into(),
            metadata: CreateMetadata {
                kind: "vm".into(),
                categories,
            },
            spec: CreateVmSpec {
                name: config.name.clone(),
                description: Some(format!("{} VM with persistent data", config.os_type)),
                resources: CreateVmResources {
                    power_state: "ON".into(),
                    num_vcpus_per_socket: config.cpu,
                    num_sockets: 1,
                    memory_size_mib: config.ram,
                    disk_list: vec![disk],
                    nic_list: vec![nic],
                    machine_type: "PC".into(),
                    hardware_clock_timezone: "UTC".into(),
                },
                cluster_reference: Reference::by_uuid("cluster", cluster_uuid),
            },
        }
    }
}

#[async_trait]
impl Provider for NutanixProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Nutanix
    }

    async fn connect(&self) -> Result<()> {
        self.client
            .list_clusters(&ListRequest::new("cluster", 1))
            .await?;
        Ok(())
    }

    async fn create_vm(&self, config: &VmConfig) -> Result<VmCreated> {
        validate_config(config)?;
        if self.vm_uuid(&config.name).await?.is_some() {
            return Err(Error::AlreadyExists(format!("vm {}", config.name)));
        }

        let cluster = self.cluster_uuid(config.cluster.as_deref()).await?;
        let subnet = self.subnet_uuid(config.network.as_deref()).await?;
        let image = match &config.template {
            Some(template) => {
                let image = self.image_uuid(template).await?;
                if image.is_none() {
                    warn!(vm = %config.name, template, "template image not found, creating a blank disk");
                }
                image
            }
            None => None,
        };
        let from_template = image.is_some();

        let task = self
            .client
            .create_vm(&self.create_request(config, cluster, subnet, image))
            .await?;
        info!(vm = %config.name, task_id = %task, from_template, "vm create accepted");
        self.finish(&task).await?;

        let id = match self.vm_uuid(&config.name).await {
            Ok(id) => id,
            Err(e) => {
                warn!(vm = %config.name, "created vm could not be looked up: {e}");
                None
            }
        };

        Ok(VmCreated {
            name: config.name.clone(),
            provider: ProviderName::Nutanix,
            id,
            ip_address: config.ip_address.clone(),
            stage: None,
            ip_configured: config.ip_address.as_ref().map(|_| true),
            message: match &config.template {
                Some(template) if from_template => {
                    format!("VM '{}' created from template '{template}'", config.name)
                }
                _ => format!("VM '{}' created", config.name),
            },
        })
    }

    async fn clone_vm(&self, source: &str, config: &VmConfig) -> Result<VmCreated> {
        validate_config(config)?;
        let source_uuid = self.require_vm(source).await?;

        let req = CloneVmRequest {
            api_version: API_VERSION.into(),
            spec_list: vec![CloneSpec {
                name: config.name.clone(),
                num_vcpus_per_socket: config.cpu,
                num_sockets: 1,
                memory_size_mib: config.ram,
            }],
        };
        let task = self.client.clone_vm(&source_uuid, &req).await?;
        info!(vm = %config.name, source, task_id = %task, "vm clone accepted");
        self.finish(&task).await?;

        let id = self.vm_uuid(&config.name).await?;
        let ip_configured = match (&config.ip_address, &id) {
            (Some(ip), Some(uuid)) => Some(match self.apply_static_ip(uuid, ip).await {
                Ok(()) => {
                    info!(vm = %config.name, ip, "static ip applied");
                    true
                }
                Err(e) => {
                    warn!(vm = %config.name, ip, "static ip not applied: {e}");
                    false
                }
            }),
            (Some(ip), None) => {
                warn!(vm = %config.name, ip, "clone not visible yet, static ip not applied");
                Some(false)
            }
            (None, _) => None,
        };

        Ok(VmCreated {
            name: config.name.clone(),
            provider: ProviderName::Nutanix,
            id,
            ip_address: config.ip_address.clone(),
            stage: None,
            ip_configured,
            message: format!("VM '{}' cloned from '{source}'", config.name),
        })
    }

    async fn delete_vm(&self, name: &str) -> Result<()> {
        let uuid = self.require_vm(name).await?;

        if let Err(e) = self.set_power(&uuid, "OFF").await {
            warn!(vm = name, "power off before delete failed: {e}");
        }
        if let Some(task) = self.client.delete_vm(&uuid).await? {
            self.finish(&task).await?;
        }
        info!(vm = name, "vm deleted");
        Ok(())
    }

    async fn start_vm(&self, name: &str) -> Result<()> {
        let uuid = self.require_vm(name).await?;
        self.set_power(&uuid, "ON").await?;
        info!(vm = name, "vm powered on");
        Ok(())
    }

    async fn stop_vm(&self, name: &str) -> Result<()> {
        let uuid = self.require_vm(name).await?;
        self.set_power(&uuid, "OFF").await?;
        info!(vm = name, "vm powered off");
        Ok(())
    }

    async fn get_vm_info(&self, name: &str) -> Result<Option<VmInfo>> {
        let Some(uuid) = self.vm_uuid(name).await? else {
            return Ok(None);
        };
        Ok(self.client.get_vm(&uuid).await?.as_ref().map(vm_info))
    }

    async fn list_vms(&self) -> Result<Vec<VmInfo>> {
        let vms = self
            .client
            .list_vms(&ListRequest::new("vm", VM_LIST_LENGTH))
            .await?;
        Ok(vms.entities.iter().map(vm_info).collect())
    }

    async fn templates(&self) -> Result<Vec<String>> {
        Ok(self.settings.templates.clone())
    }

    async fn clusters(&self) -> Result<Vec<String>> {
        let clusters = self
            .client
            .list_clusters(&ListRequest::new("cluster", INVENTORY_LIST_LENGTH))
            .await?;
        Ok(names(clusters.entities))
    }

    async fn networks(&self) -> Result<Vec<String>> {
        let subnets = self
            .client
            .list_subnets(&ListRequest::new("subnet", INVENTORY_LIST_LENGTH))
            .await?;
        Ok(names(subnets.entities))
    }

    async fn create_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let uuid = self.require_vm(name).await?;
        let req = CreateSnapshotRequest {
            api_version: API_VERSION.into(),
            metadata: EntityMetadata {
                uuid: String::new(),
                kind: Some("vm_snapshot".into()),
            },
            spec: SnapshotSpec {
                name: snapshot.to_string(),
                description: format!("Snapshot of {name}"),
            },
        };
        let task = self.client.create_snapshot(&uuid, &req).await?;
        self.finish(&task).await?;
        info!(vm = name, snapshot, "snapshot created");
        Ok(())
    }

    async fn restore_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let uuid = self.require_vm(name).await?;
        let snapshot_uuid = self.snapshot_uuid(&uuid, snapshot).await?;
        let task = self.client.restore_snapshot(&uuid, &snapshot_uuid).await?;
        self.finish(&task).await?;
        info!(vm = name, snapshot, "snapshot restored");
        Ok(())
    }

    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let uuid = self.require_vm(name).await?;
        let snapshot_uuid = self.snapshot_uuid(&uuid, snapshot).await?;
        if let Some(task) = self.client.delete_snapshot(&uuid, &snapshot_uuid).await? {
            self.finish(&task).await?;
        }
        info!(vm = name, snapshot, "snapshot deleted");
        Ok(())
    }

    async fn open_console(&self, name: &str) -> Result<ConsoleInfo> {
        let uuid = self.require_vm(name).await?;
        let url = format!(
            "https://{}:{}/console/vm/{uuid}",
            self.settings.prism_central_ip, self.settings.port
        );
        Ok(ConsoleInfo {
            kind: ConsoleKind::Web,
            message: format!("Web console for VM '{name}': {url}"),
            url: Some(url),
        })
    }
}

fn vm_info(vm: &Vm) -> VmInfo {
    VmInfo {
        name: vm.spec.name.clone(),
        id: vm.metadata.uuid.clone(),
        state: match vm.power_state() {
            Some(s) if s.eq_ignore_ascii_case("ON") => PowerState::Running,
            Some(s) if s.eq_ignore_ascii_case("OFF") => PowerState::Stopped,
            _ => PowerState::Unknown,
        },
        cpu: vm.vcpus(),
        ram: vm.spec.resources.memory_size_mib,
        disk: vm.disk_gib(),
        ip_address: vm.first_ip().map(str::to_string),
        provider: ProviderName::Nutanix,
        cluster: vm.cluster_name().map(str::to_string),
    }
}

/// UUID of the entity called `name`, or of the first entity when `name` is `None`.
fn pick(entities: Vec<Entity>, name: Option<&str>) -> Option<String> {
    entities
        .into_iter()
        .find(|e| name.is_none_or(|n| e.spec.name == n))
        .map(|e| e.metadata.uuid)
}

fn names(entities: Vec<Entity>) -> Vec<String> {
    entities.into_iter().map(|e| e.spec.name).collect()
}

/// Locally administered MAC in the AHV vendor range.
fn generate_mac() -> String {
    let mut rng = rand::rng();
    let [a, b, c]: [u8; 3] = rng.random();
    format!("{MAC_PREFIX}:{a:02x}:{b:02x}:{c:02x}")
}

/// FIQL equality on a name. `,` and `;` join clauses, so they are
/// percent-escaped along with `%` itself.
fn name_filter(key: &str, value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ',' => escaped.push_str("%2C"),
            ';' => escaped.push_str("%3B"),
            c => escaped.push(c),
        }
    }
    format!("{key}=={escaped}")
}
