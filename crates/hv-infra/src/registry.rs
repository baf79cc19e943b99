//! The provider registry: persisted configuration plus the live backends built from it.
//!
//! Readers take a snapshot of the published provider set; configuration
//! changes build a new set and swap it in whole, so a concurrent `get`
//! sees either the old set or the new one.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use vmware_cli::ProcessRunner;

use crate::config::{HypervisorConfig, ProviderEntry};
use crate::ip_pool::IpLeasePool;
use crate::nutanix::NutanixProvider;
use crate::types::{ConsoleInfo, VmConfig, VmCreated, VmInfo};
use crate::vmware::VmwareProvider;
use crate::{Error, Provider, ProviderName, Result, validate_config};

/// Builds a live provider from its configuration block.
pub trait ProviderFactory: Send + Sync + 'static {
    fn build(&self, name: ProviderName, entry: &ProviderEntry) -> Result<Arc<dyn Provider>>;
}

/// The real backends: `vmrun`/`packer` processes and the Prism REST client.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendFactory;

impl ProviderFactory for BackendFactory {
    fn build(&self, name: ProviderName, entry: &ProviderEntry) -> Result<Arc<dyn Provider>> {
        Ok(match name {
            ProviderName::Vmware => {
                Arc::new(VmwareProvider::new(entry.settings()?, Arc::new(ProcessRunner)))
            }
            ProviderName::Nutanix => Arc::new(NutanixProvider::new(entry.settings()?)?),
        })
    }
}

/// Which providers a discovery call covers. `None` and `"all"` mean every live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    All,
    One(&'a str),
}

impl<'a> From<Option<&'a str>> for Target<'a> {
    fn from(name: Option<&'a str>) -> Self {
        match name {
            None | Some("all") => Self::All,
            Some(name) => Self::One(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub provider_type: String,
    pub enabled: bool,
    pub connected: bool,
    pub is_default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a fan-out call. A provider that failed is listed in `errors`
/// and contributes nothing to `results`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Aggregate<T> {
    pub results: T,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<ProviderName, String>,
}

#[derive(Default)]
struct ProviderSet {
    default: String,
    live: BTreeMap<ProviderName, Arc<dyn Provider>>,
}

pub struct ProviderRegistry {
    path: PathBuf,
    /// Serializes writers; the file and this copy are updated together.
    config: Mutex<HypervisorConfig>,
    published: RwLock<Arc<ProviderSet>>,
    pool: Arc<IpLeasePool>,
    factory: Arc<dyn ProviderFactory>,
}

impl ProviderRegistry {
    /// Load (or create) the configuration file and the IP pool it names, then
    /// build every enabled backend. A relative pool file lives next to the
    /// configuration file.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        Self::load_with(path, Arc::new(BackendFactory)).await
    }

    pub async fn load_with(
        path: impl Into<PathBuf>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Result<Self> {
        let path = path.into();
        let config = HypervisorConfig::load_or_init(&path).await?;
        let dir = path.parent().unwrap_or(Path::new(""));
        let pool = IpLeasePool::load_or_init(&config.ip_pool.relative_to(dir)).await?;
        Ok(Self::new(path, config, Arc::new(pool), factory))
    }

    pub fn new(
        path: PathBuf,
        config: HypervisorConfig,
        pool: Arc<IpLeasePool>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        let set = instantiate(&config, factory.as_ref());
        info!(
            providers = ?set.live.keys().collect::<Vec<_>>(),
            default = %set.default,
            "provider registry ready"
        );
        Self {
            path,
            config: Mutex::new(config),
            published: RwLock::new(Arc::new(set)),
            pool,
            factory,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.path
    }

    pub fn ip_pool(&self) -> &Arc<IpLeasePool> {
        &self.pool
    }

    fn snapshot(&self) -> Arc<ProviderSet> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, set: ProviderSet) {
        *self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(set);
    }

    /// The named provider, or the default one when `name` is `None`.
    ///
    /// A name with no live instance (unknown, disabled, or failed to build) is
    /// `ProviderNotFound`. A default that is configured but disabled is
    /// `ProviderDisabled`.
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn Provider>> {
        let set = self.snapshot();
        let requested = name.unwrap_or(&set.default);
        let parsed: ProviderName = requested.parse()?;
        match set.live.get(&parsed) {
            Some(provider) => Ok(provider.clone()),
            None if name.is_none() => Err(Error::ProviderDisabled(requested.to_string())),
            None => Err(Error::ProviderNotFound(requested.to_string())),
        }
    }

    pub async fn config(&self) -> HypervisorConfig {
        self.config.lock().await.clone()
    }

    /// Every configured provider name, enabled or not.
    pub async fn available_providers(&self) -> Vec<String> {
        self.config.lock().await.providers.keys().cloned().collect()
    }

    /// Merge `update` into the named provider's block, persist, then rebuild or
    /// drop the live instance according to the resulting `enabled` flag.
    ///
    /// The new instance is built before anything is written, so settings that
    /// cannot produce a provider are rejected without touching the file.
    pub async fn update_config(&self, name: &str, update: ProviderEntry) -> Result<()> {
        let provider: ProviderName = name.parse()?;
        let mut config = self.config.lock().await;

        let mut next = config.clone();
        let entry = next.providers.entry(name.to_string()).or_default();
        entry.enabled = update.enabled;
        entry.settings.extend(update.settings);
        let entry = entry.clone();

        let rebuilt = if entry.enabled {
            Some(self.factory.build(provider, &entry)?)
        } else {
            None
        };

        next.save(&self.path).await?;
        *config = next;

        let current = self.snapshot();
        let mut live = current.live.clone();
        let replaced = match rebuilt {
            Some(instance) => live.insert(provider, instance),
            None => live.remove(&provider),
        };
        self.publish(ProviderSet {
            default: current.default.clone(),
            live,
        });
        drop(config);
        info!(provider = name, enabled = entry.enabled, "provider configuration updated");

        if let Some(old) = replaced {
            if let Err(e) = old.disconnect().await {
                warn!(provider = name, "disconnect of replaced provider failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn set_default_provider(&self, name: &str) -> Result<()> {
        let provider: ProviderName = name.parse()?;
        let mut config = self.config.lock().await;
        match config.entry(provider) {
            Some(entry) if entry.enabled => {}
            Some(_) => return Err(Error::ProviderDisabled(name.to_string())),
            None => return Err(Error::ProviderNotFound(name.to_string())),
        }

        let mut next = config.clone();
        next.default_provider = provider.as_str().to_string();
        next.save(&self.path).await?;
        *config = next;

        let current = self.snapshot();
        self.publish(ProviderSet {
            default: provider.as_str().to_string(),
            live: current.live.clone(),
        });
        info!(provider = name, "default provider changed");
        Ok(())
    }

    /// Probe every configured provider, one at a time. Disabled providers are
    /// reported without being probed.
    pub async fn status(&self) -> Vec<ProviderStatus> {
        let config = self.config().await;
        let set = self.snapshot();

        let mut statuses = Vec::with_capacity(config.providers.len());
        for (name, entry) in &config.providers {
            let parsed = name.parse::<ProviderName>().ok();
            let mut status = ProviderStatus {
                name: name.clone(),
                provider_type: parsed.map_or("unknown", |p| p.as_str()).to_string(),
                enabled: entry.enabled,
                connected: false,
                is_default: *name == set.default,
                error: None,
            };

            if entry.enabled {
                match parsed.and_then(|p| set.live.get(&p)) {
                    Some(provider) => match provider.connect().await {
                        Ok(()) => {
                            status.connected = true;
                            if let Err(e) = provider.disconnect().await {
                                warn!(provider = %name, "disconnect after probe failed: {e}");
                            }
                        }
                        Err(e) => status.error = Some(e.to_string()),
                    },
                    None => status.error = Some("provider could not be instantiated".into()),
                }
            }
            statuses.push(status);
        }
        statuses
    }

    /// Probe every live provider. Returns which ones answered.
    pub async fn connect_all(&self) -> BTreeMap<ProviderName, bool> {
        let mut connected = BTreeMap::new();
        for (name, provider) in &self.snapshot().live {
            let ok = match provider.connect().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(provider = %name, "connect failed: {e}");
                    false
                }
            };
            connected.insert(*name, ok);
        }
        connected
    }

    pub async fn disconnect_all(&self) {
        for (name, provider) in &self.snapshot().live {
            if let Err(e) = provider.disconnect().await {
                warn!(provider = %name, "disconnect failed: {e}");
            }
        }
    }

    // ── VM lifecycle ─────────────────────────────────────────────────

    /// Validate, lease an address when none was given, and dispatch. A lease
    /// taken here is returned if the backend fails.
    pub async fn create_vm(&self, provider: Option<&str>, config: VmConfig) -> Result<VmCreated> {
        self.provision(provider, config, |p, config| async move {
            p.create_vm(&config).await
        })
        .await
    }

    pub async fn clone_vm(
        &self,
        provider: Option<&str>,
        source: &str,
        config: VmConfig,
    ) -> Result<VmCreated> {
        let source = source.to_string();
        self.provision(provider, config, move |p, config| async move {
            p.clone_vm(&source, &config).await
        })
        .await
    }

    /// Builds run on their own task: a caller that goes away stops waiting
    /// but never stops a build halfway, and the lease follows the outcome.
    async fn provision<F, Fut>(
        &self,
        provider: Option<&str>,
        config: VmConfig,
        op: F,
    ) -> Result<VmCreated>
    where
        F: FnOnce(Arc<dyn Provider>, VmConfig) -> Fut,
        Fut: Future<Output = Result<VmCreated>> + Send + 'static,
    {
        validate_config(&config)?;
        let provider = self.get(provider)?;
        let (config, lease) = self.lease(provider.name(), config).await?;
        let guard = LeaseGuard {
            pool: self.pool.clone(),
            ip: lease,
        };

        let job = op(provider, config);
        tokio::spawn(async move {
            let outcome = job.await;
            match outcome {
                Ok(_) => guard.keep(),
                Err(_) => guard.release().await,
            }
            outcome
        })
        .await?
    }

    async fn lease(
        &self,
        provider: ProviderName,
        mut config: VmConfig,
    ) -> Result<(VmConfig, Option<String>)> {
        if config.ip_address.is_some() {
            return Ok((config, None));
        }
        let ip = self.pool.allocate(&lease_owner(provider, &config.name)).await?;
        info!(vm = %config.name, %provider, ip = %ip, "ip leased for vm");
        config.ip_address = Some(ip.clone());
        Ok((config, Some(ip)))
    }

    /// Delete the VM and return every address leased to it.
    pub async fn delete_vm(&self, provider: Option<&str>, name: &str) -> Result<()> {
        let provider = self.get(provider)?;
        provider.delete_vm(name).await?;
        let released = self
            .pool
            .release_owner(&lease_owner(provider.name(), name))
            .await;
        if !released.is_empty() {
            info!(vm = name, ?released, "ip leases released");
        }
        Ok(())
    }

    pub async fn start_vm(&self, provider: Option<&str>, name: &str) -> Result<()> {
        self.get(provider)?.start_vm(name).await
    }

    pub async fn stop_vm(&self, provider: Option<&str>, name: &str) -> Result<()> {
        self.get(provider)?.stop_vm(name).await
    }

    pub async fn restart_vm(&self, provider: Option<&str>, name: &str) -> Result<()> {
        self.get(provider)?.restart_vm(name).await
    }

    pub async fn get_vm_info(&self, provider: Option<&str>, name: &str) -> Result<Option<VmInfo>> {
        self.get(provider)?.get_vm_info(name).await
    }

    pub async fn create_snapshot(
        &self,
        provider: Option<&str>,
        name: &str,
        snapshot: &str,
    ) -> Result<()> {
        self.get(provider)?.create_snapshot(name, snapshot).await
    }

    pub async fn restore_snapshot(
        &self,
        provider: Option<&str>,
        name: &str,
        snapshot: &str,
    ) -> Result<()> {
        self.get(provider)?.restore_snapshot(name, snapshot).await
    }

    pub async fn delete_snapshot(
        &self,
        provider: Option<&str>,
        name: &str,
        snapshot: &str,
    ) -> Result<()> {
        self.get(provider)?.delete_snapshot(name, snapshot).await
    }

    pub async fn open_console(&self, provider: Option<&str>, name: &str) -> Result<ConsoleInfo> {
        self.get(provider)?.open_console(name).await
    }

    // ── Discovery ────────────────────────────────────────────────────

    pub async fn list_vms(&self, target: Target<'_>) -> Result<Aggregate<Vec<VmInfo>>> {
        let (results, errors) = self
            .fan_out(target, |p| async move { p.list_vms().await })
            .await?;
        Ok(Aggregate {
            results: results.into_iter().flat_map(|(_, vms)| vms).collect(),
            errors,
        })
    }

    /// Template names, de-duplicated by value across providers.
    pub async fn templates(&self, target: Target<'_>) -> Result<Aggregate<Vec<String>>> {
        let (results, errors) = self
            .fan_out(target, |p| async move { p.templates().await })
            .await?;
        let mut templates: Vec<String> = Vec::new();
        for name in results.into_iter().flat_map(|(_, names)| names) {
            if !templates.contains(&name) {
                templates.push(name);
            }
        }
        Ok(Aggregate {
            results: templates,
            errors,
        })
    }

    pub async fn clusters(
        &self,
        target: Target<'_>,
    ) -> Result<Aggregate<BTreeMap<ProviderName, Vec<String>>>> {
        let (results, errors) = self
            .fan_out(target, |p| async move { p.clusters().await })
            .await?;
        Ok(Aggregate {
            results: results.into_iter().collect(),
            errors,
        })
    }

    pub async fn networks(
        &self,
        target: Target<'_>,
    ) -> Result<Aggregate<BTreeMap<ProviderName, Vec<String>>>> {
        let (results, errors) = self
            .fan_out(target, |p| async move { p.networks().await })
            .await?;
        Ok(Aggregate {
            results: results.into_iter().collect(),
            errors,
        })
    }

    /// Run `op` against the target. A single named provider propagates its
    /// error; with `All`, failures are collected per provider.
    async fn fan_out<T, F, Fut>(
        &self,
        target: Target<'_>,
        op: F,
    ) -> Result<(Vec<(ProviderName, T)>, BTreeMap<ProviderName, String>)>
    where
        F: Fn(Arc<dyn Provider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Target::One(name) = target {
            let provider = self.get(Some(name))?;
            let name = provider.name();
            return Ok((vec![(name, op(provider).await?)], BTreeMap::new()));
        }

        let set = self.snapshot();
        let calls = set.live.values().cloned().map(|provider| {
            let name = provider.name();
            let call = op(provider);
            async move { (name, call.await) }
        });

        let mut results = Vec::new();
        let mut errors = BTreeMap::new();
        for (name, outcome) in join_all(calls).await {
            match outcome {
                Ok(value) => results.push((name, value)),
                Err(e) => {
                    warn!(provider = %name, "provider call failed: {e}");
                    errors.insert(name, e.to_string());
                }
            }
        }
        Ok((results, errors))
    }
}

/// An address leased for a VM that is still being built. Unless `keep` is
/// called it goes back to the pool, including when the build task panics.
struct LeaseGuard {
    pool: Arc<IpLeasePool>,
    ip: Option<String>,
}

impl LeaseGuard {
    fn keep(mut self) {
        self.ip = None;
    }

    async fn release(mut self) {
        if let Some(ip) = self.ip.take() {
            self.pool.release(&ip).await;
            info!(ip, "ip lease returned after failed request");
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(ip) = self.ip.take() else {
            return;
        };
        warn!(ip, "provisioning ended without an outcome, returning lease");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            handle.spawn(async move {
                pool.release(&ip).await;
            });
        }
    }
}

/// Owner tag recorded next to a leased address.
fn lease_owner(provider: ProviderName, vm: &str) -> String {
    format!("{provider}/{vm}")
}

fn instantiate(config: &HypervisorConfig, factory: &dyn ProviderFactory) -> ProviderSet {
    let mut live: BTreeMap<ProviderName, Arc<dyn Provider>> = BTreeMap::new();

    for (name, entry) in &config.providers {
        let Ok(parsed) = name.parse::<ProviderName>() else {
            warn!(provider = %name, "ignoring unknown provider in configuration");
            continue;
        };
        if !entry.enabled {
            info!(provider = %name, "provider disabled, skipping");
            continue;
        }
        match factory.build(parsed, entry) {
            Ok(provider) => {
                info!(provider = %name, "registered provider");
                live.insert(parsed, provider);
            }
            Err(e) => warn!(provider = %name, "skipping provider: {e}"),
        }
    }

    ProviderSet {
        default: config.default_provider.clone(),
        live,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Map, Value, json};

    use super::*;
    use crate::types::{ConsoleKind, PowerState};

    /// In-memory backend. Setting `"fail": true` in its config block makes
    /// every call except `name` fail.
    struct Fake {
        name: ProviderName,
        failing: bool,
        connects: AtomicUsize,
        vms: std::sync::Mutex<Vec<VmInfo>>,
    }

    impl Fake {
        fn check(&self) -> Result<()> {
            if self.failing {
                return Err(Error::TaskFailed {
                    task_id: "t-1".into(),
                    detail: format!("{} is down", self.name),
                });
            }
            Ok(())
        }

        fn created(&self, config: &VmConfig) -> Result<VmCreated> {
            self.check()?;
            self.vms.lock().unwrap().push(VmInfo {
                name: config.name.clone(),
                id: config.name.clone(),
                state: PowerState::Running,
                cpu: config.cpu,
                ram: config.ram,
                disk: config.disk,
                ip_address: config.ip_address.clone(),
                provider: self.name,
                cluster: None,
            });
            Ok(VmCreated {
                name: config.name.clone(),
                provider: self.name,
                id: Some(config.name.clone()),
                ip_address: config.ip_address.clone(),
                stage: None,
                ip_configured: None,
                message: "created".into(),
            })
        }
    }

    #[async_trait]
    impl Provider for Fake {
        fn name(&self) -> ProviderName {
            self.name
        }

        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.check()
        }

        async fn create_vm(&self, config: &VmConfig) -> Result<VmCreated> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.created(config)
        }

        async fn clone_vm(&self, _source: &str, config: &VmConfig) -> Result<VmCreated> {
            self.created(config)
        }

        async fn delete_vm(&self, name: &str) -> Result<()> {
            self.check()?;
            let mut vms = self.vms.lock().unwrap();
            let before = vms.len();
            vms.retain(|vm| vm.name != name);
            if vms.len() == before {
                return Err(Error::not_found("vm", name));
            }
            Ok(())
        }

        async fn start_vm(&self, _name: &str) -> Result<()> {
            self.check()
        }

        async fn stop_vm(&self, _name: &str) -> Result<()> {
            self.check()
        }

        async fn get_vm_info(&self, name: &str) -> Result<Option<VmInfo>> {
            self.check()?;
            Ok(self.vms.lock().unwrap().iter().find(|vm| vm.name == name).cloned())
        }

        async fn list_vms(&self) -> Result<Vec<VmInfo>> {
            self.check()?;
            Ok(self.vms.lock().unwrap().clone())
        }

        async fn templates(&self) -> Result<Vec<String>> {
            self.check()?;
            Ok(match self.name {
                ProviderName::Vmware => vec!["Ubuntu 64-bit (3)".into(), "Windows 10".into()],
                ProviderName::Nutanix => vec!["Windows Server 2019".into(), "Ubuntu 64-bit (3)".into()],
            })
        }

        async fn clusters(&self) -> Result<Vec<String>> {
            self.check()?;
            Ok(vec![format!("{}-cluster", self.name)])
        }

        async fn networks(&self) -> Result<Vec<String>> {
            self.check()?;
            Ok(vec!["default".into()])
        }

        async fn create_snapshot(&self, _name: &str, _snapshot: &str) -> Result<()> {
            self.check()
        }

        async fn restore_snapshot(&self, _name: &str, _snapshot: &str) -> Result<()> {
            self.check()
        }

        async fn delete_snapshot(&self, _name: &str, _snapshot: &str) -> Result<()> {
            self.check()
        }

        async fn open_console(&self, name: &str) -> Result<ConsoleInfo> {
            self.check()?;
            Ok(ConsoleInfo {
                kind: ConsoleKind::Web,
                url: Some(format!("https://console/{name}")),
                message: String::new(),
            })
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        built: std::sync::Mutex<Vec<Arc<Fake>>>,
    }

    impl FakeFactory {
        /// The most recently built instance for `name`.
        fn latest(&self, name: ProviderName) -> Option<Arc<Fake>> {
            self.built
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|f| f.name == name)
                .cloned()
        }

        fn builds(&self, name: ProviderName) -> usize {
            self.built.lock().unwrap().iter().filter(|f| f.name == name).count()
        }
    }

    impl ProviderFactory for FakeFactory {
        fn build(&self, name: ProviderName, entry: &ProviderEntry) -> Result<Arc<dyn Provider>> {
            if entry.settings.get("broken").is_some() {
                return Err(Error::Config("broken settings".into()));
            }
            let fake = Arc::new(Fake {
                name,
                failing: entry.settings.get("fail") == Some(&Value::Bool(true)),
                connects: AtomicUsize::new(0),
                vms: Default::default(),
            });
            self.built.lock().unwrap().push(fake.clone());
            Ok(fake)
        }
    }

    fn entry(enabled: bool, settings: Value) -> ProviderEntry {
        let settings: Map<String, Value> = serde_json::from_value(settings).unwrap();
        ProviderEntry { enabled, settings }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        registry: Arc<ProviderRegistry>,
        factory: Arc<FakeFactory>,
    }

    fn setup(vmware: ProviderEntry, nutanix: ProviderEntry, pool: (u8, u8)) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HypervisorConfig::builtin().unwrap();
        config.providers.insert("vmware".into(), vmware);
        config.providers.insert("nutanix".into(), nutanix);

        let factory = Arc::new(FakeFactory::default());
        let pool = Arc::new(IpLeasePool::in_memory("10.9.0", pool.0, pool.1).unwrap());
        let registry = ProviderRegistry::new(
            dir.path().join("hypervisor_config.json"),
            config,
            pool,
            factory.clone(),
        );
        Setup {
            _dir: dir,
            registry: Arc::new(registry),
            factory,
        }
    }

    fn both_enabled() -> Setup {
        setup(entry(true, json!({})), entry(true, json!({ "prism_central_ip": "10.0.0.5" })), (100, 110))
    }

    fn vm(name: &str) -> VmConfig {
        VmConfig {
            name: name.into(),
            cpu: 1,
            ram: 1024,
            disk: 10,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fourth_concurrent_create_exhausts_a_three_address_pool() {
        let s = setup(entry(true, json!({})), entry(false, json!({})), (100, 102));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = s.registry.clone();
                tokio::spawn(async move { registry.create_vm(None, vm(&format!("vm-{i}"))).await })
            })
            .collect();

        let mut addresses = HashSet::new();
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(created) => assert!(addresses.insert(created.ip_address.unwrap())),
                Err(Error::ResourceExhausted(_)) => exhausted += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(addresses.len(), 3);
        assert_eq!(exhausted, 1);
        for addr in ["10.9.0.100", "10.9.0.101", "10.9.0.102"] {
            assert!(addresses.contains(addr));
        }
    }

    #[tokio::test]
    async fn loading_keeps_the_pool_file_beside_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hypervisor_config.json");

        let registry = ProviderRegistry::load_with(&path, Arc::new(FakeFactory::default()))
            .await
            .unwrap();
        registry.create_vm(None, vm("web")).await.unwrap();

        let leases = std::fs::read_to_string(dir.path().join("ips.txt")).unwrap();
        assert!(leases.contains("vmware/web"), "{leases}");
    }

    #[tokio::test]
    async fn disabling_a_live_provider_unpublishes_it() {
        let s = both_enabled();
        let nutanix = s.registry.get(Some("nutanix")).unwrap();
        nutanix.connect().await.unwrap();

        s.registry
            .update_config("nutanix", entry(false, json!({})))
            .await
            .unwrap();

        assert!(matches!(
            s.registry.get(Some("nutanix")),
            Err(Error::ProviderNotFound(_))
        ));
        // The change is on disk, and the earlier settings were merged, not wiped.
        let saved = HypervisorConfig::load_or_init(s.registry.config_path()).await.unwrap();
        let block = saved.entry(ProviderName::Nutanix).unwrap();
        assert!(!block.enabled);
        assert_eq!(block.settings.get("prism_central_ip"), Some(&json!("10.0.0.5")));

        s.registry
            .update_config("nutanix", entry(true, json!({})))
            .await
            .unwrap();
        assert_eq!(s.registry.get(Some("nutanix")).unwrap().name(), ProviderName::Nutanix);
        assert_eq!(s.factory.builds(ProviderName::Nutanix), 2);
    }

    #[tokio::test]
    async fn unbuildable_settings_are_rejected_before_saving() {
        let s = both_enabled();
        let err = s
            .registry
            .update_config("vmware", entry(true, json!({ "broken": true })))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!s.registry.config_path().exists());
        assert!(s.registry.get(Some("vmware")).is_ok());

        assert!(matches!(
            s.registry.update_config("hyperv", entry(true, json!({}))).await,
            Err(Error::ProviderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn status_never_probes_disabled_providers() {
        let s = setup(entry(true, json!({ "fail": true })), entry(false, json!({})), (100, 110));

        let statuses = s.registry.status().await;
        let by_name: BTreeMap<_, _> = statuses.iter().map(|st| (st.name.as_str(), st)).collect();

        let nutanix = by_name["nutanix"];
        assert!(!nutanix.enabled);
        assert!(!nutanix.connected);
        assert_eq!(s.factory.builds(ProviderName::Nutanix), 0);

        let vmware = by_name["vmware"];
        assert!(vmware.enabled && !vmware.connected && vmware.is_default);
        assert!(vmware.error.as_deref().unwrap().contains("down"));
        assert_eq!(
            s.factory.latest(ProviderName::Vmware).unwrap().connects.load(Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn failed_create_returns_its_lease() {
        let s = setup(entry(true, json!({ "fail": true })), entry(false, json!({})), (100, 101));
        let pool = s.registry.ip_pool().clone();

        assert!(matches!(
            s.registry.create_vm(None, vm("web")).await,
            Err(Error::TaskFailed { .. })
        ));
        assert_eq!(pool.available().await, 2);

        assert!(matches!(
            s.registry.create_vm(None, VmConfig { cpu: 0, ..vm("web") }).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(pool.available().await, 2);
    }

    #[tokio::test]
    async fn abandoned_requests_still_settle_their_lease() {
        let s = setup(entry(true, json!({ "fail": true })), entry(true, json!({})), (100, 102));
        let pool = s.registry.ip_pool().clone();

        // The caller goes away mid-build; the failed build still returns its address.
        let registry = s.registry.clone();
        let request = tokio::spawn(async move { registry.create_vm(None, vm("gone")).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        request.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.available().await, 3);

        // A build that succeeds after its caller left keeps the lease for the new VM.
        let registry = s.registry.clone();
        let request =
            tokio::spawn(async move { registry.create_vm(Some("nutanix"), vm("kept")).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        request.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.available().await, 2);
        let nutanix = s.factory.latest(ProviderName::Nutanix).unwrap();
        assert!(nutanix.vms.lock().unwrap().iter().any(|v| v.name == "kept"));

        s.registry.delete_vm(Some("nutanix"), "kept").await.unwrap();
        assert_eq!(pool.available().await, 3);
    }

    #[tokio::test]
    async fn explicit_addresses_are_not_leased_and_delete_releases() {
        let s = both_enabled();
        let pool = s.registry.ip_pool().clone();

        let fixed = VmConfig {
            ip_address: Some("172.16.0.9".into()),
            ..vm("fixed")
        };
        let created = s.registry.create_vm(Some("nutanix"), fixed).await.unwrap();
        assert_eq!(created.ip_address.as_deref(), Some("172.16.0.9"));
        assert_eq!(pool.available().await, 11);

        let cloned = s
            .registry
            .clone_vm(Some("nutanix"), "fixed", vm("copy"))
            .await
            .unwrap();
        let leased = cloned.ip_address.unwrap();
        assert!(pool.is_leased(&leased).await);

        s.registry.delete_vm(Some("nutanix"), "copy").await.unwrap();
        assert!(!pool.is_leased(&leased).await);

        assert!(matches!(
            s.registry.delete_vm(Some("nutanix"), "copy").await,
            Err(Error::EntityNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn listing_all_isolates_a_failing_provider() {
        let s = setup(entry(true, json!({})), entry(true, json!({ "fail": true })), (100, 110));
        s.registry.create_vm(Some("vmware"), vm("web")).await.unwrap();

        let listing = s.registry.list_vms(Target::All).await.unwrap();
        assert_eq!(listing.results.len(), 1);
        assert_eq!(listing.results[0].name, "web");
        assert!(listing.errors[&ProviderName::Nutanix].contains("down"));
        assert!(!listing.errors.contains_key(&ProviderName::Vmware));

        // A single named provider surfaces its own failure.
        assert!(s.registry.list_vms(Target::One("nutanix")).await.is_err());
        assert!(matches!(
            s.registry.list_vms(Target::One("hyperv")).await,
            Err(Error::ProviderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn discovery_dedupes_templates_and_keys_inventory_by_provider() {
        let s = both_enabled();

        let templates = s.registry.templates(Target::from(Some("all"))).await.unwrap();
        assert_eq!(
            templates.results,
            vec!["Ubuntu 64-bit (3)", "Windows 10", "Windows Server 2019"]
        );

        let clusters = s.registry.clusters(Target::All).await.unwrap();
        assert_eq!(clusters.results[&ProviderName::Vmware], vec!["vmware-cluster"]);
        assert_eq!(clusters.results[&ProviderName::Nutanix], vec!["nutanix-cluster"]);

        let networks = s.registry.networks(Target::from(Some("vmware"))).await.unwrap();
        assert_eq!(networks.results.len(), 1);
    }

    #[tokio::test]
    async fn default_provider_can_be_switched_and_persisted() {
        let s = setup(entry(true, json!({})), entry(true, json!({})), (100, 110));
        assert_eq!(s.registry.get(None).unwrap().name(), ProviderName::Vmware);

        s.registry.set_default_provider("nutanix").await.unwrap();
        assert_eq!(s.registry.get(None).unwrap().name(), ProviderName::Nutanix);
        let saved = HypervisorConfig::load_or_init(s.registry.config_path()).await.unwrap();
        assert_eq!(saved.default_provider, "nutanix");

        s.registry
            .update_config("nutanix", entry(false, json!({})))
            .await
            .unwrap();
        assert!(matches!(s.registry.get(None), Err(Error::ProviderDisabled(_))));
        assert!(matches!(
            s.registry.set_default_provider("nutanix").await,
            Err(Error::ProviderDisabled(_))
        ));
        assert!(matches!(
            s.registry.set_default_provider("xen").await,
            Err(Error::ProviderNotFound(_))
        ));
        assert_eq!(
            s.registry.available_providers().await,
            vec!["nutanix".to_string(), "vmware".to_string()]
        );
    }

    #[tokio::test]
    async fn connect_all_reports_each_live_provider() {
        let s = setup(entry(true, json!({})), entry(true, json!({ "fail": true })), (100, 110));
        let connected = s.registry.connect_all().await;
        assert!(connected[&ProviderName::Vmware]);
        assert!(!connected[&ProviderName::Nutanix]);
        s.registry.disconnect_all().await;

        let console = s.registry.open_console(Some("vmware"), "web").await.unwrap();
        assert_eq!(console.url.as_deref(), Some("https://console/web"));
    }
}
