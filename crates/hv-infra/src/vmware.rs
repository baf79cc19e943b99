//! VMware Workstation backend.
//!
//! Lifecycle goes through `vmrun`, from-scratch builds through the Packer
//! fallback pipeline. Each VM is a directory under the base directory holding
//! `<name>.vmx`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vmware_cli::{
    CommandRunner, CommandSpec, GuestCredentials, Packer, PackerBuild, StopMode, Vmrun, VmxFile,
};

use crate::build::{BuildPipeline, StageTimeouts, vmx_files};
use crate::config::VmwareSettings;
use crate::types::{ConsoleInfo, ConsoleKind, PowerState, VmConfig, VmCreated, VmInfo};
use crate::{Error, Provider, ProviderName, Result, validate_config};

const CLONED_DIR: &str = "cloned-vms";
const PERMANENT_DIR: &str = "permanent_vms";
const CREATED_DIR: &str = "createdMachines";

const TOOLS_POLL: Duration = Duration::from_secs(10);
const GUEST_NETPLAN: &str = "/tmp/01-netcfg.yaml";
const DEFAULT_DNS: &str = "8.8.8.8";
const SECONDARY_DNS: &str = "8.8.4.4";
const WINDOWS_SHELL: &str = r"C:\Windows\System32\cmd.exe";
const WINDOWS_NIC: &str = "Ethernet";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuestFamily {
    Linux,
    Windows,
}

impl GuestFamily {
    /// From the `guestOS` key. Anything that is not Windows is treated as Linux.
    fn of(vmx: &VmxFile) -> Self {
        match vmx.guest_os() {
            Some(os) if os.to_ascii_lowercase().contains("windows") => Self::Windows,
            _ => Self::Linux,
        }
    }
}

pub struct VmwareProvider {
    settings: VmwareSettings,
    vmrun: Vmrun,
    pipeline: BuildPipeline,
    runner: Arc<dyn CommandRunner>,
}

impl VmwareProvider {
    pub fn new(settings: VmwareSettings, runner: Arc<dyn CommandRunner>) -> Self {
        let guest = match (&settings.guest_user, &settings.guest_password) {
            (Some(user), Some(password)) => Some(GuestCredentials {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        let vmrun = Vmrun::new(&settings.vmrun_path, runner.clone()).with_guest_credentials(guest);
        let packer = Packer::new(
            &settings.packer_path,
            &settings.base_directory,
            runner.clone(),
        );
        let timeouts = StageTimeouts {
            fast: Duration::from_secs(settings.fast_timeout_secs),
            headless: Duration::from_secs(settings.headless_timeout_secs),
            gui: Duration::from_secs(settings.gui_timeout_secs),
        };

        Self {
            pipeline: BuildPipeline::new(packer, vmrun.clone(), timeouts),
            vmrun,
            settings,
            runner,
        }
    }

    /// Template directory name for a friendly name such as `ubuntu`.
    fn resolve_template<'a>(&'a self, name: &'a str) -> &'a str {
        self.settings
            .template_aliases
            .get(&name.to_lowercase())
            .map(String::as_str)
            .unwrap_or(name)
    }

    /// Managed locations first, then the templates directory.
    async fn find_vmx(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return None;
        }
        let base = &self.settings.base_directory;
        for dir in [CLONED_DIR, PERMANENT_DIR, CREATED_DIR] {
            let candidate = base.join(dir).join(name).join(format!("{name}.vmx"));
            if exists(&candidate).await {
                return Some(absolute(candidate).await);
            }
        }
        let template = vmx_files(&self.settings.templates_directory.join(name))
            .await
            .into_iter()
            .next()?;
        Some(absolute(template).await)
    }

    async fn require_vmx(&self, name: &str) -> Result<PathBuf> {
        self.find_vmx(name)
            .await
            .ok_or_else(|| Error::not_found("vm", name))
    }

    async fn is_template(&self, vmx: &Path) -> bool {
        let templates = absolute(self.settings.templates_directory.clone()).await;
        vmx.starts_with(templates)
    }

    /// Running VM paths. A failing `vmrun list` reads as "nothing running".
    async fn running(&self) -> Vec<PathBuf> {
        match self.vmrun.list().await {
            Ok(paths) => paths,
            Err(e) => {
                warn!("vmrun list failed: {e}");
                Vec::new()
            }
        }
    }

    async fn describe(&self, name: &str, vmx: &Path, running: &[PathBuf]) -> Result<VmInfo> {
        let definition = VmxFile::load(vmx).await?;
        let is_running = running.iter().any(|p| p == vmx);
        let ip_address = if is_running {
            self.vmrun.guest_ip(vmx).await.unwrap_or_else(|e| {
                debug!(vm = name, "guest ip unavailable: {e}");
                None
            })
        } else {
            None
        };

        Ok(VmInfo {
            name: name.to_string(),
            id: vmx.display().to_string(),
            state: if is_running {
                PowerState::Running
            } else {
                PowerState::Stopped
            },
            cpu: u32::try_from(definition.get_u64("numvcpus", 2)).unwrap_or(u32::MAX),
            ram: definition.get_u64("memsize", 2048),
            // Disk capacity lives in the vmdk descriptors, not the vmx.
            disk: 0,
            ip_address,
            provider: ProviderName::Vmware,
            cluster: None,
        })
    }

    /// Apply sizing (clone only) and the persistence fix-up to a fresh definition.
    async fn finalize(&self, vmx: &Path, sizing: Option<(u32, u64)>) -> Result<()> {
        let mut definition = VmxFile::load(vmx).await?;
        if let Some((cpu, ram)) = sizing {
            definition.set("numvcpus", &cpu.to_string());
            definition.set("memsize", &ram.to_string());
        }
        if definition.apply_persistence_fixes() {
            debug!(vmx = %vmx.display(), "persistence settings rewritten");
        }
        definition.save(vmx).await?;
        Ok(())
    }

    fn build_request(&self, config: &VmConfig) -> PackerBuild {
        let env = [
            ("VM_NAME", config.name.clone()),
            ("OS_TYPE", config.os_type.clone()),
            ("CPU", config.cpu.to_string()),
            ("RAM", config.ram.to_string()),
            ("SSD", config.disk.to_string()),
            ("IP_ADDRESS", config.ip_address.clone().unwrap_or_default()),
        ];
        PackerBuild {
            vm_name: config.name.clone(),
            cpu: config.cpu,
            ram_mib: config.ram,
            disk_gib: config.disk,
            env: env.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            ..Default::default()
        }
    }

    async fn pin_iso(&self, build: &mut PackerBuild) {
        let Some(iso) = &self.settings.iso_path else {
            return;
        };
        build.iso_url = Some(format!(
            "file://{}",
            iso.display().to_string().replace('\\', "/")
        ));
        if !exists(iso).await {
            warn!(iso = %iso.display(), "configured ISO not found, building without checksum");
            return;
        }
        match iso_checksum(iso).await {
            Ok(sum) => build.iso_checksum = Some(sum),
            Err(e) => warn!(iso = %iso.display(), "could not hash ISO: {e}"),
        }
    }

    // ── Guest networking ─────────────────────────────────────────────

    /// Apply a static address inside the guest. Never fails the caller.
    async fn assign_ip(&self, vmx: &Path, config: &VmConfig, ip: &str) -> bool {
        match self.configure_guest_ip(vmx, config, ip).await {
            Ok(()) => {
                info!(vm = %config.name, ip, "static ip applied");
                true
            }
            Err(e) => {
                warn!(vm = %config.name, ip, "static ip not applied: {e}");
                false
            }
        }
    }

    async fn configure_guest_ip(&self, vmx: &Path, config: &VmConfig, ip: &str) -> Result<()> {
        if !self.vmrun.is_running(vmx).await? {
            self.vmrun.start(vmx, false).await?;
        }
        if !self.wait_for_tools(vmx).await {
            return Err(vmware_cli::Error::TimedOut {
                command: "vmrun checkToolsState".into(),
                secs: self.settings.tools_timeout_secs,
            }
            .into());
        }

        let gateway = config
            .gateway
            .clone()
            .unwrap_or_else(|| default_gateway(ip));
        let dns = config.dns.as_deref().unwrap_or(DEFAULT_DNS);

        match GuestFamily::of(&VmxFile::load(vmx).await?) {
            GuestFamily::Linux => {
                let netplan = netplan_config(ip, &gateway, dns);
                let host_file =
                    std::env::temp_dir().join(format!("{}-01-netcfg.yaml", config.name));
                tokio::fs::write(&host_file, netplan).await?;
                let copied = self.vmrun.copy_to_guest(vmx, &host_file, GUEST_NETPLAN).await;
                if let Err(e) = tokio::fs::remove_file(&host_file).await {
                    debug!(file = %host_file.display(), "temp netplan not removed: {e}");
                }
                copied?;

                for command in [
                    format!("sudo mv {GUEST_NETPLAN} /etc/netplan/01-netcfg.yaml"),
                    "sudo chmod 600 /etc/netplan/01-netcfg.yaml".to_string(),
                    "sudo netplan apply".to_string(),
                ] {
                    self.guest_run(vmx, "/bin/bash", &["-c", &command]).await?;
                }
            }
            GuestFamily::Windows => {
                for command in [
                    format!(
                        "netsh interface ip set address \"{WINDOWS_NIC}\" static {ip} 255.255.255.0 {gateway}"
                    ),
                    format!("netsh interface ip set dns \"{WINDOWS_NIC}\" static {dns}"),
                    format!("netsh interface ip add dns \"{WINDOWS_NIC}\" {SECONDARY_DNS} index=2"),
                ] {
                    self.guest_run(vmx, WINDOWS_SHELL, &["/c", &command]).await?;
                }
            }
        }
        Ok(())
    }

    async fn wait_for_tools(&self, vmx: &Path) -> bool {
        let deadline = Instant::now() + Duration::from_secs(self.settings.tools_timeout_secs);
        loop {
            match self.vmrun.tools_running(vmx).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => debug!(vmx = %vmx.display(), "tools probe failed: {e}"),
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(TOOLS_POLL.min(deadline - now)).await;
        }
    }

    async fn guest_run(&self, vmx: &Path, program: &str, args: &[&str]) -> Result<()> {
        let out = self.vmrun.run_in_guest(vmx, program, args).await?;
        if out.success() {
            return Ok(());
        }
        Err(vmware_cli::Error::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            code: out.code,
            stderr: out.diagnostics().trim().to_string(),
        }
        .into())
    }

    /// GUI binary: the configured path, else `vmware` next to `vmrun`.
    fn workstation_binary(&self) -> PathBuf {
        if let Some(path) = &self.settings.workstation_path {
            return path.clone();
        }
        let vmrun = &self.settings.vmrun_path;
        let mut gui = vmrun.with_file_name("vmware");
        if let Some(ext) = vmrun.extension() {
            gui.set_extension(ext);
        }
        gui
    }
}

#[async_trait]
impl Provider for VmwareProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Vmware
    }

    async fn connect(&self) -> Result<()> {
        self.vmrun.list().await?;
        Ok(())
    }

    async fn create_vm(&self, config: &VmConfig) -> Result<VmCreated> {
        validate_config(config)?;
        if self.find_vmx(&config.name).await.is_some() {
            return Err(Error::AlreadyExists(format!("vm {}", config.name)));
        }

        let mut build = self.build_request(config);
        self.pin_iso(&mut build).await;

        info!(vm = %config.name, cpu = config.cpu, ram = config.ram, disk = config.disk, "building vm");
        let stage = self.pipeline.run(&build).await?;

        let Some(vmx) = self.find_vmx(&config.name).await else {
            warn!(vm = %config.name, %stage, "build finished without producing a definition");
            return Err(Error::not_found("built vm definition", config.name.clone()));
        };
        self.finalize(&vmx, None).await?;

        Ok(VmCreated {
            name: config.name.clone(),
            provider: ProviderName::Vmware,
            id: Some(vmx.display().to_string()),
            ip_address: config.ip_address.clone(),
            stage: Some(stage.to_string()),
            ip_configured: None,
            message: format!("VM '{}' created by the {stage} build", config.name),
        })
    }

    async fn clone_vm(&self, source: &str, config: &VmConfig) -> Result<VmCreated> {
        validate_config(config)?;

        let template = self.resolve_template(source);
        let src = vmx_files(&self.settings.templates_directory.join(template))
            .await
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("template", template))?;

        let dest_dir = self
            .settings
            .base_directory
            .join(CLONED_DIR)
            .join(&config.name);
        if exists(&dest_dir).await {
            return Err(Error::AlreadyExists(dest_dir.display().to_string()));
        }
        let dest = dest_dir.join(format!("{}.vmx", config.name));

        info!(vm = %config.name, template, "cloning vm");
        let cloned = self
            .vmrun
            .clone_full(
                &src,
                &dest,
                &config.name,
                Duration::from_secs(self.settings.clone_timeout_secs),
            )
            .await;
        if let Err(e) = cloned {
            discard_partial(&dest_dir).await;
            return Err(e.into());
        }
        if let Err(e) = self.finalize(&dest, Some((config.cpu, config.ram))).await {
            discard_partial(&dest_dir).await;
            return Err(e);
        }
        let dest = absolute(dest).await;

        let ip_configured = match &config.ip_address {
            Some(ip) => Some(self.assign_ip(&dest, config, ip).await),
            None => {
                if self.settings.start_after_clone {
                    if let Err(e) = self.vmrun.start(&dest, false).await {
                        warn!(vm = %config.name, "clone finished but start failed: {e}");
                    }
                }
                None
            }
        };

        Ok(VmCreated {
            name: config.name.clone(),
            provider: ProviderName::Vmware,
            id: Some(dest.display().to_string()),
            ip_address: config.ip_address.clone(),
            stage: None,
            ip_configured,
            message: format!("VM '{}' cloned from {template}", config.name),
        })
    }

    async fn delete_vm(&self, name: &str) -> Result<()> {
        let vmx = self.require_vmx(name).await?;
        if self.is_template(&vmx).await {
            return Err(Error::Validation(format!(
                "{name} is a template and cannot be deleted"
            )));
        }

        if self.running().await.iter().any(|p| *p == vmx) {
            if let Err(e) = self.vmrun.stop(&vmx, StopMode::Hard).await {
                warn!(vm = name, "stop before delete failed: {e}");
            }
        }

        if let Some(dir) = vmx.parent() {
            tokio::fs::remove_dir_all(dir).await?;
        }
        info!(vm = name, "vm deleted");
        Ok(())
    }

    async fn start_vm(&self, name: &str) -> Result<()> {
        let vmx = self.require_vmx(name).await?;
        self.vmrun.start(&vmx, false).await?;
        info!(vm = name, "vm started");
        Ok(())
    }

    async fn stop_vm(&self, name: &str) -> Result<()> {
        let vmx = self.require_vmx(name).await?;
        self.vmrun.stop(&vmx, StopMode::Soft).await?;
        info!(vm = name, "vm stopped");
        Ok(())
    }

    async fn get_vm_info(&self, name: &str) -> Result<Option<VmInfo>> {
        let Some(vmx) = self.find_vmx(name).await else {
            return Ok(None);
        };
        let running = self.running().await;
        self.describe(name, &vmx, &running).await.map(Some)
    }

    async fn list_vms(&self) -> Result<Vec<VmInfo>> {
        let running = self.running().await;
        let mut vms = Vec::new();

        for dir in [CLONED_DIR, CREATED_DIR] {
            let root = self.settings.base_directory.join(dir);
            let Ok(mut entries) = tokio::fs::read_dir(&root).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let vmx = entry.path().join(format!("{name}.vmx"));
                if !exists(&vmx).await {
                    continue;
                }
                let vmx = absolute(vmx).await;
                match self.describe(&name, &vmx, &running).await {
                    Ok(info) => vms.push(info),
                    Err(e) => warn!(vm = %name, "skipping unreadable vm: {e}"),
                }
            }
        }

        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    async fn templates(&self) -> Result<Vec<String>> {
        Ok(self.settings.templates.clone())
    }

    async fn clusters(&self) -> Result<Vec<String>> {
        Ok(vec!["local".to_string()])
    }

    async fn networks(&self) -> Result<Vec<String>> {
        Ok(self.settings.networks.clone())
    }

    async fn create_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let vmx = self.require_vmx(name).await?;
        self.vmrun.snapshot(&vmx, snapshot).await?;
        info!(vm = name, snapshot, "snapshot created");
        Ok(())
    }

    async fn restore_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let vmx = self.require_vmx(name).await?;
        self.vmrun.revert_to_snapshot(&vmx, snapshot).await?;
        info!(vm = name, snapshot, "snapshot restored");
        Ok(())
    }

    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let vmx = self.require_vmx(name).await?;
        self.vmrun.delete_snapshot(&vmx, snapshot).await?;
        info!(vm = name, snapshot, "snapshot deleted");
        Ok(())
    }

    async fn open_console(&self, name: &str) -> Result<ConsoleInfo> {
        let vmx = self.require_vmx(name).await?;
        let mut spec = CommandSpec::new(self.workstation_binary(), Duration::from_secs(30))
            .arg(vmx.display().to_string());
        if let Some(dir) = vmx.parent() {
            spec = spec.current_dir(dir);
        }
        self.runner.spawn_detached(&spec).await?;

        Ok(ConsoleInfo {
            kind: ConsoleKind::Desktop,
            url: None,
            message: format!("Console opened for VM '{name}'"),
        })
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Remove what an unfinished clone left behind so the name can be reused.
async fn discard_partial(dir: &Path) {
    if !exists(dir).await {
        return;
    }
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(dir = %dir.display(), "partial clone not removed: {e}");
    }
}

async fn absolute(path: PathBuf) -> PathBuf {
    tokio::fs::canonicalize(&path).await.unwrap_or(path)
}

/// `sha256:<hex>` of a file, read in 1 MiB chunks.
async fn iso_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let hex: String = hasher.finalize().iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("sha256:{hex}"))
}

/// `.1` on the address's /24.
fn default_gateway(ip: &str) -> String {
    match ip.rsplit_once('.') {
        Some((net, _)) => format!("{net}.1"),
        None => ip.to_string(),
    }
}

fn netplan_config(ip: &str, gateway: &str, dns: &str) -> String {
    format!(
        "network:
  version: 2
  ethernets:
    ens33:
      dhcp4: false
      addresses:
        - {ip}/24
      gateway4: {gateway}
      nameservers:
        addresses:
          - {dns}
          - {SECONDARY_DNS}
"
    )
}
