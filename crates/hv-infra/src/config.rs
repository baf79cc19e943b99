use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::{Error, ProviderName, Result};

pub const DEFAULT_CONFIG_FILE: &str = "hypervisor_config.json";

/// Persisted provider configuration (`hypervisor_config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypervisorConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderEntry>,
    #[serde(default)]
    pub ip_pool: IpPoolConfig,
}

fn default_provider() -> String {
    ProviderName::Vmware.as_str().into()
}

/// One provider's block: the enabled flag plus backend-specific fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl ProviderEntry {
    pub fn new<T: Serialize>(enabled: bool, settings: &T) -> Result<Self> {
        match serde_json::to_value(settings) {
            Ok(Value::Object(settings)) => Ok(Self { enabled, settings }),
            Ok(_) => Err(Error::Config("provider settings must be an object".into())),
            Err(e) => Err(Error::Config(e.to_string())),
        }
    }

    /// Decode the backend-specific fields into their typed record.
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.settings.clone()))
            .map_err(|e| Error::Config(format!("invalid provider settings: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpPoolConfig {
    pub prefix: String,
    pub start: u8,
    pub end: u8,
    pub file: PathBuf,
}

impl IpPoolConfig {
    /// The same pool with a relative `file` anchored at `dir`.
    pub fn relative_to(&self, dir: &Path) -> Self {
        Self {
            file: dir.join(&self.file),
            ..self.clone()
        }
    }
}

impl Default for IpPoolConfig {
    fn default() -> Self {
        Self {
            prefix: "192.168.122".into(),
            start: 100,
            end: 200,
            file: PathBuf::from("ips.txt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmwareSettings {
    pub vmrun_path: PathBuf,
    pub packer_path: PathBuf,
    /// GUI binary used by `open_console`. Defaults to `vmware` next to `vmrun`.
    pub workstation_path: Option<PathBuf>,
    pub base_directory: PathBuf,
    pub templates_directory: PathBuf,
    pub iso_path: Option<PathBuf>,
    /// Friendly name (matched case-insensitively) to template directory name.
    pub template_aliases: BTreeMap<String, String>,
    pub templates: Vec<String>,
    pub networks: Vec<String>,
    pub guest_user: Option<String>,
    pub guest_password: Option<String>,
    pub fast_timeout_secs: u64,
    pub headless_timeout_secs: u64,
    pub gui_timeout_secs: u64,
    pub clone_timeout_secs: u64,
    pub tools_timeout_secs: u64,
    pub start_after_clone: bool,
}

impl Default for VmwareSettings {
    fn default() -> Self {
        let aliases = [
            ("windowsserver2019", "Windows Server 2019"),
            ("windows server 2019", "Windows Server 2019"),
            ("ubuntu", "Ubuntu 64-bit (3)"),
            ("ubuntu3", "Ubuntu 64-bit (3)"),
            ("ubuntu 3", "Ubuntu 64-bit (3)"),
            ("ubuntu 64-bit (3)", "Ubuntu 64-bit (3)"),
        ];
        Self {
            vmrun_path: PathBuf::from("vmrun"),
            packer_path: PathBuf::from("packer"),
            workstation_path: None,
            base_directory: PathBuf::from("."),
            templates_directory: PathBuf::from("templates"),
            iso_path: None,
            template_aliases: aliases
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            templates: vec!["Ubuntu 64-bit (3)".into(), "Windows Server 2019".into()],
            networks: vec!["NAT".into(), "Bridged".into(), "Host-only".into()],
            guest_user: None,
            guest_password: None,
            fast_timeout_secs: 300,
            headless_timeout_secs: 900,
            gui_timeout_secs: 1200,
            clone_timeout_secs: 1800,
            tools_timeout_secs: 300,
            start_after_clone: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutanixSettings {
    pub prism_central_ip: String,
    pub prism_element_ip: Option<String>,
    pub username: String,
    pub password: String,
    pub port: u16,
    pub use_ssl: bool,
    pub verify_ssl: bool,
    /// Curated template list reported by `templates()`.
    pub templates: Vec<String>,
    pub task_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub storage_container: Option<String>,
}

impl Default for NutanixSettings {
    fn default() -> Self {
        Self {
            prism_central_ip: "127.0.0.1".into(),
            prism_element_ip: None,
            username: "admin".into(),
            password: String::new(),
            port: 9440,
            use_ssl: true,
            verify_ssl: false,
            templates: vec!["Windows Server 2019".into(), "Ubuntu 64-bit (3)".into()],
            task_timeout_secs: 120,
            poll_interval_secs: 5,
            request_timeout_secs: 30,
            storage_container: None,
        }
    }
}

impl HypervisorConfig {
    /// Built-in configuration: both backends enabled, desktop first.
    pub fn builtin() -> Result<Self> {
        let mut providers = BTreeMap::new();
        providers.insert(
            ProviderName::Vmware.as_str().to_string(),
            ProviderEntry::new(true, &VmwareSettings::default())?,
        );
        providers.insert(
            ProviderName::Nutanix.as_str().to_string(),
            ProviderEntry::new(true, &NutanixSettings::default())?,
        );
        Ok(Self {
            default_provider: default_provider(),
            providers,
            ip_pool: IpPoolConfig::default(),
        })
    }

    /// Read the file, or write and return the built-in default when it does not exist.
    pub async fn load_or_init(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::builtin()?;
                config.save(path).await?;
                info!(path = %path.display(), "wrote default hypervisor config");
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite the whole file (temp file plus rename).
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub fn entry(&self, name: ProviderName) -> Option<&ProviderEntry> {
        self.providers.get(name.as_str())
    }
}
