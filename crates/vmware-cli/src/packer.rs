use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::Result;

/// Variables and environment handed to one `packer build`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackerBuild {
    pub vm_name: String,
    pub cpu: u32,
    pub ram_mib: u64,
    pub disk_gib: u64,
    pub iso_url: Option<String>,
    pub iso_checksum: Option<String>,
    pub env: Vec<(String, String)>,
}

impl PackerBuild {
    /// Scratch directory, relative to the workdir, owned by this VM's build.
    pub fn output_directory(&self) -> String {
        format!("output-{}", self.vm_name)
    }

    fn vars(&self) -> Vec<String> {
        let mut vars = vec![
            format!("vm_name={}", self.vm_name),
            format!("output_directory={}", self.output_directory()),
            format!("cpu={}", self.cpu),
            format!("ram={}", self.ram_mib),
            format!("disk_gb={}", self.disk_gib),
        ];
        if let Some(url) = &self.iso_url {
            vars.push(format!("iso_url={url}"));
        }
        if let Some(sum) = &self.iso_checksum {
            vars.push(format!("iso_checksum={sum}"));
        }
        vars
    }
}

/// Wrapper around the Packer image builder.
#[derive(Clone)]
pub struct Packer {
    path: PathBuf,
    workdir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl Packer {
    pub fn new(
        path: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            path: path.into(),
            workdir: workdir.into(),
            runner,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn build_spec(&self, build: &PackerBuild, template: &str, timeout: Duration) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.path, timeout)
            .args(["build", "-on-error=abort"])
            .current_dir(&self.workdir);
        for var in build.vars() {
            spec = spec.args(["-var".to_string(), var]);
        }
        for (key, value) in &build.env {
            spec = spec.env(key, value);
        }
        spec.arg(template)
    }

    /// Run one build. A failed or timed-out build is returned as output, not raised.
    pub async fn build(
        &self,
        build: &PackerBuild,
        template: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.runner
            .run(&self.build_spec(build, template, timeout))
            .await
    }
}
