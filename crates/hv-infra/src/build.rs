//! Three-tier desktop build: fast template clone, then unattended headless
//! install, then GUI install. Partial output is purged before every stage.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use vmware_cli::{Packer, PackerBuild, StopMode, Vmrun};

use crate::types::tail;
use crate::{Error, Result};

/// Builder failure output is logged up to this many trailing bytes.
const LOG_TAIL: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStage {
    Fast,
    Headless,
    Gui,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Headless => "headless",
            Self::Gui => "gui",
        }
    }

    /// Packer template for this tier.
    pub fn template(&self) -> &'static str {
        match self {
            Self::Fast => "build-fast.pkr.hcl",
            Self::Headless => "build-headless.pkr.hcl",
            Self::Gui => "build.pkr.hcl",
        }
    }

    /// Tier to try after this one fails.
    pub fn fallback(&self) -> Option<Self> {
        match self {
            Self::Fast => Some(Self::Headless),
            Self::Headless => Some(Self::Gui),
            Self::Gui => None,
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running(BuildStage),
    Succeeded(BuildStage),
    Failed(BuildStage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    Start,
    StageSucceeded,
    StageFailed,
}

impl PipelineState {
    /// Transition table. Events that do not apply leave the state unchanged.
    pub fn on(self, event: PipelineEvent) -> Self {
        use PipelineEvent::*;
        use PipelineState::*;

        match (self, event) {
            (Idle, Start) => Running(BuildStage::Fast),
            (Running(stage), StageSucceeded) => Succeeded(stage),
            (Running(stage), StageFailed) => match stage.fallback() {
                Some(next) => Running(next),
                None => Failed(stage),
            },
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub fast: Duration,
    pub headless: Duration,
    pub gui: Duration,
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: BuildStage) -> Duration {
        match stage {
            BuildStage::Fast => self.fast,
            BuildStage::Headless => self.headless,
            BuildStage::Gui => self.gui,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(300),
            headless: Duration::from_secs(900),
            gui: Duration::from_secs(1200),
        }
    }
}

pub struct BuildPipeline {
    packer: Packer,
    vmrun: Vmrun,
    timeouts: StageTimeouts,
}

impl BuildPipeline {
    pub fn new(packer: Packer, vmrun: Vmrun, timeouts: StageTimeouts) -> Self {
        Self {
            packer,
            vmrun,
            timeouts,
        }
    }

    /// Drive the fallback chain to a terminal state. Returns the stage that succeeded.
    pub async fn run(&self, build: &PackerBuild) -> Result<BuildStage> {
        let vm = build.vm_name.as_str();
        let mut state = PipelineState::Idle.on(PipelineEvent::Start);
        let mut last_output = String::new();

        loop {
            match state {
                PipelineState::Idle => state = state.on(PipelineEvent::Start),
                PipelineState::Running(stage) => {
                    self.purge_outputs(vm).await;
                    info!(vm, %stage, "starting build stage");

                    let output = match self
                        .packer
                        .build(build, stage.template(), self.timeouts.for_stage(stage))
                        .await
                    {
                        Ok(output) => output,
                        Err(e) => {
                            self.purge_outputs(vm).await;
                            return Err(e.into());
                        }
                    };

                    if output.success() {
                        state = state.on(PipelineEvent::StageSucceeded);
                        continue;
                    }

                    last_output = output.diagnostics().to_string();
                    warn!(
                        vm,
                        %stage,
                        code = ?output.code,
                        timed_out = output.timed_out,
                        output = tail(&last_output, LOG_TAIL),
                        "build stage failed"
                    );
                    state = state.on(PipelineEvent::StageFailed);
                }
                PipelineState::Succeeded(stage) => {
                    info!(vm, %stage, "build succeeded");
                    return Ok(stage);
                }
                PipelineState::Failed(stage) => {
                    self.purge_outputs(vm).await;
                    return Err(Error::BuildFailed {
                        stage,
                        output: last_output,
                    });
                }
            }
        }
    }

    /// Output directories Packer may leave behind for `vm`. Builds for other
    /// names write elsewhere, so concurrent builds never purge each other.
    pub fn output_dirs(&self, vm: &str) -> Vec<PathBuf> {
        let root = self.packer.workdir();
        [format!("output-{vm}"), format!("{vm}_Output")]
            .into_iter()
            .map(|dir| root.join(dir))
            .collect()
    }

    /// Best-effort: stop any VM running from a stale output directory, then delete it.
    async fn purge_outputs(&self, vm: &str) {
        for dir in self.output_dirs(vm) {
            if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                continue;
            }
            for vmx in vmx_files(&dir).await {
                if let Err(e) = self.vmrun.stop(&vmx, StopMode::Hard).await {
                    tracing::debug!(vmx = %vmx.display(), "stop before purge: {e}");
                }
            }
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!(vm, dir = %dir.display(), "purged build output"),
                Err(e) => warn!(vm, dir = %dir.display(), "could not purge build output: {e}"),
            }
        }
    }
}

pub(crate) async fn vmx_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return found;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("vmx")) {
            found.push(path);
        }
    }
    found.sort();
    found
}
