use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::Result;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Soft,
    Hard,
}

impl StopMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }
}

/// Guest account used by the in-guest subcommands (`-gu` / `-gp`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCredentials {
    pub user: String,
    pub password: String,
}

/// Wrapper around the `vmrun` control CLI.
#[derive(Clone)]
pub struct Vmrun {
    path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    guest: Option<GuestCredentials>,
}

impl Vmrun {
    pub fn new(path: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            path: path.into(),
            runner,
            timeout: DEFAULT_TIMEOUT,
            guest: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_guest_credentials(mut self, guest: Option<GuestCredentials>) -> Self {
        self.guest = guest;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(&self.path, self.timeout).args(args)
    }

    fn guest_spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = CommandSpec::new(&self.path, self.timeout);
        if let Some(guest) = &self.guest {
            spec = spec.args(["-gu", &guest.user, "-gp", &guest.password]);
        }
        spec.args(args)
    }

    async fn exec(&self, spec: CommandSpec) -> Result<CommandOutput> {
        self.runner.run(&spec).await?.into_result(&spec)
    }

    // ── Inventory ────────────────────────────────────────────────────

    /// Paths of the running VMs, as reported by `vmrun list`.
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let out = self.exec(self.spec(["list"])).await?;
        Ok(parse_list(&out.stdout))
    }

    pub async fn is_running(&self, vmx: &Path) -> Result<bool> {
        Ok(self.list().await?.iter().any(|p| p == vmx))
    }

    /// Guest IP via VMware Tools. `None` when the guest cannot report one yet.
    pub async fn guest_ip(&self, vmx: &Path) -> Result<Option<String>> {
        let spec = self
            .spec(["getGuestIPAddress", &display(vmx)])
            .with_timeout(Duration::from_secs(10));
        let out = self.runner.run(&spec).await?;
        let ip = out.stdout.trim();
        if !out.success() || ip.is_empty() || ip.starts_with("Error") {
            return Ok(None);
        }
        Ok(Some(ip.to_string()))
    }

    pub async fn tools_running(&self, vmx: &Path) -> Result<bool> {
        let spec = self
            .spec(["checkToolsState", &display(vmx)])
            .with_timeout(Duration::from_secs(30));
        let out = self.runner.run(&spec).await?;
        Ok(out.success() && out.stdout.to_lowercase().contains("running"))
    }

    // ── Power ────────────────────────────────────────────────────────

    pub async fn start(&self, vmx: &Path, gui: bool) -> Result<()> {
        let mut args = vec!["start".to_string(), display(vmx)];
        if !gui {
            args.push("nogui".into());
        }
        self.exec(self.spec(args)).await.map(drop)
    }

    pub async fn stop(&self, vmx: &Path, mode: StopMode) -> Result<()> {
        self.exec(self.spec(["stop", &display(vmx), mode.as_str()]))
            .await
            .map(drop)
    }

    // ── Cloning and snapshots ────────────────────────────────────────

    /// Full (independent) clone of `source` into `dest`.
    pub async fn clone_full(
        &self,
        source: &Path,
        dest: &Path,
        clone_name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let spec = self
            .spec([
                "clone".to_string(),
                display(source),
                display(dest),
                "full".into(),
                format!("-cloneName={clone_name}"),
            ])
            .with_timeout(timeout);
        self.exec(spec).await.map(drop)
    }

    pub async fn snapshot(&self, vmx: &Path, name: &str) -> Result<()> {
        self.exec(self.spec(["snapshot", &display(vmx), name]))
            .await
            .map(drop)
    }

    pub async fn revert_to_snapshot(&self, vmx: &Path, name: &str) -> Result<()> {
        self.exec(self.spec(["revertToSnapshot", &display(vmx), name]))
            .await
            .map(drop)
    }

    pub async fn delete_snapshot(&self, vmx: &Path, name: &str) -> Result<()> {
        self.exec(self.spec(["deleteSnapshot", &display(vmx), name]))
            .await
            .map(drop)
    }

    // ── Guest operations ─────────────────────────────────────────────

    pub async fn copy_to_guest(&self, vmx: &Path, host: &Path, guest: &str) -> Result<()> {
        self.exec(self.guest_spec([
            "CopyFileFromHostToGuest".to_string(),
            display(vmx),
            display(host),
            guest.to_string(),
        ]))
        .await
        .map(drop)
    }

    /// Run a program inside the guest. Non-zero exits are returned, not raised.
    pub async fn run_in_guest(
        &self,
        vmx: &Path,
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput> {
        let mut full = vec!["runProgramInGuest".to_string(), display(vmx), program.to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        self.runner.run(&self.guest_spec(full)).await
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn parse_list(stdout: &str) -> Vec<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("Total running VMs"))
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Records every spec and answers from a queue (success when empty).
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<CommandSpec>>,
        replies: Mutex<VecDeque<CommandOutput>>,
    }

    impl Recorder {
        fn reply(&self, code: i32, stdout: &str) {
            self.replies.lock().unwrap().push_back(CommandOutput {
                code: Some(code),
                stdout: stdout.into(),
                ..Default::default()
            });
        }

        fn args(&self) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.args.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            Ok(self.replies.lock().unwrap().pop_front().unwrap_or(CommandOutput {
                code: Some(0),
                ..Default::default()
            }))
        }

        async fn spawn_detached(&self, spec: &CommandSpec) -> Result<()> {
            self.calls.lock().unwrap().push(spec.clone());
            Ok(())
        }
    }

    fn vmrun(recorder: &Arc<Recorder>) -> Vmrun {
        Vmrun::new("vmrun", recorder.clone())
    }

    #[tokio::test]
    async fn list_parses_running_paths() {
        let rec = Arc::new(Recorder::default());
        rec.reply(0, "Total running VMs: 2\n/vms/a/a.vmx\n/vms/b/b.vmx\n");
        let vmrun = vmrun(&rec);

        let running = vmrun.list().await.unwrap();
        assert_eq!(running, vec![PathBuf::from("/vms/a/a.vmx"), PathBuf::from("/vms/b/b.vmx")]);

        rec.reply(0, "Total running VMs: 1\n/vms/a/a.vmx\n");
        assert!(!vmrun.is_running(Path::new("/vms/b/b.vmx")).await.unwrap());
    }

    #[tokio::test]
    async fn subcommands_use_cli_argument_order() {
        let rec = Arc::new(Recorder::default());
        let vmrun = vmrun(&rec);
        let vmx = Path::new("/vms/web/web.vmx");

        vmrun.start(vmx, false).await.unwrap();
        vmrun.stop(vmx, StopMode::Hard).await.unwrap();
        vmrun
            .clone_full(
                Path::new("/t/ubuntu/ubuntu.vmx"),
                vmx,
                "web",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        vmrun.snapshot(vmx, "pre").await.unwrap();
        vmrun.revert_to_snapshot(vmx, "pre").await.unwrap();
        vmrun.delete_snapshot(vmx, "pre").await.unwrap();

        assert_eq!(
            rec.args(),
            vec![
                vec!["start", "/vms/web/web.vmx", "nogui"],
                vec!["stop", "/vms/web/web.vmx", "hard"],
                vec!["clone", "/t/ubuntu/ubuntu.vmx", "/vms/web/web.vmx", "full", "-cloneName=web"],
                vec!["snapshot", "/vms/web/web.vmx", "pre"],
                vec!["revertToSnapshot", "/vms/web/web.vmx", "pre"],
                vec!["deleteSnapshot", "/vms/web/web.vmx", "pre"],
            ]
        );
    }

    #[tokio::test]
    async fn guest_commands_carry_credentials() {
        let rec = Arc::new(Recorder::default());
        let vmrun = vmrun(&rec).with_guest_credentials(Some(GuestCredentials {
            user: "ubuntu".into(),
            password: "pw".into(),
        }));
        let vmx = Path::new("/vms/web/web.vmx");

        vmrun
            .run_in_guest(vmx, "/bin/bash", &["-c", "sudo netplan apply"])
            .await
            .unwrap();

        assert_eq!(
            rec.args()[0],
            vec![
                "-gu", "ubuntu", "-gp", "pw", "runProgramInGuest", "/vms/web/web.vmx",
                "/bin/bash", "-c", "sudo netplan apply"
            ]
        );
    }

    #[tokio::test]
    async fn guest_ip_and_tools_state_are_soft() {
        let rec = Arc::new(Recorder::default());
        let vmrun = vmrun(&rec);
        let vmx = Path::new("/vms/web/web.vmx");

        rec.reply(255, "Error: The VMware Tools are not running in the virtual machine\n");
        assert_eq!(vmrun.guest_ip(vmx).await.unwrap(), None);

        rec.reply(0, "192.168.122.140\n");
        assert_eq!(
            vmrun.guest_ip(vmx).await.unwrap().as_deref(),
            Some("192.168.122.140")
        );

        rec.reply(0, "The VMware Tools are running in the guest\n");
        assert!(vmrun.tools_running(vmx).await.unwrap());
    }

    #[tokio::test]
    async fn failed_subcommand_is_an_error() {
        let rec = Arc::new(Recorder::default());
        rec.reply(255, "Error: Cannot open VM: /nope.vmx\n");
        let err = vmrun(&rec).start(Path::new("/nope.vmx"), false).await.unwrap_err();
        assert!(matches!(err, crate::Error::CommandFailed { .. }));
    }
}
