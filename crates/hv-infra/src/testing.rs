use std::sync::Mutex;

use async_trait::async_trait;
use vmware_cli::{CommandOutput, CommandRunner, CommandSpec};

type Handler = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

/// Answers every invocation from a closure and records what was asked.
pub struct ScriptedRunner {
    calls: Mutex<Vec<CommandSpec>>,
    handler: Handler,
}

impl ScriptedRunner {
    pub fn new(handler: impl Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Argument lists of every call that mentions `subcommand`.
    pub fn calls_to(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.args.iter().any(|a| a == subcommand))
            .map(|c| c.args)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> vmware_cli::Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        Ok((self.handler)(spec))
    }

    async fn spawn_detached(&self, spec: &CommandSpec) -> vmware_cli::Result<()> {
        self.calls.lock().unwrap().push(spec.clone());
        Ok(())
    }
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.into(),
        ..Default::default()
    }
}

pub fn fail(stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stderr: stderr.into(),
        ..Default::default()
    }
}
