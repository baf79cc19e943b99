//! Typed wrappers for the VMware Workstation control CLI (`vmrun`) and the
//! Packer image builder, plus the `.vmx` machine-definition codec.
//!
//! Every invocation goes through a [`CommandRunner`], which bounds its
//! duration and kills the child process when the bound is exceeded.

mod packer;
mod runner;
mod vmrun;
mod vmx;

pub use packer::{Packer, PackerBuild};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use vmrun::{GuestCredentials, StopMode, Vmrun};
pub use vmx::VmxFile;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{command} timed out after {secs}s")]
    TimedOut { command: String, secs: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
