use std::io;
use std::process::{Command, Output};

use thiserror::Error;

/// Failure of an external controller invocation.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The controller program could not be run at all
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The controller ran but reported failure
    #[error("{program} {action} {target} exited with {status}: {output}")]
    Failed {
        program: String,
        action: &'static str,
        target: String,
        status: String,
        output: String,
    },
}

/// Queries and starts targets by name.
///
/// Both calls block until the external tool returns.
pub trait Controller: Send + Sync {
    fn is_running(&self, name: &str) -> Result<bool, ControlError>;

    fn start(&self, name: &str) -> Result<(), ControlError>;
}

/// libvirt's `virsh` command line tool.
#[derive(Debug, Clone)]
pub struct Virsh {
    program: String,
}

impl Default for Virsh {
    fn default() -> Self {
        Self::new("virsh")
    }
}

impl Virsh {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn run(&self, action: &'static str, name: &str) -> Result<String, ControlError> {
        let Output { status, stdout, stderr } = Command::new(&self.program)
            .arg(action)
            .arg(name)
            .output()
            .map_err(|source| ControlError::Spawn { program: self.program.clone(), source })?;

        let mut output = String::from_utf8_lossy(&stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&stderr));
        let output = output.trim().to_string();

        if !status.success() {
            return Err(ControlError::Failed {
                program: self.program.clone(),
                action,
                target: name.to_string(),
                status: status.to_string(),
                output,
            });
        }
        Ok(output)
    }
}

impl Controller for Virsh {
    fn is_running(&self, name: &str) -> Result<bool, ControlError> {
        self.run("domstate", name).map(|state| state_is_running(&state))
    }

    fn start(&self, name: &str) -> Result<(), ControlError> {
        let output = self.run("start", name)?;
        log::debug!("[controller] {} start {}: {}", self.program, name, output);
        Ok(())
    }
}

/// `virsh domstate` prints `running`, `idle`, `paused`, `shut off`, ...
pub fn state_is_running(state: &str) -> bool {
    let state = state.trim().to_lowercase();
    state.contains("running") || state.contains("idle")
}
