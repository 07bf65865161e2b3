use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, error};

use super::pool::VmDriver;
use super::{MachineError, MachineResult};
use crate::models::Machine;

/// Driver shelling out to a machine control program.
///
/// The program is invoked as `<command> <action> <label> [args...]` and
/// must exit with status 0 on success. Supported actions: `restore`,
/// `start`, `stop`, `stop-safe`, `dump-memory`, `remote-control`.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    command: String,
}

impl CommandDriver {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn run(&self, action: &str, machine: &Machine, args: &[&str]) -> Result<(), String> {
        let mut cmd = Command::new(&self.command);
        cmd.arg(action).arg(&machine.label).args(args);

        debug!("Machine control command: {:?}", cmd);

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.command, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(vmname = %machine.name, action, "Machine control failed: {}", stderr.trim());
            return Err(format!("{} {} exited with {}: {}", action, machine.label, output.status, stderr.trim()));
        }
        Ok(())
    }
}

#[async_trait]
impl VmDriver for CommandDriver {
    fn name(&self) -> &str {
        "command"
    }

    async fn restore(&self, machine: &Machine) -> MachineResult<()> {
        let snapshot = machine.snapshot.as_deref().unwrap_or("current");
        self.run("restore", machine, &[snapshot])
            .await
            .map_err(|reason| MachineError::Snapshot {
                label: machine.label.clone(),
                reason,
            })
    }

    async fn start(&self, machine: &Machine) -> MachineResult<()> {
        self.run("start", machine, &[])
            .await
            .map_err(MachineError::Operation)
    }

    async fn stop(&self, machine: &Machine) -> MachineResult<()> {
        self.run("stop", machine, &[])
            .await
            .map_err(MachineError::Operation)
    }

    async fn stop_safe(&self, machine: &Machine) -> MachineResult<()> {
        self.run("stop-safe", machine, &[])
            .await
            .map_err(MachineError::Operation)
    }

    async fn dump_memory(&self, machine: &Machine, path: &Path) -> MachineResult<()> {
        let path = path.to_string_lossy();
        self.run("dump-memory", machine, &[path.as_ref()])
            .await
            .map_err(MachineError::Operation)
    }

    async fn enable_remote_control(&self, machine: &Machine) -> MachineResult<()> {
        self.run("remote-control", machine, &["on"])
            .await
            .map_err(MachineError::Operation)
    }

    async fn disable_remote_control(&self, machine: &Machine) -> MachineResult<()> {
        self.run("remote-control", machine, &["off"])
            .await
            .map_err(MachineError::Operation)
    }
}
