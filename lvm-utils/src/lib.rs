// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around the host's LVM toolchain.
//!
//! Everything here is a thin, typed layer over `lvcreate`, `lvremove`,
//! `lvextend`, `vgs`, `lvs`, `pvs` and `wipefs`: argument assembly is kept
//! in pure functions, reports are parsed from LVM's JSON output, and every
//! mutating operation is idempotent by probing current host state first.
//! LVM serializes concurrent invocations with its own file locks, so no
//! additional locking happens at this layer.

pub mod report;
pub mod snapshot;
pub mod volume;

/// `lvcreate` binary; creates logical volumes, thin pools and snapshots.
pub const LVCREATE: &str = "lvcreate";
/// `lvremove` binary.
pub const LVREMOVE: &str = "lvremove";
/// `lvextend` binary.
pub const LVEXTEND: &str = "lvextend";
/// `lvs` reporting binary.
pub const LVS: &str = "lvs";
/// `vgs` reporting binary.
pub const VGS: &str = "vgs";
/// `pvs` reporting binary.
pub const PVS: &str = "pvs";
/// `pvscan` binary, used to refresh the LVM metadata cache.
pub const PVSCAN: &str = "pvscan";
/// `wipefs` binary, used to erase filesystem signatures before an LV is
/// removed.
pub const WIPEFS: &str = "wipefs";

/// Captured output of a failed command.
#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),
}

impl ExecutionError {
    /// Whether the failure was LVM reporting that no volume group had room
    /// for the request. This is the one failure the controller reschedules
    /// on, classified by substring since LVM has no structured errors.
    pub fn is_insufficient_space(&self) -> bool {
        match self {
            ExecutionError::CommandFailure(info) => {
                let all =
                    format!("{} {}", info.stdout, info.stderr).to_lowercase();
                all.contains("insufficient free space")
            }
            ExecutionError::ExecutionStart { .. } => false,
        }
    }
}

fn command_to_string(command: &std::process::Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into())
        .collect::<Vec<String>>()
        .join(" ")
}

fn output_to_exec_error(
    command: &std::process::Command,
    output: &std::process::Output,
) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(command),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}

/// Runs a command to completion, turning non-zero exits into
/// [`ExecutionError::CommandFailure`] with stdout/stderr preserved.
pub fn execute(
    command: &mut std::process::Command,
) -> Result<std::process::Output, ExecutionError> {
    let output = command.output().map_err(|err| {
        ExecutionError::ExecutionStart {
            command: command_to_string(command),
            err,
        }
    })?;

    if !output.status.success() {
        return Err(output_to_exec_error(command, &output));
    }

    Ok(output)
}
