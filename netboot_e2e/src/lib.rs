// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end test engine for a network-boot provisioning service.
//!
//! Given a [`Scenario`] and a provisioned [`InfrastructureState`], the
//! [`TestExecutor`] applies the scenario's cluster resources, boots its VMs
//! through a [`VmOrchestrator`], and then checks, by polling DHCP leases and
//! boot/API logs, that every VM was served the configuration it should have
//! been. Provisioned environments are tracked by the [`EnvironmentStore`].

pub mod assertions;
mod cancel;
pub mod config;
mod executor;
mod store;
mod tracing;
pub mod vm;

pub use assertions::ValidatorRegistry;
pub use cancel::CancelContext;
pub use cancel::CancelReason;
pub use executor::*;
pub use netboot_e2e_defs::*;
pub use store::EnvironmentStore;
pub use store::StoreError;
pub use tracing::*;
pub use vm::VmOrchestrator;

use jiff::Timestamp;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

/// Error running command
#[derive(Error, Debug)]
pub enum CommandError {
    /// failed to launch command
    #[error("failed to launch command")]
    Launch(#[from] std::io::Error),
    /// command exited with non-zero status
    #[error("command exited with non-zero status ({0}): {1}")]
    Command(std::process::ExitStatus, String),
    /// command output is not utf-8
    #[error("command output is not utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Run a command on the host and return the output
pub async fn run_host_cmd(mut cmd: Command) -> Result<String, CommandError> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let cmd_debug = format!("{cmd:?}");
    ::tracing::debug!(cmd = cmd_debug, "executing command");

    let start = Timestamp::now();
    let output = cmd.output().await?;
    let time_elapsed = Timestamp::now().duration_since(start);

    let stderr_str = String::from_utf8_lossy(&output.stderr).to_string();
    ::tracing::trace!(
        cmd = cmd_debug,
        stdout_len = output.stdout.len(),
        stderr_str,
        "command exited in {:.3}s with status {}",
        time_elapsed.as_secs_f64(),
        output.status
    );

    if !output.status.success() {
        return Err(CommandError::Command(output.status, stderr_str));
    }

    Ok(String::from_utf8(output.stdout)?)
}

/// Formats `err` and its sources on one line, outermost first.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut s = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        s.push_str(": ");
        s.push_str(&e.to_string());
        source = e.source();
    }
    s
}
