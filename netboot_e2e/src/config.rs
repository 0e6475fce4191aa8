// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Harness configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.

use anyhow::Context;
use netboot_e2e_defs::TimeoutOverrides;
use netboot_e2e_defs::serde_helpers::duration_millis;
use netboot_e2e_defs::serde_helpers::duration_secs;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level harness configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory the environment store keeps its records in.
    pub store_dir: PathBuf,
    /// Phase timeouts.
    pub timeouts: ExecutorTimeouts,
    /// Assertion validator settings.
    pub validator: ValidatorConfig,
    /// Where the provisioning API's logs come from.
    pub api_logs: ApiLogConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(".netboot-e2e/environments"),
            timeouts: ExecutorTimeouts::default(),
            validator: ValidatorConfig::default(),
            api_logs: ApiLogConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Loads a configuration file. `.json` files are read as JSON, anything
    /// else as YAML.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let data = fs_err::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&data)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            _ => serde_yaml::from_str(&data)
                .with_context(|| format!("failed to parse {}", path.display()))?,
        };
        Ok(config)
    }
}

/// Deadlines and delays for each executor phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorTimeouts {
    /// How long an applied resource may take to show up.
    #[serde(with = "duration_secs")]
    pub resource_ready: Duration,
    /// How often to check whether an applied resource exists.
    #[serde(with = "duration_millis", rename = "resource_poll_interval_ms")]
    pub resource_poll_interval: Duration,
    /// How long provisioning every VM may take.
    #[serde(with = "duration_secs")]
    pub vm_boot: Duration,
    /// Default time budget for a single assertion.
    #[serde(with = "duration_secs")]
    pub assertion: Duration,
    /// Pause before validating a VM, giving its firmware time to start booting.
    #[serde(with = "duration_secs")]
    pub settle_delay: Duration,
    /// Budget for tearing VMs down, independent of any run deadline.
    #[serde(with = "duration_secs")]
    pub cleanup: Duration,
}

impl Default for ExecutorTimeouts {
    fn default() -> Self {
        Self {
            resource_ready: Duration::from_secs(60),
            resource_poll_interval: Duration::from_secs(2),
            vm_boot: Duration::from_secs(300),
            assertion: Duration::from_secs(120),
            settle_delay: Duration::from_secs(5),
            cleanup: Duration::from_secs(120),
        }
    }
}

impl ExecutorTimeouts {
    /// Applies a scenario's overrides on top of these timeouts.
    pub fn with_overrides(&self, overrides: &TimeoutOverrides) -> Self {
        let TimeoutOverrides {
            resource_ready,
            vm_boot,
            assertion,
        } = overrides;
        Self {
            resource_ready: resource_ready.unwrap_or(self.resource_ready),
            vm_boot: vm_boot.unwrap_or(self.vm_boot),
            assertion: assertion.unwrap_or(self.assertion),
            ..self.clone()
        }
    }
}

/// Settings shared by every assertion validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// How often validators re-read their evidence.
    #[serde(with = "duration_millis", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Where to read the provisioning API's logs from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiLogConfig {
    /// The `kubectl` binary.
    pub kubectl: PathBuf,
    /// Namespace the API runs in.
    pub namespace: String,
    /// Deployment whose pods serve the API.
    pub deployment: String,
    /// Only read this many trailing lines, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail_lines: Option<u32>,
}

impl Default for ApiLogConfig {
    fn default() -> Self {
        Self {
            kubectl: PathBuf::from("kubectl"),
            namespace: "netboot-system".into(),
            deployment: "netboot-api".into(),
            tail_lines: None,
        }
    }
}
