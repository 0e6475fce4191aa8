// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::serde_helpers::option_duration_secs;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A declarative test run: the VMs to boot, the cluster resources that
/// describe their boot policy, and the assertions to check.
///
/// Scenarios arrive already schema-validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name, used in reports.
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// VMs to provision, in scenario order.
    #[serde(default)]
    pub vms: Vec<VmSpec>,
    /// Cluster resources to apply, in scenario order.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    /// Assertions to validate, in scenario order.
    #[serde(default)]
    pub assertions: Vec<AssertionSpec>,
    /// Per-scenario timeout overrides.
    #[serde(default)]
    pub timeouts: TimeoutOverrides,
}

impl Scenario {
    /// Returns the assertions targeting the VM named `vm`, in scenario order.
    pub fn assertions_for<'a>(&'a self, vm: &'a str) -> impl Iterator<Item = &'a AssertionSpec> {
        self.assertions.iter().filter(move |a| a.vm == vm)
    }
}

/// Timeouts a scenario may override. Unset values fall back to the harness
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutOverrides {
    /// How long to wait for each applied resource to exist.
    #[serde(default, with = "option_duration_secs")]
    pub resource_ready: Option<Duration>,
    /// How long to wait for all VMs to be provisioned.
    #[serde(default, with = "option_duration_secs")]
    pub vm_boot: Option<Duration>,
    /// Default time budget for each assertion.
    #[serde(default, with = "option_duration_secs")]
    pub assertion: Option<Duration>,
}

/// A VM requested by a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// VM name, unique within the scenario.
    pub name: String,
    /// SMBIOS UUID to assign. The provisioning API keys boot requests on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// MAC address of the boot NIC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// Memory, in MiB.
    #[serde(default = "VmSpec::default_memory_mb")]
    pub memory_mb: u64,
    /// Virtual CPU count.
    #[serde(default = "VmSpec::default_vcpus")]
    pub vcpus: u32,
    /// Boot devices, in the order firmware should try them.
    #[serde(default = "VmSpec::default_boot_order")]
    pub boot_order: Vec<BootDevice>,
    /// Optional local disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskSpec>,
    /// Arbitrary labels, passed through to the VM manager.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl VmSpec {
    fn default_memory_mb() -> u64 {
        2048
    }

    fn default_vcpus() -> u32 {
        2
    }

    fn default_boot_order() -> Vec<BootDevice> {
        vec![BootDevice::Network]
    }

    /// Returns a spec for a network-booting VM with default sizing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            mac_address: None,
            memory_mb: Self::default_memory_mb(),
            vcpus: Self::default_vcpus(),
            boot_order: Self::default_boot_order(),
            disk: None,
            labels: BTreeMap::new(),
        }
    }

    /// Sets the SMBIOS UUID.
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Sets the boot NIC's MAC address.
    pub fn with_mac_address(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = Some(mac.into());
        self
    }
}

/// A firmware boot device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[expect(missing_docs)] // Self-describing names.
pub enum BootDevice {
    Network,
    Hd,
    Cdrom,
}

impl BootDevice {
    /// The device name as the hypervisor tooling spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            BootDevice::Network => "network",
            BootDevice::Hd => "hd",
            BootDevice::Cdrom => "cdrom",
        }
    }
}

/// A VM's local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Base image to clone. An empty disk is created when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    /// Disk size, in GiB.
    pub size_gb: u64,
}

/// A cluster resource to apply before VMs boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Resource kind, e.g. `Profile`.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Namespace, for namespaced kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Manifest file to apply.
    pub manifest: PathBuf,
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// One expected-behavior check against one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionSpec {
    /// Name of the VM the assertion targets.
    pub vm: String,
    /// What to check.
    #[serde(rename = "type")]
    pub kind: AssertionKind,
    /// Expected value, where the kind compares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// Time budget for this assertion alone.
    #[serde(default, with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl AssertionSpec {
    /// Returns a new assertion with no expected value.
    pub fn new(vm: impl Into<String>, kind: AssertionKind) -> Self {
        Self {
            vm: vm.into(),
            kind,
            expected: None,
            timeout: None,
        }
    }

    /// Sets the expected value.
    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    /// The expected value, with an empty string standing in for "anything".
    pub fn expected_str(&self) -> &str {
        self.expected.as_deref().unwrap_or("")
    }
}

/// The kinds of assertion the engine knows how to validate.
///
/// Scenario files name kinds as strings. A name the engine does not recognize
/// is kept as [`AssertionKind::Unknown`] so that it can be reported as a
/// failed assertion rather than rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AssertionKind {
    /// The VM obtained a DHCP lease.
    DhcpLease,
    /// The VM fetched its boot loader over TFTP.
    TftpBoot,
    /// The VM made an HTTP boot request to the provisioning API.
    HttpBoot,
    /// The provisioning API matched the VM to a profile.
    ProfileMatch,
    /// The provisioning API selected an assignment for the VM.
    AssignmentMatch,
    /// The VM retrieved its rendered configuration.
    ConfigRetrieved,
    /// A kind this engine does not recognize.
    Unknown(String),
}

impl AssertionKind {
    /// All kinds with a validator.
    pub const KNOWN: [AssertionKind; 6] = [
        AssertionKind::DhcpLease,
        AssertionKind::TftpBoot,
        AssertionKind::HttpBoot,
        AssertionKind::ProfileMatch,
        AssertionKind::AssignmentMatch,
        AssertionKind::ConfigRetrieved,
    ];

    /// The kind's name as written in scenario files.
    pub fn as_str(&self) -> &str {
        match self {
            AssertionKind::DhcpLease => "dhcp_lease",
            AssertionKind::TftpBoot => "tftp_boot",
            AssertionKind::HttpBoot => "http_boot",
            AssertionKind::ProfileMatch => "profile_match",
            AssertionKind::AssignmentMatch => "assignment_match",
            AssertionKind::ConfigRetrieved => "config_retrieved",
            AssertionKind::Unknown(s) => s,
        }
    }
}

impl From<String> for AssertionKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "dhcp_lease" => AssertionKind::DhcpLease,
            "tftp_boot" => AssertionKind::TftpBoot,
            "http_boot" => AssertionKind::HttpBoot,
            "profile_match" => AssertionKind::ProfileMatch,
            "assignment_match" => AssertionKind::AssignmentMatch,
            "config_retrieved" => AssertionKind::ConfigRetrieved,
            _ => AssertionKind::Unknown(s),
        }
    }
}

impl From<AssertionKind> for String {
    fn from(kind: AssertionKind) -> Self {
        match kind {
            AssertionKind::Unknown(s) => s,
            kind => kind.as_str().to_owned(),
        }
    }
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
