// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! VM provisioning for test scenarios.

mod orchestrator;

pub use orchestrator::OrchestratorError;
pub use orchestrator::VmOrchestrator;

#[cfg(test)]
pub(crate) use orchestrator::tests::FakeVmManager;

use crate::CancelContext;
use async_trait::async_trait;
use jiff::Timestamp;
use netboot_e2e_defs::BootDevice;
use netboot_e2e_defs::DiskSpec;
use netboot_e2e_defs::TestEvent;
use netboot_e2e_defs::VmEventType;
use netboot_e2e_defs::VmSpec;
use netboot_e2e_defs::VmState;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// The hypervisor-side VM lifecycle, as consumed by [`VmOrchestrator`].
///
/// Implementations wrap whatever actually creates VMs (libvirt, a cloud API,
/// a test double). Destroying a VM that does not exist should succeed.
#[async_trait]
pub trait VmManager: Send + Sync {
    /// Creates and starts a VM, returning what the manager learned about it.
    async fn create_vm(&self, config: VmConfig) -> anyhow::Result<VmMetadata>;

    /// Stops and removes the VM named `name`.
    async fn destroy_vm(&self, ctx: &CancelContext, name: &str) -> anyhow::Result<()>;

    /// Releases the manager's own resources.
    async fn close(&self) -> anyhow::Result<()>;
}

/// A VM request in the shape a [`VmManager`] consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// VM name.
    pub name: String,
    /// SMBIOS UUID.
    pub uuid: Option<String>,
    /// Boot NIC MAC address.
    pub mac_address: Option<String>,
    /// Memory, in MiB.
    pub memory_mb: u64,
    /// Virtual CPU count.
    pub vcpus: u32,
    /// Virtual network to attach the boot NIC to.
    pub network: String,
    /// Firmware boot order.
    pub boot_order: Vec<BootDevice>,
    /// Optional local disk.
    pub disk: Option<DiskSpec>,
    /// Labels to attach to the VM.
    pub labels: BTreeMap<String, String>,
}

impl VmConfig {
    /// Translates a scenario VM into a manager request on `network`.
    pub fn from_spec(spec: &VmSpec, network: &str) -> Self {
        let VmSpec {
            name,
            uuid,
            mac_address,
            memory_mb,
            vcpus,
            boot_order,
            disk,
            labels,
        } = spec;
        Self {
            name: name.clone(),
            uuid: uuid.clone(),
            mac_address: mac_address.clone(),
            memory_mb: *memory_mb,
            vcpus: *vcpus,
            network: network.to_owned(),
            boot_order: boot_order.clone(),
            disk: disk.clone(),
            labels: labels.clone(),
        }
    }
}

/// What a [`VmManager`] reports about a VM it created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmMetadata {
    /// Address assigned to the VM, if the manager knows it.
    pub ip_address: Option<IpAddr>,
    /// MAC address the manager generated, when the scenario gave none.
    pub mac_address: Option<String>,
    /// UUID the manager generated, when the scenario gave none.
    pub uuid: Option<String>,
    /// Anything else the manager wants to report.
    pub extra: BTreeMap<String, String>,
}

/// A provisioned VM.
#[derive(Debug, Clone)]
pub struct VmInstance {
    /// The scenario's request.
    pub spec: VmSpec,
    /// What the manager reported.
    pub metadata: VmMetadata,
    /// Lifecycle stage.
    pub state: VmState,
}

impl VmInstance {
    /// The VM's name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The boot NIC's MAC address, from the scenario or, failing that, the
    /// manager.
    pub fn mac_address(&self) -> Option<&str> {
        self.spec
            .mac_address
            .as_deref()
            .or(self.metadata.mac_address.as_deref())
    }

    /// The SMBIOS UUID, from the scenario or, failing that, the manager.
    pub fn uuid(&self) -> Option<&str> {
        self.spec.uuid.as_deref().or(self.metadata.uuid.as_deref())
    }

    /// The VM's IP address, once known.
    pub fn ip_address(&self) -> Option<IpAddr> {
        self.metadata.ip_address
    }
}

/// Append-only, thread-safe log of VM lifecycle events.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<TestEvent>>,
}

impl EventLog {
    /// Appends an event stamped with the current time.
    pub fn record(&self, vm_name: &str, event_type: VmEventType, detail: impl Into<String>) {
        let event = TestEvent {
            timestamp: Timestamp::now(),
            vm_name: vm_name.to_owned(),
            event_type,
            detail: detail.into(),
        };
        tracing::debug!(vm = vm_name, ?event_type, detail = event.detail, "vm event");
        self.events.lock().push(event);
    }

    /// A copy of every event so far, in append order.
    pub fn snapshot(&self) -> Vec<TestEvent> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn config_carries_spec_and_network() {
        let spec = VmSpec::new("vm-a")
            .with_uuid("u-1")
            .with_mac_address("52:54:00:00:00:01");
        let config = VmConfig::from_spec(&spec, "netboot-e2e");
        assert_eq!(config.name, "vm-a");
        assert_eq!(config.network, "netboot-e2e");
        assert_eq!(config.uuid.as_deref(), Some("u-1"));
        assert_eq!(config.boot_order, vec![BootDevice::Network]);
    }

    #[test]
    fn instance_falls_back_to_manager_identity() {
        let vm = VmInstance {
            spec: VmSpec::new("vm-a"),
            metadata: VmMetadata {
                mac_address: Some("52:54:00:00:00:02".into()),
                uuid: Some("generated".into()),
                ..Default::default()
            },
            state: VmState::Running,
        };
        assert_eq!(vm.mac_address(), Some("52:54:00:00:00:02"));
        assert_eq!(vm.uuid(), Some("generated"));
        assert_eq!(vm.ip_address(), None);
    }

    #[test]
    fn event_log_is_safe_across_threads() {
        let log = Arc::new(EventLog::default());
        std::thread::scope(|s| {
            for t in 0..8 {
                let log = &log;
                s.spawn(move || {
                    for i in 0..100 {
                        log.record(&format!("vm-{t}"), VmEventType::ProvisionStarted, i.to_string());
                    }
                });
            }
        });
        let events = log.snapshot();
        assert_eq!(events.len(), 800);
        for t in 0..8 {
            let details: Vec<_> = events
                .iter()
                .filter(|e| e.vm_name == format!("vm-{t}"))
                .map(|e| e.detail.parse::<u32>().unwrap())
                .collect();
            assert_eq!(details, (0..100).collect::<Vec<_>>());
        }
    }
}
