// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::EventLog;
use super::VmConfig;
use super::VmInstance;
use super::VmManager;
use crate::CancelContext;
use crate::CancelReason;
use crate::error_chain;
use netboot_e2e_defs::TestEvent;
use netboot_e2e_defs::VmEventType;
use netboot_e2e_defs::VmSpec;
use netboot_e2e_defs::VmState;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from VM provisioning and teardown.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The VM manager failed to create a VM.
    #[error("failed to provision VM {name}")]
    ProvisionFailed {
        /// The VM's name.
        name: String,
        /// The manager's error.
        #[source]
        source: anyhow::Error,
    },
    /// Provisioning stopped because its context ended.
    #[error("provisioning VM {name} stopped: {reason}")]
    Cancelled {
        /// The VM's name.
        name: String,
        /// Why the context ended.
        reason: CancelReason,
    },
    /// A provisioning task died without reporting a result.
    #[error("provisioning task failed")]
    TaskFailed(#[source] tokio::task::JoinError),
    /// The VM manager failed to destroy a VM.
    #[error("failed to destroy VM {name}")]
    DestroyFailed {
        /// The VM's name.
        name: String,
        /// The manager's error.
        #[source]
        source: anyhow::Error,
    },
    /// The VM is not (or no longer) provisioned.
    #[error("VM {0} not found")]
    NotFound(String),
    /// One or more VMs could not be destroyed.
    #[error("failed to destroy {} VM(s): {}", .0.len(), join_errors(.0))]
    DestroyAll(Vec<OrchestratorError>),
}

fn join_errors(errors: &[OrchestratorError]) -> String {
    errors
        .iter()
        .map(|e| error_chain(e))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Turns [`VmSpec`]s into running VMs on one virtual network, and tears
/// them down again.
///
/// Cloning yields a handle sharing the same manager and event log.
#[derive(Clone)]
pub struct VmOrchestrator {
    manager: Arc<dyn VmManager>,
    network: String,
    events: Arc<EventLog>,
    cleanup_timeout: Duration,
}

impl VmOrchestrator {
    /// Creates an orchestrator that attaches VMs to `network`.
    pub fn new(manager: Arc<dyn VmManager>, network: impl Into<String>) -> Self {
        Self {
            manager,
            network: network.into(),
            events: Arc::new(EventLog::default()),
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }

    /// The budget for rolling back a failed batch.
    pub fn cleanup_timeout(&self) -> Duration {
        self.cleanup_timeout
    }

    /// Sets the budget for rolling back a failed batch.
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// The virtual network VMs are attached to.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Appends a lifecycle event.
    pub fn record_event(&self, vm_name: &str, event_type: VmEventType, detail: impl Into<String>) {
        self.events.record(vm_name, event_type, detail);
    }

    /// Every event recorded so far, in append order.
    pub fn events(&self) -> Vec<TestEvent> {
        self.events.snapshot()
    }

    /// Creates one VM and returns it running.
    ///
    /// A create that is still in flight when `ctx` ends is abandoned, and the
    /// VM is removed by name in case the manager got far enough to create it.
    pub async fn provision_vm(
        &self,
        ctx: &CancelContext,
        spec: &VmSpec,
    ) -> Result<VmInstance, OrchestratorError> {
        let name = spec.name.as_str();
        let config = VmConfig::from_spec(spec, &self.network);
        self.record_event(
            name,
            VmEventType::ProvisionStarted,
            format!(
                "memory={}MiB vcpus={} network={}",
                config.memory_mb, config.vcpus, config.network
            ),
        );
        if let Some(reason) = ctx.reason() {
            self.record_event(name, VmEventType::ProvisionFailed, reason.to_string());
            return Err(OrchestratorError::Cancelled {
                name: name.to_owned(),
                reason,
            });
        }
        tracing::info!(vm = name, network = self.network, "provisioning VM");

        match ctx.until_cancelled(self.manager.create_vm(config)).await {
            Ok(Ok(metadata)) => {
                let detail = match metadata.ip_address {
                    Some(ip) => format!("running, ip={ip}"),
                    None => "running".to_owned(),
                };
                self.record_event(name, VmEventType::Provisioned, detail);
                tracing::info!(vm = name, ip = ?metadata.ip_address, "VM running");
                Ok(VmInstance {
                    spec: spec.clone(),
                    metadata,
                    state: VmState::Running,
                })
            }
            Ok(Err(err)) => {
                self.record_event(name, VmEventType::ProvisionFailed, format!("{err:#}"));
                tracing::error!(vm = name, error = format!("{err:#}"), "VM provisioning failed");
                Err(OrchestratorError::ProvisionFailed {
                    name: name.to_owned(),
                    source: err,
                })
            }
            Err(reason) => {
                self.record_event(name, VmEventType::ProvisionFailed, reason.to_string());
                tracing::warn!(vm = name, %reason, "VM provisioning abandoned");
                let cleanup = CancelContext::new().with_timeout(self.cleanup_timeout);
                let removed = match cleanup
                    .until_cancelled(self.manager.destroy_vm(&cleanup, name))
                    .await
                {
                    Ok(r) => r,
                    Err(reason) => Err(anyhow::Error::new(reason)),
                };
                if let Err(err) = removed {
                    tracing::warn!(
                        vm = name,
                        error = format!("{err:#}"),
                        "failed to remove abandoned VM"
                    );
                }
                Err(OrchestratorError::Cancelled {
                    name: name.to_owned(),
                    reason,
                })
            }
        }
    }

    /// Provisions every VM in `specs` concurrently, all or nothing.
    ///
    /// On success the returned VMs are in the same order as `specs`. On the
    /// first failure the remaining tasks are told to stop, every task is
    /// waited for, and any VM that did come up is destroyed under a fresh
    /// context, so a failure never leaves VMs behind. The first failure is
    /// returned.
    pub async fn provision_multiple(
        &self,
        ctx: &CancelContext,
        specs: &[VmSpec],
    ) -> Result<Vec<VmInstance>, OrchestratorError> {
        let group = ctx.child();
        let mut tasks = JoinSet::new();
        for (index, spec) in specs.iter().cloned().enumerate() {
            let this = self.clone();
            let group = group.clone();
            tasks.spawn(async move { (index, this.provision_vm(&group, &spec).await) });
        }

        let mut slots: Vec<Option<VmInstance>> = Vec::new();
        slots.resize_with(specs.len(), || None);
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let r = match joined {
                Ok((index, Ok(vm))) => {
                    slots[index] = Some(vm);
                    continue;
                }
                Ok((_, Err(err))) => err,
                Err(err) => OrchestratorError::TaskFailed(err),
            };
            if first_error.is_none() {
                group.cancel();
                first_error = Some(r);
            } else {
                tracing::debug!(error = error_chain(&r), "additional provisioning failure");
            }
        }

        let Some(err) = first_error else {
            return Ok(slots.into_iter().flatten().collect());
        };

        let created = slots.iter().flatten().count();
        tracing::error!(
            error = error_chain(&err),
            created,
            requested = specs.len(),
            "batch provisioning failed, rolling back"
        );
        // The caller's context may be the one that just expired.
        let cleanup = CancelContext::new().with_timeout(self.cleanup_timeout);
        if let Err(cleanup_err) = self.destroy_all(&cleanup, &mut slots).await {
            tracing::error!(
                error = error_chain(&cleanup_err),
                "rollback left VMs behind"
            );
        }
        Err(err)
    }

    /// Destroys one VM.
    pub async fn destroy_vm(
        &self,
        ctx: &CancelContext,
        instance: &mut VmInstance,
    ) -> Result<(), OrchestratorError> {
        let name = instance.name().to_owned();
        if instance.state == VmState::Destroyed {
            return Err(OrchestratorError::NotFound(name));
        }

        self.record_event(&name, VmEventType::DestroyStarted, "");
        tracing::info!(vm = name, "destroying VM");
        let r = match ctx.until_cancelled(self.manager.destroy_vm(ctx, &name)).await {
            Ok(r) => r,
            Err(reason) => Err(anyhow::Error::new(reason)),
        };
        match r {
            Ok(()) => {
                instance.state = VmState::Destroyed;
                self.record_event(&name, VmEventType::Destroyed, "");
                Ok(())
            }
            Err(err) => {
                self.record_event(&name, VmEventType::DestroyFailed, format!("{err:#}"));
                Err(OrchestratorError::DestroyFailed { name, source: err })
            }
        }
    }

    /// Destroys every VM in `instances`, skipping empty slots, and keeps going
    /// past failures. All failures are reported together.
    pub async fn destroy_all(
        &self,
        ctx: &CancelContext,
        instances: &mut [Option<VmInstance>],
    ) -> Result<(), OrchestratorError> {
        let mut failures = Vec::new();
        for instance in instances.iter_mut().flatten() {
            if let Err(err) = self.destroy_vm(ctx, instance).await {
                tracing::warn!(error = error_chain(&err), "teardown failure");
                failures.push(err);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::DestroyAll(failures))
        }
    }

    /// Closes the underlying VM manager.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.manager.close().await
    }
}
