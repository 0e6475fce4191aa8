// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Assertion validators.
//!
//! Each validator polls an [`EvidenceSource`] until the evidence it looks for
//! shows up or its context ends. Running out of time is an ordinary failed
//! [`AssertionResult`], not an error, and read failures along the way are
//! retried on the next poll.

mod config_retrieved;
mod correlation;
mod dhcp;
mod fields;
mod http_boot;
mod source;
mod tftp;

pub use config_retrieved::ConfigRetrievedValidator;
pub use correlation::CorrelationValidator;
pub use dhcp::DhcpLeaseValidator;
pub use http_boot::HttpBootValidator;
pub use source::CommandSource;
pub use source::EvidenceSource;
pub use source::FileSource;
pub use source::StaticSource;
pub use tftp::TftpBootValidator;

use crate::CancelContext;
use crate::CancelReason;
use crate::config::HarnessConfig;
use crate::vm::VmInstance;
use async_trait::async_trait;
use netboot_e2e_defs::AssertionKind;
use netboot_e2e_defs::AssertionResult;
use netboot_e2e_defs::AssertionSpec;
use netboot_e2e_defs::InfrastructureState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Default time between two reads of an evidence source.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Checks one assertion against one VM.
#[async_trait]
pub trait AssertionValidator: Send + Sync {
    /// Polls for evidence until it is found or `ctx` ends.
    ///
    /// Returns `Ok` with a failed result when the evidence does not show up
    /// in time or contradicts the assertion. `Err` is reserved for
    /// assertions that cannot be checked at all.
    async fn validate(
        &self,
        ctx: &CancelContext,
        assertion: &AssertionSpec,
        vm: &VmInstance,
        infra: &InfrastructureState,
    ) -> anyhow::Result<AssertionResult>;
}

/// Reasons an assertion cannot be checked.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The VM's IP address is needed but not yet known.
    #[error("IP address of VM {vm} is unknown, a dhcp_lease assertion must pass first")]
    IpUnknown {
        /// The VM's name.
        vm: String,
    },
    /// The VM's UUID is needed but neither the scenario nor the VM manager
    /// provided one.
    #[error("VM {vm} has no UUID to correlate API logs with")]
    UuidUnknown {
        /// The VM's name.
        vm: String,
    },
    /// The run was cancelled while validating.
    #[error("{kind} validation for VM {vm} was cancelled")]
    Cancelled {
        /// The assertion kind.
        kind: AssertionKind,
        /// The VM's name.
        vm: String,
    },
}

/// The verdict a validator reached from one read of its evidence.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Finding {
    passed: bool,
    actual: String,
    message: String,
}

impl Finding {
    pub fn pass(actual: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            passed: true,
            actual: actual.into(),
            message: message.into(),
        }
    }

    pub fn mismatch(actual: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            passed: false,
            actual: actual.into(),
            message: message.into(),
        }
    }
}

/// An evidence source read on a fixed interval.
#[derive(Debug, Clone)]
pub(crate) struct Poller {
    source: Arc<dyn EvidenceSource>,
    interval: Duration,
}

impl Poller {
    fn new(source: Arc<dyn EvidenceSource>) -> Self {
        Self {
            source,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Reads the source until `check` reaches a verdict or `ctx` ends.
    ///
    /// `waiting_for` describes the evidence in the timeout message.
    async fn poll(
        &self,
        ctx: &CancelContext,
        assertion: &AssertionSpec,
        vm: &VmInstance,
        waiting_for: &str,
        mut check: impl FnMut(&str) -> Option<Finding> + Send,
    ) -> anyhow::Result<AssertionResult> {
        let start = Instant::now();
        let kind = &assertion.kind;
        let mut polls = 0u64;
        let reason = loop {
            polls += 1;
            match ctx.until_cancelled(self.source.read()).await {
                Ok(Ok(text)) => {
                    if let Some(finding) = check(&text) {
                        tracing::debug!(
                            vm = vm.name(),
                            %kind,
                            polls,
                            passed = finding.passed,
                            "evidence found"
                        );
                        let Finding {
                            passed,
                            actual,
                            message,
                        } = finding;
                        return Ok(AssertionResult {
                            kind: kind.clone(),
                            expected: assertion.expected_str().to_owned(),
                            actual,
                            passed,
                            message,
                            duration: start.elapsed(),
                        });
                    }
                    tracing::debug!(vm = vm.name(), %kind, polls, "no evidence yet");
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        vm = vm.name(),
                        %kind,
                        source = ?self.source,
                        error = format!("{err:#}"),
                        "evidence read failed, retrying"
                    );
                }
                Err(reason) => break reason,
            }
            if let Err(reason) = ctx.sleep(self.interval).await {
                break reason;
            }
        };

        let elapsed = start.elapsed();
        match reason {
            CancelReason::DeadlineExceeded => {
                let message = format!(
                    "timed out after {:.1}s waiting for {waiting_for} for VM {}",
                    elapsed.as_secs_f64(),
                    vm.name()
                );
                tracing::info!(vm = vm.name(), %kind, polls, "{message}");
                Ok(AssertionResult::fail(
                    kind.clone(),
                    assertion.expected_str(),
                    "",
                    message,
                    elapsed,
                ))
            }
            CancelReason::Cancelled => Err(ValidationError::Cancelled {
                kind: kind.clone(),
                vm: vm.name().to_owned(),
            }
            .into()),
        }
    }
}

/// Validators keyed by assertion kind.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<AssertionKind, Arc<dyn AssertionValidator>>,
}

impl ValidatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// All six validators, reading from the given sources: DHCP leases from
    /// `leases`, TFTP transfers from `boot_log`, and everything the
    /// provisioning API logs from `api_log`.
    pub fn with_sources(
        leases: Arc<dyn EvidenceSource>,
        boot_log: Arc<dyn EvidenceSource>,
        api_log: Arc<dyn EvidenceSource>,
        poll_interval: Duration,
    ) -> Self {
        Self::new()
            .with_validator(
                AssertionKind::DhcpLease,
                DhcpLeaseValidator::new(leases).with_poll_interval(poll_interval),
            )
            .with_validator(
                AssertionKind::TftpBoot,
                TftpBootValidator::new(boot_log).with_poll_interval(poll_interval),
            )
            .with_validator(
                AssertionKind::HttpBoot,
                HttpBootValidator::new(api_log.clone()).with_poll_interval(poll_interval),
            )
            .with_validator(
                AssertionKind::ProfileMatch,
                CorrelationValidator::profile_match(api_log.clone())
                    .with_poll_interval(poll_interval),
            )
            .with_validator(
                AssertionKind::AssignmentMatch,
                CorrelationValidator::assignment_match(api_log.clone())
                    .with_poll_interval(poll_interval),
            )
            .with_validator(
                AssertionKind::ConfigRetrieved,
                ConfigRetrievedValidator::new(api_log).with_poll_interval(poll_interval),
            )
    }

    /// All six validators, reading the lease file and daemon log named by
    /// `infra` and the API's logs through `kubectl`.
    pub fn for_environment(infra: &InfrastructureState, config: &HarnessConfig) -> Self {
        Self::with_sources(
            Arc::new(FileSource::new(&infra.lease_file)),
            Arc::new(FileSource::new(&infra.dnsmasq_log_file)),
            Arc::new(CommandSource::kubectl_logs(
                &config.api_logs,
                &infra.kubeconfig_path,
            )),
            config.validator.poll_interval,
        )
    }

    /// Registers `validator` for `kind`, replacing any earlier one.
    pub fn with_validator(
        mut self,
        kind: AssertionKind,
        validator: impl AssertionValidator + 'static,
    ) -> Self {
        self.validators.insert(kind, Arc::new(validator));
        self
    }

    /// The validator for `kind`.
    pub fn get(&self, kind: &AssertionKind) -> Option<&Arc<dyn AssertionValidator>> {
        self.validators.get(kind)
    }

    /// Validates `assertion` with the validator registered for its kind. A
    /// kind with no validator produces a failed result naming the kind.
    pub async fn validate(
        &self,
        ctx: &CancelContext,
        assertion: &AssertionSpec,
        vm: &VmInstance,
        infra: &InfrastructureState,
    ) -> anyhow::Result<AssertionResult> {
        let Some(validator) = self.get(&assertion.kind) else {
            tracing::warn!(vm = vm.name(), kind = %assertion.kind, "no validator for assertion kind");
            return Ok(AssertionResult::fail(
                assertion.kind.clone(),
                assertion.expected_str(),
                "",
                format!("unknown assertion type {:?}", assertion.kind.as_str()),
                Duration::ZERO,
            ));
        };
        validator.validate(ctx, assertion, vm, infra).await
    }
}
