// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The test pipeline: apply resources, boot VMs, validate assertions.

use crate::CancelContext;
use crate::CancelReason;
use crate::RunLogger;
use crate::ValidatorRegistry;
use crate::config::ExecutorTimeouts;
use crate::error_chain;
use crate::vm::OrchestratorError;
use crate::vm::VmInstance;
use crate::vm::VmOrchestrator;
use anyhow::Context as _;
use async_trait::async_trait;
use jiff::Timestamp;
use netboot_e2e_defs::AssertionKind;
use netboot_e2e_defs::AssertionResult;
use netboot_e2e_defs::InfrastructureState;
use netboot_e2e_defs::ResourceResult;
use netboot_e2e_defs::ResourceSpec;
use netboot_e2e_defs::ResourceStatus;
use netboot_e2e_defs::Scenario;
use netboot_e2e_defs::TestResult;
use netboot_e2e_defs::TestStatus;
use netboot_e2e_defs::VmState;
use netboot_e2e_defs::VmTestResult;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// A cluster object created by a [`ResourceApplier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedResource {
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Namespace, for namespaced kinds.
    pub namespace: Option<String>,
}

impl From<&ResourceSpec> for AppliedResource {
    fn from(spec: &ResourceSpec) -> Self {
        Self {
            kind: spec.kind.clone(),
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
        }
    }
}

impl fmt::Display for AppliedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Creates scenario resources in the provisioning cluster.
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Applies one resource's manifest.
    async fn apply(
        &self,
        ctx: &CancelContext,
        resource: &ResourceSpec,
    ) -> anyhow::Result<AppliedResource>;

    /// Whether an applied resource can be read back yet.
    async fn exists(&self, ctx: &CancelContext, resource: &AppliedResource)
    -> anyhow::Result<bool>;
}

/// Gathers logs and other artifacts after a run.
#[async_trait]
pub trait LogCollector: Send + Sync {
    /// Collects whatever is useful for diagnosing the run, returning the
    /// paths written.
    async fn collect(
        &self,
        ctx: &CancelContext,
        infra: &InfrastructureState,
        vms: &[VmInstance],
    ) -> anyhow::Result<Vec<PathBuf>>;
}

/// A failure that stopped or degraded one phase of a run.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// Applying a resource, or confirming it exists, failed.
    #[error("failed to apply resource {resource}")]
    ResourceApplyFailed {
        /// The resource.
        resource: String,
        /// What went wrong.
        #[source]
        source: anyhow::Error,
    },
    /// An applied resource never showed up.
    #[error("resource {resource} did not become ready within {}s", timeout.as_secs())]
    ResourceTimeout {
        /// The resource.
        resource: String,
        /// How long it was given.
        timeout: Duration,
    },
    /// Not every VM could be provisioned.
    #[error("VM provisioning failed")]
    VmProvision(#[source] OrchestratorError),
    /// An assertion could not be checked at all.
    #[error("{kind} assertion for VM {vm} could not be validated")]
    Validation {
        /// The VM's name.
        vm: String,
        /// The assertion kind.
        kind: AssertionKind,
        /// Why.
        #[source]
        source: anyhow::Error,
    },
    /// The scenario has nothing to boot.
    #[error("scenario declares no VMs")]
    NoVms,
}

/// Every phase failure of a run.
#[derive(Debug, Error)]
#[error("{}", join_phase_errors(.0))]
pub struct ExecuteError(pub Vec<PhaseError>);

impl ExecuteError {
    /// The individual failures, in the order they happened.
    pub fn errors(&self) -> &[PhaseError] {
        &self.0
    }
}

fn join_phase_errors(errors: &[PhaseError]) -> String {
    errors
        .iter()
        .map(|e| error_chain(e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs one scenario against one environment.
///
/// [`execute`](Self::execute) walks the phases once:
///
/// 1. apply every resource in order, waiting for each to exist;
/// 2. provision all VMs at once, all or nothing;
/// 3. validate each VM's assertions in scenario order.
///
/// A failing phase ends the run. VMs stay up after `execute` so that their
/// logs can be inspected; [`teardown`](Self::teardown) removes them.
pub struct TestExecutor {
    scenario: Scenario,
    infra: InfrastructureState,
    applier: Arc<dyn ResourceApplier>,
    orchestrator: VmOrchestrator,
    validators: ValidatorRegistry,
    collector: Option<Arc<dyn LogCollector>>,
    logger: Option<RunLogger>,
    timeouts: ExecutorTimeouts,
    instances: Vec<Option<VmInstance>>,
}

impl TestExecutor {
    /// Creates an executor with default timeouts, no log collector, and no
    /// result logging.
    pub fn new(
        scenario: Scenario,
        infra: InfrastructureState,
        applier: Arc<dyn ResourceApplier>,
        orchestrator: VmOrchestrator,
        validators: ValidatorRegistry,
    ) -> Self {
        Self {
            scenario,
            infra,
            applier,
            orchestrator,
            validators,
            collector: None,
            logger: None,
            timeouts: ExecutorTimeouts::default(),
            instances: Vec::new(),
        }
    }

    /// Sets the phase timeouts. The scenario's own overrides still win.
    pub fn with_timeouts(mut self, timeouts: ExecutorTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Collects artifacts with `collector` once validation is over.
    pub fn with_log_collector(mut self, collector: Arc<dyn LogCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Writes the final result through `logger`.
    pub fn with_logger(mut self, logger: RunLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// The scenario being run.
    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// VMs provisioned by this executor and not yet torn down.
    pub fn instances(&self) -> impl Iterator<Item = &VmInstance> {
        self.instances.iter().flatten()
    }

    /// Runs the scenario.
    ///
    /// The result is always returned, describing however far the run got.
    /// The error lists every phase failure.
    pub async fn execute(&mut self, ctx: &CancelContext) -> (TestResult, Result<(), ExecuteError>) {
        let timeouts = self.timeouts.with_overrides(&self.scenario.timeouts);
        let started_at = Timestamp::now();
        let mut errors = Vec::new();
        let mut resources = Vec::new();
        let mut vms = Vec::new();

        tracing::info!(
            scenario = self.scenario.name,
            environment = self.infra.id,
            resources = self.scenario.resources.len(),
            vms = self.scenario.vms.len(),
            assertions = self.scenario.assertions.len(),
            "starting test"
        );

        let r = match self.apply_resources(ctx, &timeouts, &mut resources).await {
            Ok(()) => self.provision(ctx, &timeouts).await,
            Err(err) => Err(err),
        };
        match r {
            Ok(()) => vms = self.validate(ctx, &timeouts, &mut errors).await,
            Err(err) => {
                tracing::error!(error = error_chain(&err), "test phase failed");
                errors.push(err);
            }
        }

        let mut notes: Vec<String> = errors.iter().map(|e| error_chain(e)).collect();
        let log_files = self.collect_logs(&timeouts, &mut notes).await;

        let result = TestResult {
            scenario: self.scenario.name.clone(),
            environment_id: self.infra.id.clone(),
            status: TestStatus::aggregate(vms.iter().map(|vm: &VmTestResult| vm.status)),
            started_at,
            finished_at: Timestamp::now(),
            resources,
            vms,
            events: self.orchestrator.events(),
            errors: notes,
            log_files,
        };
        tracing::info!(
            scenario = result.scenario,
            status = %result.status,
            elapsed = format!("{:.1}s", result.finished_at.duration_since(started_at).as_secs_f64()),
            "test finished"
        );
        if let Some(logger) = &self.logger {
            if let Err(err) = logger.log_test_result(&result) {
                tracing::warn!(error = format!("{err:#}"), "failed to write test result");
            }
        }

        let r = if errors.is_empty() {
            Ok(())
        } else {
            Err(ExecuteError(errors))
        };
        (result, r)
    }

    async fn apply_resources(
        &self,
        ctx: &CancelContext,
        timeouts: &ExecutorTimeouts,
        results: &mut Vec<ResourceResult>,
    ) -> Result<(), PhaseError> {
        let resources = &self.scenario.resources;
        for (i, resource) in resources.iter().enumerate() {
            tracing::info!(%resource, "applying resource");
            match self.apply_resource(ctx, timeouts, resource).await {
                Ok(()) => results.push(resource_result(resource, ResourceStatus::Applied, None)),
                Err(err) => {
                    results.push(resource_result(
                        resource,
                        ResourceStatus::Failed,
                        Some(error_chain(&err)),
                    ));
                    results.extend(
                        resources[i + 1..]
                            .iter()
                            .map(|r| resource_result(r, ResourceStatus::Skipped, None)),
                    );
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn apply_resource(
        &self,
        ctx: &CancelContext,
        timeouts: &ExecutorTimeouts,
        resource: &ResourceSpec,
    ) -> Result<(), PhaseError> {
        let apply_failed = |source: anyhow::Error| PhaseError::ResourceApplyFailed {
            resource: resource.to_string(),
            source,
        };
        let ready = ctx.with_timeout(timeouts.resource_ready);
        let stopped = |reason: CancelReason| match reason {
            CancelReason::DeadlineExceeded => PhaseError::ResourceTimeout {
                resource: resource.to_string(),
                timeout: timeouts.resource_ready,
            },
            CancelReason::Cancelled => apply_failed(reason.into()),
        };

        let applied = ready
            .until_cancelled(self.applier.apply(&ready, resource))
            .await
            .map_err(stopped)?
            .map_err(apply_failed)?;

        let mut polls = 0u32;
        loop {
            polls += 1;
            match ready
                .until_cancelled(self.applier.exists(&ready, &applied))
                .await
            {
                Ok(Ok(true)) => {
                    tracing::info!(resource = %applied, polls, "resource ready");
                    return Ok(());
                }
                Ok(Ok(false)) => tracing::debug!(resource = %applied, polls, "resource not ready"),
                Ok(Err(err)) => tracing::warn!(
                    resource = %applied,
                    error = format!("{err:#}"),
                    "resource readiness check failed, retrying"
                ),
                Err(reason) => return Err(stopped(reason)),
            }
            ready
                .sleep(timeouts.resource_poll_interval)
                .await
                .map_err(stopped)?;
        }
    }

    async fn provision(
        &mut self,
        ctx: &CancelContext,
        timeouts: &ExecutorTimeouts,
    ) -> Result<(), PhaseError> {
        if self.scenario.vms.is_empty() {
            return Err(PhaseError::NoVms);
        }
        tracing::info!(count = self.scenario.vms.len(), "provisioning VMs");
        let boot = ctx.with_timeout(timeouts.vm_boot);
        let vms = self
            .orchestrator
            .clone()
            .with_cleanup_timeout(timeouts.cleanup)
            .provision_multiple(&boot, &self.scenario.vms)
            .await
            .map_err(PhaseError::VmProvision)?;
        self.instances = vms.into_iter().map(Some).collect();
        Ok(())
    }

    async fn validate(
        &mut self,
        ctx: &CancelContext,
        timeouts: &ExecutorTimeouts,
        errors: &mut Vec<PhaseError>,
    ) -> Vec<VmTestResult> {
        let mut results = Vec::new();
        for vm in self.instances.iter_mut().flatten() {
            let name = vm.name().to_owned();
            let started_at = Timestamp::now();
            let mut assertions = Vec::new();
            let mut vm_errors = Vec::new();

            tracing::info!(vm = name, "validating VM");
            if let Err(reason) = ctx.sleep(timeouts.settle_delay).await {
                vm_errors.push(format!("validation did not start: {reason}"));
            } else {
                for assertion in self.scenario.assertions_for(&name) {
                    let budget = assertion.timeout.unwrap_or(timeouts.assertion);
                    let actx = ctx.with_timeout(budget);
                    let start = Instant::now();
                    match self.validators.validate(&actx, assertion, vm, &self.infra).await {
                        Ok(result) => {
                            tracing::info!(
                                vm = name,
                                kind = %result.kind,
                                passed = result.passed,
                                actual = result.actual,
                                "{}",
                                result.message
                            );
                            if result.passed && result.kind == AssertionKind::DhcpLease {
                                if let Ok(ip) = result.actual.parse() {
                                    vm.metadata.ip_address = Some(ip);
                                }
                            }
                            assertions.push(result);
                        }
                        Err(source) => {
                            let err = PhaseError::Validation {
                                vm: name.clone(),
                                kind: assertion.kind.clone(),
                                source,
                            };
                            let message = error_chain(&err);
                            tracing::error!(vm = name, error = message, "assertion errored");
                            assertions.push(AssertionResult::fail(
                                assertion.kind.clone(),
                                assertion.expected_str(),
                                "",
                                message.clone(),
                                start.elapsed(),
                            ));
                            vm_errors.push(message);
                            errors.push(err);
                        }
                    }
                }
            }

            let status = if !vm_errors.is_empty() {
                TestStatus::Error
            } else if assertions.iter().any(|a| !a.passed) {
                TestStatus::Failed
            } else {
                TestStatus::Passed
            };
            tracing::info!(vm = name, %status, "VM validated");
            results.push(VmTestResult {
                vm_name: name,
                status,
                started_at,
                finished_at: Timestamp::now(),
                assertions,
                errors: vm_errors,
            });
        }
        results
    }

    async fn collect_logs(&self, timeouts: &ExecutorTimeouts, notes: &mut Vec<String>) -> Vec<PathBuf> {
        let Some(collector) = &self.collector else {
            return Vec::new();
        };
        // Collect even if the run's own context has ended.
        let ctx = CancelContext::new().with_timeout(timeouts.cleanup);
        let vms: Vec<VmInstance> = self.instances().cloned().collect();
        match collector.collect(&ctx, &self.infra, &vms).await {
            Ok(paths) => paths,
            Err(err) => {
                let message = format!("log collection failed: {err:#}");
                tracing::warn!("{message}");
                notes.push(message);
                Vec::new()
            }
        }
    }

    /// Destroys every VM this executor provisioned and closes the VM manager.
    ///
    /// Every VM is attempted even if some fail. VMs that could not be
    /// destroyed stay in [`instances`](Self::instances).
    pub async fn teardown(&mut self, ctx: &CancelContext) -> anyhow::Result<()> {
        tracing::info!(count = self.instances().count(), "tearing down VMs");
        let destroyed = self
            .orchestrator
            .destroy_all(ctx, &mut self.instances)
            .await;
        self.instances
            .retain(|vm| vm.as_ref().is_some_and(|vm| vm.state != VmState::Destroyed));
        let closed = self
            .orchestrator
            .close()
            .await
            .context("failed to close VM manager");

        match (destroyed, closed) {
            (Ok(()), closed) => closed,
            (Err(err), Ok(())) => Err(err.into()),
            (Err(err), Err(close_err)) => {
                tracing::error!(error = format!("{close_err:#}"), "teardown failure");
                Err(err.into())
            }
        }
    }
}

fn resource_result(
    spec: &ResourceSpec,
    status: ResourceStatus,
    message: Option<String>,
) -> ResourceResult {
    ResourceResult {
        kind: spec.kind.clone(),
        name: spec.name.clone(),
        namespace: spec.namespace.clone(),
        status,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertions::AssertionValidator;
    use crate::vm::FakeVmManager;
    use netboot_e2e_defs::AssertionSpec;
    use netboot_e2e_defs::VmSpec;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Applies everything; each resource exists after `polls_needed` checks.
    #[derive(Default)]
    struct FakeApplier {
        applied: Mutex<Vec<String>>,
        checks: Mutex<HashMap<String, u32>>,
        polls_needed: u32,
        reject: Option<String>,
    }

    #[async_trait]
    impl ResourceApplier for FakeApplier {
        async fn apply(
            &self,
            _ctx: &CancelContext,
            resource: &ResourceSpec,
        ) -> anyhow::Result<AppliedResource> {
            if self.reject.as_deref() == Some(&resource.name) {
                anyhow::bail!("admission webhook denied {}", resource.name);
            }
            self.applied.lock().push(resource.name.clone());
            Ok(resource.into())
        }

        async fn exists(
            &self,
            _ctx: &CancelContext,
            resource: &AppliedResource,
        ) -> anyhow::Result<bool> {
            let mut checks = self.checks.lock();
            let n = checks.entry(resource.name.clone()).or_default();
            *n += 1;
            Ok(*n >= self.polls_needed)
        }
    }

    /// Passes or fails according to the assertion's expected value.
    struct ScriptedValidator;

    #[async_trait]
    impl AssertionValidator for ScriptedValidator {
        async fn validate(
            &self,
            _ctx: &CancelContext,
            assertion: &AssertionSpec,
            vm: &VmInstance,
            _infra: &InfrastructureState,
        ) -> anyhow::Result<AssertionResult> {
            match assertion.expected_str() {
                "error" => anyhow::bail!("evidence source misconfigured"),
                "fail" => Ok(AssertionResult::fail(
                    assertion.kind.clone(),
                    "fail",
                    "",
                    format!("nothing for {}", vm.name()),
                    Duration::ZERO,
                )),
                _ => Ok(AssertionResult::pass(
                    assertion.kind.clone(),
                    assertion.expected_str(),
                    "192.168.100.100",
                    "ok",
                    Duration::ZERO,
                )),
            }
        }
    }

    fn resource(name: &str) -> ResourceSpec {
        ResourceSpec {
            kind: "Profile".into(),
            name: name.into(),
            namespace: Some("provisioning".into()),
            manifest: format!("{name}.yaml").into(),
        }
    }

    fn scenario(vms: &[&str], assertions: Vec<AssertionSpec>) -> Scenario {
        Scenario {
            name: "unit".into(),
            description: None,
            vms: vms.iter().map(|n| VmSpec::new(*n)).collect(),
            resources: vec![resource("a"), resource("b"), resource("c")],
            assertions,
            timeouts: Default::default(),
        }
    }

    fn executor(scenario: Scenario, applier: FakeApplier) -> (TestExecutor, Arc<FakeVmManager>) {
        executor_with(scenario, applier, FakeVmManager::default())
    }

    fn executor_with(
        scenario: Scenario,
        applier: FakeApplier,
        manager: FakeVmManager,
    ) -> (TestExecutor, Arc<FakeVmManager>) {
        let manager = Arc::new(manager);
        let registry = ValidatorRegistry::new()
            .with_validator(AssertionKind::DhcpLease, ScriptedValidator)
            .with_validator(AssertionKind::ProfileMatch, ScriptedValidator);
        let executor = TestExecutor::new(
            scenario,
            crate::assertions::tests::infra(),
            Arc::new(applier),
            VmOrchestrator::new(manager.clone(), "netboot-e2e"),
            registry,
        );
        (executor, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn resource_failure_skips_the_rest_and_boots_nothing() {
        let applier = FakeApplier {
            reject: Some("b".into()),
            ..Default::default()
        };
        let (mut executor, manager) = executor(scenario(&["vm-1"], Vec::new()), applier);
        let (result, r) = executor.execute(&CancelContext::new()).await;

        let statuses: Vec<_> = result.resources.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            [
                ResourceStatus::Applied,
                ResourceStatus::Failed,
                ResourceStatus::Skipped
            ]
        );
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.vms.is_empty());
        assert!(manager.live.lock().is_empty());
        let err = r.unwrap_err();
        assert!(matches!(
            err.errors(),
            [PhaseError::ResourceApplyFailed { resource, .. }] if resource == "Profile/provisioning/b"
        ));
        assert!(result.errors[0].contains("admission webhook"), "{:?}", result.errors);
    }

    #[tokio::test(start_paused = true)]
    async fn resource_that_never_appears_times_out() {
        let applier = FakeApplier {
            polls_needed: u32::MAX,
            ..Default::default()
        };
        let (executor, _) = executor(scenario(&["vm-1"], Vec::new()), applier);
        let mut executor = executor.with_timeouts(ExecutorTimeouts {
            resource_ready: Duration::from_secs(10),
            ..Default::default()
        });
        let start = Instant::now();
        let (result, r) = executor.execute(&CancelContext::new()).await;
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(result.resources[0].status, ResourceStatus::Failed);
        assert!(matches!(
            r.unwrap_err().errors(),
            [PhaseError::ResourceTimeout { timeout, .. }] if *timeout == Duration::from_secs(10)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn statuses_roll_up_per_vm() {
        let assertions = vec![
            AssertionSpec::new("vm-1", AssertionKind::DhcpLease),
            AssertionSpec::new("vm-2", AssertionKind::DhcpLease),
            AssertionSpec::new("vm-2", AssertionKind::ProfileMatch).with_expected("fail"),
            AssertionSpec::new("vm-3", AssertionKind::TftpBoot),
        ];
        let applier = FakeApplier {
            polls_needed: 3,
            ..Default::default()
        };
        let (mut executor, _) = executor(scenario(&["vm-1", "vm-2", "vm-3"], assertions), applier);
        let (result, r) = executor.execute(&CancelContext::new()).await;

        r.unwrap();
        let statuses: Vec<_> = result.vms.iter().map(|vm| (vm.vm_name.as_str(), vm.status)).collect();
        assert_eq!(
            statuses,
            [
                ("vm-1", TestStatus::Passed),
                ("vm-2", TestStatus::Failed),
                ("vm-3", TestStatus::Failed)
            ]
        );
        assert_eq!(result.status, TestStatus::Failed);
        assert!(result.vms[2].assertions[0].message.contains("tftp_boot"));
        assert_eq!(
            executor.instances().next().and_then(|vm| vm.ip_address()),
            Some("192.168.100.100".parse().unwrap())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn validator_error_marks_vm_error() {
        let assertions = vec![
            AssertionSpec::new("vm-1", AssertionKind::DhcpLease).with_expected("error"),
            AssertionSpec::new("vm-1", AssertionKind::ProfileMatch),
        ];
        let (mut executor, _) = executor(scenario(&["vm-1"], assertions), FakeApplier::default());
        let (result, r) = executor.execute(&CancelContext::new()).await;
        assert_eq!(result.status, TestStatus::Error);
        assert_eq!(result.vms[0].assertions.len(), 2);
        assert!(!result.vms[0].assertions[0].passed);
        assert!(result.vms[0].assertions[1].passed);
        assert!(matches!(
            r.unwrap_err().errors(),
            [PhaseError::Validation { vm, .. }] if vm == "vm-1"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_rollback_uses_cleanup_budget() {
        let mut manager = FakeVmManager::failing_create(&["vm-2"]);
        manager
            .destroy_delay
            .insert("vm-1".into(), Duration::from_secs(600));
        let (executor, manager) = executor_with(
            scenario(&["vm-1", "vm-2"], Vec::new()),
            FakeApplier::default(),
            manager,
        );
        let mut executor = executor.with_timeouts(ExecutorTimeouts {
            cleanup: Duration::from_secs(1),
            ..Default::default()
        });
        let start = Instant::now();
        let (result, r) = executor.execute(&CancelContext::new()).await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(result.status, TestStatus::Error);
        assert!(matches!(
            r.unwrap_err().errors(),
            [PhaseError::VmProvision(OrchestratorError::ProvisionFailed { name, .. })] if name == "vm-2"
        ));
        assert_eq!(*manager.destroy_calls.lock(), ["vm-1"]);
        assert_eq!(executor.instances().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_vms_is_an_error() {
        let (mut executor, _) = executor(scenario(&[], Vec::new()), FakeApplier::default());
        let (result, r) = executor.execute(&CancelContext::new()).await;
        assert_eq!(result.status, TestStatus::Error);
        assert!(matches!(r.unwrap_err().errors(), [PhaseError::NoVms]));
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_removes_everything() {
        let (mut executor, manager) =
            executor(scenario(&["vm-1", "vm-2"], Vec::new()), FakeApplier::default());
        let (result, r) = executor.execute(&CancelContext::new()).await;
        r.unwrap();
        assert_eq!(result.status, TestStatus::Passed);
        assert_eq!(manager.live.lock().len(), 2);

        executor.teardown(&CancelContext::new()).await.unwrap();
        assert!(manager.live.lock().is_empty());
        assert_eq!(executor.instances().count(), 0);
        // Nothing left, so a second teardown has nothing to do.
        executor.teardown(&CancelContext::new()).await.unwrap();
    }
}
