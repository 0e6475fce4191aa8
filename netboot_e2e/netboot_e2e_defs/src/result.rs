// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::AssertionKind;
use crate::serde_helpers::duration_millis;
use jiff::Timestamp;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// The outcome of one assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    /// The kind of assertion checked.
    #[serde(rename = "type")]
    pub kind: AssertionKind,
    /// What the assertion expected.
    pub expected: String,
    /// What the evidence showed. Empty when nothing matched.
    pub actual: String,
    /// Whether the assertion held.
    pub passed: bool,
    /// Human-readable explanation.
    pub message: String,
    /// Time from validator entry to verdict.
    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,
}

impl AssertionResult {
    /// A passing result.
    pub fn pass(
        kind: AssertionKind,
        expected: impl Into<String>,
        actual: impl Into<String>,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            kind,
            expected: expected.into(),
            actual: actual.into(),
            passed: true,
            message: message.into(),
            duration,
        }
    }

    /// A failing result.
    pub fn fail(
        kind: AssertionKind,
        expected: impl Into<String>,
        actual: impl Into<String>,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            kind,
            expected: expected.into(),
            actual: actual.into(),
            passed: false,
            message: message.into(),
            duration,
        }
    }
}

/// Verdict of a VM or of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// Every check held.
    Passed,
    /// At least one check did not hold.
    Failed,
    /// The run could not be carried out as specified.
    Error,
}

impl TestStatus {
    /// Derives the overall status from per-VM statuses.
    ///
    /// `Error` wins over `Failed`, which wins over `Passed`. A run with no VM
    /// results at all is an `Error`: nothing was verified.
    pub fn aggregate(statuses: impl IntoIterator<Item = TestStatus>) -> TestStatus {
        let mut any = false;
        let mut overall = TestStatus::Passed;
        for status in statuses {
            any = true;
            match status {
                TestStatus::Error => return TestStatus::Error,
                TestStatus::Failed => overall = TestStatus::Failed,
                TestStatus::Passed => {}
            }
        }
        if any { overall } else { TestStatus::Error }
    }

    /// The status as written in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Error => "error",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one scenario resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Applied and confirmed to exist.
    Applied,
    /// Applying or confirming it failed.
    Failed,
    /// Not attempted because an earlier resource failed.
    Skipped,
}

/// Outcome for one scenario resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResult {
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Resource namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// What happened.
    pub status: ResourceStatus,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Lifecycle stage of a provisioned VM.
///
/// `Stopped` is part of the persisted vocabulary but nothing in the engine
/// transitions a VM into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[expect(missing_docs)] // Self-describing names.
pub enum VmState {
    Created,
    Running,
    Stopped,
    Destroyed,
}

/// Kind of VM lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[expect(missing_docs)] // Self-describing names.
pub enum VmEventType {
    ProvisionStarted,
    Provisioned,
    ProvisionFailed,
    DestroyStarted,
    Destroyed,
    DestroyFailed,
}

/// Append-only record of something that happened to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEvent {
    /// When it happened.
    pub timestamp: Timestamp,
    /// The VM it happened to.
    pub vm_name: String,
    /// What happened.
    pub event_type: VmEventType,
    /// Free-text detail.
    pub detail: String,
}

/// Verdict for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTestResult {
    /// The VM's name.
    pub vm_name: String,
    /// Verdict.
    pub status: TestStatus,
    /// When validation of this VM started.
    pub started_at: Timestamp,
    /// When validation of this VM finished.
    pub finished_at: Timestamp,
    /// One result per assertion targeting this VM, in scenario order.
    pub assertions: Vec<AssertionResult>,
    /// Validator errors, as distinct from failed assertions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Verdict for a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Scenario name.
    pub scenario: String,
    /// Environment the run executed against.
    pub environment_id: String,
    /// Overall verdict.
    pub status: TestStatus,
    /// When the run started.
    pub started_at: Timestamp,
    /// When the run finished.
    pub finished_at: Timestamp,
    /// One entry per scenario resource, in scenario order.
    pub resources: Vec<ResourceResult>,
    /// One entry per validated VM, in scenario order.
    pub vms: Vec<VmTestResult>,
    /// VM lifecycle events recorded during the run.
    pub events: Vec<TestEvent>,
    /// Phase errors, in the order they occurred.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Artifacts gathered after the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_files: Vec<PathBuf>,
}

impl TestResult {
    /// Iterates over every assertion result of every VM.
    pub fn assertions(&self) -> impl Iterator<Item = (&str, &AssertionResult)> {
        self.vms
            .iter()
            .flat_map(|vm| vm.assertions.iter().map(|a| (vm.vm_name.as_str(), a)))
    }

    /// Number of assertions that failed.
    pub fn failed_assertions(&self) -> usize {
        self.assertions().filter(|(_, a)| !a.passed).count()
    }
}
