// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::AssertionValidator;
use super::EvidenceSource;
use super::Finding;
use super::Poller;
use super::ValidationError;
use super::fields::ASSIGNMENT_SELECTED;
use super::fields::BOOT_REQUEST;
use super::fields::LogLine;
use super::fields::PROFILE_MATCHED;
use super::fields::parse_lines;
use crate::CancelContext;
use crate::vm::VmInstance;
use async_trait::async_trait;
use netboot_e2e_defs::AssertionResult;
use netboot_e2e_defs::AssertionSpec;
use netboot_e2e_defs::InfrastructureState;
use std::sync::Arc;
use std::time::Duration;

/// An API decision that follows a boot request.
#[derive(Debug, Clone, Copy)]
struct Decision {
    marker: &'static str,
    name_fields: &'static [&'static str],
    what: &'static str,
}

const PROFILE: Decision = Decision {
    marker: PROFILE_MATCHED,
    name_fields: &["profile", "name"],
    what: "profile",
};

const ASSIGNMENT: Decision = Decision {
    marker: ASSIGNMENT_SELECTED,
    name_fields: &["assignment", "name"],
    what: "assignment",
};

/// Checks which profile or assignment the provisioning API chose for a VM.
///
/// A machine may boot more than once, so the decision that counts is the one
/// logged after the VM's most recent boot request. The log is scanned once to
/// find the last `ipxe_boot_request` for the VM's UUID, then forward from
/// there for the first decision event. Decision lines that name a different
/// UUID belong to another machine and are skipped.
///
/// A decision naming something other than the expected value is a failed
/// result. With no expected value any decision passes.
#[derive(Debug, Clone)]
pub struct CorrelationValidator {
    poller: Poller,
    decision: Decision,
}

impl CorrelationValidator {
    /// Checks `profile_matched` events.
    pub fn profile_match(source: Arc<dyn EvidenceSource>) -> Self {
        Self {
            poller: Poller::new(source),
            decision: PROFILE,
        }
    }

    /// Checks `assignment_selected` events.
    pub fn assignment_match(source: Arc<dyn EvidenceSource>) -> Self {
        Self {
            poller: Poller::new(source),
            decision: ASSIGNMENT,
        }
    }

    /// Sets how often the log is re-read.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poller.interval = interval;
        self
    }
}

/// Returns the name chosen after the last boot request for `uuid`.
fn correlate<'a>(lines: &'a [LogLine<'_>], uuid: &str, decision: &Decision) -> Option<&'a str> {
    let request = lines
        .iter()
        .rposition(|line| line.is_event(BOOT_REQUEST) && line.is_for(uuid))?;
    lines[request + 1..]
        .iter()
        .filter(|line| line.is_event(decision.marker) && !line.is_for_other(uuid))
        .find_map(|line| line.first_field(decision.name_fields))
}

fn check(text: &str, uuid: &str, decision: &Decision, expected: Option<&str>) -> Option<Finding> {
    let lines = parse_lines(text);
    let name = correlate(&lines, uuid, decision)?;
    let finding = match expected {
        Some(expected) if expected != name => Finding::mismatch(
            name,
            format!("{} mismatch: expected {expected:?}, got {name:?}", decision.what),
        ),
        _ => Finding::pass(name, format!("{} {name:?} selected", decision.what)),
    };
    Some(finding)
}

#[async_trait]
impl AssertionValidator for CorrelationValidator {
    async fn validate(
        &self,
        ctx: &CancelContext,
        assertion: &AssertionSpec,
        vm: &VmInstance,
        _infra: &InfrastructureState,
    ) -> anyhow::Result<AssertionResult> {
        let Some(uuid) = vm.uuid() else {
            return Err(ValidationError::UuidUnknown {
                vm: vm.name().to_owned(),
            }
            .into());
        };
        let decision = self.decision;
        let expected = assertion.expected.as_deref().filter(|e| !e.is_empty());
        let waiting_for = format!("a {} after a boot request from {uuid}", decision.marker);
        self.poller
            .poll(ctx, assertion, vm, &waiting_for, |text| {
                check(text, uuid, &decision, expected)
            })
            .await
    }
}
