// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::AssertionValidator;
use super::EvidenceSource;
use super::Finding;
use super::Poller;
use super::ValidationError;
use crate::CancelContext;
use crate::vm::VmInstance;
use async_trait::async_trait;
use netboot_e2e_defs::AssertionResult;
use netboot_e2e_defs::AssertionSpec;
use netboot_e2e_defs::InfrastructureState;
use std::sync::Arc;
use std::time::Duration;

/// Checks that a VM fetched a file over TFTP.
///
/// The source is the DHCP/TFTP daemon's log, where dnsmasq reports each
/// completed transfer as
///
/// ```text
/// dnsmasq-tftp[812]: sent /srv/tftp/undionly.kpxe to 192.168.100.100
/// ```
///
/// The VM's address must already be known, so a `dhcp_lease` assertion has to
/// pass first. If the assertion names an expected file, the transfer line must
/// mention it.
#[derive(Debug, Clone)]
pub struct TftpBootValidator {
    poller: Poller,
}

impl TftpBootValidator {
    /// Reads the daemon log from `source`.
    pub fn new(source: Arc<dyn EvidenceSource>) -> Self {
        Self {
            poller: Poller::new(source),
        }
    }

    /// Sets how often the log is re-read.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poller.interval = interval;
        self
    }
}

const TRANSFER_MARKERS: [&str; 2] = ["sent", "file"];
const FAILURE_WORDS: [&str; 3] = ["failed", "error", "not"];

/// Returns the transferred file if `line` reports a completed transfer to
/// `ip`.
fn transfer<'a>(line: &'a str, ip: &str) -> Option<&'a str> {
    let words: Vec<&str> = line
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| matches!(c, ',' | ';' | '"' | '\'')))
        .collect();
    if !words.contains(&ip) || words.iter().any(|w| FAILURE_WORDS.contains(w)) {
        return None;
    }
    let marker = words.iter().position(|w| TRANSFER_MARKERS.contains(w))?;
    let file = words.get(marker + 1).copied().filter(|f| *f != ip)?;
    Some(file)
}

fn check_transfers(text: &str, ip: &str, expected: Option<&str>) -> Option<Finding> {
    text.lines().find_map(|line| {
        let file = transfer(line, ip)?;
        if expected.is_some_and(|e| !line.contains(e)) {
            return None;
        }
        Some(Finding::pass(file, format!("{ip} fetched {file}")))
    })
}

#[async_trait]
impl AssertionValidator for TftpBootValidator {
    async fn validate(
        &self,
        ctx: &CancelContext,
        assertion: &AssertionSpec,
        vm: &VmInstance,
        _infra: &InfrastructureState,
    ) -> anyhow::Result<AssertionResult> {
        let Some(ip) = vm.ip_address() else {
            return Err(ValidationError::IpUnknown {
                vm: vm.name().to_owned(),
            }
            .into());
        };
        let ip = ip.to_string();
        let expected = assertion.expected.as_deref().filter(|e| !e.is_empty());
        let waiting_for = match expected {
            Some(file) => format!("a TFTP transfer of {file} to {ip}"),
            None => format!("a TFTP transfer to {ip}"),
        };
        self.poller
            .poll(ctx, assertion, vm, &waiting_for, |text| {
                check_transfers(text, &ip, expected)
            })
            .await
    }
}
