// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::AssertionValidator;
use super::EvidenceSource;
use super::Finding;
use super::Poller;
use crate::CancelContext;
use crate::vm::VmInstance;
use async_trait::async_trait;
use macaddr::MacAddr6;
use netboot_e2e_defs::AssertionResult;
use netboot_e2e_defs::AssertionSpec;
use netboot_e2e_defs::InfrastructureState;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Checks that a VM holds a DHCP lease.
///
/// The source is a dnsmasq lease file, one lease per line:
///
/// ```text
/// <expiry epoch> <mac> <ip> <hostname> <client-id>
/// ```
///
/// Leases are matched on the VM's MAC address, or on its name when it has
/// no MAC. If the assertion names an expected address, the leased address
/// must equal it.
#[derive(Debug, Clone)]
pub struct DhcpLeaseValidator {
    poller: Poller,
}

impl DhcpLeaseValidator {
    /// Reads leases from `source`.
    pub fn new(source: Arc<dyn EvidenceSource>) -> Self {
        Self {
            poller: Poller::new(source),
        }
    }

    /// Sets how often the lease file is re-read.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poller.interval = interval;
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Lease<'a> {
    mac: &'a str,
    ip: IpAddr,
    hostname: &'a str,
}

fn parse_lease(line: &str) -> Option<Lease<'_>> {
    let mut fields = line.split_whitespace();
    let _expiry: u64 = fields.next()?.parse().ok()?;
    let mac = fields.next()?;
    let ip = fields.next()?.parse().ok()?;
    let hostname = fields.next()?;
    Some(Lease { mac, ip, hostname })
}

fn same_mac(a: &str, b: &str) -> bool {
    match (a.parse::<MacAddr6>(), b.parse::<MacAddr6>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.eq_ignore_ascii_case(b),
    }
}

/// Which lease identifies the VM.
enum LeaseKey<'a> {
    Mac(&'a str),
    Hostname(&'a str),
}

impl LeaseKey<'_> {
    fn matches(&self, lease: &Lease<'_>) -> bool {
        match self {
            LeaseKey::Mac(mac) => same_mac(lease.mac, mac),
            LeaseKey::Hostname(name) => lease.hostname == *name,
        }
    }
}

fn check_leases(text: &str, key: &LeaseKey<'_>, expected: Option<&str>) -> Option<Finding> {
    // A renewed lease is rewritten in place, so the last match is current.
    let lease = text
        .lines()
        .rev()
        .filter_map(parse_lease)
        .find(|lease| key.matches(lease))?;
    let ip = lease.ip.to_string();
    match expected {
        Some(expected) if expected != ip => Some(Finding::mismatch(
            ip.clone(),
            format!("lease for {} has address {ip}, expected {expected}", lease.mac),
        )),
        _ => Some(Finding::pass(
            ip.clone(),
            format!("{} leased {ip} ({})", lease.mac, lease.hostname),
        )),
    }
}

#[async_trait]
impl AssertionValidator for DhcpLeaseValidator {
    async fn validate(
        &self,
        ctx: &CancelContext,
        assertion: &AssertionSpec,
        vm: &VmInstance,
        _infra: &InfrastructureState,
    ) -> anyhow::Result<AssertionResult> {
        let (key, waiting_for) = match vm.mac_address() {
            Some(mac) => (LeaseKey::Mac(mac), format!("a DHCP lease for {mac}")),
            None => (
                LeaseKey::Hostname(vm.name()),
                format!("a DHCP lease for hostname {}", vm.name()),
            ),
        };
        let expected = assertion.expected.as_deref().filter(|e| !e.is_empty());
        self.poller
            .poll(ctx, assertion, vm, &waiting_for, |text| {
                check_leases(text, &key, expected)
            })
            .await
    }
}
