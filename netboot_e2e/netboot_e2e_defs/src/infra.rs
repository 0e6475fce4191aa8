// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use jiff::Timestamp;
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;

/// A provisioned test environment: the network, boot services, and cluster
/// that a scenario runs against.
///
/// The field names are the persisted format of the environment store and must
/// stay stable across versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureState {
    /// Unique environment identifier. Also the store's file name.
    pub id: String,
    /// Host bridge the test network is attached to.
    pub bridge_name: String,
    /// Name of the virtual network VMs are attached to.
    pub network_name: String,
    /// CIDR of the test network.
    #[serde(default)]
    pub network_cidr: String,
    /// PID of the DNS/DHCP/TFTP daemon serving the test network, if running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dnsmasq_pid: Option<u32>,
    /// DHCP lease file written by the daemon.
    pub lease_file: PathBuf,
    /// Log file the daemon writes DHCP and TFTP activity to.
    pub dnsmasq_log_file: PathBuf,
    /// Name of the cluster hosting the provisioning API.
    pub cluster_name: String,
    /// Kubeconfig for the cluster.
    pub kubeconfig_path: PathBuf,
    /// Root directory served over TFTP.
    pub tftp_root: PathBuf,
    /// Directory collected logs and reports are written to.
    pub artifact_dir: PathBuf,
    /// When the environment was created.
    pub created_at: Timestamp,
}
