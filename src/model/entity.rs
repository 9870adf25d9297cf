//! Kind-specific entity records (§3's attribute table and kind-specific
//! additions).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};

use crate::error::MeshError;
use crate::keys::{PrivateKey, PublicKey};

/// `host:port` pair used for SSH coordinates and WireGuard `Endpoint`
/// fields alike.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl EndpointAddr {
    pub fn parse(s: &str) -> Result<EndpointAddr, MeshError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MeshError::MalformedConfig(format!("endpoint `{s}` missing port")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| MeshError::MalformedConfig(format!("endpoint `{s}` has bad port")))?;
        Ok(EndpointAddr {
            host: host.to_string(),
            port,
        })
    }
}

/// SSH coordinates for a deployable host (§3 kind-specific additions,
/// §6 "SSH interface"). Auth material is deliberately not stored here —
/// the deployment engine (C9) receives it out of band from the caller,
/// matching §1's framing of SSH as an externally supplied interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshCoordinates {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub remote_config_path: String,
}

impl SshCoordinates {
    #[must_use]
    pub fn default_config_path(iface: &str) -> String {
        format!("/etc/wireguard/{iface}.conf")
    }
}

/// The attribute shape shared by all four WireGuard-speaking entity kinds
/// (§3). `permanent_guid` is set once at first persistence (identity
/// invariant #1) and never mutates again; everything named `current_*`
/// mutates on rotation (§3 Lifecycle).
#[derive(Clone, Debug, PartialEq)]
pub struct Identity {
    pub permanent_guid: PublicKey,
    pub current_public_key: PublicKey,
    pub current_private_key: PrivateKey,
    pub hostname: String,
    pub vpn_ipv4: Ipv4Addr,
    pub vpn_ipv6: Option<Ipv6Addr>,
    pub endpoint: Option<EndpointAddr>,
    pub listen_port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    /// Default hostname when the caller doesn't supply one (§3: "first 8
    /// chars of `permanent_guid` when absent").
    #[must_use]
    pub fn default_hostname(permanent_guid: &PublicKey) -> String {
        permanent_guid.to_string().chars().take(8).collect()
    }

    /// Identity invariant #2: `current_public_key == derive_public(current_private_key)`.
    #[must_use]
    pub fn is_internally_consistent(&self) -> bool {
        crate::keys::derive_public(&self.current_private_key) == self.current_public_key
    }
}

/// §3: `access_level ∈ {full_access, vpn_only, lan_only, restricted_ip,
/// exit_only, custom}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessLevel {
    FullAccess,
    VpnOnly,
    LanOnly,
    RestrictedIp,
    ExitOnly,
    Custom,
}

impl AccessLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::FullAccess => "full_access",
            AccessLevel::VpnOnly => "vpn_only",
            AccessLevel::LanOnly => "lan_only",
            AccessLevel::RestrictedIp => "restricted_ip",
            AccessLevel::ExitOnly => "exit_only",
            AccessLevel::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Result<AccessLevel, MeshError> {
        Ok(match s {
            "full_access" => AccessLevel::FullAccess,
            "vpn_only" => AccessLevel::VpnOnly,
            "lan_only" => AccessLevel::LanOnly,
            "restricted_ip" => AccessLevel::RestrictedIp,
            "exit_only" => AccessLevel::ExitOnly,
            "custom" => AccessLevel::Custom,
            other => return Err(MeshError::UnknownAccessLevel(other.to_string())),
        })
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The public hub (§3).
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinationServer {
    pub identity: Identity,
    pub vpn_network_v4: Ipv4Net,
    pub vpn_network_v6: Option<Ipv6Net>,
    pub ssh: SshCoordinates,
}

/// A LAN gateway advertising one or more private networks (§3).
#[derive(Clone, Debug, PartialEq)]
pub struct SubnetRouter {
    pub identity: Identity,
    /// Ordered: order is load-bearing for deterministic `AllowedIPs`
    /// emission under `full_access` (§4.7).
    pub advertised_networks: Vec<ipnet::IpNet>,
    pub lan_interface: String,
    pub ssh: SshCoordinates,
}

/// An end-user device (§3).
#[derive(Clone, Debug, PartialEq)]
pub struct Remote {
    pub identity: Identity,
    pub access_level: AccessLevel,
    pub custom_allowed_ips: Option<Vec<ipnet::IpNet>>,
    pub device_type: Option<String>,
    pub exit_node_id: Option<PublicKey>,
}

/// An internet-egress server (§3).
#[derive(Clone, Debug, PartialEq)]
pub struct ExitNode {
    pub identity: Identity,
    pub wan_interface: String,
    pub ssh: SshCoordinates,
    pub assigned_remote_count: u32,
}
