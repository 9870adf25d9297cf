//! Extramural (third-party commercial-VPN) bookkeeping (§3, §4.10,
//! component C10). A separate, non-overlapping domain: "extramural state
//! never appears in CS/SR/exit-node configs" (§4.10).

use chrono::{DateTime, Utc};
use ipnet::IpNet;

use crate::keys::{PresharedKey, PrivateKey, PublicKey};

/// Owns one or more [`ExtramuralConfig`]s.
#[derive(Clone, Debug, PartialEq)]
pub struct Sponsor {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A single third-party VPN configuration, bound to exactly one local
/// peer (our side of the tunnel) and carrying multiple candidate servers,
/// exactly one of which is active at a time (§4.10).
#[derive(Clone, Debug, PartialEq)]
pub struct ExtramuralConfig {
    pub id: i64,
    pub sponsor_id: i64,
    /// The local private key this provider issued us, plus whatever
    /// address/DNS it assigned.
    pub local_private_key: PrivateKey,
    pub local_public_key: PublicKey,
    pub local_address: Vec<IpNet>,
    pub dns: Vec<String>,
    /// Set when the local key has been rotated but the provider hasn't
    /// been told yet (§4.10: "rotate local key (marks `pending_remote_update`)").
    pub pending_remote_update: bool,
}

/// One candidate remote endpoint for an [`ExtramuralConfig`]. Exactly one
/// per config has `active = true`, enforced by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtramuralServer {
    pub id: i64,
    pub config_id: i64,
    pub label: String,
    pub public_key: PublicKey,
    pub preshared_key: Option<PresharedKey>,
    pub endpoint: String,
    pub allowed_ips: Vec<IpNet>,
    pub active: bool,
}
