//! The config generator (spec §4.6, component C6): structured records →
//! canonical `.conf` text, plus the QR payload for remote-client configs.
//!
//! Comments are re-emitted at their recorded `position` (§4.6: "Comments
//! are re-emitted at their recorded positions"). The persisted `comment`
//! row (§3) only carries a section-level `position`, not a field name, so
//! re-emission groups `Above`/`Before`/`Standalone` comments ahead of a
//! section's fields and `Inline`/`After` comments behind them, in
//! `display_order` — the coarsest placement the stored schema actually
//! supports.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::access::{allowed_ips_for_cs_peer, default_route_allowed_ips, synthesize_restricted_ip_block};
use crate::error::MeshError;
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::model::{
    AccessLevel, Comment, CommandPair, CommandSingleton, CommentPosition, CoordinationServer,
    EntityKind, ExitNode, Identity, PeerFirewallRule, Remote, SubnetRouter,
};
use crate::patterns::{emit_bidirectional_pair, emit_down, emit_up, PatternName};

/// Default DNS resolvers for an exit-assigned remote (§4.6 item 3; §9
/// Open Question: "surface as a configurable default with the documented
/// fallback").
pub const DEFAULT_EXIT_DNS: [&str; 2] = ["1.1.1.1", "8.8.8.8"];

#[derive(Clone, Debug, Default)]
pub struct InterfaceFields {
    pub private_key: Option<PrivateKey>,
    pub address: Vec<IpNet>,
    pub listen_port: Option<u16>,
    pub dns: Vec<String>,
    pub mtu: Option<u32>,
    pub table: Option<String>,
    pub fwmark: Option<String>,
    pub post_up: Vec<String>,
    pub post_down: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct PeerFields {
    pub public_key: PublicKey,
    pub preshared_key: Option<PresharedKey>,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: u16,
}

fn emit_comments<'a>(out: &mut String, comments: impl Iterator<Item = &'a Comment>) {
    for c in comments {
        for line in c.text.lines() {
            let _ = writeln!(out, "# {line}");
        }
    }
}

fn leading_comments(comments: &[Comment]) -> Vec<&Comment> {
    let mut v: Vec<&Comment> = comments
        .iter()
        .filter(|c| {
            matches!(
                c.position,
                CommentPosition::Above | CommentPosition::Before | CommentPosition::Standalone
            )
        })
        .collect();
    v.sort_by_key(|c| c.display_order);
    v
}

fn trailing_comments(comments: &[Comment]) -> Vec<&Comment> {
    let mut v: Vec<&Comment> = comments
        .iter()
        .filter(|c| matches!(c.position, CommentPosition::Inline | CommentPosition::After))
        .collect();
    v.sort_by_key(|c| c.display_order);
    v
}

/// Renders one `[Interface]` section in the canonical field order
/// (§4.6): `PrivateKey, Address, ListenPort, DNS, MTU, Table, FwMark,
/// PostUp*, PostDown*`.
pub fn render_interface(fields: &InterfaceFields, comments: &[Comment]) -> String {
    let mut out = String::new();
    emit_comments(&mut out, leading_comments(comments).into_iter());
    out.push_str("[Interface]\n");
    if let Some(pk) = &fields.private_key {
        let _ = writeln!(out, "PrivateKey = {pk}");
    }
    if !fields.address.is_empty() {
        let addrs = fields.address.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        let _ = writeln!(out, "Address = {addrs}");
    }
    if let Some(port) = fields.listen_port {
        let _ = writeln!(out, "ListenPort = {port}");
    }
    if !fields.dns.is_empty() {
        let _ = writeln!(out, "DNS = {}", fields.dns.join(", "));
    }
    if let Some(mtu) = fields.mtu {
        let _ = writeln!(out, "MTU = {mtu}");
    }
    if let Some(table) = &fields.table {
        let _ = writeln!(out, "Table = {table}");
    }
    if let Some(fwmark) = &fields.fwmark {
        let _ = writeln!(out, "FwMark = {fwmark}");
    }
    for up in &fields.post_up {
        let _ = writeln!(out, "PostUp = {up}");
    }
    for down in &fields.post_down {
        let _ = writeln!(out, "PostDown = {down}");
    }
    emit_comments(&mut out, trailing_comments(comments).into_iter());
    out
}

/// Renders one `[Peer]` section in canonical order (§4.6): `PublicKey,
/// PresharedKey, Endpoint, AllowedIPs, PersistentKeepalive`.
pub fn render_peer(fields: &PeerFields, comments: &[Comment]) -> String {
    let mut out = String::new();
    emit_comments(&mut out, leading_comments(comments).into_iter());
    out.push_str("[Peer]\n");
    let _ = writeln!(out, "PublicKey = {}", fields.public_key);
    if let Some(psk) = &fields.preshared_key {
        let _ = writeln!(out, "PresharedKey = {psk}");
    }
    if let Some(endpoint) = &fields.endpoint {
        let _ = writeln!(out, "Endpoint = {endpoint}");
    }
    if !fields.allowed_ips.is_empty() {
        let ips = fields.allowed_ips.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        let _ = writeln!(out, "AllowedIPs = {ips}");
    }
    if fields.persistent_keepalive != 0 {
        let _ = writeln!(out, "PersistentKeepalive = {}", fields.persistent_keepalive);
    }
    emit_comments(&mut out, trailing_comments(comments).into_iter());
    out
}

/// Assembles an ordered list of rendered sections into one `.conf` text:
/// LF line endings, a single trailing newline, blank line between
/// sections (§6).
#[must_use]
pub fn assemble(sections: Vec<String>) -> String {
    sections.join("\n")
}

/// The literal remote-client `.conf` text is the QR payload (§4.6: "QR
/// output is the literal remote-client `.conf` text encoded as a QR
/// image"). Rendering the image itself is out of scope (§1); this
/// function exists only to name the handoff point for the embedding
/// binary's QR renderer.
#[must_use]
pub fn qr_payload(remote_conf_text: &str) -> &str {
    remote_conf_text
}

fn addr_net(addr: IpAddr, prefix: u8) -> Result<IpNet, MeshError> {
    IpNet::new(addr, prefix).map_err(|e| MeshError::MalformedConfig(e.to_string()))
}

/// The host route(s) an entity's own VPN address(es) contribute to a
/// peer's `Address`/`AllowedIPs` field: `/32` for IPv4, `/128` for IPv6.
fn identity_self_route(identity: &Identity) -> Result<Vec<IpNet>, MeshError> {
    let mut ips = vec![addr_net(IpAddr::V4(identity.vpn_ipv4), 32)?];
    if let Some(v6) = identity.vpn_ipv6 {
        ips.push(addr_net(IpAddr::V6(v6), 128)?);
    }
    Ok(ips)
}

/// Joins already-persisted `command_pair`/`command_singleton` rows into
/// one ordered `PostUp`/`PostDown` pair (§4.4, §4.6 item 2: "canonical
/// `PostUp`/`PostDown` reconstructed from pattern library + variables +
/// verbatim customs"). Rows carry their rendered text directly (a
/// recognized pattern's `up_commands`/`down_commands` were populated at
/// import time), so this is a pure merge-by-`execution_order`, not a
/// second pass through the pattern registry.
#[must_use]
pub fn render_commands(pairs: &[CommandPair], singletons: &[CommandSingleton]) -> (Vec<String>, Vec<String>) {
    let mut items: Vec<(i64, Vec<String>, Vec<String>)> = pairs
        .iter()
        .map(|p| (p.execution_order, p.up_commands.clone(), p.down_commands.clone()))
        .collect();
    for s in singletons {
        let (up, down) = if s.direction_is_up {
            (vec![s.command.clone()], Vec::new())
        } else {
            (Vec::new(), vec![s.command.clone()])
        };
        items.push((s.execution_order, up, down));
    }
    items.sort_by_key(|(order, ..)| *order);

    let mut up_all = Vec::new();
    let mut down_all = Vec::new();
    for (_, up, down) in items {
        up_all.extend(up);
        down_all.extend(down);
    }
    (up_all, down_all)
}

fn sr_peer_fields(sr: &SubnetRouter) -> Result<PeerFields, MeshError> {
    let mut allowed = identity_self_route(&sr.identity)?;
    allowed.extend(sr.advertised_networks.iter().copied());
    Ok(PeerFields {
        public_key: sr.identity.current_public_key.clone(),
        preshared_key: None,
        endpoint: sr.identity.endpoint.as_ref().map(ToString::to_string),
        allowed_ips: allowed,
        persistent_keepalive: 0,
    })
}

/// Assembles the coordination-server config (§4.6 item 1): its own
/// `[Interface]`, then one `[Peer]` per subnet router, per non-`exit_only`
/// remote, and per exit node, in `peer_order` (falling back to
/// subnet-routers-then-remotes-then-exits, each in their given slice
/// order, when `peer_order` is empty — §3's "falls back to creation
/// order" with entities already listed in creation order by the caller).
pub fn generate_coordination_server(
    cs: &CoordinationServer,
    subnet_routers: &[SubnetRouter],
    remotes: &[Remote],
    exit_nodes: &[ExitNode],
    peer_order: &[(String, EntityKind)],
    comments: &BTreeMap<String, Vec<Comment>>,
) -> Result<String, MeshError> {
    let no_comments: Vec<Comment> = Vec::new();
    let iface = InterfaceFields {
        private_key: Some(cs.identity.current_private_key.clone()),
        address: identity_self_route(&cs.identity)?,
        listen_port: cs.identity.listen_port,
        dns: Vec::new(),
        mtu: None,
        table: None,
        fwmark: None,
        post_up: Vec::new(),
        post_down: Vec::new(),
    };
    let mut sections = vec![render_interface(
        &iface,
        comments.get(&cs.identity.permanent_guid.to_string()).unwrap_or(&no_comments),
    )];

    let ordered_guids: Vec<(String, EntityKind)> = if peer_order.is_empty() {
        subnet_routers
            .iter()
            .map(|s| (s.identity.permanent_guid.to_string(), EntityKind::SubnetRouter))
            .chain(
                remotes
                    .iter()
                    .filter(|r| r.access_level != AccessLevel::ExitOnly)
                    .map(|r| (r.identity.permanent_guid.to_string(), EntityKind::Remote)),
            )
            .chain(exit_nodes.iter().map(|e| (e.identity.permanent_guid.to_string(), EntityKind::ExitNode)))
            .collect()
    } else {
        peer_order.to_vec()
    };

    for (guid, kind) in ordered_guids {
        let entity_comments = comments.get(&guid).unwrap_or(&no_comments);
        match kind {
            EntityKind::SubnetRouter => {
                if let Some(sr) = subnet_routers.iter().find(|s| s.identity.permanent_guid.to_string() == guid) {
                    sections.push(render_peer(&sr_peer_fields(sr)?, entity_comments));
                }
            }
            EntityKind::Remote => {
                if let Some(r) = remotes.iter().find(|r| r.identity.permanent_guid.to_string() == guid) {
                    if r.access_level == AccessLevel::ExitOnly {
                        continue;
                    }
                    let peer = PeerFields {
                        public_key: r.identity.current_public_key.clone(),
                        preshared_key: None,
                        endpoint: None,
                        allowed_ips: identity_self_route(&r.identity)?,
                        persistent_keepalive: 0,
                    };
                    sections.push(render_peer(&peer, entity_comments));
                }
            }
            EntityKind::ExitNode => {
                if let Some(e) = exit_nodes.iter().find(|e| e.identity.permanent_guid.to_string() == guid) {
                    let peer = PeerFields {
                        public_key: e.identity.current_public_key.clone(),
                        preshared_key: None,
                        endpoint: None,
                        allowed_ips: identity_self_route(&e.identity)?,
                        persistent_keepalive: 0,
                    };
                    sections.push(render_peer(&peer, entity_comments));
                }
            }
            _ => {}
        }
    }

    Ok(assemble(sections))
}

/// Assembles a subnet-router config (§4.6 item 2): its `[Interface]` with
/// reconstructed `PostUp`/`PostDown` plus any restricted-IP firewall
/// blocks contributed by remotes that target it, then one `[Peer]`
/// pointing at the coordination server.
pub fn generate_subnet_router(
    sr: &SubnetRouter,
    cs: &CoordinationServer,
    command_pairs: &[CommandPair],
    command_singletons: &[CommandSingleton],
    remote_firewall_rules: &[(Remote, Vec<PeerFirewallRule>)],
    comments: &[Comment],
) -> Result<String, MeshError> {
    let (mut post_up, mut post_down) = render_commands(command_pairs, command_singletons);

    for (remote, rules) in remote_firewall_rules {
        if rules.is_empty() {
            continue;
        }
        let (up, down) =
            synthesize_restricted_ip_block(&remote.identity.hostname, remote.identity.vpn_ipv4, rules);
        post_up.extend(up);
        post_down.extend(down);
    }

    let iface = InterfaceFields {
        private_key: Some(sr.identity.current_private_key.clone()),
        address: identity_self_route(&sr.identity)?,
        listen_port: sr.identity.listen_port,
        dns: Vec::new(),
        mtu: None,
        table: None,
        fwmark: None,
        post_up,
        post_down,
    };
    let mut sections = vec![render_interface(&iface, comments)];

    let cs_peer = PeerFields {
        public_key: cs.identity.current_public_key.clone(),
        preshared_key: None,
        endpoint: cs.identity.endpoint.as_ref().map(ToString::to_string),
        allowed_ips: identity_self_route(&cs.identity)?,
        persistent_keepalive: 25,
    };
    sections.push(render_peer(&cs_peer, &[]));

    Ok(assemble(sections))
}

/// Assembles a remote-client config (§4.6 item 3).
pub fn generate_remote_client(
    remote: &Remote,
    cs: &CoordinationServer,
    subnet_routers: &[SubnetRouter],
    firewall_rules: &[PeerFirewallRule],
    exit_node: Option<&ExitNode>,
    dns_override: &[String],
    comments: &[Comment],
) -> Result<String, MeshError> {
    let dns = if !dns_override.is_empty() {
        dns_override.to_vec()
    } else if exit_node.is_some() {
        DEFAULT_EXIT_DNS.iter().map(ToString::to_string).collect()
    } else {
        Vec::new()
    };

    let iface = InterfaceFields {
        private_key: Some(remote.identity.current_private_key.clone()),
        address: identity_self_route(&remote.identity)?,
        listen_port: None,
        dns,
        mtu: None,
        table: None,
        fwmark: None,
        post_up: Vec::new(),
        post_down: Vec::new(),
    };
    let mut sections = vec![render_interface(&iface, comments)];

    if remote.access_level != AccessLevel::ExitOnly {
        let allowed = allowed_ips_for_cs_peer(remote, cs, subnet_routers, firewall_rules).unwrap_or_default();
        let cs_peer = PeerFields {
            public_key: cs.identity.current_public_key.clone(),
            preshared_key: None,
            endpoint: cs.identity.endpoint.as_ref().map(ToString::to_string),
            allowed_ips: allowed,
            persistent_keepalive: 25,
        };
        sections.push(render_peer(&cs_peer, &[]));
    }

    if let Some(exit) = exit_node {
        let exit_peer = PeerFields {
            public_key: exit.identity.current_public_key.clone(),
            preshared_key: None,
            endpoint: exit.identity.endpoint.as_ref().map(ToString::to_string),
            allowed_ips: default_route_allowed_ips(),
            persistent_keepalive: 25,
        };
        sections.push(render_peer(&exit_peer, &[]));
    }

    Ok(assemble(sections))
}

/// Builds an exit node's MASQUERADE + forwarding-enable + MSS-clamping
/// `PostUp`/`PostDown` from the pattern library (§4.6 item 4), over the
/// mesh's own VPN network(s) rather than any one peer's address.
fn exit_node_commands(wan: &str, vpn_network_v4: &str, vpn_network_v6: Option<&str>) -> (Vec<String>, Vec<String>) {
    let empty = BTreeMap::new();
    let mut up = vec![emit_up(PatternName::EnableIpv4Forwarding, &empty)];
    let mut down = vec![emit_down(PatternName::EnableIpv4Forwarding, &empty)];

    let mut nat4 = BTreeMap::new();
    nat4.insert("cidr4".to_string(), vpn_network_v4.to_string());
    nat4.insert("wan".to_string(), wan.to_string());
    up.push(emit_up(PatternName::NatMasqueradeIpv4, &nat4));
    down.push(emit_down(PatternName::NatMasqueradeIpv4, &nat4));

    if let Some(v6) = vpn_network_v6 {
        up.push(emit_up(PatternName::EnableIpv6Forwarding, &empty));
        down.push(emit_down(PatternName::EnableIpv6Forwarding, &empty));
        let mut nat6 = BTreeMap::new();
        nat6.insert("cidr6".to_string(), v6.to_string());
        nat6.insert("wan".to_string(), wan.to_string());
        up.push(emit_up(PatternName::NatMasqueradeIpv6, &nat6));
        down.push(emit_down(PatternName::NatMasqueradeIpv6, &nat6));
    }

    let (bidi_up, bidi_down) = emit_bidirectional_pair(PatternName::BidirectionalForwardIpv4, "wg0", wan);
    up.extend(bidi_up);
    down.extend(bidi_down);

    if vpn_network_v6.is_some() {
        let (bidi6_up, bidi6_down) = emit_bidirectional_pair(PatternName::BidirectionalForwardIpv6, "wg0", wan);
        up.extend(bidi6_up);
        down.extend(bidi6_down);
    }

    up.push(emit_up(PatternName::MssClamping, &empty));
    down.push(emit_down(PatternName::MssClamping, &empty));

    (up, down)
}

/// Assembles an exit-node config (§4.6 item 4): its `[Interface]` with
/// MASQUERADE/forwarding `PostUp`/`PostDown` over `wan_interface`, then
/// one `[Peer]` per assigned remote and a final `[Peer]` for the
/// coordination server.
pub fn generate_exit_node(
    exit: &ExitNode,
    cs: &CoordinationServer,
    assigned_remotes: &[Remote],
    comments: &[Comment],
) -> Result<String, MeshError> {
    let (post_up, post_down) = exit_node_commands(
        &exit.wan_interface,
        &cs.vpn_network_v4.to_string(),
        cs.vpn_network_v6.map(|n| n.to_string()).as_deref(),
    );

    let iface = InterfaceFields {
        private_key: Some(exit.identity.current_private_key.clone()),
        address: identity_self_route(&exit.identity)?,
        listen_port: exit.identity.listen_port,
        dns: Vec::new(),
        mtu: None,
        table: None,
        fwmark: None,
        post_up,
        post_down,
    };
    let mut sections = vec![render_interface(&iface, comments)];

    for remote in assigned_remotes {
        let peer = PeerFields {
            public_key: remote.identity.current_public_key.clone(),
            preshared_key: None,
            endpoint: None,
            allowed_ips: identity_self_route(&remote.identity)?,
            persistent_keepalive: 25,
        };
        sections.push(render_peer(&peer, &[]));
    }

    let cs_peer = PeerFields {
        public_key: cs.identity.current_public_key.clone(),
        preshared_key: None,
        endpoint: cs.identity.endpoint.as_ref().map(ToString::to_string),
        allowed_ips: identity_self_route(&cs.identity)?,
        persistent_keepalive: 25,
    };
    sections.push(render_peer(&cs_peer, &[]));

    Ok(assemble(sections))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_keypair;
    use crate::model::{CommentCategory, EntityKind};

    #[test]
    fn interface_field_order_is_canonical() {
        let (private, _) = generate_keypair();
        let fields = InterfaceFields {
            private_key: Some(private),
            address: vec!["10.66.0.1/24".parse().unwrap()],
            listen_port: Some(51820),
            dns: vec!["1.1.1.1".to_string()],
            mtu: Some(1420),
            table: None,
            fwmark: None,
            post_up: vec!["sysctl -w net.ipv4.ip_forward=1".to_string()],
            post_down: vec![],
        };
        let text = render_interface(&fields, &[]);
        let keys: Vec<&str> = text
            .lines()
            .filter_map(|l| l.split_once(" = ").map(|(k, _)| k))
            .collect();
        assert_eq!(keys, vec!["PrivateKey", "Address", "ListenPort", "DNS", "MTU", "PostUp"]);
    }

    #[test]
    fn comments_re_emit_at_recorded_position() {
        let comment = Comment {
            id: None,
            entity_guid: "g".to_string(),
            entity_kind: EntityKind::Remote,
            category: CommentCategory::Custom,
            text: "alice's phone".to_string(),
            position: CommentPosition::Above,
            display_order: 0,
        };
        let fields = InterfaceFields {
            address: vec!["10.66.0.30/32".parse().unwrap()],
            ..Default::default()
        };
        let text = render_interface(&fields, std::slice::from_ref(&comment));
        assert!(text.starts_with("# alice's phone\n[Interface]"));
    }

    /// A dual-stack exit node MASQUERADEs and forwards both address
    /// families — the IPv6 FORWARD ACCEPT pair must be present alongside
    /// the IPv4 one, not silently dropped.
    #[test]
    fn exit_node_commands_include_ipv6_bidirectional_forward_when_dual_stack() {
        let (up, down) = exit_node_commands("eth0", "10.66.0.0/24", Some("fd00:66::/64"));
        assert!(up.iter().any(|l| l == "ip6tables -A FORWARD -i wg0 -o eth0 -j ACCEPT"));
        assert!(up.iter().any(|l| l == "ip6tables -A FORWARD -i eth0 -o wg0 -j ACCEPT"));
        assert!(down.iter().any(|l| l == "ip6tables -D FORWARD -i wg0 -o eth0 -j ACCEPT"));
        assert!(down.iter().any(|l| l == "ip6tables -D FORWARD -i eth0 -o wg0 -j ACCEPT"));

        let (up_v4_only, _) = exit_node_commands("eth0", "10.66.0.0/24", None);
        assert!(!up_v4_only.iter().any(|l| l.starts_with("ip6tables")));
    }
}
