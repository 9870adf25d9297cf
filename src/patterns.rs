//! The pattern library (spec §4.4, component C4): a registry of canonical
//! `PostUp`/`PostDown` fragments with a recognizer and an emitter each.
//!
//! Recognition order is a fixed `Vec` walked front-to-back; "on ambiguity,
//! the first match wins and the library must commit to that choice
//! consistently across parser and generator" (§4.4) — so [`recognize_line`]
//! and [`emit`] both close over [`REGISTRY`] and nothing else decides
//! pattern identity.

use std::collections::BTreeMap;

use crate::error::Warning;

/// Stable identifier for a registered pattern (§4.4: "a stable identifier").
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PatternName {
    EnableIpv4Forwarding,
    EnableIpv6Forwarding,
    NatMasqueradeIpv4,
    NatMasqueradeIpv6,
    BidirectionalForwardIpv4,
    BidirectionalForwardIpv6,
    MssClamping,
}

impl PatternName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PatternName::EnableIpv4Forwarding => "enable_ipv4_forwarding",
            PatternName::EnableIpv6Forwarding => "enable_ipv6_forwarding",
            PatternName::NatMasqueradeIpv4 => "nat_masquerade_ipv4",
            PatternName::NatMasqueradeIpv6 => "nat_masquerade_ipv6",
            PatternName::BidirectionalForwardIpv4 => "bidirectional_forward_ipv4",
            PatternName::BidirectionalForwardIpv6 => "bidirectional_forward_ipv6",
            PatternName::MssClamping => "mss_clamping",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<PatternName> {
        Some(match s {
            "enable_ipv4_forwarding" => PatternName::EnableIpv4Forwarding,
            "enable_ipv6_forwarding" => PatternName::EnableIpv6Forwarding,
            "nat_masquerade_ipv4" => PatternName::NatMasqueradeIpv4,
            "nat_masquerade_ipv6" => PatternName::NatMasqueradeIpv6,
            "bidirectional_forward_ipv4" => PatternName::BidirectionalForwardIpv4,
            "bidirectional_forward_ipv6" => PatternName::BidirectionalForwardIpv6,
            "mss_clamping" => PatternName::MssClamping,
            _ => return None,
        })
    }
}

/// §4.4 `scope`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternScope {
    Interface,
    PeerSpecific,
    Global,
}

/// A registered pattern: recognizer, emitter, rationale, scope, grouped
/// under a stable [`PatternName`].
pub struct Pattern {
    pub name: PatternName,
    pub rationale: &'static str,
    pub scope: PatternScope,
    recognize: fn(&str) -> Option<BTreeMap<String, String>>,
    emit_up: fn(&BTreeMap<String, String>) -> String,
    emit_down: fn(&BTreeMap<String, String>) -> String,
}

fn recognize_enable_ipv4_forwarding(line: &str) -> Option<BTreeMap<String, String>> {
    (line.trim() == "sysctl -w net.ipv4.ip_forward=1").then(BTreeMap::new)
}
fn emit_up_enable_ipv4_forwarding(_v: &BTreeMap<String, String>) -> String {
    "sysctl -w net.ipv4.ip_forward=1".to_string()
}
fn emit_down_enable_ipv4_forwarding(_v: &BTreeMap<String, String>) -> String {
    "sysctl -w net.ipv4.ip_forward=0".to_string()
}

fn recognize_enable_ipv6_forwarding(line: &str) -> Option<BTreeMap<String, String>> {
    (line.trim() == "sysctl -w net.ipv6.conf.all.forwarding=1").then(BTreeMap::new)
}
fn emit_up_enable_ipv6_forwarding(_v: &BTreeMap<String, String>) -> String {
    "sysctl -w net.ipv6.conf.all.forwarding=1".to_string()
}
fn emit_down_enable_ipv6_forwarding(_v: &BTreeMap<String, String>) -> String {
    "sysctl -w net.ipv6.conf.all.forwarding=0".to_string()
}

fn recognize_nat_masquerade_ipv4(line: &str) -> Option<BTreeMap<String, String>> {
    let rest = line.trim().strip_prefix("iptables -t nat -A POSTROUTING -s ")?;
    let (cidr4, rest) = rest.split_once(" -o ")?;
    let wan = rest.strip_suffix(" -j MASQUERADE")?;
    let mut vars = BTreeMap::new();
    vars.insert("cidr4".to_string(), cidr4.to_string());
    vars.insert("wan".to_string(), wan.to_string());
    Some(vars)
}
fn emit_up_nat_masquerade_ipv4(v: &BTreeMap<String, String>) -> String {
    format!(
        "iptables -t nat -A POSTROUTING -s {} -o {} -j MASQUERADE",
        v["cidr4"], v["wan"]
    )
}
fn emit_down_nat_masquerade_ipv4(v: &BTreeMap<String, String>) -> String {
    format!(
        "iptables -t nat -D POSTROUTING -s {} -o {} -j MASQUERADE",
        v["cidr4"], v["wan"]
    )
}

fn recognize_nat_masquerade_ipv6(line: &str) -> Option<BTreeMap<String, String>> {
    let rest = line.trim().strip_prefix("ip6tables -t nat -A POSTROUTING -s ")?;
    let (cidr6, rest) = rest.split_once(" -o ")?;
    let wan = rest.strip_suffix(" -j MASQUERADE")?;
    let mut vars = BTreeMap::new();
    vars.insert("cidr6".to_string(), cidr6.to_string());
    vars.insert("wan".to_string(), wan.to_string());
    Some(vars)
}
fn emit_up_nat_masquerade_ipv6(v: &BTreeMap<String, String>) -> String {
    format!(
        "ip6tables -t nat -A POSTROUTING -s {} -o {} -j MASQUERADE",
        v["cidr6"], v["wan"]
    )
}
fn emit_down_nat_masquerade_ipv6(v: &BTreeMap<String, String>) -> String {
    format!(
        "ip6tables -t nat -D POSTROUTING -s {} -o {} -j MASQUERADE",
        v["cidr6"], v["wan"]
    )
}

fn recognize_bidirectional_forward_ipv4(line: &str) -> Option<BTreeMap<String, String>> {
    let rest = line.trim().strip_prefix("iptables -A FORWARD -i ")?;
    let (iface, rest) = rest.split_once(" -o ")?;
    let wan = rest.strip_suffix(" -j ACCEPT")?;
    let mut vars = BTreeMap::new();
    vars.insert("iface".to_string(), iface.to_string());
    vars.insert("wan".to_string(), wan.to_string());
    Some(vars)
}
fn emit_up_bidirectional_forward_ipv4(v: &BTreeMap<String, String>) -> String {
    format!(
        "iptables -A FORWARD -i {} -o {} -j ACCEPT",
        v["iface"], v["wan"]
    )
}
fn emit_down_bidirectional_forward_ipv4(v: &BTreeMap<String, String>) -> String {
    format!(
        "iptables -D FORWARD -i {} -o {} -j ACCEPT",
        v["iface"], v["wan"]
    )
}

fn recognize_bidirectional_forward_ipv6(line: &str) -> Option<BTreeMap<String, String>> {
    let rest = line.trim().strip_prefix("ip6tables -A FORWARD -i ")?;
    let (iface, rest) = rest.split_once(" -o ")?;
    let wan = rest.strip_suffix(" -j ACCEPT")?;
    let mut vars = BTreeMap::new();
    vars.insert("iface".to_string(), iface.to_string());
    vars.insert("wan".to_string(), wan.to_string());
    Some(vars)
}
fn emit_up_bidirectional_forward_ipv6(v: &BTreeMap<String, String>) -> String {
    format!(
        "ip6tables -A FORWARD -i {} -o {} -j ACCEPT",
        v["iface"], v["wan"]
    )
}
fn emit_down_bidirectional_forward_ipv6(v: &BTreeMap<String, String>) -> String {
    format!(
        "ip6tables -D FORWARD -i {} -o {} -j ACCEPT",
        v["iface"], v["wan"]
    )
}

fn recognize_mss_clamping(line: &str) -> Option<BTreeMap<String, String>> {
    (line.trim()
        == "iptables -t mangle -A FORWARD -p tcp --tcp-flags SYN,RST SYN -j TCPMSS --clamp-mss-to-pmtu")
        .then(BTreeMap::new)
}
fn emit_up_mss_clamping(_v: &BTreeMap<String, String>) -> String {
    "iptables -t mangle -A FORWARD -p tcp --tcp-flags SYN,RST SYN -j TCPMSS --clamp-mss-to-pmtu"
        .to_string()
}
fn emit_down_mss_clamping(_v: &BTreeMap<String, String>) -> String {
    "iptables -t mangle -D FORWARD -p tcp --tcp-flags SYN,RST SYN -j TCPMSS --clamp-mss-to-pmtu"
        .to_string()
}

/// The fixed, ordered registry (§4.4 "minimum set"). `bidirectional_forward`
/// is registered as a matched `iface -> wan` / `wan -> iface` pair by the
/// generator (see [`emit_bidirectional_pair`]); the recognizer here matches
/// either half independently so the parser can ingest them in any order.
static REGISTRY: &[Pattern] = &[
    Pattern {
        name: PatternName::EnableIpv4Forwarding,
        rationale: "Enables IPv4 packet forwarding at the kernel level, required for this host to route traffic between peers.",
        scope: PatternScope::Global,
        recognize: recognize_enable_ipv4_forwarding,
        emit_up: emit_up_enable_ipv4_forwarding,
        emit_down: emit_down_enable_ipv4_forwarding,
    },
    Pattern {
        name: PatternName::EnableIpv6Forwarding,
        rationale: "Enables IPv6 packet forwarding at the kernel level.",
        scope: PatternScope::Global,
        recognize: recognize_enable_ipv6_forwarding,
        emit_up: emit_up_enable_ipv6_forwarding,
        emit_down: emit_down_enable_ipv6_forwarding,
    },
    Pattern {
        name: PatternName::NatMasqueradeIpv4,
        rationale: "Masquerades outbound IPv4 traffic from the mesh network through the WAN interface.",
        scope: PatternScope::Interface,
        recognize: recognize_nat_masquerade_ipv4,
        emit_up: emit_up_nat_masquerade_ipv4,
        emit_down: emit_down_nat_masquerade_ipv4,
    },
    Pattern {
        name: PatternName::NatMasqueradeIpv6,
        rationale: "Masquerades outbound IPv6 traffic from the mesh network through the WAN interface.",
        scope: PatternScope::Interface,
        recognize: recognize_nat_masquerade_ipv6,
        emit_up: emit_up_nat_masquerade_ipv6,
        emit_down: emit_down_nat_masquerade_ipv6,
    },
    Pattern {
        name: PatternName::BidirectionalForwardIpv4,
        rationale: "Allows IPv4 FORWARD traffic in both directions between the WireGuard interface and the WAN interface.",
        scope: PatternScope::Interface,
        recognize: recognize_bidirectional_forward_ipv4,
        emit_up: emit_up_bidirectional_forward_ipv4,
        emit_down: emit_down_bidirectional_forward_ipv4,
    },
    Pattern {
        name: PatternName::BidirectionalForwardIpv6,
        rationale: "Allows IPv6 FORWARD traffic in both directions between the WireGuard interface and the WAN interface.",
        scope: PatternScope::Interface,
        recognize: recognize_bidirectional_forward_ipv6,
        emit_up: emit_up_bidirectional_forward_ipv6,
        emit_down: emit_down_bidirectional_forward_ipv6,
    },
    Pattern {
        name: PatternName::MssClamping,
        rationale: "Clamps TCP MSS to the path MTU to avoid fragmentation issues over the tunnel.",
        scope: PatternScope::Interface,
        recognize: recognize_mss_clamping,
        emit_up: emit_up_mss_clamping,
        emit_down: emit_down_mss_clamping,
    },
];

/// Looks up a pattern by name.
#[must_use]
pub fn pattern(name: PatternName) -> &'static Pattern {
    REGISTRY
        .iter()
        .find(|p| p.name == name)
        .expect("every PatternName has a REGISTRY entry")
}

/// Recognition result for a single `PostUp` (or `PostDown`) line: either a
/// matched pattern plus the variables it was parameterized with, or
/// `None` if no registered pattern matches (the caller then stores the
/// line verbatim as a `custom` singleton and raises
/// [`Warning::UnrecognizedPattern`]).
#[must_use]
pub fn recognize_line(line: &str) -> Option<(PatternName, BTreeMap<String, String>)> {
    REGISTRY.iter().find_map(|p| (p.recognize)(line).map(|vars| (p.name, vars)))
}

/// Recognizes a line, returning the warning §7 requires when nothing
/// matches.
pub fn recognize_or_warn(line: &str) -> Result<(PatternName, BTreeMap<String, String>), Warning> {
    recognize_line(line).ok_or_else(|| Warning::UnrecognizedPattern {
        line: line.to_string(),
    })
}

/// Emits the `PostUp` line for `name` given `variables`.
#[must_use]
pub fn emit_up(name: PatternName, variables: &BTreeMap<String, String>) -> String {
    (pattern(name).emit_up)(variables)
}

/// Emits the matching `PostDown` line: the exact inverse (§4.4: "Every
/// down-command is the exact inverse").
#[must_use]
pub fn emit_down(name: PatternName, variables: &BTreeMap<String, String>) -> String {
    (pattern(name).emit_down)(variables)
}

/// Emits the canonical `iface -> wan` / `wan -> iface` bidirectional-
/// forward pair (§4.4 table) as up/down line quadruples, under `name`
/// (`BidirectionalForwardIpv4` or `BidirectionalForwardIpv6` — callers
/// with a dual-stack mesh emit both).
#[must_use]
pub fn emit_bidirectional_pair(name: PatternName, iface: &str, wan: &str) -> (Vec<String>, Vec<String>) {
    let mut fwd = BTreeMap::new();
    fwd.insert("iface".to_string(), iface.to_string());
    fwd.insert("wan".to_string(), wan.to_string());
    let mut rev = BTreeMap::new();
    rev.insert("iface".to_string(), wan.to_string());
    rev.insert("wan".to_string(), iface.to_string());

    let up = vec![emit_up(name, &fwd), emit_up(name, &rev)];
    let down = vec![emit_down(name, &fwd), emit_down(name, &rev)];
    (up, down)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognize_emit_roundtrips_for_every_pattern() {
        let mut vars = BTreeMap::new();
        vars.insert("cidr4".to_string(), "10.66.0.0/24".to_string());
        vars.insert("wan".to_string(), "eth0".to_string());
        let up = emit_up(PatternName::NatMasqueradeIpv4, &vars);
        let (name, recognized) = recognize_line(&up).unwrap();
        assert_eq!(name, PatternName::NatMasqueradeIpv4);
        assert_eq!(recognized, vars);
    }

    #[test]
    fn down_command_is_exact_inverse() {
        let mut vars = BTreeMap::new();
        vars.insert("cidr4".to_string(), "10.66.0.0/24".to_string());
        vars.insert("wan".to_string(), "eth0".to_string());
        let up = emit_up(PatternName::NatMasqueradeIpv4, &vars);
        let down = emit_down(PatternName::NatMasqueradeIpv4, &vars);
        assert_eq!(up.replace("-A", "-D"), down);
    }

    #[test]
    fn unrecognized_fragment_is_a_warning() {
        assert!(recognize_line("echo custom-script.sh").is_none());
        assert!(matches!(
            recognize_or_warn("echo custom-script.sh"),
            Err(Warning::UnrecognizedPattern { .. })
        ));
    }

    #[test]
    fn no_argument_patterns_recognize_exactly() {
        assert_eq!(
            recognize_line("sysctl -w net.ipv4.ip_forward=1")
                .unwrap()
                .0,
            PatternName::EnableIpv4Forwarding
        );
    }
}
