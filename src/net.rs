//! Network utilities (spec §4.2, component C2).
//!
//! Thin arithmetic layer on top of [`ipnet`]: CIDR parsing, containment,
//! host iteration and smallest-free-address search. IPv4 and IPv6 are
//! handled independently throughout; mixing families is always an error
//! rather than a silent narrowing.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::MeshError;

/// `parse_cidr(s)` (§4.2).
pub fn parse_cidr(s: &str) -> Result<IpNet, MeshError> {
    s.trim()
        .parse::<IpNet>()
        .map_err(|e| MeshError::MalformedConfig(format!("invalid CIDR `{s}`: {e}")))
}

/// `host_in_network(addr, cidr)` (§4.2). A family mismatch between `addr`
/// and `cidr` is always `AddressFamilyMismatch`, never a silent `false`.
pub fn host_in_network(addr: IpAddr, cidr: IpNet) -> Result<bool, MeshError> {
    match (addr, cidr) {
        (IpAddr::V4(_), IpNet::V4(_)) | (IpAddr::V6(_), IpNet::V6(_)) => Ok(cidr.contains(&addr)),
        _ => Err(family_mismatch(addr, cidr)),
    }
}

fn family_mismatch(addr: IpAddr, cidr: IpNet) -> MeshError {
    MeshError::AddressFamilyMismatch {
        addr,
        network: cidr.to_string(),
        network_family: match cidr {
            IpNet::V4(_) => "IPv4",
            IpNet::V6(_) => "IPv6",
        },
    }
}

/// `iterate_hosts(cidr)` (§4.2). Iterates every host address in the
/// network (for IPv4 this includes network/broadcast addresses when the
/// prefix is `/31` or `/32`, matching `ipnet`'s own `hosts()` semantics for
/// those edge prefixes).
pub fn iterate_hosts(cidr: IpNet) -> Box<dyn Iterator<Item = IpAddr>> {
    match cidr {
        IpNet::V4(net) => Box::new(net.hosts().map(IpAddr::V4)),
        IpNet::V6(net) => Box::new(net.hosts().map(IpAddr::V6)),
    }
}

/// `next_free(cidr, used_set, [lo, hi])` (§4.2).
///
/// Returns the numerically smallest host address in `cidr` that falls
/// within the inclusive `[lo, hi]` bound (itself expressed as the last
/// octet/group offset from the network address, per §3's per-kind VPN
/// ranges) and is not present in `used`.
pub fn next_free(
    cidr: IpNet,
    used: &BTreeSet<IpAddr>,
    lo: IpAddr,
    hi: IpAddr,
) -> Result<IpAddr, MeshError> {
    match (cidr, lo, hi) {
        (IpNet::V4(net), IpAddr::V4(lo4), IpAddr::V4(hi4)) => {
            next_free_v4(net, used, lo4, hi4).ok_or_else(|| exhausted(lo, hi))
        }
        (IpNet::V6(net), IpAddr::V6(lo6), IpAddr::V6(hi6)) => {
            next_free_v6(net, used, lo6, hi6).ok_or_else(|| exhausted(lo, hi))
        }
        _ => Err(family_mismatch(lo, cidr)),
    }
}

fn exhausted(lo: IpAddr, hi: IpAddr) -> MeshError {
    MeshError::AddressSpaceExhausted {
        lo: lo.to_string(),
        hi: hi.to_string(),
        purpose: "VPN address allocation".to_string(),
    }
}

fn next_free_v4(
    net: Ipv4Net,
    used: &BTreeSet<IpAddr>,
    lo: Ipv4Addr,
    hi: Ipv4Addr,
) -> Option<IpAddr> {
    let lo_u = u32::from(lo);
    let hi_u = u32::from(hi);
    (lo_u..=hi_u).map(Ipv4Addr::from).find_map(|candidate| {
        let addr = IpAddr::V4(candidate);
        (net.contains(&candidate) && !used.contains(&addr)).then_some(addr)
    })
}

fn next_free_v6(
    net: Ipv6Net,
    used: &BTreeSet<IpAddr>,
    lo: Ipv6Addr,
    hi: Ipv6Addr,
) -> Option<IpAddr> {
    let lo_u = u128::from(lo);
    let hi_u = u128::from(hi);
    (lo_u..=hi_u).map(Ipv6Addr::from).find_map(|candidate| {
        let addr = IpAddr::V6(candidate);
        (net.contains(&candidate) && !used.contains(&addr)).then_some(addr)
    })
}

/// Builds the `[lo, hi]` host-offset bound for a partition of §3's VPN
/// IPv4 range table, given the coordination server's `/24`-or-wider VPN
/// network. `lo_offset`/`hi_offset` are the last-octet bounds from the
/// partition table (e.g. `(30, 99)` for remotes).
pub fn v4_offset_range(network: Ipv4Net, lo_offset: u8, hi_offset: u8) -> (IpAddr, IpAddr) {
    let base = u32::from(network.network());
    let lo = Ipv4Addr::from(base + u32::from(lo_offset));
    let hi = Ipv4Addr::from(base + u32::from(hi_offset));
    (IpAddr::V4(lo), IpAddr::V4(hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_and_v6() {
        assert!(parse_cidr("10.66.0.0/24").is_ok());
        assert!(parse_cidr("fd00::/64").is_ok());
        assert!(parse_cidr("not-a-cidr").is_err());
    }

    #[test]
    fn family_mismatch_is_an_error_not_false() {
        let cidr = parse_cidr("10.66.0.0/24").unwrap();
        let v6_addr: IpAddr = "fd00::1".parse().unwrap();
        assert!(matches!(
            host_in_network(v6_addr, cidr),
            Err(MeshError::AddressFamilyMismatch { .. })
        ));
    }

    #[test]
    fn next_free_picks_smallest_unused() {
        let cidr = parse_cidr("10.66.0.0/24").unwrap();
        let (lo, hi) = v4_offset_range(
            match cidr {
                IpNet::V4(n) => n,
                _ => unreachable!(),
            },
            30,
            99,
        );
        let mut used = BTreeSet::new();
        used.insert("10.66.0.30".parse::<IpAddr>().unwrap());
        let next = next_free(cidr, &used, lo, hi).unwrap();
        assert_eq!(next, "10.66.0.31".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn next_free_exhausted_on_71st_remote() {
        let cidr = parse_cidr("10.66.0.0/24").unwrap();
        let (lo, hi) = v4_offset_range(
            match cidr {
                IpNet::V4(n) => n,
                _ => unreachable!(),
            },
            30,
            99,
        );
        let mut used = BTreeSet::new();
        for offset in 30..=99u8 {
            used.insert(IpAddr::V4(Ipv4Addr::from(
                u32::from(Ipv4Addr::new(10, 66, 0, 0)) + u32::from(offset),
            )));
        }
        assert!(matches!(
            next_free(cidr, &used, lo, hi),
            Err(MeshError::AddressSpaceExhausted { .. })
        ));
    }
}
