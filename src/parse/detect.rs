//! Config-type detection (§4.5 rule 5), used by the import wizard to
//! guess which kind of entity a freshly parsed `.conf` describes.

use super::RawConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigType {
    CoordinationServer,
    SubnetRouter,
    Client,
}

/// Implements §4.5 rule 5 verbatim:
///
/// - ≥ 3 peers → coordination server.
/// - FORWARD/POSTROUTING PostUp rules and exactly 1 peer → subnet router.
/// - same rules and ≥ 2 peers → coordination server.
/// - 1 peer with `Endpoint` → client.
/// - 1 peer without `Endpoint` → subnet router.
/// - otherwise → client.
#[must_use]
pub fn detect_config_type(config: &RawConfig) -> ConfigType {
    let peer_count = config.peers.len();
    let has_forward_rules = config
        .interface
        .post_up
        .iter()
        .any(|line| line.contains("FORWARD") || line.contains("POSTROUTING"));

    if peer_count >= 3 {
        return ConfigType::CoordinationServer;
    }
    if has_forward_rules {
        return if peer_count == 1 {
            ConfigType::SubnetRouter
        } else {
            // peer_count >= 2 (but < 3, so exactly 2)
            ConfigType::CoordinationServer
        };
    }
    match peer_count {
        1 => {
            if config.peers[0].endpoint.is_some() {
                ConfigType::Client
            } else {
                ConfigType::SubnetRouter
            }
        }
        _ => ConfigType::Client,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{parse, RawPeer};

    fn peer_with_endpoint() -> RawPeer {
        RawPeer {
            endpoint: Some("vps.example.com:51820".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn one_peer_with_endpoint_is_client() {
        let mut cfg = RawConfig::default();
        cfg.peers.push(peer_with_endpoint());
        assert_eq!(detect_config_type(&cfg), ConfigType::Client);
    }

    #[test]
    fn three_peers_with_forward_rules_is_coordination_server() {
        let text = "[Interface]\nPrivateKey = sJkP2oorqrq49P6Ln25MWo3X04PxhB8k+RnJJnZ4gEo=\nPostUp = iptables -A FORWARD -i wg0 -o eth0 -j ACCEPT\n\n[Peer]\nPublicKey = ijxpP+2xo+s77bfbm4QZzl6OyYP7sIOTutqngQSlZBs=\nAllowedIPs = 10.66.0.30/32\n\n[Peer]\nPublicKey = ijxpP+2xo+s77bfbm4QZzl6OyYP7sIOTutqngQSlZBs=\nAllowedIPs = 10.66.0.31/32\n\n[Peer]\nPublicKey = ijxpP+2xo+s77bfbm4QZzl6OyYP7sIOTutqngQSlZBs=\nAllowedIPs = 10.66.0.32/32\n";
        let (cfg, _) = parse(text).unwrap();
        assert_eq!(detect_config_type(&cfg), ConfigType::CoordinationServer);
    }

    #[test]
    fn single_peer_no_endpoint_is_subnet_router() {
        let mut cfg = RawConfig::default();
        cfg.peers.push(RawPeer::default());
        assert_eq!(detect_config_type(&cfg), ConfigType::SubnetRouter);
    }
}
