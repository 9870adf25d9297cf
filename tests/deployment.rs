//! Seed 5 (§8): deployment backup & idempotence, driven entirely through
//! the public [`wireguard_mesh_core::deploy`] API and its `FakeTransport`
//! test double — no real SSH stack involved.

use wireguard_mesh_core::deploy::{AuthMaterial, CommandOutput, DeployTarget, DeploymentEngine, FakeTransport, HostOutcome};
use wireguard_mesh_core::model::SshCoordinates;

fn target() -> DeployTarget {
    DeployTarget {
        ssh: SshCoordinates {
            host: "home-gateway.lan".to_string(),
            port: 22,
            user: "root".to_string(),
            remote_config_path: "/etc/wireguard/wg0.conf".to_string(),
        },
        auth: AuthMaterial::Agent,
        interface: "wg0".to_string(),
        local: false,
    }
}

#[test]
fn deploying_twice_without_restart_produces_two_distinct_backups_and_matching_content() {
    let transport = FakeTransport::new();
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), "[Interface]\nPrivateKey = abc\n").unwrap();
    let engine = DeploymentEngine::new(&transport);

    let first = engine.deploy_host(&target(), tmp.path(), &[], true, 0, false);
    assert_eq!(first.outcome, HostOutcome::Success);
    let first_backup = first.backup_path.expect("first deploy records a backup path");

    let second = engine.deploy_host(&target(), tmp.path(), &[], true, 0, false);
    assert_eq!(second.outcome, HostOutcome::Success);
    let second_backup = second.backup_path.expect("second deploy records a backup path");

    assert_ne!(first_backup, second_backup, "each deploy's backup carries a distinct timestamp");

    let uploaded = transport.files.lock().unwrap().get("/etc/wireguard/wg0.conf").cloned();
    assert_eq!(uploaded.as_deref(), Some("[Interface]\nPrivateKey = abc\n"));

    let commands = transport.commands.lock().unwrap();
    assert!(commands.iter().any(|c| c == &format!("cp /etc/wireguard/wg0.conf {first_backup}")));
    assert!(commands.iter().any(|c| c == &format!("cp /etc/wireguard/wg0.conf {second_backup}")));
}

#[test]
fn post_deployment_wg_show_reports_expected_peer_count() {
    let transport = FakeTransport::new();
    transport.script(
        "wg show wg0",
        CommandOutput {
            stdout: "peer: aaa\npeer: bbb\npeer: ccc\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        },
    );
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), "[Interface]\n").unwrap();
    let engine = DeploymentEngine::new(&transport);

    let result = engine.deploy_host(&target(), tmp.path(), &[], true, 3, true);

    assert_eq!(result.outcome, HostOutcome::Success);
    assert_eq!(result.verified_peer_count, Some((3, 3)));
}
