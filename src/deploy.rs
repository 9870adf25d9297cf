//! The deployment engine (§4.9, component C9) and the §6 "SSH interface"
//! it is built against.
//!
//! SSH transport is an external collaborator: this crate defines the
//! two-operation interface and a pure local transport for the "target is
//! this host" case, but never links a concrete SSH client. A downstream
//! binary supplies a [`HostTransport`] backed by whatever it likes
//! (OpenSSH subprocess, `ssh2`, an agent-forwarding library).

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::error::{MeshError, MeshResult, Warning};
use crate::model::SshCoordinates;
use crate::patterns::{self, PatternName};

/// Key-based auth material for a deployment target (§6: "authentication
/// is key-based (passwords rejected by default)").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMaterial {
    KeyFile(String),
    Agent,
}

/// One deployable host: SSH coordinates, auth, WireGuard interface name,
/// and whether this is the locally running machine (§4.9 step 1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployTarget {
    pub ssh: SshCoordinates,
    pub auth: AuthMaterial,
    pub interface: String,
    pub local: bool,
}

impl DeployTarget {
    #[must_use]
    pub fn remote_path(&self) -> String {
        self.ssh.remote_config_path.clone()
    }
}

/// `execute`'s result (§6: "(stdout, stderr, exit_code)").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    fn ensure_success(&self, host: &str, command: &str) -> MeshResult<()> {
        if self.exit_code == 0 {
            Ok(())
        } else {
            Err(MeshError::RemoteCommandFailed {
                host: host.to_string(),
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.clone(),
            })
        }
    }
}

/// §6's two-operation SSH interface. Implementations own timeouts and
/// authentication; this crate only calls through the interface.
pub trait HostTransport {
    fn execute(&self, target: &DeployTarget, command: &str) -> MeshResult<CommandOutput>;
    fn put(&self, target: &DeployTarget, local_path: &Path, remote_path: &str) -> MeshResult<()>;
}

/// Direct filesystem/process transport for `target.local == true` hosts
/// (§4.9 step 1: "direct filesystem I/O with elevated-privilege helper").
/// Privilege escalation itself (sudo, polkit, ...) is left to the caller's
/// environment; this just shells out plainly.
pub struct LocalTransport;

impl HostTransport for LocalTransport {
    fn execute(&self, target: &DeployTarget, command: &str) -> MeshResult<CommandOutput> {
        let output = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|e| MeshError::SshTransport {
                host: target.ssh.host.clone(),
                message: e.to_string(),
            })?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn put(&self, _target: &DeployTarget, local_path: &Path, remote_path: &str) -> MeshResult<()> {
        std::fs::copy(local_path, remote_path)?;
        Ok(())
    }
}

/// A deterministic in-memory [`HostTransport`] double (§10.6), recording
/// every call so the scenario tests in §8 can run without a real SSH
/// stack.
#[derive(Default)]
pub struct FakeTransport {
    pub files: std::sync::Mutex<BTreeMap<String, String>>,
    pub commands: std::sync::Mutex<Vec<String>>,
    /// `(prefix, response)` pairs, checked in insertion order against each
    /// command's prefix — a prefix rather than an exact match, since
    /// backup commands embed a real timestamp the test can't predict.
    pub script: std::sync::Mutex<Vec<(String, CommandOutput)>>,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> FakeTransport {
        FakeTransport::default()
    }

    /// Seeds a canned response for every command starting with `prefix`
    /// (tests arrange failures, e.g. a missing backup target, this way).
    pub fn script(&self, prefix: &str, output: CommandOutput) {
        self.script.lock().unwrap().push((prefix.to_string(), output));
    }

    pub fn seed_file(&self, remote_path: &str, content: &str) {
        self.files.lock().unwrap().insert(remote_path.to_string(), content.to_string());
    }
}

impl HostTransport for FakeTransport {
    fn execute(&self, _target: &DeployTarget, command: &str) -> MeshResult<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        if let Some((_, scripted)) = self.script.lock().unwrap().iter().find(|(prefix, _)| command.starts_with(prefix.as_str())) {
            return Ok(scripted.clone());
        }
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    fn put(&self, _target: &DeployTarget, local_path: &Path, remote_path: &str) -> MeshResult<()> {
        let content = std::fs::read_to_string(local_path)?;
        self.files.lock().unwrap().insert(remote_path.to_string(), content);
        Ok(())
    }
}

/// Terminal state of one host's deployment (§4.9: "a per-host result with
/// a terminal state in {success, partial ..., failed-before-upload,
/// failed-after-upload}").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostOutcome {
    Success,
    /// Upload and (if requested) restart succeeded but verification did
    /// not confirm the expected peer count.
    Partial,
    FailedBeforeUpload,
    FailedAfterUpload,
}

/// One host's deployment result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostResult {
    pub host: String,
    pub outcome: HostOutcome,
    pub warnings: Vec<Warning>,
    /// Present whenever a backup was taken (success or failure after it).
    /// The rollback instruction on a failure is simply "restore this
    /// path" (§4.9: "carry rollback instructions").
    pub backup_path: Option<String>,
    pub verified_peer_count: Option<(usize, usize)>,
    pub error: Option<String>,
}

/// What dry-run mode reports instead of actually running anything
/// (§4.9: "performs only steps 1 and 2's planning ... no mutation").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DryRunPlan {
    pub host: String,
    pub warnings: Vec<Warning>,
    pub planned_commands: Vec<String>,
}

fn backup_path(remote_path: &str) -> String {
    format!("{remote_path}.backup.{}", Utc::now().format("%Y%m%d-%H%M%S"))
}

fn restart_commands(iface: &str) -> Vec<String> {
    vec![format!("wg-quick down {iface} && wg-quick up {iface}")]
}

fn status_command(iface: &str) -> String {
    format!("wg show {iface}")
}

/// Counts `peer:` lines `wg show` would print, one per configured peer.
fn count_peers(wg_show_stdout: &str) -> usize {
    wg_show_stdout.lines().filter(|l| l.trim_start().starts_with("peer:")).count()
}

/// Runs the §4.9 pre-flight forwarding check for one address family.
/// Non-blocking: a disabled/undeclared forwarding setting is a
/// [`Warning::ForwardingDisabled`], never an error.
fn preflight_forwarding(
    transport: &dyn HostTransport,
    target: &DeployTarget,
    postup_lines: &[String],
    family: &'static str,
    pattern: PatternName,
    sysctl_probe: &str,
) -> Option<Warning> {
    let declared = postup_lines
        .iter()
        .any(|line| matches!(patterns::recognize_line(line), Some((name, _)) if name == pattern));
    if declared {
        debug!(host = %target.ssh.host, family, "forwarding declared in PostUp");
        return None;
    }
    let live = transport
        .execute(target, sysctl_probe)
        .map(|out| out.stdout.trim() == "1")
        .unwrap_or(false);
    if live {
        debug!(host = %target.ssh.host, family, "forwarding confirmed live via sysctl probe");
        return None;
    }
    Some(Warning::ForwardingDisabled {
        host: target.ssh.host.clone(),
        family,
    })
}

/// The deployment engine (§4.9). Holds no per-host state; each call is
/// independent so hosts can be driven in any order (or in parallel — §5:
/// "per-host deployment MAY be issued in parallel").
pub struct DeploymentEngine<'t> {
    transport: &'t dyn HostTransport,
}

impl<'t> DeploymentEngine<'t> {
    #[must_use]
    pub fn new(transport: &'t dyn HostTransport) -> DeploymentEngine<'t> {
        DeploymentEngine { transport }
    }

    fn transport_for<'a>(&'a self, target: &DeployTarget, local: &'a LocalTransport) -> &'a dyn HostTransport {
        if target.local {
            local
        } else {
            self.transport
        }
    }

    /// §4.9 dry-run: plans every command that would run, performs the
    /// read-only pre-flight check, and mutates nothing.
    #[instrument(skip(self, postup_lines))]
    pub fn plan_host(
        &self,
        target: &DeployTarget,
        postup_lines: &[String],
        is_subnet_router_or_exit: bool,
        restart: bool,
    ) -> DryRunPlan {
        let local = LocalTransport;
        let transport = self.transport_for(target, &local);
        let remote_path = target.remote_path();

        let mut warnings = Vec::new();
        if is_subnet_router_or_exit {
            if let Some(w) = preflight_forwarding(
                transport,
                target,
                postup_lines,
                "IPv4",
                PatternName::EnableIpv4Forwarding,
                "cat /proc/sys/net/ipv4/ip_forward",
            ) {
                warnings.push(w);
            }
            if let Some(w) = preflight_forwarding(
                transport,
                target,
                postup_lines,
                "IPv6",
                PatternName::EnableIpv6Forwarding,
                "cat /proc/sys/net/ipv6/conf/all/forwarding",
            ) {
                warnings.push(w);
            }
        }

        let mut planned = vec![
            format!("cp {remote_path} {}", backup_path(&remote_path)),
            format!("put <rendered config> {remote_path}"),
            format!("chmod 600 {remote_path}"),
        ];
        if restart {
            planned.extend(restart_commands(&target.interface));
            planned.push(status_command(&target.interface));
        }

        DryRunPlan {
            host: target.ssh.host.clone(),
            warnings,
            planned_commands: planned,
        }
    }

    /// §4.9 steps 3–6: backup, upload, chmod, optional restart, verify.
    #[instrument(skip(self, postup_lines))]
    pub fn deploy_host(
        &self,
        target: &DeployTarget,
        local_rendered_path: &Path,
        postup_lines: &[String],
        is_subnet_router_or_exit: bool,
        expected_peer_count: usize,
        restart: bool,
    ) -> HostResult {
        let local = LocalTransport;
        let transport = self.transport_for(target, &local);
        let host = target.ssh.host.clone();
        let remote_path = target.remote_path();

        let mut warnings = Vec::new();
        if is_subnet_router_or_exit {
            warnings.extend(
                [
                    preflight_forwarding(
                        transport,
                        target,
                        postup_lines,
                        "IPv4",
                        PatternName::EnableIpv4Forwarding,
                        "cat /proc/sys/net/ipv4/ip_forward",
                    ),
                    preflight_forwarding(
                        transport,
                        target,
                        postup_lines,
                        "IPv6",
                        PatternName::EnableIpv6Forwarding,
                        "cat /proc/sys/net/ipv6/conf/all/forwarding",
                    ),
                ]
                .into_iter()
                .flatten(),
            );
        }
        for w in &warnings {
            warn!(%host, warning = %w, "deployment pre-flight warning");
        }

        let backup = backup_path(&remote_path);
        match transport.execute(target, &format!("cp {remote_path} {backup}")) {
            Ok(out) if out.exit_code == 0 => {}
            _ => {
                warnings.push(Warning::BackupMissing {
                    host: host.clone(),
                    path: remote_path.clone(),
                });
            }
        }

        if let Err(e) = transport.put(target, local_rendered_path, &remote_path) {
            return HostResult {
                host,
                outcome: HostOutcome::FailedBeforeUpload,
                warnings,
                backup_path: None,
                verified_peer_count: None,
                error: Some(e.to_string()),
            };
        }

        if let Err(e) = transport
            .execute(target, &format!("chmod 600 {remote_path}"))
            .and_then(|out| out.ensure_success(&host, "chmod 600"))
        {
            return HostResult {
                host,
                outcome: HostOutcome::FailedAfterUpload,
                warnings,
                backup_path: Some(backup),
                verified_peer_count: None,
                error: Some(e.to_string()),
            };
        }

        let mut verified_peer_count = None;
        if restart {
            for cmd in restart_commands(&target.interface) {
                if let Err(e) = transport.execute(target, &cmd).and_then(|out| out.ensure_success(&host, &cmd)) {
                    return HostResult {
                        host,
                        outcome: HostOutcome::FailedAfterUpload,
                        warnings,
                        backup_path: Some(backup),
                        verified_peer_count: None,
                        error: Some(e.to_string()),
                    };
                }
            }

            match transport.execute(target, &status_command(&target.interface)) {
                Ok(out) => {
                    let observed = count_peers(&out.stdout);
                    verified_peer_count = Some((observed, expected_peer_count));
                    if observed != expected_peer_count {
                        return HostResult {
                            host,
                            outcome: HostOutcome::Partial,
                            warnings,
                            backup_path: Some(backup),
                            verified_peer_count,
                            error: None,
                        };
                    }
                }
                Err(e) => {
                    return HostResult {
                        host,
                        outcome: HostOutcome::Partial,
                        warnings,
                        backup_path: Some(backup),
                        verified_peer_count: None,
                        error: Some(e.to_string()),
                    };
                }
            }
        }

        HostResult {
            host,
            outcome: HostOutcome::Success,
            warnings,
            backup_path: Some(backup),
            verified_peer_count,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(local: bool) -> DeployTarget {
        DeployTarget {
            ssh: SshCoordinates {
                host: "sr1.example.com".to_string(),
                port: 22,
                user: "root".to_string(),
                remote_config_path: "/etc/wireguard/wg0.conf".to_string(),
            },
            auth: AuthMaterial::Agent,
            interface: "wg0".to_string(),
            local,
        }
    }

    #[test]
    fn successful_deploy_with_restart_and_matching_peer_count() {
        let transport = FakeTransport::new();
        transport.script(
            "wg show wg0",
            CommandOutput {
                stdout: "peer: aaa\npeer: bbb\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
        );
        let engine = DeploymentEngine::new(&transport);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[Interface]\n").unwrap();

        let result = engine.deploy_host(&target(false), tmp.path(), &[], true, 2, true);

        assert_eq!(result.outcome, HostOutcome::Success);
        assert_eq!(result.verified_peer_count, Some((2, 2)));
        assert!(result.backup_path.is_some());
        assert_eq!(
            transport.files.lock().unwrap().get("/etc/wireguard/wg0.conf").map(String::as_str),
            Some("[Interface]\n")
        );
    }

    #[test]
    fn backup_missing_does_not_abort_deploy() {
        let transport = FakeTransport::new();
        transport.script(
            "cp /etc/wireguard/wg0.conf /etc/wireguard/wg0.conf.backup.",
            CommandOutput {
                stdout: String::new(),
                stderr: "no such file".to_string(),
                exit_code: 1,
            },
        );
        let engine = DeploymentEngine::new(&transport);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[Interface]\n").unwrap();

        let result = engine.deploy_host(&target(false), tmp.path(), &[], false, 0, false);

        assert_eq!(result.outcome, HostOutcome::Success);
        assert!(result.warnings.iter().any(|w| matches!(w, Warning::BackupMissing { .. })));
    }

    #[test]
    fn mismatched_peer_count_is_partial_not_failure() {
        let transport = FakeTransport::new();
        transport.script(
            "wg show wg0",
            CommandOutput {
                stdout: "peer: aaa\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
        );
        let engine = DeploymentEngine::new(&transport);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[Interface]\n").unwrap();

        let result = engine.deploy_host(&target(false), tmp.path(), &[], true, 5, true);

        assert_eq!(result.outcome, HostOutcome::Partial);
        assert_eq!(result.verified_peer_count, Some((1, 5)));
    }

    #[test]
    fn undeclared_forwarding_without_live_sysctl_warns() {
        let transport = FakeTransport::new();
        let engine = DeploymentEngine::new(&transport);
        let plan = engine.plan_host(&target(false), &[], true, false);
        assert_eq!(plan.warnings.len(), 2);
        assert!(plan.warnings.iter().all(|w| matches!(w, Warning::ForwardingDisabled { .. })));
    }

    #[test]
    fn declared_forwarding_in_postup_suppresses_warning() {
        let transport = FakeTransport::new();
        let engine = DeploymentEngine::new(&transport);
        let postup = vec!["sysctl -w net.ipv4.ip_forward=1".to_string()];
        let plan = engine.plan_host(&target(false), &postup, true, false);
        assert!(plan.warnings.iter().all(|w| !matches!(
            w,
            Warning::ForwardingDisabled { family, .. } if *family == "IPv4"
        )));
    }

    #[test]
    fn dry_run_plans_without_mutating() {
        let transport = FakeTransport::new();
        let engine = DeploymentEngine::new(&transport);
        let plan = engine.plan_host(&target(false), &[], false, true);
        assert!(plan.planned_commands.iter().any(|c| c.starts_with("cp ")));
        assert!(plan.planned_commands.iter().any(|c| c.contains("wg-quick")));
        assert!(transport.files.lock().unwrap().is_empty());
    }
}
