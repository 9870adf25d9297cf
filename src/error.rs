//! Crate-wide error taxonomy (spec §7).
//!
//! Errors are grouped the way §7 groups them: input errors and invariant
//! errors abort an operation before any mutation is visible; remote errors
//! are reported per host; recoverable warnings are never an `Err` at all —
//! they accumulate into a [`Warning`] list returned alongside a success
//! value.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type MeshResult<T> = Result<T, MeshError>;

/// The machine-readable tag for an error, independent of its formatted
/// message. Mirrors the "machine tag" half of §7's "human message + machine
/// tag" contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorTag {
    MalformedConfig,
    MalformedKey,
    MalformedSection,
    DuplicateField,
    UnknownAccessLevel,
    AddressFamilyMismatch,
    KeyConsistencyError,
    DuplicateIdentity,
    AddressSpaceExhausted,
    OrphanedReference,
    SshAuthFailure,
    SshTransport,
    RemoteCommandFailed,
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorTag::MalformedConfig => "MalformedConfig",
            ErrorTag::MalformedKey => "MalformedKey",
            ErrorTag::MalformedSection => "MalformedSection",
            ErrorTag::DuplicateField => "DuplicateField",
            ErrorTag::UnknownAccessLevel => "UnknownAccessLevel",
            ErrorTag::AddressFamilyMismatch => "AddressFamilyMismatch",
            ErrorTag::KeyConsistencyError => "KeyConsistencyError",
            ErrorTag::DuplicateIdentity => "DuplicateIdentity",
            ErrorTag::AddressSpaceExhausted => "AddressSpaceExhausted",
            ErrorTag::OrphanedReference => "OrphanedReference",
            ErrorTag::SshAuthFailure => "SshAuthFailure",
            ErrorTag::SshTransport => "SshTransport",
            ErrorTag::RemoteCommandFailed => "RemoteCommandFailed",
        };
        f.write_str(s)
    }
}

/// A single crate-wide error.
///
/// Input errors and invariant errors (§7) abort their operation; the store
/// is left exactly as it was on entry. Remote errors are per-host and are
/// carried in a [`crate::deploy::HostResult`] rather than aborting the whole
/// deployment.
#[derive(Error, Debug)]
pub enum MeshError {
    // -- input errors -------------------------------------------------
    #[error("malformed config: {0}")]
    MalformedConfig(String),

    #[error("malformed key: {0}")]
    MalformedKey(String),

    #[error("malformed section: {0}")]
    MalformedSection(String),

    #[error("duplicate field `{field}` in [{section}] (WireGuard forbids repeating this key)")]
    DuplicateField { section: String, field: String },

    #[error("unknown access level: {0}")]
    UnknownAccessLevel(String),

    #[error("address family mismatch: address {addr} is not in the {network_family} network {network}")]
    AddressFamilyMismatch {
        addr: IpAddr,
        network: String,
        network_family: &'static str,
    },

    // -- invariant errors -----------------------------------------------
    #[error(
        "key consistency error: {context} derived public key {derived} does not match stored public key {stored}"
    )]
    KeyConsistencyError {
        context: String,
        derived: String,
        stored: String,
    },

    #[error("duplicate identity: {field} {value} is already in use")]
    DuplicateIdentity { field: &'static str, value: String },

    #[error("address space exhausted in range {lo}-{hi} for {purpose}")]
    AddressSpaceExhausted {
        lo: String,
        hi: String,
        purpose: String,
    },

    #[error("orphaned reference: {referrer} references missing {referent}")]
    OrphanedReference {
        referrer: String,
        referent: String,
    },

    // -- remote errors ----------------------------------------------------
    #[error("ssh authentication failed for host {host}: {message}")]
    SshAuthFailure { host: String, message: String },

    #[error("ssh transport error for host {host}: {message}")]
    SshTransport { host: String, message: String },

    #[error("remote command failed on {host} ({command}): exit {exit_code}: {stderr}")]
    RemoteCommandFailed {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    // -- store plumbing -----------------------------------------------
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store locked: {0}")]
    StoreLocked(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// The machine tag for this error, per §7.
    pub fn tag(&self) -> Option<ErrorTag> {
        use MeshError::*;
        Some(match self {
            MalformedConfig(_) => ErrorTag::MalformedConfig,
            MalformedKey(_) => ErrorTag::MalformedKey,
            MalformedSection(_) => ErrorTag::MalformedSection,
            DuplicateField { .. } => ErrorTag::DuplicateField,
            UnknownAccessLevel(_) => ErrorTag::UnknownAccessLevel,
            AddressFamilyMismatch { .. } => ErrorTag::AddressFamilyMismatch,
            KeyConsistencyError { .. } => ErrorTag::KeyConsistencyError,
            DuplicateIdentity { .. } => ErrorTag::DuplicateIdentity,
            AddressSpaceExhausted { .. } => ErrorTag::AddressSpaceExhausted,
            OrphanedReference { .. } => ErrorTag::OrphanedReference,
            SshAuthFailure { .. } => ErrorTag::SshAuthFailure,
            SshTransport { .. } => ErrorTag::SshTransport,
            RemoteCommandFailed { .. } => ErrorTag::RemoteCommandFailed,
            Store(_) | StoreLocked(_) | Io(_) => return None,
        })
    }
}

/// A recoverable warning (§7): logged, attached to the operation's result,
/// never aborts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Warning {
    /// A field the parser did not recognize for its section.
    UnknownField { section: String, key: String },
    /// A `PostUp`/`PostDown` fragment the pattern library could not
    /// recognize; preserved verbatim as a `custom` singleton.
    UnrecognizedPattern { line: String },
    /// The deployment engine could not back up a remote file that was
    /// expected to already exist (not fatal: a fresh install has nothing to
    /// back up).
    BackupMissing { host: String, path: String },
    /// Pre-flight check found forwarding disabled on a subnet router or
    /// exit node.
    ForwardingDisabled { host: String, family: &'static str },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnknownField { section, key } => {
                write!(f, "unknown field `{key}` in [{section}]")
            }
            Warning::UnrecognizedPattern { line } => {
                write!(f, "unrecognized PostUp/PostDown fragment: {line}")
            }
            Warning::BackupMissing { host, path } => {
                write!(f, "no existing file to back up at {host}:{path}")
            }
            Warning::ForwardingDisabled { host, family } => {
                write!(f, "{family} forwarding appears disabled on {host}")
            }
        }
    }
}
