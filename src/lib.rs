//! Semantic data model, config parser/generator and orchestration core for
//! a WireGuard mesh centered on a coordination server.
//!
//! A mesh has one coordination server (CS) acting as hub, any number of
//! subnet routers and exit nodes peering with it, and any number of
//! remotes whose `AllowedIPs` are derived from their [`model::AccessLevel`]
//! rather than hand-edited. [`orchestrator`] (C8) is the mutating entry
//! point: it allocates VPN addresses, rotates keys, and figures out which
//! configs need regenerating after a change. [`store`] (C3) is where all
//! of that state actually lives, behind a single-writer SQLite database.
//! [`parse`]/[`generate`] (C5/C6) round-trip `.conf` text; [`access`] (C7)
//! turns an access level into `AllowedIPs` and firewall rules; [`deploy`]
//! (C9) pushes rendered configs out over an operator-supplied
//! [`deploy::HostTransport`]. [`extramural`] (C10) tracks third-party
//! commercial-VPN configs as a bookkeeping domain that never feeds back
//! into the mesh itself.
//!
//! # Example
//!
//! ```
//! use wireguard_mesh_core::store::Store;
//! use wireguard_mesh_core::orchestrator::{Orchestrator, AddRemoteOptions};
//! use wireguard_mesh_core::model::{AccessLevel, CoordinationServer, Identity};
//!
//! # fn main() -> wireguard_mesh_core::error::MeshResult<()> {
//! let store = Store::open_memory()?;
//! // ... bootstrap a CoordinationServer into `store`, then:
//! // let orch = Orchestrator::new(&store);
//! // orch.add_remote(&cs_guid, "laptop", AccessLevel::VpnOnly, AddRemoteOptions::default())?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod deploy;
pub mod error;
pub mod extramural;
pub mod generate;
pub mod keys;
mod macros;
pub mod model;
pub mod net;
pub mod orchestrator;
pub mod parse;
pub mod patterns;
pub mod store;

pub mod prelude {
    //! The common entry points: the store, the orchestrator, the data
    //! model's entity kinds and the crate's error types.

    pub use crate::access::{allowed_ips_for_cs_peer, allowed_ips_for_restricted};
    pub use crate::deploy::{AuthMaterial, DeployTarget, DeploymentEngine, HostOutcome, HostResult, HostTransport};
    pub use crate::error::{MeshError, MeshResult, Warning};
    pub use crate::extramural::ExtramuralManager;
    pub use crate::keys::{PresharedKey, PrivateKey, PublicKey};
    pub use crate::model::{
        AccessLevel, Comment, CoordinationServer, EntityKind, ExitNode, Identity, Remote,
        SubnetRouter,
    };
    pub use crate::orchestrator::{Orchestrator, RegenerationPlan};
    pub use crate::store::{Store, StoreConfig};
}
