//! Plugin Gatekeeper and identity/signing primitives (§4.3, §9).

pub mod gatekeeper;
pub mod identity;
pub mod signing;

pub use gatekeeper::{Gatekeeper, GatekeeperReport};
pub use identity::{AuthenticationError, EnterpriseProvider, IdentityProvider, LocalProvider, User};
pub use signing::{compute_artifact_hash, env_hash, sha256_hex, source_hash};
