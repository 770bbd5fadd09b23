//! The Sentinel (§4.4): the ZMQ broker that matches idle workers against
//! claimable jobs and pushes DISPATCH, as an alternative to workers polling
//! the store directly.

pub mod dispatch;
pub mod error;
pub mod registry;
pub mod router;
pub mod routing;

pub use error::{Result, SentinelError};
pub use router::{run, SentinelConfig};
