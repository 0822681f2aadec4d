//! STUN probing, NAT classification, and UPnP port mapping.

pub mod classify;
pub mod message;
pub mod upnp;
pub mod worker;

use thiserror::Error;

pub use classify::{classify, probe_basic, NatInfo, NatType};
pub use worker::StunWorker;

#[derive(Error, Debug)]
pub enum StunError {
    #[error("resolve {0}: {1}")]
    Resolve(String, String),

    #[error("open socket: {0}")]
    SocketOpen(std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("bad response: {0}")]
    BadResponse(String),
}

/// Whether an error chain bottoms out in a STUN timeout. The worker uses
/// this to pick `Timeout` over `Failed` for the penetration status.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(cause.downcast_ref::<StunError>(), Some(StunError::Timeout(_)))
            || matches!(
                cause.downcast_ref::<crate::common::Error>(),
                Some(crate::common::Error::Timeout(_))
            )
    })
}
