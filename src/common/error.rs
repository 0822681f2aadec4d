use thiserror::Error;

/// Error kinds the runtime branches on: the supervisor consults them to
/// decide whether a crashed worker is worth respawning, and the STUN worker
/// maps them onto its penetration status.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("auth denied: {0}")]
    AuthDenied(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Fatal errors are not retried by the supervisor: a malformed rule or a
    /// port that is already taken does not get better by respawning.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Fatal(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Walk an `anyhow` chain looking for a typed [`Error`] marked fatal.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<Error>())
        .any(|e| e.is_fatal())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::Config("bad rule".into()).is_fatal());
        assert!(Error::Fatal("port in use".into()).is_fatal());
        assert!(!Error::Timeout("stun".into()).is_fatal());
        assert!(!Error::Protocol("short reply".into()).is_fatal());
    }

    #[test]
    fn fatal_through_anyhow_chain() {
        let err = anyhow::Error::from(Error::Fatal("cert load".into())).context("worker died");
        assert!(is_fatal(&err));

        let err = anyhow::Error::from(Error::Timeout("probe".into())).context("worker died");
        assert!(!is_fatal(&err));
    }
}
