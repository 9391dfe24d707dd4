//! Error kinds per the disposition table: most are not propagated as control
//! flow (operations return bool/Option/length per-component), but are
//! constructed at the few points that need a caller-visible reason (CLI
//! replies, persistence retries, structured logs).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("replay detected: sender timestamp does not exceed the stored floor")]
    ReplayDetected,

    #[error("invalid password")]
    InvalidPassword,

    #[error("table full")]
    TableFull,

    #[error("unknown region: {0}")]
    UnknownRegion(String),

    #[error("malformed packet")]
    MalformedPacket,

    #[error("flood denied by region policy")]
    DenyFlood,

    #[error("rate limited")]
    RateLimited,

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
