use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No available IP addresses in range")]
    Exhausted,

    #[error("Address {0} is outside the configured range")]
    OutOfRange(Ipv4Addr),

    #[error("Address {0} is not allocated")]
    NotAllocated(Ipv4Addr),

    #[error("Hardware address {0} not found in lease table")]
    NotFound(String),

    #[error("Requested {requested} for {hw}, but {stored} is on record")]
    Mismatch {
        hw: String,
        requested: Ipv4Addr,
        stored: Ipv4Addr,
    },

    #[error("Address {ip} is already leased to {holder}")]
    Conflict { ip: Ipv4Addr, holder: String },

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Lease table changed during expiry sweep")]
    ConcurrentModification,

    #[error("Malformed lease record: {0}")]
    MalformedLease(String),
}

pub type Result<T> = std::result::Result<T, Error>;
