use std::net::IpAddr;

use thiserror::Error;

use super::message::Muid;

#[derive(Debug, Error)]
pub enum GuessError {
    #[error("GUESS querying is disabled")]
    Disabled,

    #[error("a query is already running for {0}")]
    DuplicateMuid(Muid),

    #[error("unknown query")]
    UnknownQuery,

    #[error("RPC already pending for {muid} with {addr}")]
    RpcAlreadyPending { muid: Muid, addr: IpAddr },

    #[error("malformed {extension} extension: {reason}")]
    MalformedExtension {
        extension: &'static str,
        reason: String,
    },

    #[error("invalid MUID length")]
    InvalidMuid,

    #[error("invalid host record: {0}")]
    InvalidRecord(String),
}
