//! Typed errors for every component of the agreement engine.

use std::net::SocketAddr;

use thiserror::Error;

use crate::wire::PeerId;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown order value: {0}")]
    UnknownOrder(String),
    #[error("frame is missing its value payload")]
    MissingValue,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no outbound channel registered for peer {0}")]
    UnknownPeer(PeerId),
    #[error("connect to {peer} at {addr} failed: {source}")]
    Connect {
        peer: PeerId,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("write to {peer} failed: {source}")]
    Write {
        peer: PeerId,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} is not the primary")]
    NotPrimary(PeerId),
    #[error("the client may not issue the undecided order")]
    InvalidClientOrder,
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("a general with this id already exists: {0}")]
    DuplicatePeer(PeerId),
    #[error("a general with this id does not exist: {0}")]
    UnknownPeer(PeerId),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("the client may not issue the undecided order")]
    InvalidOrder,
    #[error("connect to primary at {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("io error talking to the primary: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("primary closed the connection without responding")]
    NoResponse,
}
