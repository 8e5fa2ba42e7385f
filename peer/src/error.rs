use shared::CodecError;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to join multicast group {group}: {source}")]
    Multicast {
        group: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("outbound queue closed")]
    TransportClosed,
}
