use std::{io, path::PathBuf, time::Duration};

use icochat_core::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("server {address} is unreachable: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("no response from {address} within {timeout:?}")]
    Timeout { address: String, timeout: Duration },
    #[error("handshake with {address} failed: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("no name negotiation is pending")]
    NotNegotiating,
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("another transfer is already in progress")]
    Busy,
    #[error("transfer canceled")]
    Canceled,
    #[error("not connected")]
    NotConnected,
    #[error("transfer ended after {received} of {expected} bytes")]
    IncompleteTransfer { expected: u64, received: u64 },
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
    #[error("i/o failure: {0}")]
    IoFailure(#[from] io::Error),
}

impl From<ProtocolError> for TransferError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::IncompleteTransfer { expected, received } => {
                TransferError::IncompleteTransfer { expected, received }
            }
            other => TransferError::Protocol(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed for {}: {source}", path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store {} is corrupt: {reason}", path.display())]
    CorruptData { path: PathBuf, reason: String },
    #[error("store {} is too large: {size} bytes (max {max})", path.display())]
    TooLarge { path: PathBuf, size: u64, max: u64 },
    #[error("user name must not be empty")]
    EmptyUserName,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session is running")]
    NotStarted,
    #[error("a session is already running")]
    AlreadyStarted,
    #[error("no user name configured")]
    MissingUserName,
    #[error("message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_protocol_error_maps_to_transfer_variant() {
        let err = TransferError::from(ProtocolError::IncompleteTransfer {
            expected: 10,
            received: 4,
        });
        assert!(matches!(
            err,
            TransferError::IncompleteTransfer {
                expected: 10,
                received: 4
            }
        ));

        let err = TransferError::from(ProtocolError::MalformedLength("abc".to_owned()));
        assert!(matches!(
            err,
            TransferError::Protocol(ProtocolError::MalformedLength(_))
        ));
    }
}
