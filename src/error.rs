use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::handshake::Role;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Every way a transfer session can end other than success.
///
/// All variants are fatal to the session that raised them; nothing here is
/// retried by the library.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Listening, accepting or connecting failed before a stream existed.
    #[error("could not establish connection: {0}")]
    Connection(#[source] io::Error),

    /// A read or write on the established stream failed mid-protocol.
    #[error("peer connection closed: {0}")]
    PeerDisconnected(#[source] io::Error),

    #[error(
        "protocol version {peer} of the peer cannot interoperate with local version {local}; \
         update both devices to the latest release"
    )]
    VersionIncompatible { local: u64, peer: u64 },

    #[error("both devices chose to be {0}; one side must send and the other receive")]
    RoleConflict(Role),

    /// A frame failed authentication, was malformed, or the file was truncated.
    #[error("chunk {chunk} failed integrity verification")]
    Integrity { chunk: u64 },

    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Authenticated data that does not make sense at this point of the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("a transfer session is already active")]
    SessionActive,

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Storage {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_message_has_upgrade_pointer() {
        let err = TransferError::VersionIncompatible { local: 9, peer: 7 };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains("update"));
    }

    #[test]
    fn test_role_conflict_names_role() {
        let err = TransferError::RoleConflict(Role::Receiving);
        assert!(err.to_string().contains("receiving"));
    }

    #[test]
    fn test_peer_disconnected_message() {
        let err = TransferError::PeerDisconnected(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(err.to_string().starts_with("peer connection closed"));
    }
}
