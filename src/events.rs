//! Outbound signals for whoever presents the transfer to a user.
//!
//! The library only ever writes to an [`EventSink`]; it never reads back.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::TransferError;
use crate::session::TransferSummary;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Listening; credentials can now be shown to or sent to the peer.
    AwaitingPeer { port: u16 },
    Connecting { addr: SocketAddr },
    Connected { peer: SocketAddr },
    HandshakeComplete { peer_version: u64 },
    /// `index` is 1-based.
    SendingFile { index: u64, total: u64, name: String },
    ReceivingFile { index: u64, total: u64 },
    FileSaved { path: PathBuf },
    TransferComplete,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::AwaitingPeer { port } => write!(f, "Waiting for peer on port {}", port),
            StatusEvent::Connecting { addr } => write!(f, "Connecting to {}", addr),
            StatusEvent::Connected { peer } => write!(f, "Connected to {}", peer),
            StatusEvent::HandshakeComplete { peer_version } => {
                write!(f, "Peer accepted (protocol v{})", peer_version)
            }
            StatusEvent::SendingFile { index, total, name } => {
                write!(f, "Sending file {} of {}: {}", index, total, name)
            }
            StatusEvent::ReceivingFile { index, total } => {
                write!(f, "Receiving file {} of {}", index, total)
            }
            StatusEvent::FileSaved { path } => write!(f, "Saved {}", path.display()),
            StatusEvent::TransferComplete => f.write_str("Transfer complete"),
        }
    }
}

/// Byte progress within the current file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub file_index: u64,
    pub file_count: u64,
    pub bytes: u64,
    /// Unknown when the sender did not declare a size.
    pub total: Option<u64>,
}

impl Progress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some(self.bytes as f64 / total as f64),
            None => None,
        }
    }
}

/// How a session ended. Reported exactly once per session.
#[derive(Debug, Clone, Copy)]
pub enum SessionOutcome<'a> {
    Completed(&'a TransferSummary),
    Failed(&'a TransferError),
    Cancelled,
}

pub trait EventSink: Send + Sync {
    fn status(&self, event: &StatusEvent);
    fn progress(&self, progress: &Progress);
    fn finished(&self, outcome: SessionOutcome<'_>);
}

/// Sink that drops everything.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn status(&self, _event: &StatusEvent) {}
    fn progress(&self, _progress: &Progress) {}
    fn finished(&self, _outcome: SessionOutcome<'_>) {}
}
