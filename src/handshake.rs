//! Version and role negotiation run over a freshly opened stream.
//!
//! Both steps are plain request/response exchanges of 8-byte integers. The
//! side that writes first is fixed by [`HostingStatus`]: the joiner writes
//! and then reads, the host reads and then writes, so two blocking peers
//! never wait on each other.
//!
//! Version decision rule: when the two versions differ, only the strictly
//! lower side judges compatibility and sends its verdict (`1` or `0`); the
//! higher side never sends one and honours whatever it receives. Equal
//! versions are judged locally by both sides with no verdict on the wire.

use std::fmt;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{read_u64, write_u64, SIGNAL_NO, SIGNAL_YES};
use crate::error::{Result, TransferError};
use crate::networking::HostingStatus;
use crate::MIN_SUPPORTED_VERSION;

/// Which side of the exchange this process plays for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sending,
    Receiving,
}

impl Role {
    pub fn to_wire(self) -> u64 {
        match self {
            Role::Sending => 1,
            Role::Receiving => 0,
        }
    }

    pub fn from_wire(value: u64) -> Option<Role> {
        match value {
            1 => Some(Role::Sending),
            0 => Some(Role::Receiving),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sending => f.write_str("sending"),
            Role::Receiving => f.write_str("receiving"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    VersionPending,
    VersionConfirmed,
    RolePending,
    RoleConfirmed,
    Ready,
    Rejected,
}

/// What the session needs to know once both checks have passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub role: Role,
    pub peer_version: u64,
}

pub struct Handshake {
    role: Role,
    hosting: HostingStatus,
    local_version: u64,
    min_supported: u64,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(role: Role, hosting: HostingStatus, local_version: u64) -> Self {
        Handshake {
            role,
            hosting,
            local_version,
            min_supported: MIN_SUPPORTED_VERSION,
            state: HandshakeState::Idle,
        }
    }

    pub fn with_min_supported(mut self, min_supported: u64) -> Self {
        self.min_supported = min_supported;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run version then role negotiation. No file bytes may move until this
    /// returns `Ok`.
    pub async fn run<S>(&mut self, stream: &mut S) -> Result<HandshakeOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != HandshakeState::Idle {
            return Err(TransferError::Protocol(format!(
                "handshake already ran (state {:?})",
                self.state
            )));
        }

        self.state = HandshakeState::VersionPending;
        let peer_version = match self.negotiate_version(stream).await {
            Ok(v) => v,
            Err(e) => {
                self.state = HandshakeState::Rejected;
                return Err(e);
            }
        };
        self.state = HandshakeState::VersionConfirmed;

        self.state = HandshakeState::RolePending;
        if let Err(e) = self.negotiate_role(stream).await {
            self.state = HandshakeState::Rejected;
            return Err(e);
        }
        self.state = HandshakeState::RoleConfirmed;

        self.state = HandshakeState::Ready;
        debug!(
            "Handshake ready: role {}, local v{}, peer v{}",
            self.role, self.local_version, peer_version
        );
        Ok(HandshakeOutcome {
            role: self.role,
            peer_version,
        })
    }

    async fn negotiate_version<S>(&self, stream: &mut S) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let peer_version = match self.hosting {
            HostingStatus::Host => {
                let peer = read_u64(stream).await?;
                write_u64(stream, self.local_version).await?;
                peer
            }
            HostingStatus::Join => {
                write_u64(stream, self.local_version).await?;
                read_u64(stream).await?
            }
        };
        debug!(
            "Versions exchanged: local {}, peer {}",
            self.local_version, peer_version
        );

        let incompatible = TransferError::VersionIncompatible {
            local: self.local_version,
            peer: peer_version,
        };

        if peer_version < self.local_version {
            // Lower peer owns the verdict.
            let decision = read_u64(stream).await?;
            debug!("Peer v{} decided {}", peer_version, decision);
            if decision != SIGNAL_YES {
                warn!("Peer v{} rejected local v{}", peer_version, self.local_version);
                return Err(incompatible);
            }
        } else if peer_version > self.local_version {
            let compatible = self.local_version >= self.min_supported;
            let decision = if compatible { SIGNAL_YES } else { SIGNAL_NO };
            write_u64(stream, decision).await?;
            if !compatible {
                warn!(
                    "Local v{} is below minimum v{}",
                    self.local_version, self.min_supported
                );
                return Err(incompatible);
            }
        } else if self.local_version < self.min_supported {
            warn!(
                "Shared v{} is below minimum v{}",
                self.local_version, self.min_supported
            );
            return Err(incompatible);
        }

        Ok(peer_version)
    }

    async fn negotiate_role<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.hosting {
            HostingStatus::Host => {
                let raw = read_u64(stream).await?;
                let peer_role = Role::from_wire(raw)
                    .ok_or_else(|| TransferError::Protocol(format!("unknown role value {}", raw)))?;
                debug!("Peer role: {}, local role: {}", peer_role, self.role);

                if peer_role == self.role {
                    // Tell the peer before failing here.
                    write_u64(stream, SIGNAL_NO).await?;
                    return Err(TransferError::RoleConflict(self.role));
                }
                write_u64(stream, SIGNAL_YES).await
            }
            HostingStatus::Join => {
                write_u64(stream, self.role.to_wire()).await?;
                let confirmation = read_u64(stream).await?;
                debug!("Host confirmation for role {}: {}", self.role, confirmation);

                if confirmation != SIGNAL_YES {
                    return Err(TransferError::RoleConflict(self.role));
                }
                Ok(())
            }
        }
    }
}
