//! Fixed-width integer framing for every control value on the wire.
//!
//! All control values are unsigned 64-bit integers sent most-significant byte
//! first. Decoding never fails; whether a value makes sense is up to the
//! caller.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransferError};

/// "No", "conflict" or "incompatible".
pub const SIGNAL_NO: u64 = 0;
/// "Yes", "ok" or "compatible".
pub const SIGNAL_YES: u64 = 1;

pub fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn decode_u64(bytes: [u8; 8]) -> u64 {
    u64::from_be_bytes(bytes)
}

/// Write one 8-byte control value. Stream failures become `PeerDisconnected`.
pub async fn write_u64<W: AsyncWrite + Unpin>(writer: &mut W, value: u64) -> Result<()> {
    writer
        .write_all(&encode_u64(value))
        .await
        .map_err(TransferError::PeerDisconnected)?;
    writer.flush().await.map_err(TransferError::PeerDisconnected)
}

/// Read one 8-byte control value. A short read is a disconnect.
pub async fn read_u64<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(TransferError::PeerDisconnected)?;
    Ok(decode_u64(buf))
}

/// Bound one stream operation by `limit`. An elapsed deadline counts as the
/// peer going away; `None` waits forever.
pub async fn with_io_deadline<T, F>(limit: Option<Duration>, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, op).await.unwrap_or_else(|_| {
            Err(TransferError::PeerDisconnected(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("peer idle for {:?}", limit),
            )))
        }),
        None => op.await,
    }
}
