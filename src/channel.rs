//! Chunked, encrypted transfer of one file over the session stream.
//!
//! Wire layout per file:
//!
//! ```text
//! {len:8}{nonce:12}{header ciphertext+tag}      header frame
//! {len:8}{nonce:12}{chunk ciphertext+tag}  ...  one frame per chunk
//! {0:8}                                         end of file
//! ```
//!
//! `len` counts ciphertext plus tag. Every frame is authenticated with
//! associated data naming its kind, file index and chunk index, so frames
//! cannot be reordered, replayed into another file or swapped for the header.
//! Memory use is bounded by one chunk regardless of file size.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bytes::read_chunk;
use crate::codec::{encode_u64, read_u64, with_io_deadline};
use crate::cryptography::{decrypt_chunk, encrypt_chunk, frame_aad, generate_nonce, DerivedKey, FrameKind};
use crate::error::{Result, TransferError};
use crate::utils::FileHeader;
use crate::{ENCRYPTION_OVERHEAD, MAX_CHUNK_SIZE, NONCE_SIZE};

const MAX_FRAME_LEN: u64 = (MAX_CHUNK_SIZE + ENCRYPTION_OVERHEAD) as u64;

/// Counts for one file body, excluding header and end marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkStats {
    pub chunks: u64,
    pub bytes: u64,
}

pub struct FileChannel {
    key: DerivedKey,
    chunk_size: usize,
    io_timeout: Option<Duration>,
}

impl FileChannel {
    pub fn new(key: DerivedKey, chunk_size: usize) -> Self {
        FileChannel {
            key,
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
            io_timeout: None,
        }
    }

    /// Fail with `PeerDisconnected` when a single frame takes longer than
    /// `limit` to read or write.
    pub fn with_io_timeout(mut self, limit: Option<Duration>) -> Self {
        self.io_timeout = limit;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout
    }

    /// Send `header` then the whole of `source`, chunk by chunk.
    ///
    /// `on_progress` gets the running byte total after every chunk.
    pub async fn send_file<S, R, F>(
        &self,
        stream: &mut S,
        file_index: u64,
        header: &FileHeader,
        source: &mut R,
        mut on_progress: F,
    ) -> Result<ChunkStats>
    where
        S: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
        F: FnMut(u64),
    {
        let label = display_path(header);
        let encoded = header
            .encode()
            .map_err(|e| TransferError::Protocol(format!("cannot encode header: {}", e)))?;
        self.write_frame(stream, &encoded, frame_aad(FrameKind::Header, file_index, 0))
            .await?;
        debug!("Sent header for file {}: {}", file_index, label.display());

        let mut buffer = vec![0u8; self.chunk_size];
        let mut stats = ChunkStats::default();

        loop {
            let n = read_chunk(source, &mut buffer)
                .await
                .map_err(|e| TransferError::storage(&label, e))?;
            if n == 0 {
                break;
            }

            stats.bytes += n as u64;
            if header.size.is_some_and(|size| stats.bytes > size) {
                return Err(source_changed(&label));
            }

            self.write_frame(
                stream,
                &buffer[..n],
                frame_aad(FrameKind::Data, file_index, stats.chunks),
            )
            .await?;
            debug!("Sent chunk {}: {} bytes", stats.chunks, n);

            stats.chunks += 1;
            on_progress(stats.bytes);
        }

        if header.size.is_some_and(|size| stats.bytes != size) {
            return Err(source_changed(&label));
        }

        with_io_deadline(self.io_timeout, async {
            stream
                .write_all(&encode_u64(0))
                .await
                .map_err(TransferError::PeerDisconnected)?;
            stream.flush().await.map_err(TransferError::PeerDisconnected)
        })
        .await?;
        debug!(
            "Finished file {}: {} chunks, {} bytes",
            file_index, stats.chunks, stats.bytes
        );
        Ok(stats)
    }

    /// Read and authenticate the header frame that opens every file.
    pub async fn receive_header<S>(&self, stream: &mut S, file_index: u64) -> Result<FileHeader>
    where
        S: AsyncRead + Unpin,
    {
        let (nonce, ciphertext) = self
            .read_frame(stream, 0)
            .await?
            .ok_or_else(|| TransferError::Protocol("file header missing".to_string()))?;

        let plaintext = decrypt_chunk(
            &self.key,
            &ciphertext,
            &nonce,
            &frame_aad(FrameKind::Header, file_index, 0),
        )
        .map_err(|_| {
            warn!("Header of file {} failed authentication", file_index);
            TransferError::Integrity { chunk: 0 }
        })?;

        let header = FileHeader::decode(&plaintext)
            .map_err(|e| TransferError::Protocol(format!("malformed file header: {}", e)))?;
        debug!("Received header for file {}: {:?}", file_index, header);
        Ok(header)
    }

    /// Receive chunks until the end marker, writing plaintext to `sink`.
    ///
    /// `dest` only labels storage errors. Any failure leaves `sink` holding a
    /// partial file that the caller must discard.
    pub async fn receive_body<S, W, F>(
        &self,
        stream: &mut S,
        file_index: u64,
        header: &FileHeader,
        sink: &mut W,
        dest: &Path,
        mut on_progress: F,
    ) -> Result<ChunkStats>
    where
        S: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        F: FnMut(u64),
    {
        let mut stats = ChunkStats::default();

        while let Some((nonce, ciphertext)) = self.read_frame(stream, stats.chunks).await? {
            let plaintext = decrypt_chunk(
                &self.key,
                &ciphertext,
                &nonce,
                &frame_aad(FrameKind::Data, file_index, stats.chunks),
            )
            .map_err(|_| {
                warn!("Chunk {} of file {} failed authentication", stats.chunks, file_index);
                TransferError::Integrity { chunk: stats.chunks }
            })?;

            stats.bytes += plaintext.len() as u64;
            if header.size.is_some_and(|size| stats.bytes > size) {
                return Err(TransferError::Integrity { chunk: stats.chunks });
            }

            sink.write_all(&plaintext)
                .await
                .map_err(|e| TransferError::storage(dest, e))?;
            debug!("Received chunk {}: {} bytes", stats.chunks, plaintext.len());

            stats.chunks += 1;
            on_progress(stats.bytes);
        }

        if header.size.is_some_and(|size| stats.bytes != size) {
            warn!(
                "File {} ended after {} of {:?} bytes",
                file_index, stats.bytes, header.size
            );
            return Err(TransferError::Integrity { chunk: stats.chunks });
        }

        sink.flush().await.map_err(|e| TransferError::storage(dest, e))?;
        Ok(stats)
    }

    async fn write_frame<S>(&self, stream: &mut S, plaintext: &[u8], aad: [u8; 17]) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let nonce = generate_nonce();
        let ciphertext = encrypt_chunk(&self.key, plaintext, &nonce, &aad)
            .map_err(|_| TransferError::Protocol("chunk encryption failed".to_string()))?;

        with_io_deadline(self.io_timeout, async {
            stream
                .write_all(&encode_u64(ciphertext.len() as u64))
                .await
                .map_err(TransferError::PeerDisconnected)?;
            stream
                .write_all(&nonce)
                .await
                .map_err(TransferError::PeerDisconnected)?;
            stream
                .write_all(&ciphertext)
                .await
                .map_err(TransferError::PeerDisconnected)?;
            stream.flush().await.map_err(TransferError::PeerDisconnected)
        })
        .await
    }

    /// `None` is the end-of-file marker.
    async fn read_frame<S>(&self, stream: &mut S, chunk: u64) -> Result<Option<([u8; NONCE_SIZE], Vec<u8>)>>
    where
        S: AsyncRead + Unpin,
    {
        with_io_deadline(self.io_timeout, read_frame_from(stream, chunk)).await
    }
}

async fn read_frame_from<S>(stream: &mut S, chunk: u64) -> Result<Option<([u8; NONCE_SIZE], Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let len = read_u64(stream).await?;
    if len == 0 {
        return Ok(None);
    }
    if len < ENCRYPTION_OVERHEAD as u64 || len > MAX_FRAME_LEN {
        warn!("Rejecting frame of {} bytes", len);
        return Err(TransferError::Integrity { chunk });
    }

    let mut nonce = [0u8; NONCE_SIZE];
    stream
        .read_exact(&mut nonce)
        .await
        .map_err(TransferError::PeerDisconnected)?;

    let mut ciphertext = vec![0u8; len as usize];
    stream
        .read_exact(&mut ciphertext)
        .await
        .map_err(TransferError::PeerDisconnected)?;

    Ok(Some((nonce, ciphertext)))
}

fn display_path(header: &FileHeader) -> PathBuf {
    Path::new(&header.relative_path).join(&header.name)
}

fn source_changed(label: &Path) -> TransferError {
    TransferError::storage(
        label,
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "source length changed during transfer",
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CHUNK_SIZE;
    use std::io::Cursor;

    const SMALL_CHUNK: usize = 1000;

    fn channel(chunk_size: usize) -> FileChannel {
        FileChannel::new(DerivedKey::from_credential("channel-test"), chunk_size)
    }

    fn header(size: Option<u64>) -> FileHeader {
        FileHeader {
            name: "data.bin".to_string(),
            relative_path: "docs".to_string(),
            size,
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Encode one file into a byte vector as the sender would put it on the wire.
    async fn encode_file(ch: &FileChannel, data: &[u8], size: Option<u64>) -> (Vec<u8>, ChunkStats) {
        let mut wire = Vec::new();
        let mut source = Cursor::new(data.to_vec());
        let stats = ch
            .send_file(&mut wire, 0, &header(size), &mut source, |_| {})
            .await
            .expect("Should send file");
        (wire, stats)
    }

    async fn decode_file(ch: &FileChannel, wire: Vec<u8>) -> Result<(FileHeader, Vec<u8>, ChunkStats)> {
        let mut stream = Cursor::new(wire);
        let header = ch.receive_header(&mut stream, 0).await?;
        let mut out = Vec::new();
        let stats = ch
            .receive_body(&mut stream, 0, &header, &mut out, Path::new("out"), |_| {})
            .await?;
        Ok((header, out, stats))
    }

    fn header_frame_len(wire: &[u8]) -> usize {
        let len = u64::from_be_bytes(wire[..8].try_into().unwrap()) as usize;
        8 + NONCE_SIZE + len
    }

    // ============================================================================
    // Round-Trip Tests
    // ============================================================================

    #[tokio::test]
    async fn test_boundary_lengths_roundtrip() {
        let ch = channel(SMALL_CHUNK);
        for len in [0, 1, SMALL_CHUNK - 1, SMALL_CHUNK, SMALL_CHUNK + 1, 3 * SMALL_CHUNK + 17] {
            let data = pattern(len);
            let (wire, sent) = encode_file(&ch, &data, Some(len as u64)).await;
            let (header, out, received) = decode_file(&ch, wire).await.unwrap();

            let expected_chunks = len.div_ceil(SMALL_CHUNK) as u64;
            assert_eq!(out, data, "length {}", len);
            assert_eq!(header.size, Some(len as u64));
            assert_eq!(sent.chunks, expected_chunks, "length {}", len);
            assert_eq!(received.chunks, expected_chunks, "length {}", len);
            assert_eq!(received.bytes, len as u64);
        }
    }

    #[tokio::test]
    async fn test_default_chunk_size_boundaries() {
        let ch = channel(CHUNK_SIZE);
        for len in [CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1] {
            let data = pattern(len);
            let (wire, sent) = encode_file(&ch, &data, Some(len as u64)).await;
            let (_, out, _) = decode_file(&ch, wire).await.unwrap();
            assert_eq!(sent.chunks, len.div_ceil(CHUNK_SIZE) as u64);
            assert!(out == data, "length {} did not round-trip", len);
        }
    }

    #[tokio::test]
    async fn test_wire_ends_with_single_marker() {
        let ch = channel(SMALL_CHUNK);
        let (wire, _) = encode_file(&ch, &pattern(2500), Some(2500)).await;

        // header + 3 data frames + 8-byte marker
        let data_frames = 2 * (8 + NONCE_SIZE + SMALL_CHUNK + ENCRYPTION_OVERHEAD)
            + (8 + NONCE_SIZE + 500 + ENCRYPTION_OVERHEAD);
        assert_eq!(wire.len(), header_frame_len(&wire) + data_frames + 8);
        assert_eq!(&wire[wire.len() - 8..], &[0u8; 8]);
    }

    #[tokio::test]
    async fn test_unknown_size_roundtrip() {
        let ch = channel(SMALL_CHUNK);
        let data = pattern(4321);
        let (wire, _) = encode_file(&ch, &data, None).await;
        let (header, out, _) = decode_file(&ch, wire).await.unwrap();
        assert_eq!(header.size, None);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_progress_reported_per_chunk() {
        let ch = channel(SMALL_CHUNK);
        let mut wire = Vec::new();
        let mut seen = Vec::new();
        let mut source = Cursor::new(pattern(2500));
        ch.send_file(&mut wire, 0, &header(Some(2500)), &mut source, |b| seen.push(b))
            .await
            .unwrap();
        assert_eq!(seen, vec![1000, 2000, 2500]);

        let mut stream = Cursor::new(wire);
        let header = ch.receive_header(&mut stream, 0).await.unwrap();
        let mut received = Vec::new();
        let mut out = Vec::new();
        ch.receive_body(&mut stream, 0, &header, &mut out, Path::new("out"), |b| received.push(b))
            .await
            .unwrap();
        assert_eq!(received, vec![1000, 2000, 2500]);
    }

    // ============================================================================
    // Integrity Tests
    // ============================================================================

    #[tokio::test]
    async fn test_tampered_ciphertext_rejected() {
        let ch = channel(SMALL_CHUNK);
        let (wire, _) = encode_file(&ch, &pattern(1500), Some(1500)).await;
        let body_start = header_frame_len(&wire) + 8 + NONCE_SIZE;

        for offset in [0, 1, 500, SMALL_CHUNK - 1, SMALL_CHUNK + ENCRYPTION_OVERHEAD - 1] {
            let mut tampered = wire.clone();
            tampered[body_start + offset] ^= 0x01;
            let result = decode_file(&ch, tampered).await;
            assert!(
                matches!(result, Err(TransferError::Integrity { chunk: 0 })),
                "offset {} was accepted",
                offset
            );
        }
    }

    #[tokio::test]
    async fn test_tampered_nonce_rejected() {
        let ch = channel(SMALL_CHUNK);
        let (mut wire, _) = encode_file(&ch, &pattern(10), Some(10)).await;
        let nonce_at = header_frame_len(&wire) + 8;
        wire[nonce_at] ^= 0x80;
        assert!(matches!(
            decode_file(&ch, wire).await,
            Err(TransferError::Integrity { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_header_rejected() {
        let ch = channel(SMALL_CHUNK);
        let (mut wire, _) = encode_file(&ch, &pattern(10), Some(10)).await;
        wire[8 + NONCE_SIZE] ^= 0x01;
        assert!(matches!(
            decode_file(&ch, wire).await,
            Err(TransferError::Integrity { chunk: 0 })
        ));
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let (wire, _) = encode_file(&channel(SMALL_CHUNK), &pattern(10), Some(10)).await;
        let other = FileChannel::new(DerivedKey::from_credential("someone-else"), SMALL_CHUNK);
        assert!(matches!(
            decode_file(&other, wire).await,
            Err(TransferError::Integrity { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_body_rejected() {
        let ch = channel(SMALL_CHUNK);
        let (wire, _) = encode_file(&ch, &pattern(2500), Some(2500)).await;

        // Keep the header, drop every data frame, forge an end marker.
        let mut truncated = wire[..header_frame_len(&wire)].to_vec();
        truncated.extend_from_slice(&encode_u64(0));
        assert!(matches!(
            decode_file(&ch, truncated).await,
            Err(TransferError::Integrity { chunk: 0 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_read() {
        let ch = channel(SMALL_CHUNK);
        let (wire, _) = encode_file(&ch, &[], Some(0)).await;
        let mut forged = wire[..header_frame_len(&wire)].to_vec();
        forged.extend_from_slice(&encode_u64(u64::MAX));
        assert!(matches!(
            decode_file(&ch, forged).await,
            Err(TransferError::Integrity { chunk: 0 })
        ));
    }

    #[tokio::test]
    async fn test_stream_cut_mid_frame_is_disconnect() {
        let ch = channel(SMALL_CHUNK);
        let (wire, _) = encode_file(&ch, &pattern(1500), Some(1500)).await;
        let cut = wire[..header_frame_len(&wire) + 8 + NONCE_SIZE + 10].to_vec();
        assert!(matches!(
            decode_file(&ch, cut).await,
            Err(TransferError::PeerDisconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_header_is_protocol_error() {
        let ch = channel(SMALL_CHUNK);
        let mut stream = Cursor::new(encode_u64(0).to_vec());
        assert!(matches!(
            ch.receive_header(&mut stream, 0).await,
            Err(TransferError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_source_shorter_than_declared_fails_before_marker() {
        let ch = channel(SMALL_CHUNK);
        let mut wire = Vec::new();
        let mut source = Cursor::new(pattern(100));
        let err = ch
            .send_file(&mut wire, 0, &header(Some(200)), &mut source, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Storage { .. }));
        assert_ne!(&wire[wire.len() - 8..], &[0u8; 8]);
    }

    // ============================================================================
    // Deadline Tests
    // ============================================================================

    fn assert_timed_out(result: Result<impl std::fmt::Debug>) {
        match result {
            Err(TransferError::PeerDisconnected(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::TimedOut)
            }
            other => panic!("expected a timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_sender_times_out_mid_file() {
        let ch = channel(SMALL_CHUNK).with_io_timeout(Some(std::time::Duration::from_millis(100)));
        let (wire, _) = encode_file(&ch, &pattern(2500), Some(2500)).await;

        // Header and first data frame arrive, then nothing; the writer stays open.
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        let first = header_frame_len(&wire) + 8 + NONCE_SIZE + SMALL_CHUNK + ENCRYPTION_OVERHEAD;
        tx.write_all(&wire[..first]).await.unwrap();

        let header = ch.receive_header(&mut rx, 0).await.unwrap();
        let mut out = Vec::new();
        let result = ch
            .receive_body(&mut rx, 0, &header, &mut out, Path::new("out"), |_| {})
            .await;
        assert_timed_out(result);
        assert_eq!(out.len(), SMALL_CHUNK);
        drop(tx);
    }

    #[tokio::test]
    async fn test_stalled_reader_times_out_sender() {
        let ch = channel(SMALL_CHUNK).with_io_timeout(Some(std::time::Duration::from_millis(100)));
        let (mut tx, _rx) = tokio::io::duplex(64);
        let mut source = Cursor::new(pattern(5000));
        let result = ch
            .send_file(&mut tx, 0, &header(Some(5000)), &mut source, |_| {})
            .await;
        assert_timed_out(result);
    }
}
