//! One transfer after a successful handshake: the file count, then every
//! file in order, then a completion acknowledgement from the receiver.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::FileChannel;
use crate::codec::{read_u64, with_io_deadline, write_u64, SIGNAL_YES};
use crate::error::{Result, TransferError};
use crate::events::{EventSink, Progress, StatusEvent};
use crate::handshake::{HandshakeOutcome, Role};
use crate::storage::{OutgoingFile, Storage};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub files: u64,
    pub bytes: u64,
    /// Where received files ended up. Empty on the sending side.
    pub saved: Vec<PathBuf>,
}

/// What this side brings to the session.
pub enum Workload {
    Send(Vec<OutgoingFile>),
    Receive(Arc<dyn Storage>),
}

impl Workload {
    pub fn role(&self) -> Role {
        match self {
            Workload::Send(_) => Role::Sending,
            Workload::Receive(_) => Role::Receiving,
        }
    }
}

pub struct TransferSession<S> {
    role: Role,
    peer_version: u64,
    stream: S,
    channel: FileChannel,
}

impl<S> TransferSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Only constructible from a completed handshake.
    pub fn new(handshake: HandshakeOutcome, stream: S, channel: FileChannel) -> Self {
        TransferSession {
            role: handshake.role,
            peer_version: handshake.peer_version,
            stream,
            channel,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_version(&self) -> u64 {
        self.peer_version
    }

    pub async fn run(mut self, workload: Workload, sink: &dyn EventSink) -> Result<TransferSummary> {
        let summary = match (self.role, workload) {
            (Role::Sending, Workload::Send(files)) => self.send_all(files, sink).await?,
            (Role::Receiving, Workload::Receive(storage)) => {
                self.receive_all(storage.as_ref(), sink).await?
            }
            (role, workload) => {
                return Err(TransferError::Protocol(format!(
                    "negotiated role {} but workload is for {}",
                    role,
                    workload.role()
                )))
            }
        };

        info!(
            "Transfer complete: {} files, {} bytes",
            summary.files, summary.bytes
        );
        sink.status(&StatusEvent::TransferComplete);
        Ok(summary)
    }

    async fn send_all(&mut self, files: Vec<OutgoingFile>, sink: &dyn EventSink) -> Result<TransferSummary> {
        let total = files.len() as u64;
        debug!("Sending file count: {}", total);
        with_io_deadline(self.channel.io_timeout(), write_u64(&mut self.stream, total)).await?;

        let mut summary = TransferSummary::default();
        for (i, file) in files.into_iter().enumerate() {
            let file_index = i as u64;
            let (header, mut source) = file.open().await?;

            sink.status(&StatusEvent::SendingFile {
                index: file_index + 1,
                total,
                name: header.name.clone(),
            });
            sink.progress(&Progress {
                file_index: file_index + 1,
                file_count: total,
                bytes: 0,
                total: header.size,
            });

            let stats = self
                .channel
                .send_file(&mut self.stream, file_index, &header, &mut source, |bytes| {
                    sink.progress(&Progress {
                        file_index: file_index + 1,
                        file_count: total,
                        bytes,
                        total: header.size,
                    })
                })
                .await?;

            summary.files += 1;
            summary.bytes += stats.bytes;
        }

        // The receiver only acknowledges once every file is safely stored.
        match with_io_deadline(self.channel.io_timeout(), read_u64(&mut self.stream)).await? {
            SIGNAL_YES => Ok(summary),
            other => Err(TransferError::Protocol(format!(
                "unexpected completion signal {}",
                other
            ))),
        }
    }

    async fn receive_all(&mut self, storage: &dyn Storage, sink: &dyn EventSink) -> Result<TransferSummary> {
        let total = with_io_deadline(self.channel.io_timeout(), read_u64(&mut self.stream)).await?;
        debug!("Expecting {} files", total);

        let mut summary = TransferSummary::default();
        for file_index in 0..total {
            sink.status(&StatusEvent::ReceivingFile {
                index: file_index + 1,
                total,
            });

            let header = self.channel.receive_header(&mut self.stream, file_index).await?;
            let (out, path) = storage
                .create(&header.relative_path, &header.name)
                .map_err(|e| {
                    TransferError::storage(Path::new(&header.relative_path).join(&header.name), e)
                })?;
            let pending = PendingFile::new(storage, path);

            sink.progress(&Progress {
                file_index: file_index + 1,
                file_count: total,
                bytes: 0,
                total: header.size,
            });

            // The sink is closed before the pending file is kept or discarded.
            let stats = {
                let mut out = out;
                self.channel
                    .receive_body(
                        &mut self.stream,
                        file_index,
                        &header,
                        &mut out,
                        pending.path(),
                        |bytes| {
                            sink.progress(&Progress {
                                file_index: file_index + 1,
                                file_count: total,
                                bytes,
                                total: header.size,
                            })
                        },
                    )
                    .await
            }?;

            let path = pending.keep();
            sink.status(&StatusEvent::FileSaved { path: path.clone() });
            summary.files += 1;
            summary.bytes += stats.bytes;
            summary.saved.push(path);
        }

        with_io_deadline(self.channel.io_timeout(), write_u64(&mut self.stream, SIGNAL_YES)).await?;
        Ok(summary)
    }
}

/// A destination file that is removed again unless kept, so neither an error
/// nor a cancelled task leaves a partial file behind.
struct PendingFile<'a> {
    storage: &'a dyn Storage,
    path: Option<PathBuf>,
}

impl<'a> PendingFile<'a> {
    fn new(storage: &'a dyn Storage, path: PathBuf) -> Self {
        PendingFile {
            storage,
            path: Some(path),
        }
    }

    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    fn keep(mut self) -> PathBuf {
        self.path.take().unwrap_or_default()
    }
}

impl Drop for PendingFile<'_> {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            self.storage.discard(&path);
        }
    }
}
