//! Where file bytes come from and where they go.
//!
//! The session only sees [`OutgoingFile`] sources and a [`Storage`] that
//! hands out sinks, so tests and embedders can swap in their own backends.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, BufWriter};
use walkdir::WalkDir;

use crate::error::{Result, TransferError};
use crate::utils::FileHeader;

pub type FileSink = Box<dyn AsyncWrite + Send + Unpin>;
pub type FileSource = Box<dyn AsyncRead + Send + Unpin>;

/// Receiving-side destination for incoming files.
pub trait Storage: Send + Sync {
    /// Create a new, empty file for `name` under `relative_path`.
    ///
    /// Returns the sink and the path the file actually landed at, which may
    /// differ from the requested one to avoid overwriting.
    fn create(&self, relative_path: &str, name: &str) -> io::Result<(FileSink, PathBuf)>;

    /// Remove a partially written file after a failure.
    fn discard(&self, path: &Path);
}

/// Stores files under a root directory, recreating the sender's folders.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryStorage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

const MAX_RENAME_ATTEMPTS: u32 = 10_000;

impl Storage for DirectoryStorage {
    fn create(&self, relative_path: &str, name: &str) -> io::Result<(FileSink, PathBuf)> {
        let dir = self.root.join(sanitize_relative(relative_path)?);
        let name = sanitize_name(name)?;
        std::fs::create_dir_all(&dir)?;

        for attempt in 0..MAX_RENAME_ATTEMPTS {
            let candidate = dir.join(numbered_name(name, attempt));
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(file) => {
                    debug!("Writing to file: {}", candidate.display());
                    let sink = BufWriter::new(File::from_std(file));
                    return Ok((Box::new(sink), candidate));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free file name for {} in {}", name, dir.display()),
        ))
    }

    fn discard(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Discarded partial file {}", path.display()),
            Err(e) => warn!("Could not remove partial file {}: {}", path.display(), e),
        }
    }
}

/// Turn a `/`-separated relative directory from the peer into a path that
/// cannot escape the storage root.
fn sanitize_relative(relative: &str) -> io::Result<PathBuf> {
    let mut clean = PathBuf::new();
    for part in relative.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(invalid_path(relative)),
            _ => {}
        }
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(c)), None) => clean.push(c),
            _ => return Err(invalid_path(relative)),
        }
    }
    Ok(clean)
}

fn sanitize_name(name: &str) -> io::Result<&str> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).is_absolute();
    if bad {
        return Err(invalid_path(name));
    }
    Ok(name)
}

fn invalid_path(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("refusing unsafe path from peer: {:?}", path),
    )
}

/// `photo.jpg`, `photo (1).jpg`, `photo (2).jpg`, ...
fn numbered_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{} ({}).{}", stem, attempt, ext),
        None => format!("{} ({})", stem, attempt),
    }
}

enum Origin {
    Path(PathBuf),
    Reader(FileSource),
}

/// One file queued for sending. Files on disk are opened only when their
/// turn comes.
pub struct OutgoingFile {
    pub name: String,
    /// `/`-separated directory the receiver should recreate; empty for top level.
    pub relative_path: String,
    pub size: Option<u64>,
    origin: Origin,
}

impl fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("name", &self.name)
            .field("relative_path", &self.relative_path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl OutgoingFile {
    /// A file on disk. Its size is read now and checked again while sending.
    pub fn from_path(path: &Path, relative_path: impl Into<String>) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| TransferError::storage(path, e))?;
        if !metadata.is_file() {
            return Err(TransferError::storage(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                TransferError::storage(
                    path,
                    io::Error::new(io::ErrorKind::InvalidInput, "file name is not valid UTF-8"),
                )
            })?
            .to_string();

        Ok(OutgoingFile {
            name,
            relative_path: relative_path.into(),
            size: Some(metadata.len()),
            origin: Origin::Path(path.to_path_buf()),
        })
    }

    /// Any byte source, e.g. a pipe or an in-memory buffer.
    pub fn from_reader(
        name: impl Into<String>,
        relative_path: impl Into<String>,
        size: Option<u64>,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        OutgoingFile {
            name: name.into(),
            relative_path: relative_path.into(),
            size,
            origin: Origin::Reader(Box::new(reader)),
        }
    }

    pub fn header(&self) -> FileHeader {
        FileHeader {
            name: self.name.clone(),
            relative_path: self.relative_path.clone(),
            size: self.size,
        }
    }

    pub async fn open(self) -> Result<(FileHeader, FileSource)> {
        let header = self.header();
        let source: FileSource = match self.origin {
            Origin::Path(path) => {
                let file = File::open(&path)
                    .await
                    .map_err(|e| TransferError::storage(&path, e))?;
                debug!("Opened {}", path.display());
                Box::new(file)
            }
            Origin::Reader(reader) => reader,
        };
        Ok((header, source))
    }
}

/// Expand files and folders into the ordered list of files to send.
///
/// A folder keeps its own name as the top of every relative path, so
/// sending `photos/` recreates `photos/...` on the receiver.
pub fn collect_outgoing<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<OutgoingFile>> {
    let mut files = Vec::new();

    for path in paths {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| TransferError::storage(path, e))?;

        if !metadata.is_dir() {
            files.push(OutgoingFile::from_path(path, "")?);
            continue;
        }

        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let at = e.path().unwrap_or(path).to_path_buf();
                TransferError::storage(at, io::Error::from(e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let inner = entry
                .path()
                .parent()
                .and_then(|parent| parent.strip_prefix(path).ok())
                .unwrap_or_else(|| Path::new(""));
            let relative = std::iter::once(base.clone())
                .chain(inner.components().map(|c| c.as_os_str().to_string_lossy().into_owned()))
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("/");

            files.push(OutgoingFile::from_path(entry.path(), relative)?);
        }
    }

    debug!("Collected {} files to send", files.len());
    Ok(files)
}
