//! File adapter: normalizes upload inputs (filesystem paths or in-memory
//! byte streams) into a named, seekable, readable source.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::error::Error;

/// Capability bound for upload sources.
///
/// Anything readable and seekable qualifies; `tokio::fs::File` and
/// `std::io::Cursor<Vec<u8>>` both do.
pub trait ByteSource: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> ByteSource for T {}

/// An upload input: either a filesystem path (opened and validated by the
/// adapter) or an already-open byte stream.
pub enum FileSource {
    Path(PathBuf),
    Stream(Box<dyn ByteSource>),
}

impl FileSource {
    pub fn path(path: impl Into<PathBuf>) -> FileSource {
        FileSource::Path(path.into())
    }

    pub fn stream(stream: impl ByteSource + 'static) -> FileSource {
        FileSource::Stream(Box::new(stream))
    }

    /// Wraps an in-memory buffer as a seekable stream.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> FileSource {
        FileSource::Stream(Box::new(std::io::Cursor::new(bytes.into())))
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            FileSource::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

/// Expands a leading `~` to the user's home directory.
pub(crate) fn expand_user(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest.trim_start_matches('/'));
            }
        }
    }

    PathBuf::from(path)
}

/// Strips any directory components, leaving the bare file name.
pub(crate) fn basename(name: &str) -> Option<String> {
    Path::new(name).file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Prepares a source for the upload engine.
///
/// Paths are tilde-expanded, absolutized and opened for binary read;
/// streams are taken as-is. A name must be derivable from `file_name` or
/// the path itself, and is returned as the basename.
pub(crate) async fn process_file(
    file_name: Option<&str>,
    source: FileSource,
) -> Result<(String, Box<dyn ByteSource>), Error> {
    match source {
        FileSource::Path(path) => {
            let path = match path.to_str() {
                Some(s) => expand_user(s),
                None => path,
            };
            let path = std::path::absolute(&path)?;

            if !path.is_file() {
                return Err(Error::FileDoesNotExist(path));
            }

            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Err(Error::AccessToFileDenied(path));
                }
                Err(e) => return Err(e.into()),
            };

            let name = match file_name {
                Some(name) => basename(name),
                None => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            };

            match name {
                Some(name) => Ok((name, Box::new(file))),
                None => Err(Error::FileNameRequired),
            }
        }
        FileSource::Stream(stream) => {
            let name = file_name.and_then(basename).ok_or(Error::FileNameRequired)?;

            Ok((name, stream))
        }
    }
}

/// Reads `len` bytes starting at `start`.
///
/// Callers serialize access: the seek and the read must not interleave
/// with another chunk's.
pub(crate) async fn read_chunk<S>(source: &mut S, start: u64, len: usize) -> Result<Bytes, Error>
where
    S: ByteSource + ?Sized,
{
    source.seek(SeekFrom::Start(start)).await.map_err(|_| Error::FileNotSeekable)?;

    let mut buf = vec![0u8; len];
    source
        .read_exact(&mut buf)
        .await
        .map_err(|_| Error::FileObjectNotReadable)?;

    Ok(Bytes::from(buf))
}

/// Seeks to the end once to learn the source length.
pub(crate) async fn stream_len<S>(source: &mut S) -> Result<u64, Error>
where
    S: ByteSource + ?Sized,
{
    source.seek(SeekFrom::End(0)).await.map_err(|_| Error::FileNotSeekable)
}
