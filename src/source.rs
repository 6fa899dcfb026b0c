//! The upstream data source contract and a file-backed implementation.

use std::fs;
use std::io::{self, Read, Seek};
use std::ops::BitOr;
use std::path::Path;

use parking_lot::Mutex;
use thiserror::Error;

/// Capability bits advertised by a [`DataSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceFlags(u32);

impl SourceFlags {
    /// The source is backed by an HTTP-like connection that can be
    /// disconnected and re-established at an offset.
    pub const HTTP_BASED: SourceFlags = SourceFlags(1 << 0);
    /// The source would like a caching layer to prefetch for it.
    pub const WANTS_PREFETCHING: SourceFlags = SourceFlags(1 << 1);
    /// The source is itself a caching layer.
    pub const CACHING: SourceFlags = SourceFlags(1 << 2);

    pub fn contains(self, other: SourceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// This set with every bit of `other` cleared.
    pub fn without(self, other: SourceFlags) -> SourceFlags {
        SourceFlags(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SourceFlags {
    type Output = SourceFlags;

    fn bitor(self, rhs: SourceFlags) -> SourceFlags {
        SourceFlags(self.0 | rhs.0)
    }
}

/// Error returned by a [`DataSource`] operation.
///
/// [`SourceError::Unsupported`] and [`SourceError::BrokenPipe`] are
/// permanent - retrying will not make them go away (the server does not
/// support range requests, or the peer is gone for good). Everything else
/// is transient and eligible for retry.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SourceError {
    #[error("source does not support the operation")]
    Unsupported,
    #[error("connection to the source is broken")]
    BrokenPipe,
    #[error("transient source failure (code {0})")]
    Transient(i32),
}

impl SourceError {
    /// True if retrying cannot succeed.
    pub fn is_permanent(self) -> bool {
        matches!(self, SourceError::Unsupported | SourceError::BrokenPipe)
    }
}

/// A slow, seekable, byte-addressable stream of bytes.
///
/// Implementations must be callable from multiple threads: the cache reads
/// on its fetcher thread while [`DataSource::disconnect`] may arrive from
/// the consumer's thread to unblock a pending read.
pub trait DataSource: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; `Ok(0)` means end of stream. May block, but must return
    /// promptly once [`DataSource::disconnect`] is called.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError>;

    /// Re-establishes the underlying stream starting at `offset`.
    ///
    /// `query_proxy` is the proxy re-configuration handshake: the caller
    /// sets it to request a proxy re-query, and the source clears it if
    /// re-configuration failed.
    fn reconnect_at(&self, offset: u64, query_proxy: &mut bool) -> Result<(), SourceError> {
        let _ = (offset, query_proxy);
        Err(SourceError::Unsupported)
    }

    /// Drops the underlying connection. Idempotent; unblocks any in-flight
    /// [`DataSource::read_at`].
    fn disconnect(&self) {}

    /// Capability bits of this source.
    fn flags(&self) -> SourceFlags {
        SourceFlags::default()
    }

    /// Total stream length, when known.
    fn size(&self) -> Option<u64> {
        None
    }
}

/// [`DataSource`] over a local file.
///
/// Positional reads seek the shared handle under a mutex; the handle is
/// never shared outside this struct.
pub struct FileSource {
    file: Mutex<fs::File>,
    size: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<FileSource> {
        let file = fs::File::open(path)?;
        let size = file.metadata()?.len();
        Ok(FileSource {
            file: Mutex::new(file),
            size,
        })
    }
}

fn map_io_error(e: &io::Error) -> SourceError {
    match e.kind() {
        io::ErrorKind::BrokenPipe => SourceError::BrokenPipe,
        _ => SourceError::Transient(e.raw_os_error().unwrap_or(-1)),
    }
}

impl DataSource for FileSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        let mut file = self.file.lock();
        file.seek(io::SeekFrom::Start(offset))
            .map_err(|e| map_io_error(&e))?;
        file.read(buf).map_err(|e| map_io_error(&e))
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp_file(contents: &[u8]) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(contents).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    fn source_flags_algebra() {
        let flags = SourceFlags::HTTP_BASED | SourceFlags::WANTS_PREFETCHING;

        assert!(flags.contains(SourceFlags::HTTP_BASED));
        assert!(!flags.contains(SourceFlags::CACHING));

        let masked = flags
            .without(SourceFlags::HTTP_BASED | SourceFlags::WANTS_PREFETCHING)
            | SourceFlags::CACHING;
        assert!(masked.contains(SourceFlags::CACHING));
        assert!(!masked.contains(SourceFlags::HTTP_BASED));

        assert!(SourceFlags::default().is_empty());
    }

    #[test]
    fn source_error_permanence() {
        assert!(SourceError::Unsupported.is_permanent());
        assert!(SourceError::BrokenPipe.is_permanent());
        assert!(!SourceError::Transient(-5).is_permanent());
    }

    #[test]
    fn file_source_reads_at_offset() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let temp_file = write_temp_file(&data);

        let source = FileSource::open(temp_file.path()).unwrap();
        assert_eq!(source.size(), Some(1000));

        let mut buf = [0u8; 16];
        let n = source.read_at(100, &mut buf).unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf[..], &data[100..116]);
    }

    #[test]
    fn file_source_short_read_at_end() {
        let temp_file = write_temp_file(&[1u8; 100]);
        let source = FileSource::open(temp_file.path()).unwrap();

        let mut buf = [0u8; 64];
        let n = source.read_at(90, &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf[..10], &[1u8; 10]);
    }

    #[test]
    fn file_source_eof_returns_zero() {
        let temp_file = write_temp_file(&[1u8; 100]);
        let source = FileSource::open(temp_file.path()).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(source.read_at(100, &mut buf).unwrap(), 0);
        assert_eq!(source.read_at(5000, &mut buf).unwrap(), 0);
    }

    #[test]
    fn file_source_default_reconnect_is_unsupported() {
        let temp_file = write_temp_file(&[0u8; 10]);
        let source = FileSource::open(temp_file.path()).unwrap();

        let mut query_proxy = false;
        assert_eq!(
            source.reconnect_at(0, &mut query_proxy),
            Err(SourceError::Unsupported)
        );
    }
}
