//! Flat ring file: consecutive raw payloads, no header, no length prefix

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage::Persistence;

/// Writes payloads back to back into any seekable sink
pub struct RingWriter<W: Write + Seek> {
    inner: W,
    position: u64,
}

impl RingWriter<File> {
    /// Create (or truncate) the ring file at `path`
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| StorageError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Writing frames to {}", path.display());
        Ok(Self::new(file))
    }
}

impl<W: Write + Seek> RingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    /// Byte offset of the next write
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Seek + Send + 'static> Persistence for RingWriter<W> {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, StorageError> {
        let mut written = 0;
        while written < bytes.len() {
            match self.inner.write(&bytes[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.position += written as u64;
        Ok(written)
    }

    fn reset_cursor(&mut self) -> Result<(), StorageError> {
        self.inner.seek(SeekFrom::Start(0))?;
        debug!("Ring file wrapped after {} bytes", self.position);
        self.position = 0;
        Ok(())
    }

    fn close(mut self) -> Result<(), StorageError> {
        self.inner.flush()?;
        Ok(())
    }
}
