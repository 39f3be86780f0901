//! The persistence seam and its ring file implementation

pub mod reader;
pub mod ring;

pub use reader::RingFileReader;
pub use ring::RingWriter;

use crate::error::StorageError;

/// Sink-side storage for raw frame payloads.
///
/// Writes land at the current cursor. The sink decides when the store is
/// full and calls [`Persistence::reset_cursor`] to start over at the
/// beginning, overwriting the oldest frames.
pub trait Persistence: Send + 'static {
    /// Write `bytes` at the cursor, returning how many were written.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, StorageError>;

    fn reset_cursor(&mut self) -> Result<(), StorageError>;

    /// Flush and release the backing store
    fn close(self) -> Result<(), StorageError>
    where
        Self: Sized;
}
