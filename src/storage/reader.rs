//! Read back a ring file.
//!
//! The file carries no framing, so the reader must be told the frame size,
//! and for chronological order also how many frames were written in total.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::StorageError;

pub struct RingFileReader {
    // None for an empty file, which cannot be mapped
    map: Option<Mmap>,
    frame_size: usize,
}

impl RingFileReader {
    pub fn open(path: impl AsRef<Path>, frame_size: usize) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file.metadata()?.len() as usize;
        if frame_size == 0 || len % frame_size != 0 {
            return Err(StorageError::Misaligned { len, frame_size });
        }

        let map = if len == 0 {
            None
        } else {
            // SAFETY: the map is read-only and the file is not expected to be
            // modified while it is inspected.
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self { map, frame_size })
    }

    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of frame slots present in the file
    pub fn frame_count(&self) -> usize {
        self.bytes().len() / self.frame_size
    }

    /// Frame at file position `index`
    pub fn frame(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.frame_size)?;
        let end = start.checked_add(self.frame_size)?;
        self.bytes().get(start..end)
    }

    /// Frames in file order
    pub fn frames(&self) -> impl Iterator<Item = &[u8]> {
        self.bytes().chunks_exact(self.frame_size)
    }

    /// Frames oldest to newest, given the total written over the file's
    /// lifetime and the wrap limit it was written with.
    pub fn frames_in_order(&self, written_total: u64, max_images: usize) -> Vec<&[u8]> {
        let count = self.frame_count();
        if max_images == 0 || written_total <= max_images as u64 {
            let live = (written_total as usize).min(count);
            return self.frames().take(live).collect();
        }

        // Next write position is where the oldest surviving frame sits
        let cursor = (written_total % max_images as u64) as usize;
        let end = max_images.min(count);
        (cursor..end)
            .chain(0..cursor.min(end))
            .filter_map(|i| self.frame(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_file(frames: &[u8], frame_size: usize) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = frames
            .iter()
            .flat_map(|&f| std::iter::repeat(f).take(frame_size))
            .collect();
        std::fs::write(file.path(), bytes).unwrap();
        file
    }

    #[test]
    fn splits_file_into_frames() {
        let file = ring_file(&[1, 2, 3], 4);
        let reader = RingFileReader::open(file.path(), 4).unwrap();
        assert_eq!(reader.frame_count(), 3);
        assert_eq!(reader.frame(1), Some(&[2u8, 2, 2, 2][..]));
        assert_eq!(reader.frame(3), None);
        assert_eq!(reader.frames().count(), 3);
    }

    #[test]
    fn out_of_range_index_near_usize_max() {
        let file = ring_file(&[1, 2, 3], 4);
        let reader = RingFileReader::open(file.path(), 4).unwrap();
        // The offset itself fits, its end does not
        assert_eq!(reader.frame(usize::MAX / 4), None);
        assert_eq!(reader.frame(usize::MAX), None);
    }

    #[test]
    fn rejects_misaligned_files() {
        let file = ring_file(&[1, 2, 3], 4);
        assert!(matches!(
            RingFileReader::open(file.path(), 5),
            Err(StorageError::Misaligned { len: 12, .. })
        ));
    }

    #[test]
    fn empty_file_has_no_frames() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let reader = RingFileReader::open(file.path(), 8).unwrap();
        assert_eq!(reader.frame_count(), 0);
        assert!(reader.frames_in_order(0, 4).is_empty());
    }

    #[test]
    fn orders_wrapped_file_oldest_first() {
        // 10 frames (values 0..10) through a 4-frame ring leaves [8, 9, 6, 7]
        let file = ring_file(&[8, 9, 6, 7], 2);
        let reader = RingFileReader::open(file.path(), 2).unwrap();
        let order: Vec<u8> = reader
            .frames_in_order(10, 4)
            .iter()
            .map(|f| f[0])
            .collect();
        assert_eq!(order, vec![6, 7, 8, 9]);

        // Exactly one full lap: no rotation
        let order: Vec<u8> = reader.frames_in_order(8, 4).iter().map(|f| f[0]).collect();
        assert_eq!(order, vec![8, 9, 6, 7]);
    }

    #[test]
    fn partial_first_lap() {
        let file = ring_file(&[1, 2], 3);
        let reader = RingFileReader::open(file.path(), 3).unwrap();
        let order: Vec<u8> = reader.frames_in_order(2, 4).iter().map(|f| f[0]).collect();
        assert_eq!(order, vec![1, 2]);
    }
}
