//! Container file - low-level positioned I/O.
//!
//! [`ContainerFile`] handles all direct file operations: positioned reads
//! and writes plus the durability barrier. Everything above it works in
//! logical offsets; the fixed 4-byte skew at the front of the file is
//! applied here and nowhere else.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::common::config::OFFSET_BASE;
use crate::common::Result;

/// Manages I/O for a single container file.
///
/// # File Layout
/// ```text
/// ┌──────────┬────────────────────────────────────────────┐
/// │ 4 bytes  │ logical offset space (header at -4, blocks │
/// │ skew     │ at their allocator offsets)                │
/// └──────────┴────────────────────────────────────────────┘
/// Physical:  0          4 = logical 0
/// ```
///
/// Logical offset `o` lives at physical byte `o + 4`. The header is read at
/// logical offset -4, which is why offsets here are signed.
///
/// # Thread Safety
/// `ContainerFile` is single-threaded; the [`Store`](crate::Store) owns it
/// exclusively for the life of an open session.
pub struct ContainerFile {
    file: File,
}

impl ContainerFile {
    /// Create a new container file.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Open an existing container file.
    ///
    /// # Errors
    /// Returns an error if the file doesn't exist or cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Read `len` bytes at a logical offset.
    ///
    /// Reads past the current end of file yield zeros: freshly allocated
    /// blocks may not have been written yet, and their content is defined
    /// to be arbitrary until first flush.
    pub fn read_at(&mut self, offset: i64, len: usize) -> Result<Vec<u8>> {
        let physical = (offset + OFFSET_BASE as i64) as u64;
        self.file.seek(SeekFrom::Start(physical))?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break; // rest stays zeroed
            }
            filled += n;
        }
        Ok(buf)
    }

    /// Write bytes at a logical offset.
    pub fn write_at(&mut self, offset: i64, data: &[u8]) -> Result<()> {
        let physical = (offset + OFFSET_BASE as i64) as u64;
        self.file.seek(SeekFrom::Start(physical))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Force all pending writes to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Current physical size of the file in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
