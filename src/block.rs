//! Aligned block access to a single backing file.

use std::fs;
use std::io;
use std::io::prelude::*;
use std::io::SeekFrom;
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};

/// Size of the leading header record. Data blocks start at this offset, so
/// block I/O stays aligned no matter the block size.
pub const HEADER_BYTES: u64 = 4096;

const MAGIC: u64 = 0x7870_6965_6d31_6b62;
const VERSION: u64 = 1;

/// Access mode of a stream and its backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, items may only be read.
    Read,
    /// Fresh file (an existing one is truncated), items may only be written.
    Write,
    /// Created if missing, items may be read and written.
    ReadWrite,
}

impl OpenMode {
    pub(crate) fn allows_read(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    pub(crate) fn allows_write(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }
}

/// Leading header record of a block file, persisted in native byte order; the
/// file is rejected if the stored layout does not match the requested one.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct FileHeader {
    magic: u64,
    version: u64,
    block_bytes: u64,
    item_size: u64,
    items_per_block: u64,
    len: u64,
    type_tag: u64,
    reserved: u64,
}

/// Block-aligned accessor for a single backing file.
///
/// The accessor knows the block layout and the authoritative item count; it
/// does not interpret block contents. Every transfer repositions the file
/// cursor explicitly, so the OS offset can never drift from the caller's
/// logical position.
pub struct BlockFile {
    file: fs::File,
    header: FileHeader,
}

impl BlockFile {
    /// Opens (or creates, depending on the mode) the backing file and
    /// validates its header against the requested layout.
    ///
    /// Returns the accessor together with the persisted item count.
    pub fn open(
        path: &Path,
        mode: OpenMode,
        block_bytes: usize,
        item_size: usize,
        type_tag: u64,
    ) -> Result<(BlockFile, u64)> {
        let header = FileHeader {
            magic: MAGIC,
            version: VERSION,
            block_bytes: block_bytes as u64,
            item_size: item_size as u64,
            items_per_block: (block_bytes / item_size) as u64,
            len: 0,
            type_tag,
            reserved: 0,
        };

        let mut options = fs::OpenOptions::new();
        // The descriptor is always opened for reading and writing as far as
        // the mode allows it; a write-mode stream still reads blocks back
        // when the caller seeks into already written data.
        match mode {
            OpenMode::Read => {
                options.read(true);
            }
            OpenMode::Write => {
                options.read(true).write(true).create(true).truncate(true);
            }
            OpenMode::ReadWrite => {
                options.read(true).write(true).create(true);
            }
        };
        let file = options.open(path)?;

        let mut accessor = BlockFile { file, header };
        let len = if accessor.file.metadata()?.len() == 0 {
            if mode == OpenMode::Read {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: empty file has no stream header", path.display()),
                )));
            }
            accessor.write_len(0)?;
            0
        } else {
            accessor.read_and_check_header(path)?
        };
        return Ok((accessor, len));
    }

    fn read_and_check_header(&mut self, path: &Path) -> Result<u64> {
        let mut stored = FileHeader::zeroed();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(bytemuck::bytes_of_mut(&mut stored))?;

        let reject = |what: &str| {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: stream header mismatch ({})", path.display(), what),
            )))
        };
        if stored.magic != MAGIC {
            return reject("not a stream file");
        }
        if stored.version != VERSION {
            return reject("unsupported version");
        }
        if stored.block_bytes != self.header.block_bytes {
            return reject("different block size");
        }
        if stored.item_size != self.header.item_size {
            return reject("different item size");
        }
        if stored.items_per_block != self.header.items_per_block {
            return reject("different block layout");
        }
        if stored.type_tag != self.header.type_tag {
            return reject("different item type");
        }
        self.header = stored;
        return Ok(stored.len);
    }

    /// Persists the item count in the header record.
    pub fn write_len(&mut self, len: u64) -> Result<()> {
        self.header.len = len;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(bytemuck::bytes_of(&self.header))?;
        Ok(())
    }

    fn block_offset(&self, idx: u64) -> u64 {
        HEADER_BYTES + idx * self.header.block_bytes
    }

    /// Byte offset just past item `k`, used to cut the file on truncation.
    /// Blocks are laid out with a stride of `block_bytes`; only the leading
    /// `items_per_block * item_size` bytes of each block carry items.
    fn end_of_item(&self, k: u64) -> u64 {
        let ipb = self.header.items_per_block;
        HEADER_BYTES + (k / ipb) * self.header.block_bytes + (k % ipb) * self.header.item_size
    }

    /// Reads block `idx` into `buf`, returning the number of bytes read.
    /// Short counts (including zero) occur at the end of the file.
    pub fn read_block(&mut self, idx: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(self.block_offset(idx)))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        }
        return Ok(filled);
    }

    /// Writes the valid prefix of block `idx`. A partial buffer is permitted
    /// for the last block of the file.
    pub fn write_block(&mut self, idx: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.block_offset(idx)))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Cuts the backing file after item `len`, discarding whole blocks past it.
    pub fn truncate_items(&mut self, len: u64) -> Result<()> {
        let end = self.end_of_item(len);
        self.file.set_len(end)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{BlockFile, OpenMode};

    #[test]
    fn test_header_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");

        {
            let (mut bf, len) = BlockFile::open(&path, OpenMode::Write, 4096, 8, 42).unwrap();
            assert_eq!(len, 0);
            bf.write_block(0, &[7u8; 4096]).unwrap();
            bf.write_block(1, &[9u8; 16]).unwrap();
            bf.write_len(514).unwrap();
        }

        let (mut bf, len) = BlockFile::open(&path, OpenMode::Read, 4096, 8, 42).unwrap();
        assert_eq!(len, 514);
        let mut buf = [0u8; 4096];
        assert_eq!(bf.read_block(0, &mut buf).unwrap(), 4096);
        assert!(buf.iter().all(|&b| b == 7));
        // The second block is partial; the read comes back short.
        assert_eq!(bf.read_block(1, &mut buf).unwrap(), 16);
        assert_eq!(bf.read_block(2, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        BlockFile::open(&path, OpenMode::Write, 4096, 8, 42).unwrap();

        assert!(BlockFile::open(&path, OpenMode::Read, 8192, 8, 42).is_err());
        assert!(BlockFile::open(&path, OpenMode::Read, 4096, 4, 42).is_err());
        assert!(BlockFile::open(&path, OpenMode::Read, 4096, 8, 43).is_err());
        assert!(BlockFile::open(&path, OpenMode::Read, 4096, 8, 42).is_ok());
    }

    #[test]
    fn test_truncate_cuts_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        let (mut bf, _) = BlockFile::open(&path, OpenMode::Write, 64, 8, 1).unwrap();
        for idx in 0..4 {
            bf.write_block(idx, &[idx as u8 + 1; 64]).unwrap();
        }
        bf.truncate_items(9).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(bf.read_block(0, &mut buf).unwrap(), 64);
        assert_eq!(bf.read_block(1, &mut buf).unwrap(), 8);
        assert_eq!(bf.read_block(2, &mut buf).unwrap(), 0);
    }
}
