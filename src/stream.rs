//! Typed item streams over block files.

use std::mem;
use std::path::Path;

use bytemuck::Pod;
use log;

use crate::block::{BlockFile, OpenMode};
use crate::error::{Error, Result};
use crate::temp::TempFile;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_BYTES: usize = 2 * 1024 * 1024;

/// Marker for stream items: fixed-size, bit-copyable values. Blanket-implemented
/// for every [`bytemuck::Pod`] type that can cross threads.
pub trait Item: Pod + Send + 'static {}

impl<T: Pod + Send + 'static> Item for T {}

/// Tag identifying the item type in the stream header. Streams written with a
/// different item type are rejected on open.
pub(crate) fn type_tag<T>() -> u64 {
    // FNV-1a over the type name.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in std::any::type_name::<T>().bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    return hash;
}

/// A seekable, typed item stream persisted as fixed-size blocks.
///
/// Exactly one block is resident in memory at a time; it is written back
/// before another block is loaded if it has been modified. The logical
/// cursor always satisfies `0 <= tell() <= stream_len()`.
pub struct Stream<T: Item> {
    file: BlockFile,
    mode: OpenMode,
    items_per_block: usize,
    len: u64,
    pos: u64,
    /// The resident block. Always `items_per_block` slots; the number of
    /// valid leading items is derived from `len`.
    block: Vec<T>,
    block_idx: u64,
    dirty: bool,
    len_dirty: bool,
    /// Keeps the backing file of an anonymous stream alive until drop.
    temp: Option<TempFile>,
}

impl<T: Item> Stream<T> {
    /// Opens a stream over `path` with the given mode and block size.
    ///
    /// `Write` truncates an existing file; `Read` fails unless the file
    /// exists and carries a matching header; `ReadWrite` creates the file if
    /// missing and validates the header otherwise.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, block_bytes: usize) -> Result<Stream<T>> {
        let item_size = mem::size_of::<T>();
        if item_size == 0 {
            return Err(Error::Capacity("zero-sized items cannot be streamed".into()));
        }
        if block_bytes < item_size {
            return Err(Error::Capacity(format!(
                "block size {} is smaller than a single {}-byte item",
                block_bytes, item_size
            )));
        }

        let (file, len) = BlockFile::open(path.as_ref(), mode, block_bytes, item_size, type_tag::<T>())?;
        let items_per_block = block_bytes / item_size;
        let mut stream = Stream {
            file,
            mode,
            items_per_block,
            len,
            pos: 0,
            block: vec![T::zeroed(); items_per_block],
            block_idx: 0,
            dirty: false,
            len_dirty: false,
            temp: None,
        };
        stream.load_block(0)?;
        return Ok(stream);
    }

    /// Opens an anonymous read-write stream over a fresh temporary file. The
    /// backing file is removed when the stream is dropped.
    pub fn new_temp(block_bytes: usize) -> Result<Stream<T>> {
        let tmp = TempFile::new();
        let mut stream = Self::open(tmp.path(), OpenMode::ReadWrite, block_bytes)?;
        stream.temp = Some(tmp);
        return Ok(stream);
    }

    /// As [`Stream::new_temp`], but places the backing file in `dir`.
    pub fn new_temp_in(dir: &Path, block_bytes: usize) -> Result<Stream<T>> {
        let tmp = TempFile::in_dir(dir);
        let mut stream = Self::open(tmp.path(), OpenMode::ReadWrite, block_bytes)?;
        stream.temp = Some(tmp);
        return Ok(stream);
    }

    /// Memory held by an open stream with the given block size: the object
    /// itself plus one resident block.
    pub fn memory_usage(block_bytes: usize) -> usize {
        mem::size_of::<Stream<T>>() + block_bytes
    }

    /// Number of items in the stream.
    pub fn stream_len(&self) -> u64 {
        self.len
    }

    /// Current cursor position.
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Moves the cursor to `offset`. Fails with `OutOfRange` outside `[0, len]`.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.len {
            return Err(Error::OutOfRange { offset, len: self.len });
        }
        self.ensure_block_for(offset)?;
        self.pos = offset;
        Ok(())
    }

    /// Reads the item at the cursor and advances it. The returned reference
    /// stays valid until the resident block changes.
    pub fn read_item(&mut self) -> Result<&T> {
        if !self.mode.allows_read() {
            return Err(Error::State("cannot read a write-only stream"));
        }
        if self.pos == self.len {
            return Err(Error::EndOfStream);
        }
        self.ensure_block_for(self.pos)?;
        let slot = (self.pos % self.items_per_block as u64) as usize;
        self.pos += 1;
        return Ok(&self.block[slot]);
    }

    /// Writes an item at the cursor and advances it: an append when the
    /// cursor is at the end, an overwrite otherwise.
    pub fn write_item(&mut self, item: T) -> Result<()> {
        if !self.mode.allows_write() {
            return Err(Error::State("cannot write a read-only stream"));
        }
        self.ensure_block_for(self.pos)?;
        let slot = (self.pos % self.items_per_block as u64) as usize;
        self.block[slot] = item;
        self.dirty = true;
        self.pos += 1;
        if self.pos > self.len {
            self.len = self.pos;
            self.len_dirty = true;
        }
        Ok(())
    }

    /// Fills `buf` with consecutive items starting at the cursor, stopping at
    /// the end of the stream. Returns the number of items read. Internally
    /// performs one copy per touched block.
    pub fn read_array(&mut self, buf: &mut [T]) -> Result<usize> {
        if !self.mode.allows_read() {
            return Err(Error::State("cannot read a write-only stream"));
        }
        let ipb = self.items_per_block as u64;
        let total = (buf.len() as u64).min(self.len - self.pos) as usize;
        let mut copied = 0;
        while copied < total {
            self.ensure_block_for(self.pos)?;
            let slot = (self.pos % ipb) as usize;
            let run = (self.items_per_block - slot).min(total - copied);
            buf[copied..copied + run].copy_from_slice(&self.block[slot..slot + run]);
            self.pos += run as u64;
            copied += run;
        }
        return Ok(total);
    }

    /// Writes all of `items` starting at the cursor, overwriting existing
    /// items and appending past the end. Internally performs one copy per
    /// touched block.
    pub fn write_array(&mut self, items: &[T]) -> Result<()> {
        if !self.mode.allows_write() {
            return Err(Error::State("cannot write a read-only stream"));
        }
        let ipb = self.items_per_block as u64;
        let mut copied = 0;
        while copied < items.len() {
            self.ensure_block_for(self.pos)?;
            let slot = (self.pos % ipb) as usize;
            let run = (self.items_per_block - slot).min(items.len() - copied);
            self.block[slot..slot + run].copy_from_slice(&items[copied..copied + run]);
            self.dirty = true;
            self.pos += run as u64;
            copied += run;
            if self.pos > self.len {
                self.len = self.pos;
                self.len_dirty = true;
            }
        }
        Ok(())
    }

    /// Cuts the stream after item `n` and clamps the cursor to it. Fails with
    /// `OutOfRange` when `n` exceeds the current length.
    pub fn truncate(&mut self, n: u64) -> Result<()> {
        if !self.mode.allows_write() {
            return Err(Error::State("cannot truncate a read-only stream"));
        }
        if n > self.len {
            return Err(Error::OutOfRange { offset: n, len: self.len });
        }
        self.len = n;
        self.len_dirty = true;
        if self.block_idx * self.items_per_block as u64 >= n {
            // The resident block lies entirely past the new end; whatever it
            // held goes away with the truncated region.
            self.dirty = false;
        }
        self.file.truncate_items(n)?;
        self.pos = self.pos.min(n);
        Ok(())
    }

    /// Flushes the resident block and the header, consuming the stream.
    /// Dropping without `close` flushes too, but reports failures only in the
    /// log.
    pub fn close(mut self) -> Result<()> {
        self.flush_all()
    }

    fn flush_all(&mut self) -> Result<()> {
        self.flush_block()?;
        if self.len_dirty {
            self.file.write_len(self.len)?;
            self.len_dirty = false;
        }
        Ok(())
    }

    fn ensure_block_for(&mut self, pos: u64) -> Result<()> {
        let idx = pos / self.items_per_block as u64;
        if idx != self.block_idx {
            self.flush_block()?;
            self.load_block(idx)?;
        }
        Ok(())
    }

    fn load_block(&mut self, idx: u64) -> Result<()> {
        let bytes = bytemuck::cast_slice_mut::<T, u8>(&mut self.block);
        let read = self.file.read_block(idx, bytes)?;
        let valid = read / mem::size_of::<T>();
        for slot in &mut self.block[valid..] {
            *slot = T::zeroed();
        }
        self.block_idx = idx;
        self.dirty = false;
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let start = self.block_idx * self.items_per_block as u64;
        let valid = self.len.saturating_sub(start).min(self.items_per_block as u64) as usize;
        let bytes = &bytemuck::cast_slice::<T, u8>(&self.block)[..valid * mem::size_of::<T>()];
        self.file.write_block(self.block_idx, bytes)?;
        self.dirty = false;
        Ok(())
    }
}

impl<T: Item> Drop for Stream<T> {
    fn drop(&mut self) {
        if let Err(err) = self.flush_all() {
            log::warn!("stream flush failed on drop: {}", err);
        }
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;
    use rstest::*;

    use super::{OpenMode, Stream};
    use crate::error::Error;

    /// Pseudo-random but reproducible test items.
    fn item(i: u64) -> u64 {
        i * 98927 % 104639
    }

    const ITEMS: u64 = 1048576;
    const ARRAY_SIZE: usize = 512;
    const ARRAYS: u64 = 2048;
    const BLOCK: usize = 64 * 1024;

    #[fixture]
    fn dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_sequential_write_read(dir: tempfile::TempDir) {
        let path = dir.path().join("seq");
        {
            let mut s: Stream<u64> = Stream::open(&path, OpenMode::Write, BLOCK).unwrap();
            for i in 0..ITEMS {
                s.write_item(item(i)).unwrap();
            }
            assert_eq!(s.stream_len(), ITEMS);
            s.close().unwrap();
        }

        let mut s: Stream<u64> = Stream::open(&path, OpenMode::Read, BLOCK).unwrap();
        assert_eq!(s.stream_len(), ITEMS);
        for i in 0..ITEMS {
            assert_eq!(*s.read_item().unwrap(), item(i), "item {}", i);
        }
        assert!(matches!(s.read_item(), Err(Error::EndOfStream)));
    }

    #[rstest]
    fn test_array_write_read(dir: tempfile::TempDir) {
        let path = dir.path().join("arrays");
        let mut x = [0u64; ARRAY_SIZE];
        for (j, slot) in x.iter_mut().enumerate() {
            *slot = item(j as u64);
        }

        {
            let mut s: Stream<u64> = Stream::open(&path, OpenMode::Write, BLOCK).unwrap();
            for _ in 0..ARRAYS {
                s.write_array(&x).unwrap();
            }
            s.close().unwrap();
        }

        let mut s: Stream<u64> = Stream::open(&path, OpenMode::Read, BLOCK).unwrap();
        assert_eq!(s.stream_len(), ARRAYS * ARRAY_SIZE as u64);
        let mut buf = [0u64; ARRAY_SIZE];
        for _ in 0..ARRAYS {
            assert_eq!(s.read_array(&mut buf).unwrap(), ARRAY_SIZE);
            assert_eq!(buf, x);
        }
        assert_eq!(s.read_array(&mut buf).unwrap(), 0);
    }

    #[rstest]
    fn test_random_probe(dir: tempfile::TempDir) {
        let path = dir.path().join("probe");
        let mut s: Stream<u64> = Stream::open(&path, OpenMode::ReadWrite, BLOCK).unwrap();
        let mut data = Vec::with_capacity(ITEMS as usize);
        for i in 0..ITEMS {
            data.push(item(i));
            s.write_item(data[i as usize]).unwrap();
        }

        for i in 0..10u64 {
            let idx = item(i) % ITEMS;
            s.seek(idx).unwrap();
            if i % 2 == 0 {
                assert_eq!(*s.read_item().unwrap(), data[idx as usize]);
            } else {
                let value = item(ITEMS + i);
                data[idx as usize] = value;
                s.write_item(value).unwrap();
            }
            assert_eq!(s.tell(), idx + 1);
        }
    }

    #[rstest]
    fn test_seek_read_back_any_offset(dir: tempfile::TempDir) {
        let path = dir.path().join("offsets");
        let mut s: Stream<u64> = Stream::open(&path, OpenMode::ReadWrite, 256).unwrap();
        for i in 0..1000 {
            s.write_item(item(i)).unwrap();
        }
        for k in [0, 1, 31, 32, 33, 500, 998, 999] {
            s.seek(k).unwrap();
            assert_eq!(*s.read_item().unwrap(), item(k));
        }
        assert!(matches!(s.seek(1001), Err(Error::OutOfRange { .. })));
        s.seek(1000).unwrap();
        assert!(matches!(s.read_item(), Err(Error::EndOfStream)));
    }

    #[rstest]
    fn test_truncate(dir: tempfile::TempDir) {
        let path = dir.path().join("trunc");
        let mut s: Stream<u64> = Stream::open(&path, OpenMode::ReadWrite, 256).unwrap();
        for i in 0..1000 {
            s.write_item(item(i)).unwrap();
        }
        s.truncate(100).unwrap();
        assert_eq!(s.stream_len(), 100);
        assert_eq!(s.tell(), 100);
        assert!(matches!(s.read_item(), Err(Error::EndOfStream)));
        assert!(matches!(s.truncate(101), Err(Error::OutOfRange { .. })));

        s.seek(0).unwrap();
        for i in 0..100 {
            assert_eq!(*s.read_item().unwrap(), item(i));
        }

        // Growing the stream again after the cut starts from the new end.
        s.write_item(7).unwrap();
        assert_eq!(s.stream_len(), 101);
    }

    #[rstest]
    fn test_mode_enforcement(dir: tempfile::TempDir) {
        let path = dir.path().join("modes");
        let mut w: Stream<u64> = Stream::open(&path, OpenMode::Write, 256).unwrap();
        w.write_item(1).unwrap();
        w.seek(0).unwrap();
        assert!(matches!(w.read_item(), Err(Error::State(_))));
        w.close().unwrap();

        let mut r: Stream<u64> = Stream::open(&path, OpenMode::Read, 256).unwrap();
        assert!(matches!(r.write_item(2), Err(Error::State(_))));
        assert!(matches!(r.truncate(0), Err(Error::State(_))));
        assert_eq!(*r.read_item().unwrap(), 1);
    }

    #[rstest]
    fn test_reopen_write_truncates(dir: tempfile::TempDir) {
        let path = dir.path().join("rewrite");
        let mut s: Stream<u64> = Stream::open(&path, OpenMode::Write, 256).unwrap();
        for i in 0..100 {
            s.write_item(i).unwrap();
        }
        s.close().unwrap();

        let s: Stream<u64> = Stream::open(&path, OpenMode::Write, 256).unwrap();
        assert_eq!(s.stream_len(), 0);
    }

    #[rstest]
    fn test_type_tag_mismatch_rejected(dir: tempfile::TempDir) {
        let path = dir.path().join("typed");
        let s: Stream<u64> = Stream::open(&path, OpenMode::Write, 256).unwrap();
        s.close().unwrap();
        assert!(Stream::<u32>::open(&path, OpenMode::Read, 256).is_err());
    }

    #[rstest]
    fn test_temp_stream_backing_removed(dir: tempfile::TempDir) {
        let mut s: Stream<u64> = Stream::new_temp_in(dir.path(), 256).unwrap();
        for i in 0..100 {
            s.write_item(i).unwrap();
        }
        drop(s);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Randomized cycle of reads, writes, seeks, array transfers and
    /// truncations against an in-memory shadow copy.
    #[rstest]
    fn test_stress(dir: tempfile::TempDir) {
        const ACTIONS: usize = 4000;
        const MAX_SIZE: usize = 100_000;
        const CHUNK: usize = 1024;

        let mut rng = rand::thread_rng();
        let mut shadow: Vec<u64> = Vec::new();
        let mut arr = vec![0u64; CHUNK];
        let mut location: usize = 0;

        let mut stream: Stream<u64> = Stream::new_temp_in(dir.path(), 4096).unwrap();

        for _ in 0..ACTIONS {
            match rng.gen_range(0..7) {
                // read
                0 => {
                    let left = shadow.len() - location;
                    if left > 0 {
                        let cnt = rng.gen_range(1..=left.min(CHUNK));
                        for _ in 0..cnt {
                            assert_eq!(*stream.read_item().unwrap(), shadow[location]);
                            location += 1;
                        }
                    } else {
                        assert!(matches!(stream.read_item(), Err(Error::EndOfStream)));
                    }
                }
                // write
                1 => {
                    let cnt = rng.gen_range(1..=CHUNK).min(MAX_SIZE - location);
                    for _ in 0..cnt {
                        let value = rng.gen_range(0..123456789u64);
                        if location < shadow.len() {
                            shadow[location] = value;
                        } else {
                            shadow.push(value);
                        }
                        stream.write_item(value).unwrap();
                        location += 1;
                    }
                }
                // seek to the end
                2 => {
                    location = shadow.len();
                    stream.seek(location as u64).unwrap();
                }
                // seek somewhere
                3 => {
                    location = rng.gen_range(0..=shadow.len());
                    stream.seek(location as u64).unwrap();
                }
                // read array
                4 => {
                    let left = shadow.len() - location;
                    if left > 0 {
                        let cnt = rng.gen_range(1..=left.min(CHUNK));
                        let got = stream.read_array(&mut arr[..cnt]).unwrap();
                        assert_eq!(got, cnt);
                        assert_eq!(&arr[..cnt], &shadow[location..location + cnt]);
                        location += cnt;
                    }
                }
                // write array
                5 => {
                    let cnt = rng.gen_range(1..=CHUNK).min(MAX_SIZE - location);
                    for slot in arr[..cnt].iter_mut() {
                        *slot = rng.gen_range(0..123456789u64);
                    }
                    for (off, &value) in arr[..cnt].iter().enumerate() {
                        if location + off < shadow.len() {
                            shadow[location + off] = value;
                        } else {
                            shadow.push(value);
                        }
                    }
                    stream.write_array(&arr[..cnt]).unwrap();
                    location += cnt;
                }
                // truncate
                _ => {
                    let lo = shadow.len().saturating_sub(CHUNK);
                    let ns = rng.gen_range(lo..=shadow.len());
                    stream.truncate(ns as u64).unwrap();
                    shadow.truncate(ns);
                    stream.seek(0).unwrap();
                    location = 0;
                }
            }

            assert_eq!(stream.stream_len(), shadow.len() as u64);
            assert_eq!(stream.tell(), location as u64);
        }
    }
}
