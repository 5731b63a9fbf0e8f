//! K-way merging of sorted runs stored in streams.

use std::cmp::Ordering;
use std::mem;

use crate::error::{Error, Result};
use crate::heap::MergeHeap;
use crate::stream::{Item, Stream};

/// Merges up to `fanout` sorted runs read from open streams into a single
/// sorted pull sequence.
///
/// Each input stream is positioned at the head of its run when handed over;
/// a run ends after `run_length` items or at the end of its stream, whichever
/// comes first. Runs sharing a backing file rely on the item cap to stop at
/// their neighbour's first item.
pub struct Merger<T: Item, C> {
    heap: MergeHeap<T, C>,
    inputs: Vec<Stream<T>>,
    items_read: Vec<u64>,
    run_length: u64,
}

impl<T, C> Merger<T, C>
where
    T: Item,
    C: Fn(&T, &T) -> Ordering,
{
    /// Creates an idle merger. [`Merger::reset`] arms it with input runs.
    pub fn new(cmp: C) -> Self {
        Merger {
            heap: MergeHeap::new(0, cmp),
            inputs: Vec::new(),
            items_read: Vec::new(),
            run_length: 0,
        }
    }

    /// Memory held by a merger over `fanout` open runs: the input streams
    /// plus the merge heap. The merge sorter sizes both jointly.
    pub fn memory_usage(fanout: usize, block_bytes: usize) -> usize {
        mem::size_of::<Self>()
            + fanout * Stream::<T>::memory_usage(block_bytes)
            + MergeHeap::<T, C>::memory_usage(fanout)
    }

    /// Readies the merger over a fresh set of run streams. The previous merge
    /// must have been pulled dry.
    pub fn reset(&mut self, inputs: Vec<Stream<T>>, run_length: u64) -> Result<()> {
        if !self.heap.is_empty() {
            return Err(Error::State("merger reset while merged items remain"));
        }
        self.items_read = vec![0; inputs.len()];
        self.inputs = inputs;
        self.run_length = run_length;
        for run in 0..self.inputs.len() {
            if let Some(item) = self.advance_run(run)? {
                self.heap.push(item, run);
            }
        }
        Ok(())
    }

    /// Drops the input streams, closing their backing files.
    pub fn release(&mut self) {
        self.inputs.clear();
        self.items_read.clear();
    }

    /// True while merged items remain.
    pub fn can_pull(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Returns the next item in merge order, refilling the heap from the run
    /// that produced it.
    pub fn pull(&mut self) -> Result<T> {
        let run = match self.heap.top_run() {
            Some(run) => run,
            None => return Err(Error::EndOfStream),
        };
        let popped = match self.advance_run(run)? {
            Some(next) => self.heap.pop_and_push(next, run),
            None => self.heap.pop(),
        };
        match popped {
            Some((item, _)) => Ok(item),
            None => unreachable!("merge heap emptied while its top was read"),
        }
    }

    /// Reads the next item of `run`, if the run has one left.
    fn advance_run(&mut self, run: usize) -> Result<Option<T>> {
        if self.items_read[run] >= self.run_length {
            return Ok(None);
        }
        let stream = &mut self.inputs[run];
        if stream.tell() >= stream.stream_len() {
            return Ok(None);
        }
        let item = *stream.read_item()?;
        self.items_read[run] += 1;
        return Ok(Some(item));
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::Merger;
    use crate::block::OpenMode;
    use crate::error::Error;
    use crate::stream::Stream;

    #[fixture]
    fn dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn run_stream(dir: &tempfile::TempDir, items: &[u64]) -> Stream<u64> {
        let mut stream = Stream::new_temp_in(dir.path(), 256).unwrap();
        stream.write_array(items).unwrap();
        stream.seek(0).unwrap();
        return stream;
    }

    #[rstest]
    fn test_merges_runs(dir: tempfile::TempDir) {
        let inputs = vec![
            run_stream(&dir, &[4, 5, 7]),
            run_stream(&dir, &[1, 6]),
            run_stream(&dir, &[3]),
            run_stream(&dir, &[]),
        ];

        let mut merger = Merger::new(|a: &u64, b: &u64| a.cmp(b));
        merger.reset(inputs, 100).unwrap();

        let mut merged = Vec::new();
        while merger.can_pull() {
            merged.push(merger.pull().unwrap());
        }
        assert_eq!(merged, vec![1, 3, 4, 5, 6, 7]);
        assert!(matches!(merger.pull(), Err(Error::EndOfStream)));
    }

    #[rstest]
    fn test_run_length_caps_each_input(dir: tempfile::TempDir) {
        // Two runs packed back to back in one file: [0, 2, 4] and [1, 3, 5].
        let path = dir.path().join("packed");
        {
            let mut writer: Stream<u64> = Stream::open(&path, OpenMode::Write, 256).unwrap();
            writer.write_array(&[0, 2, 4, 1, 3, 5]).unwrap();
            writer.close().unwrap();
        }

        let first: Stream<u64> = Stream::open(&path, OpenMode::Read, 256).unwrap();
        let mut second: Stream<u64> = Stream::open(&path, OpenMode::Read, 256).unwrap();
        second.seek(3).unwrap();

        let mut merger = Merger::new(|a: &u64, b: &u64| a.cmp(b));
        merger.reset(vec![first, second], 3).unwrap();

        let mut merged = Vec::new();
        while merger.can_pull() {
            merged.push(merger.pull().unwrap());
        }
        assert_eq!(merged, vec![0, 1, 2, 3, 4, 5]);
    }
}
