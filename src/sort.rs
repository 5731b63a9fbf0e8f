//! External merge sorter.
//!
//! Sorting proceeds in four phases:
//!
//! 1. calculating parameters,
//! 2. sorting and forming runs,
//! 3. merging runs,
//! 4. final merge and report.
//!
//! If everything received during phase 2 fits below the internal report
//! threshold, nothing is written to disk: phase 3 becomes a no-op and phase 4
//! walks the in-memory buffer.

use std::cmp::Ordering;
use std::mem;
use std::path::PathBuf;

use log;
use rayon::prelude::*;

use crate::block::OpenMode;
use crate::error::{Error, Result};
use crate::merger::Merger;
use crate::stream::{Item, Stream, DEFAULT_BLOCK_BYTES};
use crate::temp::{temp_root, TempFile};

/// Configuration of a merge sorter.
#[derive(Clone, Debug)]
pub struct SortOptions {
    /// Block size of the run streams.
    pub block_bytes: usize,
    /// Directory run files are placed in. [`temp_root`] when `None`.
    pub temp_dir: Option<PathBuf>,
}

impl Default for SortOptions {
    fn default() -> Self {
        SortOptions {
            block_bytes: DEFAULT_BLOCK_BYTES,
            temp_dir: None,
        }
    }
}

/// Parameters steering run formation and merging, derived from the memory
/// budgets of phases 2-4.
#[derive(Clone, Copy, Debug, Default)]
pub struct SortParameters {
    /// Items per initial run.
    pub run_length: u64,
    /// Runs merged per intermediate merge pass.
    pub fanout: usize,
    /// Runs merged by the final merge pass.
    pub final_fanout: usize,
    /// Largest item count reported from memory without touching disk.
    pub internal_report_threshold: u64,
    /// Effective phase budgets, after clamping.
    pub memory_phase2: usize,
    pub memory_phase3: usize,
    pub memory_phase4: usize,
}

impl SortParameters {
    fn dump(&self) {
        log::debug!("calculated merge sort parameters:");
        log::debug!("  run length                {}", self.run_length);
        log::debug!("  fanout                    {}", self.fanout);
        log::debug!("  final fanout              {}", self.final_fanout);
        log::debug!("  internal report threshold {}", self.internal_report_threshold);
        log::debug!(
            "  phase memory              {} / {} / {}",
            self.memory_phase2,
            self.memory_phase3,
            self.memory_phase4
        );
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SorterState {
    /// No parameters yet.
    Fresh,
    /// Parameters set, run formation not started.
    Ready,
    /// Between `begin` and `end`.
    Forming,
    /// Run formation finished, merges not performed.
    Formed,
    /// `calc` done; items may be pulled.
    Prepared,
}

/// A sort-pull segment: push items between [`begin`](MergeSorter::begin) and
/// [`end`](MergeSorter::end), run [`calc`](MergeSorter::calc), then pull them
/// back in sorted order.
///
/// Runs live inside a bank of `2 * fanout` temporary files; merge level
/// parity alternates which half of the bank is consumed and which is
/// produced, so the bank never grows.
pub struct MergeSorter<T: Item, C> {
    opts: SortOptions,
    cmp: C,
    params: SortParameters,
    state: SorterState,
    run_files: Vec<TempFile>,
    /// Current run buffer. Empty before `begin`; in internal report mode it
    /// holds the sorted output until pulled dry.
    current_run: Vec<T>,
    /// Number of runs written to disk.
    finished_runs: u64,
    report_internal: bool,
    items_pulled: u64,
    merge_passes: usize,
    merger: Merger<T, C>,
}

impl<T> MergeSorter<T, fn(&T, &T) -> Ordering>
where
    T: Item + Ord,
{
    /// A sorter using the item type's natural order.
    pub fn natural() -> Self {
        MergeSorter::new(T::cmp as fn(&T, &T) -> Ordering)
    }
}

impl<T, C> MergeSorter<T, C>
where
    T: Item,
    C: Fn(&T, &T) -> Ordering + Clone + Send + Sync,
{
    /// Creates a sorter with default options.
    pub fn new(cmp: C) -> Self {
        Self::with_options(cmp, SortOptions::default())
    }

    /// Creates a sorter with the given options.
    pub fn with_options(cmp: C, opts: SortOptions) -> Self {
        MergeSorter {
            opts,
            merger: Merger::new(cmp.clone()),
            cmp,
            params: SortParameters::default(),
            state: SorterState::Fresh,
            run_files: Vec::new(),
            current_run: Vec::new(),
            finished_runs: 0,
            report_internal: false,
            items_pulled: 0,
            merge_passes: 0,
        }
    }

    /// The parameters in effect, once set.
    pub fn parameters(&self) -> Option<&SortParameters> {
        match self.state {
            SorterState::Fresh => None,
            _ => Some(&self.params),
        }
    }

    /// Number of merge passes performed so far, the final merge included.
    pub fn merge_pass_count(&self) -> usize {
        self.merge_passes
    }

    /// Sets the run length and fanout directly, bypassing the memory
    /// calculation. Intended for tests.
    pub fn set_parameters(&mut self, run_length: u64, fanout: usize) -> Result<()> {
        self.check_parameters_settable()?;
        if run_length == 0 {
            return Err(Error::Capacity("run length must hold at least one item".into()));
        }
        if fanout < 2 {
            return Err(Error::Capacity("fanout must be at least 2".into()));
        }
        self.params = SortParameters {
            run_length,
            fanout,
            final_fanout: fanout,
            internal_report_threshold: run_length,
            memory_phase2: 0,
            memory_phase3: 0,
            memory_phase4: 0,
        };
        self.state = SorterState::Ready;
        log::debug!("manually set run length {} and fanout {}", run_length, fanout);
        Ok(())
    }

    /// Calculates parameters from a single memory budget shared by all
    /// phases.
    pub fn set_available_memory(&mut self, m: usize) -> Result<()> {
        self.set_available_memory_per_phase(m, m, m)
    }

    /// Calculates parameters from separate memory budgets for run formation
    /// (`m2`), intermediate merging (`m3`) and the final merge (`m4`).
    ///
    /// An `m3` or `m4` too small for a two-way merge is raised to the
    /// smallest workable budget with a warning; an `m2` that cannot hold a
    /// single item next to one open stream and the run-file bank has no
    /// viable downgrade and fails with `Capacity`.
    pub fn set_available_memory_per_phase(&mut self, m2: usize, mut m3: usize, mut m4: usize) -> Result<()> {
        self.check_parameters_settable()?;
        let block_bytes = self.opts.block_bytes;
        let item_size = mem::size_of::<T>();

        // Phase 3: the fanout is bounded by the merge heap and the fanout
        // open streams.
        log::debug!("phase 3: {} b available memory", m3);
        let fanout = Self::calculate_fanout(m3, block_bytes);
        if Self::fanout_memory_usage(fanout, block_bytes) > m3 {
            log::warn!(
                "not enough memory for fanout {}; raising phase 3 budget from {} to {} b",
                fanout,
                m3,
                Self::fanout_memory_usage(fanout, block_bytes)
            );
            m3 = Self::fanout_memory_usage(fanout, block_bytes);
        }

        // Phase 4: same calculation, capped by the intermediate fanout.
        log::debug!("phase 4: {} b available memory", m4);
        let mut final_fanout = Self::calculate_fanout(m4, block_bytes);
        if final_fanout > fanout {
            final_fanout = fanout;
        }
        if Self::fanout_memory_usage(final_fanout, block_bytes) > m4 {
            log::warn!(
                "not enough memory for final fanout {}; raising phase 4 budget from {} to {} b",
                final_fanout,
                m4,
                Self::fanout_memory_usage(final_fanout, block_bytes)
            );
            m4 = Self::fanout_memory_usage(final_fanout, block_bytes);
        }

        // Phase 2: whatever is left after one open stream and the run-file
        // bank determines the run length.
        let stream_memory = Stream::<T>::memory_usage(block_bytes);
        let temp_file_memory = 2 * fanout * mem::size_of::<TempFile>();
        log::debug!(
            "phase 2: {} b available memory, {} b per open stream, {} b for the run-file bank",
            m2,
            stream_memory,
            temp_file_memory
        );
        let min_m2 = item_size + stream_memory + temp_file_memory;
        if m2 < min_m2 {
            return Err(Error::Capacity(format!(
                "phase 2 budget of {} b cannot hold one item next to an open stream (needs {} b)",
                m2, min_m2
            )));
        }
        let run_length = ((m2 - stream_memory - temp_file_memory) / item_size) as u64;

        let smallest = m2.min(m3).min(m4);
        let mut internal_report_threshold = (smallest.saturating_sub(temp_file_memory) / item_size) as u64;
        if internal_report_threshold > run_length {
            internal_report_threshold = run_length;
        }

        self.params = SortParameters {
            run_length,
            fanout,
            final_fanout,
            internal_report_threshold,
            memory_phase2: m2,
            memory_phase3: m3,
            memory_phase4: m4,
        };
        self.state = SorterState::Ready;
        self.params.dump();
        Ok(())
    }

    /// Initiates phase 2: formation of input runs.
    pub fn begin(&mut self) -> Result<()> {
        if self.state != SorterState::Ready {
            return Err(Error::State("begin requires parameters and no prior run formation"));
        }
        log::debug!("start forming input runs");
        self.current_run = Vec::with_capacity(self.params.run_length as usize);
        let dir = self.opts.temp_dir.clone().unwrap_or_else(temp_root);
        self.run_files = (0..2 * self.params.fanout).map(|_| TempFile::in_dir(&dir)).collect();
        self.finished_runs = 0;
        self.state = SorterState::Forming;
        Ok(())
    }

    /// Pushes an item during phase 2.
    pub fn push(&mut self, item: T) -> Result<()> {
        if self.state != SorterState::Forming {
            return Err(Error::State("push is only valid between begin and end"));
        }
        if self.current_run.len() as u64 >= self.params.run_length {
            self.sort_current_run();
            self.spill_current_run()?;
        }
        self.current_run.push(item);
        Ok(())
    }

    /// Ends phase 2. Decides between internal reporting and spilling the
    /// residual run.
    pub fn end(&mut self) -> Result<()> {
        if self.state != SorterState::Forming {
            return Err(Error::State("end without begin"));
        }
        self.sort_current_run();
        if self.finished_runs == 0 && self.current_run.len() as u64 <= self.params.internal_report_threshold {
            self.report_internal = true;
            self.items_pulled = 0;
            log::debug!("got {} items; internal reporting mode", self.current_run.len());
        } else {
            self.report_internal = false;
            if !self.current_run.is_empty() {
                self.spill_current_run()?;
            }
            self.current_run = Vec::new();
            log::debug!("got {} runs; external reporting mode", self.finished_runs);
        }
        self.state = SorterState::Formed;
        Ok(())
    }

    /// Performs phase 3: every merge in the merge tree except the last one,
    /// then readies the final merge.
    pub fn calc(&mut self) -> Result<()> {
        if self.state != SorterState::Formed {
            return Err(Error::State("calc before end"));
        }
        if !self.report_internal {
            self.prepare_pull()?;
        }
        self.state = SorterState::Prepared;
        Ok(())
    }

    /// In phase 4: true while sorted items remain.
    pub fn can_pull(&self) -> bool {
        if self.state != SorterState::Prepared {
            return false;
        }
        if self.report_internal {
            self.items_pulled < self.current_run.len() as u64
        } else {
            self.merger.can_pull()
        }
    }

    /// In phase 4: fetches the next item in sorted order.
    pub fn pull(&mut self) -> Result<T> {
        if self.state != SorterState::Prepared {
            return Err(Error::State("pull before calc"));
        }
        if self.report_internal {
            if self.items_pulled >= self.current_run.len() as u64 {
                return Err(Error::EndOfStream);
            }
            let item = self.current_run[self.items_pulled as usize];
            self.items_pulled += 1;
            if self.items_pulled == self.current_run.len() as u64 {
                // Last item handed out; release the buffer.
                self.current_run = Vec::new();
                self.items_pulled = 0;
            }
            return Ok(item);
        }
        let item = self.merger.pull()?;
        if !self.merger.can_pull() {
            self.merger.release();
        }
        return Ok(item);
    }

    fn check_parameters_settable(&self) -> Result<()> {
        match self.state {
            SorterState::Fresh | SorterState::Ready => Ok(()),
            _ => Err(Error::State("parameters can only be set before run formation")),
        }
    }

    fn sort_current_run(&mut self) {
        let cmp = self.cmp.clone();
        self.current_run.par_sort_unstable_by(|a, b| cmp(a, b));
    }

    // Postcondition: the run buffer is empty.
    fn spill_current_run(&mut self) -> Result<()> {
        if self.finished_runs < 10 {
            log::debug!("write {} items to run {}", self.current_run.len(), self.finished_runs);
        } else if self.finished_runs == 10 {
            log::debug!("...");
        }
        let mut out = self.open_run_file_write(0, self.finished_runs)?;
        out.write_array(&self.current_run)?;
        out.close()?;
        self.current_run.clear();
        self.finished_runs += 1;
        Ok(())
    }

    /// Merges all runs level by level while more than `fanout` remain, then
    /// sets up the final merge.
    fn prepare_pull(&mut self) -> Result<()> {
        let fanout = self.params.fanout as u64;
        let mut level = 0u64;
        let mut run_count = self.finished_runs;
        while run_count > fanout {
            log::debug!("merge {} runs in merge level {}", run_count, level);
            let mut new_run_count = 0u64;
            let mut first = 0u64;
            while first < run_count {
                let n = (run_count - first).min(fanout);
                if new_run_count < 10 {
                    log::debug!("merge {} runs starting from #{}", n, first);
                } else if new_run_count == 10 {
                    log::debug!("...");
                }
                self.merge_runs(level, first, n)?;
                new_run_count += 1;
                first += fanout;
            }
            self.merge_passes += 1;
            level += 1;
            run_count = new_run_count;
        }
        log::debug!("final merge level {} has {} runs", level, run_count);
        self.initialize_final_merger(level, run_count)?;
        self.merge_passes += 1;
        Ok(())
    }

    /// Merges runs `first..first + count` of `level` into one run of
    /// `level + 1`, returning the new run's number.
    fn merge_runs(&mut self, level: u64, first: u64, count: u64) -> Result<u64> {
        self.initialize_merger(level, first, count)?;
        let next_run_number = first / self.params.fanout as u64;
        let mut out = self.open_run_file_write(level + 1, next_run_number)?;
        while self.merger.can_pull() {
            out.write_item(self.merger.pull()?)?;
        }
        self.merger.release();
        out.close()?;
        return Ok(next_run_number);
    }

    /// Readies the merger over runs `first..first + count` of `level`.
    fn initialize_merger(&mut self, level: u64, first: u64, count: u64) -> Result<()> {
        let mut inputs = Vec::with_capacity(count as usize);
        for i in 0..count {
            inputs.push(self.open_run_file_read(level, first + i)?);
        }
        let run_length = Self::run_length_at(self.params.run_length, self.params.fanout, level);
        self.merger.reset(inputs, run_length)
    }

    /// Readies the merger for phase 4 over the `run_count` surviving runs.
    ///
    /// When more runs survive than the final fanout allows, the trailing runs
    /// are first merged into a single extra-large run one level up, and the
    /// final merge covers `final_fanout - 1` short runs plus that long one.
    fn initialize_final_merger(&mut self, level: u64, run_count: u64) -> Result<()> {
        let final_fanout = self.params.final_fanout as u64;
        if run_count <= final_fanout {
            log::debug!("run count {} fits the final fanout {}", run_count, final_fanout);
            return self.initialize_merger(level, 0, run_count);
        }

        log::debug!("run count {} exceeds the final fanout {}", run_count, final_fanout);
        let first = final_fanout - 1;
        let trailing = run_count - first;
        log::debug!("merge {} trailing runs starting from #{}", trailing, first);
        let long_run = self.merge_runs(level, first, trailing)?;
        self.merge_passes += 1;

        let mut inputs = Vec::with_capacity(final_fanout as usize);
        for i in 0..first {
            inputs.push(self.open_run_file_read(level, i)?);
        }
        inputs.push(self.open_run_file_read(level + 1, long_run)?);
        let run_length = Self::run_length_at(self.params.run_length, self.params.fanout, level + 1);
        self.merger.reset(inputs, run_length)
    }

    /// Items in a single run of the given merge level.
    fn run_length_at(initial: u64, fanout: usize, level: u64) -> u64 {
        let mut length = initial;
        for _ in 0..level {
            length = length.saturating_mul(fanout as u64);
        }
        return length;
    }

    /// Index in the run-file bank of the given run. Level parity selects the
    /// half of the bank, so consecutive levels never share files.
    fn run_file_index(&self, level: u64, run_number: u64) -> usize {
        let fanout = self.params.fanout as u64;
        ((level % 2) * fanout + run_number % fanout) as usize
    }

    /// Opens a run file for appending the given run.
    fn open_run_file_write(&mut self, level: u64, run_number: u64) -> Result<Stream<T>> {
        let idx = self.run_file_index(level, run_number);
        if run_number < self.params.fanout as u64 {
            // First wrap-around of this level: whatever the file held two
            // levels ago is dead.
            self.run_files[idx].free();
        }
        let mut stream = Stream::open(self.run_files[idx].path(), OpenMode::ReadWrite, self.opts.block_bytes)?;
        let end = stream.stream_len();
        stream.seek(end)?;
        return Ok(stream);
    }

    /// Opens a run file for reading the given run, positioned at its head.
    fn open_run_file_read(&mut self, level: u64, run_number: u64) -> Result<Stream<T>> {
        let idx = self.run_file_index(level, run_number);
        let mut stream = Stream::open(self.run_files[idx].path(), OpenMode::Read, self.opts.block_bytes)?;
        let offset = Self::run_length_at(self.params.run_length, self.params.fanout, level)
            .saturating_mul(run_number / self.params.fanout as u64);
        stream.seek(offset)?;
        return Ok(stream);
    }

    fn calculate_fanout(available_memory: usize, block_bytes: usize) -> usize {
        let mut lo = 2usize;
        let mut hi = 251usize;
        // Binary search for the largest fanout the budget can hold.
        while lo < hi - 1 {
            let mid = lo + (hi - lo) / 2;
            if Self::fanout_memory_usage(mid, block_bytes) < available_memory {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        return lo;
    }

    /// Memory needed to merge with the given fanout: the merger with its
    /// `fanout` open streams, the output stream, and the bank handles.
    fn fanout_memory_usage(fanout: usize, block_bytes: usize) -> usize {
        Merger::<T, C>::memory_usage(fanout, block_bytes)
            + Stream::<T>::memory_usage(block_bytes)
            + 2 * mem::size_of::<TempFile>()
    }
}

#[cfg(test)]
mod test {
    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::{MergeSorter, SortOptions};
    use crate::error::Error;

    #[fixture]
    fn dir() -> tempfile::TempDir {
        init_logs();
        tempfile::tempdir().unwrap()
    }

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn small_block_options(dir: &tempfile::TempDir) -> SortOptions {
        SortOptions {
            block_bytes: 4096,
            temp_dir: Some(dir.path().to_path_buf()),
        }
    }

    fn drain(sorter: &mut MergeSorter<u64, impl Fn(&u64, &u64) -> std::cmp::Ordering + Clone + Send + Sync>) -> Vec<u64> {
        let mut out = Vec::new();
        while sorter.can_pull() {
            out.push(sorter.pull().unwrap());
        }
        return out;
    }

    #[rstest]
    fn test_sorts_permutation(dir: tempfile::TempDir) {
        let mut input = Vec::from_iter(0u64..100_000);
        input.shuffle(&mut rand::thread_rng());

        let mut sorter = MergeSorter::with_options(|a: &u64, b: &u64| a.cmp(b), small_block_options(&dir));
        // A budget small enough to spill several runs to disk.
        sorter.set_available_memory(200_000).unwrap();
        assert!(sorter.parameters().unwrap().internal_report_threshold < 100_000);

        sorter.begin().unwrap();
        for &x in &input {
            sorter.push(x).unwrap();
        }
        sorter.end().unwrap();
        sorter.calc().unwrap();

        assert_eq!(drain(&mut sorter), Vec::from_iter(0u64..100_000));
        assert!(matches!(sorter.pull(), Err(Error::EndOfStream)));
    }

    #[rstest]
    fn test_multi_level_spill(dir: tempfile::TempDir) {
        let mut rng = rand::thread_rng();
        let input: Vec<u64> = (0..50_000).map(|_| rng.gen_range(0..1000)).collect();

        let mut sorter = MergeSorter::with_options(|a: &u64, b: &u64| a.cmp(b), small_block_options(&dir));
        sorter.set_parameters(1000, 4).unwrap();

        sorter.begin().unwrap();
        for &x in &input {
            sorter.push(x).unwrap();
        }
        sorter.end().unwrap();
        sorter.calc().unwrap();

        let mut expected = input;
        expected.sort_unstable();
        assert_eq!(drain(&mut sorter), expected);
        assert!(sorter.merge_pass_count() >= 3, "passes: {}", sorter.merge_pass_count());
    }

    #[rstest]
    fn test_final_fanout_overflow_path(dir: tempfile::TempDir) {
        // 6 runs with fanout 8 would fit a single merge; force the final
        // fanout down so the trailing runs collapse into one long run first.
        let mut input = Vec::from_iter(0u64..6000);
        input.shuffle(&mut rand::thread_rng());

        let mut sorter = MergeSorter::with_options(|a: &u64, b: &u64| a.cmp(b), small_block_options(&dir));
        sorter.set_parameters(1000, 8).unwrap();
        sorter.params.final_fanout = 3;
        sorter.params.internal_report_threshold = 1000;

        sorter.begin().unwrap();
        for &x in &input {
            sorter.push(x).unwrap();
        }
        sorter.end().unwrap();
        sorter.calc().unwrap();

        assert_eq!(drain(&mut sorter), Vec::from_iter(0u64..6000));
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_comparator_direction(dir: tempfile::TempDir, #[case] reversed: bool) {
        let mut input = Vec::from_iter(0u64..5000);
        input.shuffle(&mut rand::thread_rng());

        let compare = move |a: &u64, b: &u64| if reversed { b.cmp(a) } else { a.cmp(b) };
        let mut sorter = MergeSorter::with_options(compare, small_block_options(&dir));
        sorter.set_parameters(512, 4).unwrap();

        sorter.begin().unwrap();
        for &x in &input {
            sorter.push(x).unwrap();
        }
        sorter.end().unwrap();
        sorter.calc().unwrap();

        let expected = if reversed {
            Vec::from_iter((0u64..5000).rev())
        } else {
            Vec::from_iter(0u64..5000)
        };
        assert_eq!(drain(&mut sorter), expected);
    }

    #[rstest]
    fn test_internal_report_mode(dir: tempfile::TempDir) {
        let mut input = Vec::from_iter(0u64..500);
        input.shuffle(&mut rand::thread_rng());

        let mut sorter = MergeSorter::with_options(|a: &u64, b: &u64| a.cmp(b), small_block_options(&dir));
        sorter.set_parameters(1000, 4).unwrap();

        sorter.begin().unwrap();
        for &x in &input {
            sorter.push(x).unwrap();
        }
        sorter.end().unwrap();
        sorter.calc().unwrap();

        assert_eq!(sorter.merge_pass_count(), 0);
        assert_eq!(drain(&mut sorter), Vec::from_iter(0u64..500));
        assert!(!sorter.can_pull());
    }

    #[rstest]
    fn test_empty_input(dir: tempfile::TempDir) {
        let mut sorter: MergeSorter<u64, _> =
            MergeSorter::with_options(|a: &u64, b: &u64| a.cmp(b), small_block_options(&dir));
        sorter.set_parameters(16, 2).unwrap();
        sorter.begin().unwrap();
        sorter.end().unwrap();
        sorter.calc().unwrap();
        assert!(!sorter.can_pull());
        assert!(matches!(sorter.pull(), Err(Error::EndOfStream)));
    }

    #[test]
    fn test_natural_order() {
        let mut sorter = MergeSorter::<u64, _>::natural();
        sorter.set_parameters(64, 2).unwrap();
        sorter.begin().unwrap();
        for x in [5u64, 3, 9, 1] {
            sorter.push(x).unwrap();
        }
        sorter.end().unwrap();
        sorter.calc().unwrap();
        let mut out = Vec::new();
        while sorter.can_pull() {
            out.push(sorter.pull().unwrap());
        }
        assert_eq!(out, vec![1, 3, 5, 9]);
    }

    #[rstest]
    fn test_state_misuse_is_reported(dir: tempfile::TempDir) {
        let mut sorter: MergeSorter<u64, _> =
            MergeSorter::with_options(|a: &u64, b: &u64| a.cmp(b), small_block_options(&dir));

        assert!(matches!(sorter.begin(), Err(Error::State(_))));
        sorter.set_parameters(16, 2).unwrap();
        assert!(matches!(sorter.push(1), Err(Error::State(_))));
        assert!(matches!(sorter.calc(), Err(Error::State(_))));

        sorter.begin().unwrap();
        sorter.push(1).unwrap();
        assert!(matches!(sorter.set_parameters(16, 2), Err(Error::State(_))));
        assert!(matches!(sorter.pull(), Err(Error::State(_))));
        assert!(matches!(sorter.calc(), Err(Error::State(_))));

        sorter.end().unwrap();
        assert!(matches!(sorter.push(2), Err(Error::State(_))));
        assert!(matches!(sorter.end(), Err(Error::State(_))));

        sorter.calc().unwrap();
        assert!(matches!(sorter.calc(), Err(Error::State(_))));
    }

    #[test]
    fn test_capacity_errors() {
        let mut sorter: MergeSorter<u64, _> = MergeSorter::new(|a: &u64, b: &u64| a.cmp(b));
        assert!(matches!(sorter.set_parameters(0, 4), Err(Error::Capacity(_))));
        assert!(matches!(sorter.set_parameters(16, 1), Err(Error::Capacity(_))));
        assert!(matches!(sorter.set_available_memory(64), Err(Error::Capacity(_))));
    }
}
