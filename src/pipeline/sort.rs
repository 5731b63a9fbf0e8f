//! The merge sorter as a buffering pipeline segment.
//!
//! `src | sort_by(..) | sink` splits the pipeline at the sorter: the feeding
//! phase pushes into run formation, the hidden merge step runs at the phase
//! boundary, and the draining phase pulls sorted items into the downstream
//! chain. The sorter's memory budgets come from the pipeline plan: its share
//! of the feeding phase, the whole budget for the merge step, and its share
//! of the draining phase.

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::ops::BitOr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::sort::{MergeSorter, SortOptions};
use crate::stream::Item;

use super::factory::{FilterChain, FilterFactory, FilterPipe, SinkFactory, SinkPipe, SourceFactory, SourcePipe};
use super::node::{BoxPushNode, Driver, NodeMeta, PushNode, PRIORITY_USER};
use super::{PhaseSpec, Pipeline};

type SharedSorter<T, C> = Arc<Mutex<MergeSorter<T, C>>>;

/// A sorting segment with default options. Composes with `|` like a filter,
/// but starts a new phase downstream of itself.
pub fn sort_by<T, C>(cmp: C) -> SortPipe<T, C>
where
    T: Item,
    C: Fn(&T, &T) -> Ordering + Clone + Send + Sync,
{
    sort_by_with(cmp, SortOptions::default())
}

/// A sorting segment with explicit [`SortOptions`].
pub fn sort_by_with<T, C>(cmp: C, opts: SortOptions) -> SortPipe<T, C>
where
    T: Item,
    C: Fn(&T, &T) -> Ordering + Clone + Send + Sync,
{
    SortPipe {
        sorter: MergeSorter::with_options(cmp, opts),
        meta: NodeMeta::named("sort", PRIORITY_USER),
    }
}

/// An unattached sorting segment.
pub struct SortPipe<T: Item, C> {
    sorter: MergeSorter<T, C>,
    meta: NodeMeta,
}

impl<T: Item, C> SortPipe<T, C> {
    /// Names the segment for progress reporting.
    pub fn name(mut self, name: &str, priority: u32) -> Self {
        self.meta.name = name.to_owned();
        self.meta.priority = priority;
        self
    }

    /// Sets the segment's share of its phases' memory budgets.
    pub fn memory(mut self, fraction: f64) -> Self {
        self.meta.memory_fraction = fraction;
        self
    }
}

/// The identity filter used as the empty tail behind a sorter. Declares no
/// node of its own.
pub struct PassFilter<T> {
    meta: NodeMeta,
    marker: PhantomData<fn(T)>,
}

impl<T> PassFilter<T> {
    fn new() -> Self {
        PassFilter {
            meta: NodeMeta::default(),
            marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> FilterFactory for PassFilter<T> {
    type In = T;
    type Out = T;

    fn collect_meta(&self, _out: &mut Vec<NodeMeta>) {}

    fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }

    fn build(self, dest: BoxPushNode<T>) -> Result<BoxPushNode<T>> {
        Ok(dest)
    }
}

/// A pipeline under assembly whose upstream part ends in a sorter: the phases
/// before the sorter are closed, the chain behind it is still growing.
pub struct SortedSource<T: Item, C, F> {
    phases: Vec<PhaseSpec>,
    sorter: SharedSorter<T, C>,
    sorter_meta: NodeMeta,
    tail: F,
}

/// The push side of a sorter inside a feeding phase.
struct SorterSink<T: Item, C> {
    sorter: SharedSorter<T, C>,
}

impl<T, C> PushNode<T> for SorterSink<T, C>
where
    T: Item,
    C: Fn(&T, &T) -> Ordering + Clone + Send + Sync + 'static,
{
    fn begin(&mut self) -> Result<()> {
        self.sorter.lock().begin()
    }

    fn push(&mut self, item: T) -> Result<()> {
        self.sorter.lock().push(item)
    }

    fn end(&mut self) -> Result<()> {
        self.sorter.lock().end()
    }
}

/// The pull side of a sorter driving a draining phase. Runs the merge step in
/// its `begin`.
struct SorterDrain<T: Item, C> {
    sorter: SharedSorter<T, C>,
    dest: BoxPushNode<T>,
}

impl<T, C> Driver for SorterDrain<T, C>
where
    T: Item,
    C: Fn(&T, &T) -> Ordering + Clone + Send + Sync + 'static,
{
    fn begin(&mut self) -> Result<()> {
        self.sorter.lock().calc()?;
        self.dest.begin()
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let next = {
                let mut sorter = self.sorter.lock();
                if !sorter.can_pull() {
                    break;
                }
                sorter.pull()?
            };
            self.dest.push(next)?;
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.dest.end()
    }
}

/// Closes the phase feeding `sorter` over the nodes described by `metas`,
/// where the sorter's own meta sits at `sorter_slot` and the phase driver is
/// produced by `feed`.
fn feed_phase<T, C>(
    metas: Vec<NodeMeta>,
    sorter_slot: usize,
    sorter: SharedSorter<T, C>,
    feed: impl FnOnce(BoxPushNode<T>) -> Result<Box<dyn Driver>> + 'static,
) -> PhaseSpec
where
    T: Item,
    C: Fn(&T, &T) -> Ordering + Clone + Send + Sync + 'static,
{
    PhaseSpec {
        metas,
        build: Box::new(move |plan, idx| {
            let m2 = plan.assignment(idx, sorter_slot);
            let m3 = plan.total();
            // The sorter's meta leads the next phase's metas.
            let m4 = plan.assignment(idx + 1, 0);
            sorter.lock().set_available_memory_per_phase(m2, m3, m4)?;
            feed(Box::new(SorterSink { sorter }))
        }),
    }
}

impl<S, T, C> BitOr<SortPipe<T, C>> for SourcePipe<S>
where
    S: SourceFactory<Item = T> + 'static,
    T: Item,
    C: Fn(&T, &T) -> Ordering + Clone + Send + Sync + 'static,
{
    type Output = SortedSource<T, C, PassFilter<T>>;

    fn bitor(self, rhs: SortPipe<T, C>) -> Self::Output {
        let sorter = Arc::new(Mutex::new(rhs.sorter));
        let mut metas = Vec::new();
        self.0.collect_meta(&mut metas);
        metas.push(rhs.meta.clone());
        let sorter_slot = metas.len() - 1;

        let source = self.0;
        let phase = feed_phase(metas, sorter_slot, sorter.clone(), move |sink| source.build(sink));

        SortedSource {
            phases: vec![phase],
            sorter,
            sorter_meta: rhs.meta,
            tail: PassFilter::new(),
        }
    }
}

impl<T, C, F, G> BitOr<FilterPipe<G>> for SortedSource<T, C, F>
where
    T: Item,
    F: FilterFactory<In = T>,
    G: FilterFactory<In = F::Out>,
{
    type Output = SortedSource<T, C, FilterChain<F, G>>;

    fn bitor(self, rhs: FilterPipe<G>) -> Self::Output {
        SortedSource {
            phases: self.phases,
            sorter: self.sorter,
            sorter_meta: self.sorter_meta,
            tail: FilterChain::new(self.tail, rhs.0),
        }
    }
}

impl<T, C, F, K> BitOr<SinkPipe<K>> for SortedSource<T, C, F>
where
    T: Item,
    C: Fn(&T, &T) -> Ordering + Clone + Send + Sync + 'static,
    F: FilterFactory<In = T> + 'static,
    K: SinkFactory<In = F::Out> + 'static,
{
    type Output = Pipeline;

    fn bitor(mut self, rhs: SinkPipe<K>) -> Pipeline {
        let mut metas = vec![self.sorter_meta];
        self.tail.collect_meta(&mut metas);
        rhs.0.collect_meta(&mut metas);

        let sorter = self.sorter;
        let tail = self.tail;
        let sink = rhs.0;
        self.phases.push(PhaseSpec {
            metas,
            build: Box::new(move |_plan, _idx| {
                let dest = tail.build(sink.build()?)?;
                Ok(Box::new(SorterDrain { sorter, dest }) as Box<dyn Driver>)
            }),
        });
        Pipeline::from_phases(self.phases)
    }
}

impl<T, C, F, T2, C2> BitOr<SortPipe<T2, C2>> for SortedSource<T, C, F>
where
    T: Item,
    C: Fn(&T, &T) -> Ordering + Clone + Send + Sync + 'static,
    F: FilterFactory<In = T, Out = T2> + 'static,
    T2: Item,
    C2: Fn(&T2, &T2) -> Ordering + Clone + Send + Sync + 'static,
{
    type Output = SortedSource<T2, C2, PassFilter<T2>>;

    fn bitor(mut self, rhs: SortPipe<T2, C2>) -> Self::Output {
        let second = Arc::new(Mutex::new(rhs.sorter));
        let mut metas = vec![self.sorter_meta];
        self.tail.collect_meta(&mut metas);
        metas.push(rhs.meta.clone());
        let sorter_slot = metas.len() - 1;

        let first = self.sorter;
        let tail = self.tail;
        let phase = feed_phase(metas, sorter_slot, second.clone(), move |sink| {
            let dest = tail.build(sink)?;
            Ok(Box::new(SorterDrain { sorter: first, dest }) as Box<dyn Driver>)
        });
        self.phases.push(phase);

        SortedSource {
            phases: self.phases,
            sorter: second,
            sorter_meta: rhs.meta,
            tail: PassFilter::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rand::seq::SliceRandom;

    use super::sort_by_with;
    use crate::pipeline::ops::{map, push_source, vec_sink};
    use crate::sort::SortOptions;

    fn options(dir: &tempfile::TempDir) -> SortOptions {
        SortOptions {
            block_bytes: 4096,
            temp_dir: Some(dir.path().to_path_buf()),
        }
    }

    #[test]
    fn test_sort_segment_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = Vec::from_iter(0u64..30_000);
        input.shuffle(&mut rand::thread_rng());

        let out = Arc::new(Mutex::new(Vec::new()));
        let pipeline = push_source(input.into_iter())
            | sort_by_with(|a: &u64, b: &u64| a.cmp(b), options(&dir))
            | vec_sink(out.clone());
        pipeline.run_with_memory(200_000).unwrap();

        assert_eq!(*out.lock(), Vec::from_iter(0u64..30_000));
    }

    #[test]
    fn test_two_sort_segments_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = Vec::from_iter(0u64..5_000);
        input.shuffle(&mut rand::thread_rng());

        let out = Arc::new(Mutex::new(Vec::new()));
        let pipeline = push_source(input.into_iter())
            | sort_by_with(|a: &u64, b: &u64| a.cmp(b), options(&dir))
            | map(|x: u64| x / 10)
            | sort_by_with(|a: &u64, b: &u64| b.cmp(a), options(&dir))
            | vec_sink(out.clone());
        pipeline.run_with_memory(200_000).unwrap();

        let mut expected = Vec::from_iter((0u64..5_000).map(|x| x / 10));
        expected.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(*out.lock(), expected);
    }
}
