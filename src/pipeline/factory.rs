//! Composable pipe factories.
//!
//! A pipeline is assembled from factory values combined with `|`. A factory
//! does not hold a node; it holds the recipe for one, and the declared
//! [`NodeMeta`]. Composition follows the destination: building a chain hands
//! the downstream node to the upstream factory, so
//! `(f1 | f2).build(dest) == f1.build(f2.build(dest))`.

use std::ops::BitOr;

use crate::error::Result;

use super::node::{BoxPullNode, BoxPushNode, Driver, NodeMeta};
use super::{phase_from_push, phase_from_pull, Pipeline};

/// Recipe for a push source: the node that produces the phase's items.
pub trait SourceFactory: Sized {
    type Item;

    /// Appends the metas of every node this factory will build, in
    /// topological order.
    fn collect_meta(&self, out: &mut Vec<NodeMeta>);

    /// The meta of the most recently attached node, for builder adjustments.
    fn meta_mut(&mut self) -> &mut NodeMeta;

    fn build(self, dest: BoxPushNode<Self::Item>) -> Result<Box<dyn Driver>>;
}

/// Recipe for a push filter: consumes `In`, produces `Out`.
pub trait FilterFactory: Sized {
    type In;
    type Out;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>);

    fn meta_mut(&mut self) -> &mut NodeMeta;

    fn build(self, dest: BoxPushNode<Self::Out>) -> Result<BoxPushNode<Self::In>>;
}

/// Recipe for a push sink: the chain's terminal node.
pub trait SinkFactory: Sized {
    type In;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>);

    fn meta_mut(&mut self) -> &mut NodeMeta;

    fn build(self) -> Result<BoxPushNode<Self::In>>;
}

/// Recipe for a pull source: the upstream end items are demanded from.
pub trait PullSourceFactory: Sized {
    type Item;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>);

    fn meta_mut(&mut self) -> &mut NodeMeta;

    fn build(self) -> Result<BoxPullNode<Self::Item>>;
}

/// Recipe for a pull filter: demands `In` upstream, yields `Out`.
pub trait PullFilterFactory: Sized {
    type In;
    type Out;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>);

    fn meta_mut(&mut self) -> &mut NodeMeta;

    fn build(self, source: BoxPullNode<Self::In>) -> Result<BoxPullNode<Self::Out>>;
}

/// Recipe for a pull sink: drives the chain by pulling its upstream dry.
pub trait PullSinkFactory: Sized {
    type In;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>);

    fn meta_mut(&mut self) -> &mut NodeMeta;

    fn build(self, source: BoxPullNode<Self::In>) -> Result<Box<dyn Driver>>;
}

macro_rules! builder_methods {
    () => {
        /// Names the wrapped node for progress reporting.
        pub fn name(mut self, name: &str, priority: u32) -> Self {
            let meta = self.0.meta_mut();
            meta.name = name.to_owned();
            meta.priority = priority;
            self
        }

        /// Sets the node's share of the phase memory budget.
        pub fn memory(mut self, fraction: f64) -> Self {
            self.0.meta_mut().memory_fraction = fraction;
            self
        }

        /// Declares the memory the node cannot run below.
        pub fn minimum(mut self, bytes: usize) -> Self {
            self.0.meta_mut().minimum_memory = bytes;
            self
        }

        /// Declares a dependency on another node, by name.
        pub fn depends_on(mut self, name: &str) -> Self {
            self.0.meta_mut().dependencies.push(name.to_owned());
            self
        }
    };
}

/// A source end of a push pipeline under assembly.
pub struct SourcePipe<F>(pub(crate) F);

/// A filter in a push pipeline under assembly.
pub struct FilterPipe<F>(pub(crate) F);

/// A sink end of a push pipeline under assembly.
pub struct SinkPipe<F>(pub(crate) F);

/// A source end of a pull pipeline under assembly.
pub struct PullSourcePipe<F>(pub(crate) F);

/// A filter in a pull pipeline under assembly.
pub struct PullFilterPipe<F>(pub(crate) F);

/// A sink end of a pull pipeline under assembly.
pub struct PullSinkPipe<F>(pub(crate) F);

impl<F: SourceFactory> SourcePipe<F> {
    builder_methods!();
}

impl<F: FilterFactory> FilterPipe<F> {
    builder_methods!();
}

impl<F: SinkFactory> SinkPipe<F> {
    builder_methods!();
}

impl<F: PullSourceFactory> PullSourcePipe<F> {
    builder_methods!();
}

impl<F: PullFilterFactory> PullFilterPipe<F> {
    builder_methods!();
}

impl<F: PullSinkFactory> PullSinkPipe<F> {
    builder_methods!();
}

/// A source with a filter attached.
pub struct SourceChain<S, F> {
    source: S,
    filter: F,
}

impl<S, F> SourceFactory for SourceChain<S, F>
where
    S: SourceFactory,
    F: FilterFactory<In = S::Item>,
{
    type Item = F::Out;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        self.source.collect_meta(out);
        self.filter.collect_meta(out);
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        self.filter.meta_mut()
    }

    fn build(self, dest: BoxPushNode<Self::Item>) -> Result<Box<dyn Driver>> {
        self.source.build(self.filter.build(dest)?)
    }
}

/// Two filters attached back to back.
pub struct FilterChain<F1, F2> {
    first: F1,
    second: F2,
}

impl<F1, F2> FilterChain<F1, F2> {
    pub(crate) fn new(first: F1, second: F2) -> Self {
        FilterChain { first, second }
    }
}

impl<F1, F2> FilterFactory for FilterChain<F1, F2>
where
    F1: FilterFactory,
    F2: FilterFactory<In = F1::Out>,
{
    type In = F1::In;
    type Out = F2::Out;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        self.first.collect_meta(out);
        self.second.collect_meta(out);
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        self.second.meta_mut()
    }

    fn build(self, dest: BoxPushNode<Self::Out>) -> Result<BoxPushNode<Self::In>> {
        self.first.build(self.second.build(dest)?)
    }
}

/// A sink with a filter in front of it.
pub struct SinkChain<F, K> {
    filter: F,
    sink: K,
}

impl<F, K> SinkFactory for SinkChain<F, K>
where
    F: FilterFactory,
    K: SinkFactory<In = F::Out>,
{
    type In = F::In;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        self.filter.collect_meta(out);
        self.sink.collect_meta(out);
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        self.sink.meta_mut()
    }

    fn build(self) -> Result<BoxPushNode<Self::In>> {
        self.filter.build(self.sink.build()?)
    }
}

/// A pull source with a pull filter attached.
pub struct PullSourceChain<S, F> {
    source: S,
    filter: F,
}

impl<S, F> PullSourceFactory for PullSourceChain<S, F>
where
    S: PullSourceFactory,
    F: PullFilterFactory<In = S::Item>,
{
    type Item = F::Out;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        self.source.collect_meta(out);
        self.filter.collect_meta(out);
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        self.filter.meta_mut()
    }

    fn build(self) -> Result<BoxPullNode<Self::Item>> {
        self.filter.build(self.source.build()?)
    }
}

/// Two pull filters attached back to back.
pub struct PullFilterChain<F1, F2> {
    first: F1,
    second: F2,
}

impl<F1, F2> PullFilterFactory for PullFilterChain<F1, F2>
where
    F1: PullFilterFactory,
    F2: PullFilterFactory<In = F1::Out>,
{
    type In = F1::In;
    type Out = F2::Out;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        self.first.collect_meta(out);
        self.second.collect_meta(out);
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        self.second.meta_mut()
    }

    fn build(self, source: BoxPullNode<Self::In>) -> Result<BoxPullNode<Self::Out>> {
        self.second.build(self.first.build(source)?)
    }
}

/// A pull sink with a pull filter in front of it.
pub struct PullSinkChain<F, K> {
    filter: F,
    sink: K,
}

impl<F, K> PullSinkFactory for PullSinkChain<F, K>
where
    F: PullFilterFactory,
    K: PullSinkFactory<In = F::Out>,
{
    type In = F::In;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        self.filter.collect_meta(out);
        self.sink.collect_meta(out);
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        self.sink.meta_mut()
    }

    fn build(self, source: BoxPullNode<Self::In>) -> Result<Box<dyn Driver>> {
        let filtered = self.filter.build(source)?;
        self.sink.build(filtered)
    }
}

impl<S, F> BitOr<FilterPipe<F>> for SourcePipe<S>
where
    S: SourceFactory,
    F: FilterFactory<In = S::Item>,
{
    type Output = SourcePipe<SourceChain<S, F>>;

    fn bitor(self, rhs: FilterPipe<F>) -> Self::Output {
        SourcePipe(SourceChain {
            source: self.0,
            filter: rhs.0,
        })
    }
}

impl<S, K> BitOr<SinkPipe<K>> for SourcePipe<S>
where
    S: SourceFactory + 'static,
    K: SinkFactory<In = S::Item> + 'static,
{
    type Output = Pipeline;

    fn bitor(self, rhs: SinkPipe<K>) -> Pipeline {
        Pipeline::from_phases(vec![phase_from_push(self.0, rhs.0)])
    }
}

impl<F1, F2> BitOr<FilterPipe<F2>> for FilterPipe<F1>
where
    F1: FilterFactory,
    F2: FilterFactory<In = F1::Out>,
{
    type Output = FilterPipe<FilterChain<F1, F2>>;

    fn bitor(self, rhs: FilterPipe<F2>) -> Self::Output {
        FilterPipe(FilterChain {
            first: self.0,
            second: rhs.0,
        })
    }
}

impl<F, K> BitOr<SinkPipe<K>> for FilterPipe<F>
where
    F: FilterFactory,
    K: SinkFactory<In = F::Out>,
{
    type Output = SinkPipe<SinkChain<F, K>>;

    fn bitor(self, rhs: SinkPipe<K>) -> Self::Output {
        SinkPipe(SinkChain {
            filter: self.0,
            sink: rhs.0,
        })
    }
}

impl<S, F> BitOr<PullFilterPipe<F>> for PullSourcePipe<S>
where
    S: PullSourceFactory,
    F: PullFilterFactory<In = S::Item>,
{
    type Output = PullSourcePipe<PullSourceChain<S, F>>;

    fn bitor(self, rhs: PullFilterPipe<F>) -> Self::Output {
        PullSourcePipe(PullSourceChain {
            source: self.0,
            filter: rhs.0,
        })
    }
}

impl<S, K> BitOr<PullSinkPipe<K>> for PullSourcePipe<S>
where
    S: PullSourceFactory + 'static,
    K: PullSinkFactory<In = S::Item> + 'static,
{
    type Output = Pipeline;

    fn bitor(self, rhs: PullSinkPipe<K>) -> Pipeline {
        Pipeline::from_phases(vec![phase_from_pull(self.0, rhs.0)])
    }
}

impl<F1, F2> BitOr<PullFilterPipe<F2>> for PullFilterPipe<F1>
where
    F1: PullFilterFactory,
    F2: PullFilterFactory<In = F1::Out>,
{
    type Output = PullFilterPipe<PullFilterChain<F1, F2>>;

    fn bitor(self, rhs: PullFilterPipe<F2>) -> Self::Output {
        PullFilterPipe(PullFilterChain {
            first: self.0,
            second: rhs.0,
        })
    }
}

impl<F, K> BitOr<PullSinkPipe<K>> for PullFilterPipe<F>
where
    F: PullFilterFactory,
    K: PullSinkFactory<In = F::Out>,
{
    type Output = PullSinkPipe<PullSinkChain<F, K>>;

    fn bitor(self, rhs: PullSinkPipe<K>) -> Self::Output {
        PullSinkPipe(PullSinkChain {
            filter: self.0,
            sink: rhs.0,
        })
    }
}
