//! Elementary pipeline nodes built from iterators and closures.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::factory::{
    FilterFactory, FilterPipe, PullFilterFactory, PullFilterPipe, PullSinkFactory, PullSinkPipe,
    PullSourceFactory, PullSourcePipe, SinkFactory, SinkPipe, SourceFactory, SourcePipe,
};
use super::node::{BoxPullNode, BoxPushNode, Driver, NodeMeta, PullNode, PushNode};

/// A push source feeding the items of an iterator downstream.
pub fn push_source<I>(iter: I) -> SourcePipe<IterSource<I>>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    SourcePipe(IterSource {
        iter,
        meta: NodeMeta::default(),
    })
}

pub struct IterSource<I> {
    iter: I,
    meta: NodeMeta,
}

impl<I> SourceFactory for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Item = I::Item;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        out.push(self.meta.clone());
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }

    fn build(self, dest: BoxPushNode<Self::Item>) -> Result<Box<dyn Driver>> {
        Ok(Box::new(IterDriver { iter: self.iter, dest }))
    }
}

struct IterDriver<I: Iterator> {
    iter: I,
    dest: BoxPushNode<I::Item>,
}

impl<I: Iterator> Driver for IterDriver<I> {
    fn begin(&mut self) -> Result<()> {
        self.dest.begin()
    }

    fn run(&mut self) -> Result<()> {
        for item in self.iter.by_ref() {
            self.dest.push(item)?;
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.dest.end()
    }
}

/// A filter applying a function to every item.
pub fn map<A, B, F>(f: F) -> FilterPipe<MapFilter<A, B, F>>
where
    F: FnMut(A) -> B + Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    FilterPipe(MapFilter {
        f,
        meta: NodeMeta::default(),
        marker: PhantomData,
    })
}

/// The do-nothing filter; useful as the unit of composition and as the
/// simplest fragment to parallelize.
pub fn identity<T: Send + 'static>() -> FilterPipe<MapFilter<T, T, fn(T) -> T>> {
    map(std::convert::identity as fn(T) -> T)
}

pub struct MapFilter<A, B, F> {
    f: F,
    meta: NodeMeta,
    marker: PhantomData<fn(A) -> B>,
}

// Cloneable whenever the function is, no matter the item types; required for
// fragments replicated across parallel workers.
impl<A, B, F: Clone> Clone for MapFilter<A, B, F> {
    fn clone(&self) -> Self {
        MapFilter {
            f: self.f.clone(),
            meta: self.meta.clone(),
            marker: PhantomData,
        }
    }
}

impl<A, B, F> FilterFactory for MapFilter<A, B, F>
where
    F: FnMut(A) -> B + Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    type In = A;
    type Out = B;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        out.push(self.meta.clone());
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }

    fn build(self, dest: BoxPushNode<B>) -> Result<BoxPushNode<A>> {
        Ok(Box::new(MapNode { f: self.f, dest }))
    }
}

struct MapNode<B, F> {
    f: F,
    dest: BoxPushNode<B>,
}

impl<A, B, F> PushNode<A> for MapNode<B, F>
where
    F: FnMut(A) -> B + Send,
    B: Send,
{
    fn begin(&mut self) -> Result<()> {
        self.dest.begin()
    }

    fn push(&mut self, item: A) -> Result<()> {
        self.dest.push((self.f)(item))
    }

    fn end(&mut self) -> Result<()> {
        self.dest.end()
    }
}

/// A sink handing every item to a closure.
pub fn sink_fn<T, F>(f: F) -> SinkPipe<FnSink<T, F>>
where
    F: FnMut(T) + Send + 'static,
    T: Send + 'static,
{
    SinkPipe(FnSink {
        f,
        meta: NodeMeta::default(),
        marker: PhantomData,
    })
}

pub struct FnSink<T, F> {
    f: F,
    meta: NodeMeta,
    marker: PhantomData<fn(T)>,
}

impl<T, F> SinkFactory for FnSink<T, F>
where
    F: FnMut(T) + Send + 'static,
    T: Send + 'static,
{
    type In = T;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        out.push(self.meta.clone());
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }

    fn build(self) -> Result<BoxPushNode<T>> {
        Ok(Box::new(FnSinkNode { f: self.f, marker: PhantomData }))
    }
}

struct FnSinkNode<T, F> {
    f: F,
    marker: PhantomData<fn(T)>,
}

impl<T, F> PushNode<T> for FnSinkNode<T, F>
where
    F: FnMut(T) + Send,
    T: Send,
{
    fn push(&mut self, item: T) -> Result<()> {
        (self.f)(item);
        Ok(())
    }
}

/// A sink collecting items into a shared vector.
pub fn vec_sink<T: Send + 'static>(out: Arc<Mutex<Vec<T>>>) -> SinkPipe<VecSink<T>> {
    SinkPipe(VecSink {
        out,
        meta: NodeMeta::default(),
    })
}

pub struct VecSink<T> {
    out: Arc<Mutex<Vec<T>>>,
    meta: NodeMeta,
}

impl<T: Send + 'static> SinkFactory for VecSink<T> {
    type In = T;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        out.push(self.meta.clone());
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }

    fn build(self) -> Result<BoxPushNode<T>> {
        Ok(Box::new(VecSinkNode { out: self.out }))
    }
}

struct VecSinkNode<T> {
    out: Arc<Mutex<Vec<T>>>,
}

impl<T: Send + 'static> PushNode<T> for VecSinkNode<T> {
    fn push(&mut self, item: T) -> Result<()> {
        self.out.lock().push(item);
        Ok(())
    }
}

/// A pull source yielding the items of an iterator on demand.
pub fn pull_source<I>(iter: I) -> PullSourcePipe<PullIterSource<I>>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    PullSourcePipe(PullIterSource {
        iter,
        meta: NodeMeta::default(),
    })
}

pub struct PullIterSource<I> {
    iter: I,
    meta: NodeMeta,
}

impl<I> PullSourceFactory for PullIterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Item = I::Item;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        out.push(self.meta.clone());
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }

    fn build(self) -> Result<BoxPullNode<Self::Item>> {
        Ok(Box::new(PullIterNode {
            iter: self.iter,
            peeked: None,
        }))
    }
}

struct PullIterNode<I: Iterator> {
    iter: I,
    peeked: Option<I::Item>,
}

impl<I> PullNode<I::Item> for PullIterNode<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn can_pull(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.iter.next();
        }
        self.peeked.is_some()
    }

    fn pull(&mut self) -> Result<I::Item> {
        match self.peeked.take().or_else(|| self.iter.next()) {
            Some(item) => Ok(item),
            None => Err(Error::EndOfStream),
        }
    }
}

/// A pull filter applying a function to every item demanded through it.
pub fn pull_map<A, B, F>(f: F) -> PullFilterPipe<PullMapFilter<A, B, F>>
where
    F: FnMut(A) -> B + Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    PullFilterPipe(PullMapFilter {
        f,
        meta: NodeMeta::default(),
        marker: PhantomData,
    })
}

pub struct PullMapFilter<A, B, F> {
    f: F,
    meta: NodeMeta,
    marker: PhantomData<fn(A) -> B>,
}

impl<A, B, F> PullFilterFactory for PullMapFilter<A, B, F>
where
    F: FnMut(A) -> B + Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    type In = A;
    type Out = B;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        out.push(self.meta.clone());
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }

    fn build(self, source: BoxPullNode<A>) -> Result<BoxPullNode<B>> {
        Ok(Box::new(PullMapNode { f: self.f, source }))
    }
}

struct PullMapNode<A, F> {
    f: F,
    source: BoxPullNode<A>,
}

impl<A, B, F> PullNode<B> for PullMapNode<A, F>
where
    F: FnMut(A) -> B + Send,
    A: Send,
{
    fn begin(&mut self) -> Result<()> {
        self.source.begin()
    }

    fn can_pull(&mut self) -> bool {
        self.source.can_pull()
    }

    fn pull(&mut self) -> Result<B> {
        Ok((self.f)(self.source.pull()?))
    }

    fn end(&mut self) -> Result<()> {
        self.source.end()
    }
}

/// A pull sink driving the chain and handing every item to a closure.
pub fn pull_sink_fn<T, F>(f: F) -> PullSinkPipe<PullFnSink<T, F>>
where
    F: FnMut(T) + Send + 'static,
    T: Send + 'static,
{
    PullSinkPipe(PullFnSink {
        f,
        meta: NodeMeta::default(),
        marker: PhantomData,
    })
}

pub struct PullFnSink<T, F> {
    f: F,
    meta: NodeMeta,
    marker: PhantomData<fn(T)>,
}

impl<T, F> PullSinkFactory for PullFnSink<T, F>
where
    F: FnMut(T) + Send + 'static,
    T: Send + 'static,
{
    type In = T;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        out.push(self.meta.clone());
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }

    fn build(self, source: BoxPullNode<T>) -> Result<Box<dyn Driver>> {
        Ok(Box::new(PullFnDriver { f: self.f, source }))
    }
}

struct PullFnDriver<T, F> {
    f: F,
    source: BoxPullNode<T>,
}

impl<T, F> Driver for PullFnDriver<T, F>
where
    F: FnMut(T),
{
    fn begin(&mut self) -> Result<()> {
        self.source.begin()
    }

    fn run(&mut self) -> Result<()> {
        while self.source.can_pull() {
            (self.f)(self.source.pull()?);
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.source.end()
    }
}

/// A pull sink collecting items into a shared vector.
pub fn pull_vec_sink<T: Send + 'static>(
    out: Arc<Mutex<Vec<T>>>,
) -> PullSinkPipe<PullFnSink<T, impl FnMut(T) + Send + 'static>> {
    pull_sink_fn(move |item| out.lock().push(item))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{map, pull_map, pull_source, pull_vec_sink, push_source, sink_fn, vec_sink};

    #[test]
    fn test_push_chain() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let pipeline = push_source(1u32..=5)
            | map(|x: u32| x * 10)
            | map(|x: u32| x + 1)
            | vec_sink(out.clone());
        pipeline.run_with_memory(1 << 20).unwrap();
        assert_eq!(*out.lock(), vec![11, 21, 31, 41, 51]);
    }

    #[test]
    fn test_sink_fn_sees_every_item() {
        let sum = Arc::new(Mutex::new(0u64));
        let total = sum.clone();
        let pipeline = push_source(1u64..=100) | sink_fn(move |x: u64| *total.lock() += x);
        pipeline.run_with_memory(1 << 20).unwrap();
        assert_eq!(*sum.lock(), 5050);
    }

    #[test]
    fn test_pull_chain() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pull_source(1u32..=5)
            | pull_map(|x: u32| x * 2)
            | pull_vec_sink(out.clone());
        pipeline.run_with_memory(1 << 20).unwrap();
        assert_eq!(*out.lock(), vec![2, 4, 6, 8, 10]);
    }

    /// Composition associates freely: filters may be attached to the sink
    /// before the source joins.
    #[test]
    fn test_filters_attach_to_sink_first() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let tail = map(|x: u32| x + 5) | vec_sink(out.clone());
        let pipeline = push_source(0u32..3) | tail;
        pipeline.run_with_memory(1 << 20).unwrap();
        assert_eq!(*out.lock(), vec![5, 6, 7]);
    }

    #[test]
    fn test_pull_composition_associates_freely() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let filters = pull_map(|x: u32| x + 1) | pull_map(|x: u32| x * 3);
        let pipeline = pull_source(0u32..4) | filters | pull_vec_sink(out.clone());
        pipeline.run_with_memory(1 << 20).unwrap();
        assert_eq!(*out.lock(), vec![3, 6, 9, 12]);

        let tail = pull_map(|x: u32| x * 2) | pull_vec_sink(out.clone());
        let pipeline = pull_source(1u32..=3) | tail;
        pipeline.run_with_memory(1 << 20).unwrap();
        assert_eq!(out.lock()[4..], [2, 4, 6]);
    }
}
