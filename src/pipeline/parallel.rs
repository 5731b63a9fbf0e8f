//! Parallel execution of a pipeline fragment.
//!
//! [`parallel`] wraps a cloneable filter fragment in a push segment that fans
//! buffers of items out to worker threads. One producer node in the main
//! thread fills a staging buffer and hands it to an idle worker; each worker
//! runs a private instance of the fragment feeding an output buffer; a
//! consumer in the main thread pushes drained output downstream in completion
//! order.
//!
//! Per worker the segment keeps one input and one output buffer, exchanged by
//! move under a single mutex; a worker touches its buffers only in the
//! `Processing` and `Outputting` states, the producer only in `Idle` and
//! `Outputting`, so the buffers are never aliased. Output order across
//! workers is not the input order; callers that need input order must not
//! use this segment.

use std::mem;
use std::panic;
use std::sync::Arc;
use std::thread;

use log;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

use super::factory::{FilterFactory, FilterPipe};
use super::node::{BoxPushNode, NodeMeta, PushNode, PRIORITY_INSIGNIFICANT};

/// User-supplied options of a parallel segment.
#[derive(Clone, Copy, Debug)]
pub struct ParallelOptions {
    /// Number of worker threads.
    pub num_jobs: usize,
    /// Number of items in each buffer sent between threads.
    pub buf_size: usize,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        ParallelOptions {
            num_jobs: 4,
            buf_size: 64,
        }
    }
}

/// Runs the given filter fragment in `opts.num_jobs` worker threads.
///
/// The fragment factory is cloned once per worker. The resulting segment
/// preserves the multiset of items but not their order.
pub fn parallel<F>(inner: FilterPipe<F>, opts: ParallelOptions) -> FilterPipe<ParallelFactory<F>>
where
    F: FilterFactory + Clone + Send + 'static,
    F::In: Send + 'static,
    F::Out: Send + 'static,
{
    let mut opts = opts;
    if opts.num_jobs == 0 {
        log::warn!("parallel segment with zero jobs; using one");
        opts.num_jobs = 1;
    }
    if opts.buf_size == 0 {
        log::warn!("parallel segment with zero buffer size; using one");
        opts.buf_size = 1;
    }

    let minimum_memory = opts.num_jobs
        * opts.buf_size
        * (mem::size_of::<F::In>() + mem::size_of::<F::Out>())
        + opts.buf_size * mem::size_of::<F::In>();
    let meta = NodeMeta {
        name: "parallel input".to_owned(),
        priority: PRIORITY_INSIGNIFICANT,
        minimum_memory,
        ..NodeMeta::default()
    };
    FilterPipe(ParallelFactory {
        inner: inner.0,
        opts,
        meta,
    })
}

/// Factory of the parallel segment; builds the producer node.
pub struct ParallelFactory<F> {
    inner: F,
    opts: ParallelOptions,
    meta: NodeMeta,
}

impl<F> FilterFactory for ParallelFactory<F>
where
    F: FilterFactory + Clone + Send + 'static,
    F::In: Send + 'static,
    F::Out: Send + 'static,
{
    type In = F::In;
    type Out = F::Out;

    fn collect_meta(&self, out: &mut Vec<NodeMeta>) {
        out.push(self.meta.clone());
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }

    fn build(self, dest: BoxPushNode<F::Out>) -> Result<BoxPushNode<F::In>> {
        let opts = self.opts;
        Ok(Box::new(Producer {
            opts,
            factory: Some(self.inner),
            shared: Arc::new(Shared::new(opts)),
            staging: Vec::with_capacity(opts.buf_size),
            consumer: Consumer { dest },
            handles: Vec::new(),
        }))
    }
}

/// States of the per-worker state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    /// The slot is the producer's: it may write the input buffer.
    Idle,
    /// The slot is the worker's: it owns the input and fills the output.
    Processing,
    /// The output is ready for the consumer.
    Outputting,
}

/// One worker's slot in the arena: its state and the two exchange buffers.
struct Slot<I, O> {
    state: WorkerState,
    /// The worker is between taking a batch and finishing it. A mid-batch
    /// drain leaves the slot `Idle`, but it must not receive fresh input
    /// until the batch is over, or a later flush of the same batch would
    /// clobber the pending assignment.
    busy: bool,
    input: Vec<I>,
    output: Vec<O>,
}

struct Inner<I, O> {
    slots: Vec<Slot<I, O>>,
    /// No further input will arrive.
    done: bool,
    /// The segment is being torn down after a failure; workers drop their
    /// output instead of waiting for a consumer that will not come.
    aborted: bool,
    failure: Option<Error>,
    running_workers: usize,
}

/// State shared between the producer and the workers. The mutex guards every
/// slot state; the buffers themselves are only touched by the side the state
/// machine currently assigns them to.
struct Shared<I, O> {
    opts: ParallelOptions,
    inner: Mutex<Inner<I, O>>,
    /// Waited on by the producer until some worker leaves `Processing`.
    producer_cond: Condvar,
    /// One per worker; waited on for new input or for the output drain.
    worker_conds: Vec<Condvar>,
}

impl<I, O> Shared<I, O> {
    fn new(opts: ParallelOptions) -> Self {
        Shared {
            inner: Mutex::new(Inner {
                slots: (0..opts.num_jobs)
                    .map(|_| Slot {
                        state: WorkerState::Idle,
                        busy: false,
                        input: Vec::new(),
                        output: Vec::new(),
                    })
                    .collect(),
                done: false,
                aborted: false,
                failure: None,
                running_workers: 0,
            }),
            producer_cond: Condvar::new(),
            worker_conds: (0..opts.num_jobs).map(|_| Condvar::new()).collect(),
            opts,
        }
    }
}

/// Hands the worker's output buffer to the consumer and waits until it has
/// been drained. Returns `false` if there was nothing to flush.
///
/// With `end_of_batch` the slot is simultaneously marked ready for fresh
/// input; doing both under one lock is what makes the producer's
/// drain-and-reassign step sound. The wait then ends in `Idle` (the usual
/// case) or directly in `Processing`: the producer may drain the output and
/// assign fresh input in one go, and the skipped `Idle` saves a wakeup.
fn flush_output<I, O>(
    shared: &Shared<I, O>,
    index: usize,
    buffer: &mut Vec<O>,
    end_of_batch: bool,
) -> Result<bool> {
    let mut inner = shared.inner.lock();
    if end_of_batch {
        inner.slots[index].busy = false;
    }
    if buffer.is_empty() {
        if end_of_batch {
            // Nothing to flush; hand the slot back directly. A non-empty
            // input means the producer already assigned the next batch.
            let slot = &mut inner.slots[index];
            if slot.state == WorkerState::Processing && slot.input.is_empty() {
                slot.state = WorkerState::Idle;
                shared.producer_cond.notify_one();
            }
        }
        return Ok(false);
    }
    if inner.aborted {
        buffer.clear();
        return Ok(true);
    }
    inner.slots[index].output = mem::take(buffer);
    inner.slots[index].state = WorkerState::Outputting;
    log::debug!("worker {}: output ready, notifying the producer", index);
    shared.producer_cond.notify_one();
    loop {
        match inner.slots[index].state {
            WorkerState::Idle => {
                log::debug!("worker {}: output drained", index);
                break;
            }
            WorkerState::Processing => {
                log::debug!("worker {}: output drained, new input already assigned", index);
                break;
            }
            WorkerState::Outputting => {
                if inner.aborted {
                    break;
                }
                shared.worker_conds[index].wait(&mut inner);
            }
        }
    }
    drop(inner);
    if buffer.capacity() == 0 {
        *buffer = Vec::with_capacity(shared.opts.buf_size);
    }
    return Ok(true);
}

/// Body of one worker thread.
fn worker_loop<F>(shared: Arc<Shared<F::In, F::Out>>, index: usize, factory: F)
where
    F: FilterFactory,
    F::In: Send + 'static,
    F::Out: Send + 'static,
{
    log::debug!("worker {}: starting", index);
    let buffer: Arc<Mutex<Vec<F::Out>>> = Arc::new(Mutex::new(Vec::with_capacity(shared.opts.buf_size)));
    let after: BoxPushNode<F::Out> = Box::new(AfterSink {
        shared: shared.clone(),
        index,
        buffer: buffer.clone(),
    });

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        drive_worker(&shared, index, factory, after, &buffer)
    }))
    .unwrap_or_else(|_| Err(Error::Invariant("parallel worker panicked".into())));

    let mut inner = shared.inner.lock();
    inner.running_workers -= 1;
    if let Err(error) = outcome {
        log::debug!("worker {}: failed: {}", index, error);
        if inner.failure.is_none() {
            inner.failure = Some(error);
        }
        inner.done = true;
        inner.aborted = true;
        for cond in &shared.worker_conds {
            cond.notify_one();
        }
    }
    log::debug!("worker {}: exiting", index);
    shared.producer_cond.notify_all();
}

fn drive_worker<F>(
    shared: &Shared<F::In, F::Out>,
    index: usize,
    factory: F,
    after: BoxPushNode<F::Out>,
    buffer: &Mutex<Vec<F::Out>>,
) -> Result<()>
where
    F: FilterFactory,
    F::In: Send + 'static,
    F::Out: Send + 'static,
{
    let mut chain = factory.build(after)?;
    chain.begin()?;
    loop {
        let batch = {
            let mut inner = shared.inner.lock();
            loop {
                if inner.slots[index].state == WorkerState::Processing {
                    break;
                }
                if inner.done {
                    log::debug!("worker {}: done signal received", index);
                    drop(inner);
                    // The inner fragment may flush residual items here.
                    chain.end()?;
                    let mut residual = buffer.lock();
                    flush_output(shared, index, &mut residual, false)?;
                    return Ok(());
                }
                shared.worker_conds[index].wait(&mut inner);
            }
            inner.slots[index].busy = true;
            mem::take(&mut inner.slots[index].input)
        };

        log::debug!("worker {}: processing {} items", index, batch.len());
        for item in batch {
            chain.push(item)?;
        }
        // Batch over: flush whatever it produced and reopen the slot for
        // fresh input, in one step.
        let mut full = buffer.lock();
        flush_output(shared, index, &mut full, true)?;
        drop(full);
    }
}

/// Accepts output items inside a worker and hands full buffers to the main
/// thread.
struct AfterSink<I, O> {
    shared: Arc<Shared<I, O>>,
    index: usize,
    /// Shared with the worker loop, which flushes it at the end of every
    /// batch.
    buffer: Arc<Mutex<Vec<O>>>,
}

impl<I, O> PushNode<O> for AfterSink<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn push(&mut self, item: O) -> Result<()> {
        let mut buffer = self.buffer.lock();
        buffer.push(item);
        if buffer.len() >= self.shared.opts.buf_size {
            // The buffer filled before the batch ended.
            flush_output(&self.shared, self.index, &mut buffer, false)?;
        }
        Ok(())
    }
}

/// Pushes drained output batches downstream, in completion order.
struct Consumer<O> {
    dest: BoxPushNode<O>,
}

impl<O> Consumer<O> {
    fn consume(&mut self, batch: Vec<O>) -> Result<()> {
        for item in batch {
            self.dest.push(item)?;
        }
        Ok(())
    }
}

/// The main-thread end of the segment: buffers incoming items and manages the
/// worker arena.
struct Producer<F: FilterFactory> {
    opts: ParallelOptions,
    factory: Option<F>,
    shared: Arc<Shared<F::In, F::Out>>,
    staging: Vec<F::In>,
    consumer: Consumer<F::Out>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl<F> Producer<F>
where
    F: FilterFactory + Clone + Send + 'static,
    F::In: Send + 'static,
    F::Out: Send + 'static,
{
    /// Hands the staging buffer to a worker, draining output along the way.
    fn dispatch_staging(&mut self) -> Result<()> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let num_jobs = self.opts.num_jobs;
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(error) = inner.failure.take() {
                return Err(error);
            }
            if inner.done {
                // A failure was already raised and the workers are gone.
                return Err(Error::State("parallel segment already failed"));
            }
            // A slot is interesting when its output wants draining or when it
            // can take input: Idle and not still chewing on a batch.
            let ready = (0..num_jobs).find(|&i| {
                let slot = &inner.slots[i];
                slot.state == WorkerState::Outputting
                    || (slot.state == WorkerState::Idle && !slot.busy)
            });
            let index = match ready {
                Some(index) => index,
                None => {
                    log::debug!("producer: no ready worker, waiting");
                    self.shared.producer_cond.wait(&mut inner);
                    continue;
                }
            };
            match inner.slots[index].state {
                WorkerState::Idle => {
                    inner.slots[index].input =
                        mem::replace(&mut self.staging, Vec::with_capacity(self.opts.buf_size));
                    inner.slots[index].state = WorkerState::Processing;
                    self.shared.worker_conds[index].notify_one();
                    log::debug!("producer: sent a buffer to worker {}", index);
                    return Ok(());
                }
                WorkerState::Outputting if inner.slots[index].busy => {
                    // A mid-batch flush: drain it, but the worker keeps its
                    // current batch.
                    let batch = mem::take(&mut inner.slots[index].output);
                    inner.slots[index].state = WorkerState::Idle;
                    self.shared.worker_conds[index].notify_one();
                    log::debug!("producer: drained worker {} mid-batch", index);
                    if let Err(error) = self.consumer.consume(batch) {
                        self.abort_locked(&mut inner);
                        return Err(error);
                    }
                }
                WorkerState::Outputting => {
                    let batch = mem::take(&mut inner.slots[index].output);
                    // Drain and reassign in one critical section with a
                    // single wakeup; the worker skips Idle entirely.
                    inner.slots[index].input =
                        mem::replace(&mut self.staging, Vec::with_capacity(self.opts.buf_size));
                    inner.slots[index].state = WorkerState::Processing;
                    self.shared.worker_conds[index].notify_one();
                    log::debug!("producer: drained worker {} and reassigned it directly", index);
                    if let Err(error) = self.consumer.consume(batch) {
                        self.abort_locked(&mut inner);
                        return Err(error);
                    }
                    return Ok(());
                }
                WorkerState::Processing => continue,
            }
        }
    }

    /// Drains the remaining input and output, signals `done` and waits for
    /// every worker to exit.
    fn finish_protocol(&mut self) -> Result<()> {
        self.dispatch_staging()?;
        let num_jobs = self.opts.num_jobs;
        let mut inner = self.shared.inner.lock();

        // Wait for every worker to go quiet, draining output as it appears.
        loop {
            if inner.failure.is_some() {
                break;
            }
            if let Some(index) = (0..num_jobs).find(|&i| inner.slots[i].state == WorkerState::Outputting) {
                let batch = mem::take(&mut inner.slots[index].output);
                inner.slots[index].state = WorkerState::Idle;
                self.shared.worker_conds[index].notify_one();
                log::debug!("producer: drained worker {}", index);
                if let Err(error) = self.consumer.consume(batch) {
                    self.abort_locked(&mut inner);
                    return Err(error);
                }
                continue;
            }
            if (0..num_jobs).any(|i| {
                inner.slots[i].state == WorkerState::Processing || inner.slots[i].busy
            }) {
                log::debug!("producer: waiting for workers to finish");
                self.shared.producer_cond.wait(&mut inner);
                continue;
            }
            break;
        }

        log::debug!("producer: input exhausted, signalling done");
        inner.done = true;
        for cond in &self.shared.worker_conds {
            cond.notify_one();
        }

        // Workers flush residual output on their way out.
        loop {
            if let Some(index) = (0..num_jobs).find(|&i| inner.slots[i].state == WorkerState::Outputting) {
                let batch = mem::take(&mut inner.slots[index].output);
                inner.slots[index].state = WorkerState::Idle;
                self.shared.worker_conds[index].notify_one();
                log::debug!("producer: drained worker {} during shutdown", index);
                if let Err(error) = self.consumer.consume(batch) {
                    self.abort_locked(&mut inner);
                    return Err(error);
                }
                continue;
            }
            if inner.running_workers > 0 {
                self.shared.producer_cond.wait(&mut inner);
                continue;
            }
            break;
        }
        Ok(())
    }

    fn abort_locked(&self, inner: &mut Inner<F::In, F::Out>) {
        inner.done = true;
        inner.aborted = true;
        for cond in &self.shared.worker_conds {
            cond.notify_one();
        }
    }

    fn join_workers(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                let mut inner = self.shared.inner.lock();
                if inner.failure.is_none() {
                    inner.failure = Some(Error::Invariant("parallel worker panicked".into()));
                }
            }
        }
    }
}

impl<F> PushNode<F::In> for Producer<F>
where
    F: FilterFactory + Clone + Send + 'static,
    F::In: Send + 'static,
    F::Out: Send + 'static,
{
    fn begin(&mut self) -> Result<()> {
        self.consumer.dest.begin()?;
        let factory = match self.factory.take() {
            Some(factory) => factory,
            None => return Err(Error::State("parallel segment begun twice")),
        };
        self.shared.inner.lock().running_workers = self.opts.num_jobs;
        for index in 0..self.opts.num_jobs {
            let shared = self.shared.clone();
            let factory = factory.clone();
            let spawned = thread::Builder::new()
                .name(format!("parallel-worker-{}", index))
                .spawn(move || worker_loop(shared, index, factory));
            match spawned {
                Ok(handle) => self.handles.push(handle),
                Err(err) => {
                    {
                        let mut inner = self.shared.inner.lock();
                        inner.running_workers -= self.opts.num_jobs - index;
                        self.abort_locked(&mut inner);
                    }
                    self.join_workers();
                    return Err(Error::Io(err));
                }
            }
        }
        Ok(())
    }

    fn push(&mut self, item: F::In) -> Result<()> {
        self.staging.push(item);
        if self.staging.len() >= self.opts.buf_size {
            self.dispatch_staging()?;
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let outcome = self.finish_protocol();
        self.join_workers();
        let latched = self.shared.inner.lock().failure.take();
        outcome?;
        if let Some(error) = latched {
            return Err(error);
        }
        self.consumer.dest.end()
    }
}

impl<F: FilterFactory> Drop for Producer<F> {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        // Release every worker still waiting, then reap the threads.
        {
            let mut inner = self.shared.inner.lock();
            inner.done = true;
            inner.aborted = true;
        }
        for cond in &self.shared.worker_conds {
            cond.notify_one();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
