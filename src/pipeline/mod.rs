//! Push- and pull-based pipeline runtime.
//!
//! Pipelines are assembled from factory values combined with `|` and executed
//! by invoking the resulting [`Pipeline`]. Execution is split into phases at
//! buffering segments (such as [`sort_by`]); within a phase, `begin` is
//! propagated from the driving end, items flow, and `end` follows the same
//! direction so every node can flush into a destination that is still open.
//!
//! Every phase shares one memory budget; each node receives
//! `minimum + spare * fraction / fraction_sum`, capped by its declared
//! maximum.

pub mod factory;
pub mod node;
pub mod ops;
pub mod parallel;
pub mod sort;

use std::env;

use log;

use crate::error::{Error, Result};

use self::factory::{PullSinkFactory, PullSourceFactory, SinkFactory, SourceFactory};
use self::node::{Driver, NodeMeta};

pub use self::factory::{
    FilterFactory, FilterPipe, PullFilterFactory, PullFilterPipe, PullSinkPipe, PullSourcePipe,
    SinkPipe, SourcePipe,
};
pub use self::node::{
    BoxPullNode, BoxPushNode, PullNode, PushNode, PRIORITY_INSIGNIFICANT, PRIORITY_USER,
};
pub use self::ops::{
    identity, map, pull_map, pull_sink_fn, pull_source, pull_vec_sink, push_source, sink_fn,
    vec_sink,
};
pub use self::parallel::{parallel, ParallelOptions};
pub use self::sort::{sort_by, sort_by_with};

/// Environment variable providing the default pipeline memory budget, in
/// bytes.
pub const DEFAULT_MEMORY_ENV: &str = "TPIE_DEFAULT_MM";

const FALLBACK_MEMORY: usize = 256 * 1024 * 1024;

/// The memory budget used by [`Pipeline::run`]: the `TPIE_DEFAULT_MM`
/// environment variable if set, 256 MiB otherwise.
pub fn default_memory() -> usize {
    match env::var(DEFAULT_MEMORY_ENV) {
        Ok(value) => match value.trim().parse() {
            Ok(bytes) => bytes,
            Err(_) => {
                log::warn!("ignoring unparsable {} value {:?}", DEFAULT_MEMORY_ENV, value);
                FALLBACK_MEMORY
            }
        },
        Err(_) => FALLBACK_MEMORY,
    }
}

/// Memory assignments for every node of every phase, computed before any
/// phase starts so buffering segments can see their budgets across phase
/// boundaries.
pub struct PipelinePlan {
    total: usize,
    assignments: Vec<Vec<usize>>,
}

impl PipelinePlan {
    fn compute(phases: &[PhaseSpec], total: usize) -> Result<PipelinePlan> {
        let mut assignments = Vec::with_capacity(phases.len());
        for (idx, phase) in phases.iter().enumerate() {
            let minimum: usize = phase.metas.iter().map(|m| m.minimum_memory).sum();
            if minimum > total {
                return Err(Error::Capacity(format!(
                    "phase {} needs at least {} b of memory, the budget is {} b",
                    idx, minimum, total
                )));
            }
            let fraction_sum: f64 = phase.metas.iter().map(|m| m.memory_fraction).sum();
            let spare = (total - minimum) as f64;
            let shares = phase
                .metas
                .iter()
                .map(|meta| {
                    let extra = if fraction_sum > 0.0 {
                        (spare * meta.memory_fraction / fraction_sum) as usize
                    } else {
                        0
                    };
                    (meta.minimum_memory + extra).min(meta.maximum_memory)
                })
                .collect();
            assignments.push(shares);
        }
        return Ok(PipelinePlan { total, assignments });
    }

    /// The whole-pipeline budget.
    pub(crate) fn total(&self) -> usize {
        self.total
    }

    /// The budget assigned to one node, addressed by phase and position.
    pub(crate) fn assignment(&self, phase: usize, node: usize) -> usize {
        self.assignments
            .get(phase)
            .and_then(|shares| shares.get(node))
            .copied()
            .unwrap_or(self.total)
    }
}

pub(crate) type PhaseBuild = Box<dyn FnOnce(&PipelinePlan, usize) -> Result<Box<dyn Driver>>>;

/// One phase of a pipeline: the metas of its nodes plus the deferred
/// construction of its driving node. Construction is deferred so memory
/// budgets are known before any node exists.
pub(crate) struct PhaseSpec {
    pub(crate) metas: Vec<NodeMeta>,
    pub(crate) build: PhaseBuild,
}

/// An executable pipeline. Created by composing a source with filters and a
/// sink via `|`; run by invoking it.
pub struct Pipeline {
    phases: Vec<PhaseSpec>,
}

impl Pipeline {
    pub(crate) fn from_phases(phases: Vec<PhaseSpec>) -> Pipeline {
        Pipeline { phases }
    }

    /// Runs every phase with the [`default_memory`] budget.
    pub fn run(self) -> Result<()> {
        let budget = default_memory();
        self.run_with_memory(budget)
    }

    /// Runs every phase with the given memory budget in bytes.
    pub fn run_with_memory(self, total: usize) -> Result<()> {
        let plan = PipelinePlan::compute(&self.phases, total)?;
        for (idx, phase) in self.phases.into_iter().enumerate() {
            log::info!(
                "phase {} '{}': {} nodes, {} b memory",
                idx,
                phase_label(&phase.metas),
                phase.metas.len(),
                total
            );
            for (meta, share) in phase.metas.iter().zip(&plan.assignments[idx]) {
                if !meta.name.is_empty() {
                    log::debug!("  node '{}': {} b", meta.name, share);
                    for dep in &meta.dependencies {
                        log::debug!("  node '{}' runs after '{}'", meta.name, dep);
                    }
                }
            }

            let mut driver = (phase.build)(&plan, idx)?;
            driver.begin()?;
            driver.run()?;
            driver.end()?;
        }
        Ok(())
    }
}

/// The phase is labelled by its highest-priority named node.
fn phase_label(metas: &[NodeMeta]) -> &str {
    metas
        .iter()
        .filter(|m| !m.name.is_empty())
        .max_by_key(|m| m.priority)
        .map(|m| m.name.as_str())
        .unwrap_or("unnamed")
}

pub(crate) fn phase_from_push<S, K>(source: S, sink: K) -> PhaseSpec
where
    S: SourceFactory + 'static,
    K: SinkFactory<In = S::Item> + 'static,
{
    let mut metas = Vec::new();
    source.collect_meta(&mut metas);
    sink.collect_meta(&mut metas);
    PhaseSpec {
        metas,
        build: Box::new(move |_plan, _idx| source.build(sink.build()?)),
    }
}

pub(crate) fn phase_from_pull<S, K>(source: S, sink: K) -> PhaseSpec
where
    S: PullSourceFactory + 'static,
    K: PullSinkFactory<In = S::Item> + 'static,
{
    let mut metas = Vec::new();
    source.collect_meta(&mut metas);
    sink.collect_meta(&mut metas);
    PhaseSpec {
        metas,
        build: Box::new(move |_plan, _idx| sink.build(source.build()?)),
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rand::seq::SliceRandom;

    use super::node::PRIORITY_USER;
    use super::ops::{map, push_source, sink_fn, vec_sink};
    use super::parallel::{parallel, ParallelOptions};
    use super::sort::sort_by_with;
    use crate::error::Error;
    use crate::sort::SortOptions;

    #[test]
    fn test_push_pipeline_moves_items() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let pipeline = push_source(0u64..100)
            | map(|x: u64| x * 2).name("double", PRIORITY_USER)
            | vec_sink(out.clone());
        pipeline.run_with_memory(1 << 20).unwrap();
        assert_eq!(*out.lock(), Vec::from_iter((0u64..100).map(|x| x * 2)));
    }

    #[test]
    fn test_unsatisfiable_minimum_memory_is_reported() {
        let pipeline = push_source(0u64..10) | sink_fn(|_x: u64| {}).minimum(1 << 30);
        assert!(matches!(pipeline.run_with_memory(1 << 20), Err(Error::Capacity(_))));
    }

    /// Parallel mapping feeding an external sort: two phases, worker threads,
    /// run files on disk.
    #[test]
    fn test_parallel_then_sort() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = Vec::from_iter(0u64..20_000);
        input.shuffle(&mut rand::thread_rng());

        let out = Arc::new(Mutex::new(Vec::new()));
        let opts = SortOptions {
            block_bytes: 4096,
            temp_dir: Some(dir.path().to_path_buf()),
        };
        let pipeline = push_source(input.into_iter())
            | parallel(map(|x: u64| x ^ 1), ParallelOptions::default())
            | sort_by_with(|a: &u64, b: &u64| a.cmp(b), opts)
            | vec_sink(out.clone());
        pipeline.run_with_memory(300_000).unwrap();

        let mut expected = Vec::from_iter((0u64..20_000).map(|x| x ^ 1));
        expected.sort_unstable();
        assert_eq!(*out.lock(), expected);
    }
}
