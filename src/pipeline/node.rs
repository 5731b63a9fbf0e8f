//! Pipeline node capabilities and metadata.

use crate::error::Result;

/// Priority of nodes that should not name their phase in progress reporting.
pub const PRIORITY_INSIGNIFICANT: u32 = 0;

/// Default priority of user-named nodes.
pub const PRIORITY_USER: u32 = 10;

/// Static declaration a node makes about itself: how to label it, how to
/// share phase memory, and which other nodes it depends on.
#[derive(Clone, Debug)]
pub struct NodeMeta {
    /// Name used to label the node's phase in progress reporting.
    pub name: String,
    /// The node with the highest priority names the whole phase.
    pub priority: u32,
    /// Share of the phase budget relative to the other nodes in the phase.
    pub memory_fraction: f64,
    /// Memory the node cannot run below.
    pub minimum_memory: usize,
    /// Memory past which more budget is wasted on the node.
    pub maximum_memory: usize,
    /// Names of nodes this one depends on, for reporting.
    pub dependencies: Vec<String>,
}

impl NodeMeta {
    /// A meta with the given name and priority and default memory settings.
    pub fn named(name: &str, priority: u32) -> NodeMeta {
        NodeMeta {
            name: name.to_owned(),
            priority,
            ..NodeMeta::default()
        }
    }
}

impl Default for NodeMeta {
    fn default() -> Self {
        NodeMeta {
            name: String::new(),
            priority: PRIORITY_INSIGNIFICANT,
            memory_fraction: 1.0,
            minimum_memory: 0,
            maximum_memory: usize::MAX,
            dependencies: Vec::new(),
        }
    }
}

/// A node driven by items arriving from upstream.
///
/// `begin` and `end` propagate downstream: a node finishes its own setup
/// before forwarding `begin`, and flushes whatever it still holds before
/// forwarding `end`, so residual items always reach a destination that is
/// still open.
pub trait PushNode<T>: Send {
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn push(&mut self, item: T) -> Result<()>;

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A node producing items on demand.
pub trait PullNode<T>: Send {
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    /// True while another item can be pulled. May read ahead.
    fn can_pull(&mut self) -> bool;

    fn pull(&mut self) -> Result<T>;

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type BoxPushNode<T> = Box<dyn PushNode<T>>;
pub type BoxPullNode<T> = Box<dyn PullNode<T>>;

/// The node driving a phase: a source pushing items downstream, or a sink
/// pulling its upstream dry.
pub trait Driver {
    fn begin(&mut self) -> Result<()>;

    /// Moves every item of the phase through the chain.
    fn run(&mut self) -> Result<()>;

    fn end(&mut self) -> Result<()>;
}
