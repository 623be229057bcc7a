use core::{
    num::NonZeroU32,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};
use derive_more::Display;
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::HashMap as _HashMap;

/// Execution discipline of a graph.
///
/// Selected per graph (and independently per nested subgraph) before `init`
/// and fixed afterwards. It decides which edge strategy the graph binds to its
/// edges and how its nodes are dispatched.
#[derive(Debug, Display, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum ParallelType {
    /// Unset. Runs like [`ParallelType::Sequential`].
    #[default]
    #[display("none")]
    None,
    /// Topological order on the calling thread.
    #[display("sequential")]
    Sequential,
    /// Dependency-ordered dispatch on a worker pool.
    #[display("task")]
    Task,
    /// Every node is a persistent worker loop; invocations overlap.
    #[display("pipeline")]
    Pipeline,
}

impl ParallelType {
    /// The discipline actually used at runtime.
    #[must_use]
    pub fn resolve(self) -> Self {
        match self {
            Self::None => Self::Sequential,
            other => other,
        }
    }

    /// Whether graphs of this type own a worker pool.
    #[must_use]
    pub fn uses_pool(self) -> bool {
        matches!(self.resolve(), Self::Task | Self::Pipeline)
    }
}

/// Process-unique identifier of a node (leaf or subgraph).
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("#{_0}")]
pub struct NodeId(NonZeroU32);

impl NodeId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        let raw = NEXT.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU32::new(raw).expect("NodeId::next: [1]"))
    }

    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Process-unique identifier of an edge.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("e{_0}")]
pub struct EdgeId(u64);

impl EdgeId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
