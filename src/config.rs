use core::num::NonZeroUsize;
use std::thread;

/// Runtime settings of a graph.
///
/// Only Task and Pipeline graphs own a worker pool, so Sequential graphs
/// ignore every field. Nested subgraphs carry their own configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphConfig {
    /// Worker threads of the graph's pool. Pipeline graphs always get at least
    /// one thread per node, since every node is a persistent loop.
    pub num_threads: NonZeroUsize,
    /// Prefix of worker thread names; the worker index is appended.
    pub thread_name: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            thread_name: "cpg-worker".to_owned(),
        }
    }
}

impl GraphConfig {
    #[must_use]
    pub fn with_num_threads(mut self, num_threads: NonZeroUsize) -> Self {
        self.num_threads = num_threads;
        self
    }

    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }
}
