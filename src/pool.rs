use crate::{
    config::GraphConfig,
    error::{Error, Result},
};
use crossbeam_channel::{Receiver, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error};

/// Start the worker pool of graph `graph` with at least `min_threads` threads.
///
/// # Errors
/// [`Error::ThreadPool`] if the threads cannot be spawned.
pub(crate) fn build(config: &GraphConfig, graph: &str, min_threads: usize) -> Result<ThreadPool> {
    let num_threads = config.num_threads.get().max(min_threads);
    let prefix = config.thread_name.clone();
    let owner = graph.to_owned();
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(move |index| format!("{prefix}-{index}"))
        .panic_handler(move |_| error!(graph = %owner, "worker panicked outside a node body"))
        .build()
        .map_err(|err| Error::ThreadPool(err.to_string()))?;
    debug!(graph, num_threads, "worker pool started");
    Ok(pool)
}

/// Long-running jobs sharing one pool.
///
/// Every job keeps a clone of a channel sender alive; [`WorkerGroup::join`]
/// waits for the channel to disconnect, which happens once the last job has
/// returned.
#[derive(Debug)]
pub(crate) struct WorkerGroup {
    pool: ThreadPool,
    alive: Option<Sender<()>>,
    finished: Receiver<()>,
}

impl WorkerGroup {
    pub(crate) fn new(pool: ThreadPool) -> Self {
        let (alive, finished) = crossbeam_channel::bounded(0);
        Self {
            pool,
            alive: Some(alive),
            finished,
        }
    }

    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let alive = self.alive.clone();
        self.pool.spawn(move || {
            let _alive = alive;
            job();
        });
    }

    /// Block until every spawned job has returned.
    pub(crate) fn join(mut self) {
        drop(self.alive.take());
        while self.finished.recv().is_ok() {}
    }
}
