use crate::{
    edge::{ConsumerId, EdgeStrategy},
    error::{Error, Result},
    packet::{PacketData, PacketView},
    sync::{Condvar, Mutex, lock, wait, wait_timeout},
    types::ParallelType,
};
use core::time::Duration;
use std::time::Instant;

/// Task-mode edge: one in-flight value handed from the producer's task to
/// its consumers.
///
/// Readers block until the value of the current run is written. The graph
/// clears the value before every run, so a reader never observes the
/// previous run's output.
#[derive(Debug)]
pub(crate) struct TaskEdge {
    name: String,
    state: Mutex<TaskSlot>,
    written: Condvar,
}

#[derive(Debug, Default)]
struct TaskSlot {
    value: Option<PacketView>,
    terminated: bool,
}

impl TaskEdge {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(TaskSlot::default()),
            written: Condvar::new(),
        }
    }

    fn wait_for_value(&self, timeout: Option<Duration>) -> Result<PacketView> {
        let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));
        let mut state = lock(&self.state);
        loop {
            if state.terminated {
                return Err(Error::Terminated {
                    edge: self.name.clone(),
                });
            }
            if let Some(value) = &state.value {
                return Ok(value.clone());
            }
            state = match deadline {
                None => wait(&self.written, state),
                Some((deadline, timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::PipelineTimeout {
                            edge: self.name.clone(),
                            timeout,
                        });
                    }
                    wait_timeout(&self.written, state, deadline - now).0
                }
            };
        }
    }
}

impl EdgeStrategy for TaskEdge {
    fn parallel_type(&self) -> ParallelType {
        ParallelType::Task
    }

    fn publish(&self, index: u64, data: PacketData) -> Result<()> {
        let mut state = lock(&self.state);
        if state.terminated {
            return Err(Error::Terminated {
                edge: self.name.clone(),
            });
        }
        state.value = Some(PacketView::new(index, data));
        drop(state);
        self.written.notify_all();
        Ok(())
    }

    fn update(&self, _consumer: ConsumerId, timeout: Option<Duration>) -> Result<PacketView> {
        self.wait_for_value(timeout)
    }

    fn get(&self, _consumer: ConsumerId) -> Result<PacketView> {
        self.wait_for_value(None)
    }

    fn index(&self, _consumer: ConsumerId) -> Option<u64> {
        self.last_index()
    }

    fn position(&self, _consumer: ConsumerId) -> Option<usize> {
        lock(&self.state).value.as_ref().map(|_| 0)
    }

    fn last_index(&self) -> Option<u64> {
        lock(&self.state).value.as_ref().map(PacketView::index)
    }

    fn backlog_len(&self) -> usize {
        usize::from(lock(&self.state).value.is_some())
    }

    fn clear(&self) {
        lock(&self.state).value = None;
    }

    fn request_terminate(&self) -> bool {
        let mut state = lock(&self.state);
        let first = !state.terminated;
        state.terminated = true;
        drop(state);
        self.written.notify_all();
        first
    }
}
