use crate::bus::StateBus;
use crate::error::Result;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const JOIN_POLL: Duration = Duration::from_millis(10);

type Fallback = Box<dyn FnOnce() + Send>;

struct Worker {
    name: String,
    handle: JoinHandle<()>,
    on_stuck: Option<Fallback>,
}

/// Owns the long-lived worker threads and stops them together.
pub struct Supervisor {
    bus: Arc<StateBus>,
    workers: Vec<Worker>,
}

impl Supervisor {
    pub fn new(bus: Arc<StateBus>) -> Self {
        Self {
            bus,
            workers: Vec::new(),
        }
    }

    /// Start a named worker thread.
    pub fn spawn<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(f)?;
        self.adopt(name, handle);
        Ok(())
    }

    /// Track a thread started elsewhere.
    pub fn adopt(&mut self, name: &str, handle: JoinHandle<()>) {
        self.workers.push(Worker {
            name: name.to_string(),
            handle,
            on_stuck: None,
        });
    }

    /// Run `fallback` at shutdown if worker `name` misses the deadline.
    pub fn on_stuck<F>(&mut self, name: &str, fallback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(worker) = self.workers.iter_mut().find(|w| w.name == name) {
            worker.on_stuck = Some(Box::new(fallback));
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Clear the running flag and join every worker, giving all of them
    /// `timeout` in total. Returns the names of workers left behind.
    pub fn shutdown(self, timeout: Duration) -> Vec<String> {
        self.bus.set_running(false);
        let deadline = Instant::now() + timeout;
        let mut stuck = Vec::new();

        for Worker {
            name,
            handle,
            on_stuck,
        } in self.workers
        {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!(worker = %name, "worker panicked");
                } else {
                    tracing::debug!(worker = %name, "worker stopped");
                }
            } else {
                tracing::warn!(worker = %name, "did not stop in time");
                if let Some(fallback) = on_stuck {
                    fallback();
                }
                stuck.push(name);
            }
        }
        stuck
    }
}
