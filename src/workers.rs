use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context};
use command_executor::command::Command;
use command_executor::shutdown_mode::ShutdownMode;
use command_executor::thread_pool::ThreadPool;
use command_executor::thread_pool_builder::ThreadPoolBuilder;

struct PoolState {
    users: usize,
    pool: Option<Arc<Mutex<ThreadPool>>>,
    starts: usize,
}

/// Shared pool of worker threads used by the parallel array sorter.
///
/// The handle is cheap to clone and may be shared by any number of concurrent sorts. Every sort
/// registers itself for its whole duration; the threads are started by the first sort which
/// actually needs them and shut down when the last registered sort finishes.
///
/// # Examples
/// ```
/// use adaptive_file_sort::workers::Workers;
///
/// let workers = Workers::new(4);
/// assert_eq!(workers.threads(), 4);
/// assert!(!workers.is_running());
/// ```
#[derive(Clone)]
pub struct Workers {
    threads: usize,
    queue_size: usize,
    state: Arc<Mutex<PoolState>>,
}

impl Workers {
    /// Create a handle for a pool of `threads` workers. Zero selects the number of CPU cores.
    pub fn new(threads: usize) -> Workers {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        Workers {
            threads,
            queue_size: 4096,
            state: Arc::new(Mutex::new(PoolState {
                users: 0,
                pool: None,
                starts: 0,
            })),
        }
    }

    pub(crate) fn with_queue_size(mut self, queue_size: usize) -> Workers {
        self.queue_size = queue_size;
        self
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// True while the worker threads are started.
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pool
            .is_some()
    }

    /// How many times the worker threads have been started.
    pub fn starts(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).starts
    }

    /// Register a new user of the pool. The threads are not started yet.
    pub(crate) fn lease(&self) -> WorkersLease {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.users += 1;
        WorkersLease {
            workers: self.clone(),
        }
    }

    fn pool(&self) -> Result<Arc<Mutex<ThreadPool>>, anyhow::Error> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| anyhow!("Worker pool state poisoned: {}", e))?;
        if let Some(pool) = &state.pool {
            return Ok(pool.clone());
        }

        log::debug!("Initializing array sorting pool ({} threads)", self.threads);
        let mut thread_pool_builder = ThreadPoolBuilder::new();
        let pool = thread_pool_builder
            .with_name("asort".to_string())
            .with_tasks(self.threads)
            .with_queue_size(self.queue_size)
            .with_shutdown_mode(ShutdownMode::CompletePending)
            .build()
            .with_context(|| format!("Failed to start {} worker threads", self.threads))?;
        let pool = Arc::new(Mutex::new(pool));
        state.pool = Some(pool.clone());
        state.starts += 1;
        Ok(pool)
    }
}

/// Registration of one sort with the shared [Workers] pool.
pub(crate) struct WorkersLease {
    workers: Workers,
}

impl WorkersLease {
    pub(crate) fn threads(&self) -> usize {
        self.workers.threads
    }

    /// Queue a command, starting the threads on first use.
    pub(crate) fn submit(&self, command: Box<dyn Command + Send + Sync>) -> Result<(), anyhow::Error> {
        let pool = self.workers.pool()?;
        let pool = pool
            .lock()
            .map_err(|e| anyhow!("Worker pool poisoned: {}", e))?;
        pool.submit(command);
        Ok(())
    }
}

impl Drop for WorkersLease {
    fn drop(&mut self) {
        let mut state = self
            .workers
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.users -= 1;
        if state.users > 0 {
            return;
        }
        if let Some(pool) = state.pool.take() {
            match Arc::try_unwrap(pool) {
                Ok(pool) => {
                    log::debug!("Shutting down array sorting pool");
                    let mut pool = pool.into_inner().unwrap_or_else(PoisonError::into_inner);
                    pool.shutdown();
                    if let Err(e) = pool.join() {
                        log::warn!("Array sorting pool did not shut down cleanly: {}", e);
                    }
                }
                Err(_) => {
                    log::warn!("Array sorting pool is still referenced, leaving it running");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use command_executor::command::Command;

    use crate::workers::Workers;

    struct Ping {
        tx: mpsc::Sender<usize>,
        value: usize,
    }

    impl Command for Ping {
        fn execute(&self) -> Result<(), anyhow::Error> {
            self.tx.send(self.value)?;
            Ok(())
        }
    }

    #[test]
    fn test_lazy_start_and_last_user_stops() -> Result<(), anyhow::Error> {
        let workers = Workers::new(2);
        let first = workers.lease();
        let second = workers.lease();
        assert!(!workers.is_running());

        let (tx, rx) = mpsc::channel();
        for value in 0..10 {
            first.submit(Box::new(Ping { tx: tx.clone(), value }))?;
        }
        assert!(workers.is_running());
        let mut received: Vec<usize> = rx.iter().take(10).collect();
        received.sort();
        assert_eq!(received, (0..10).collect::<Vec<usize>>());

        drop(first);
        assert!(workers.is_running());
        drop(second);
        assert!(!workers.is_running());
        Ok(())
    }

    #[test]
    fn test_restart_after_shutdown() -> Result<(), anyhow::Error> {
        let workers = Workers::new(1);
        for round in 0..2 {
            let lease = workers.lease();
            let (tx, rx) = mpsc::channel();
            lease.submit(Box::new(Ping { tx, value: round }))?;
            assert_eq!(rx.recv()?, round);
            drop(lease);
            assert!(!workers.is_running());
        }
        assert_eq!(workers.starts(), 2);
        Ok(())
    }

    #[test]
    fn test_zero_threads_uses_cpus() {
        assert_eq!(Workers::new(0).threads(), num_cpus::get());
    }
}
