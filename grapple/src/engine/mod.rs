use std::sync::Arc;

use once_cell::sync::Lazy;
use rayon::{ThreadPool, ThreadPoolBuilder};

use self::messages::ManagerKind;

pub mod app;
pub mod channel;
pub mod context;
pub mod messages;
pub mod parallel;
pub mod worker;

pub static POOL: Lazy<Arc<ThreadPool>> = Lazy::new(|| {
    let num_threads = std::env::var("GRAPPLE_MAX_THREADS")
        .map(|s| {
            s.parse::<usize>()
                .expect("GRAPPLE_MAX_THREADS must be a number")
        })
        .unwrap_or_else(|_| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

    custom_pool(num_threads)
});

pub fn custom_pool(n_threads: usize) -> Arc<ThreadPool> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .build()
        .expect("failed to build rayon thread pool");

    Arc::new(pool)
}

/// Configuration a [`worker::Worker`] is constructed with.
#[derive(Clone, Copy, Debug)]
pub struct EngineSpec {
    /// Evaluation threads; `None` uses the shared global pool.
    pub threads: Option<usize>,
    /// Which message-manager implementation to construct.
    pub manager: ManagerKind,
}

impl Default for EngineSpec {
    fn default() -> Self {
        Self {
            threads: None,
            manager: ManagerKind::Parallel,
        }
    }
}

impl EngineSpec {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn manager(mut self, manager: ManagerKind) -> Self {
        self.manager = manager;
        self
    }
}
