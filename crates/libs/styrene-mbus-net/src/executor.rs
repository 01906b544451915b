use std::sync::Mutex;

use tokio::runtime::{Builder, Runtime};

use crate::error::NetError;
use crate::transport::NetTask;

/// Worker pool for decode and delivery of protocols that need no ordering.
///
/// Tasks are plain closures that may block inside owner callbacks, so they
/// run on the runtime's blocking pool.
pub(crate) struct Executor {
    runtime: Mutex<Option<Runtime>>,
}

impl Executor {
    pub(crate) fn new(threads: usize) -> Result<Self, NetError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("mbus-exec")
            .build()?;
        Ok(Self { runtime: Mutex::new(Some(runtime)) })
    }

    /// Runs `task` on a worker, or inline once the executor is shut down.
    pub(crate) fn execute(&self, task: NetTask) {
        let runtime = self.runtime.lock().expect("executor mutex poisoned");
        match runtime.as_ref() {
            Some(runtime) => {
                runtime.spawn_blocking(task);
            }
            None => {
                drop(runtime);
                task();
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        let runtime = self.runtime.lock().expect("executor mutex poisoned").take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
