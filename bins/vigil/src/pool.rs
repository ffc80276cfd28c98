use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use vigil_core::job::Job;
use vigil_core::now_ms;

use crate::executor::Executor;
use crate::module::shutdown_requested;
use crate::plugin::Plugin;

/// Element of the shared work queue.
pub enum Work {
    /// Dispatch a Job once it is due.
    Run {
        /// Job to submit.
        job: Job,
        /// Resolved plugin for plugin activities.
        plugin: Option<Arc<dyn Plugin>>,
    },
    /// Ask exactly one worker to exit.
    Shutdown,
}

type Queue = Arc<Mutex<mpsc::UnboundedReceiver<Work>>>;

/// Resizable set of workers draining one FIFO queue into the [`Executor`].
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Work>,
    rx: Queue,
    executor: Arc<Executor>,
    shutdown: watch::Receiver<bool>,
    workers: Vec<JoinHandle<()>>,
    size: usize,
    next_id: usize,
}

impl WorkerPool {
    /// Empty pool feeding `executor`.
    pub fn new(executor: Arc<Executor>, shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            executor,
            shutdown,
            workers: Vec::new(),
            size: 0,
            next_id: 1,
        }
    }

    /// Target number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a Job.
    pub fn enqueue(&self, job: Job, plugin: Option<Arc<dyn Plugin>>) {
        if self.tx.send(Work::Run { job, plugin }).is_err() {
            warn!("work queue closed; dropping job");
        }
    }

    /// Grow by spawning workers or shrink by queueing one `Shutdown` per
    /// worker to remove. Whichever workers pop them exit.
    pub fn resize(&mut self, count: usize) {
        self.workers.retain(|h| !h.is_finished());

        if count > self.size {
            info!("starting {} job consumers", count - self.size);
            while self.size < count {
                let id = self.next_id;
                self.next_id += 1;
                self.workers.push(tokio::spawn(run_worker(
                    id,
                    self.rx.clone(),
                    self.executor.clone(),
                    self.shutdown.clone(),
                )));
                self.size += 1;
            }
        } else if count < self.size {
            info!("stopping {} job consumers", self.size - count);
            while self.size > count {
                let _ = self.tx.send(Work::Shutdown);
                self.size -= 1;
            }
        }
    }

    /// Shrink to zero and wait for every worker to exit.
    pub async fn drain(&mut self) {
        self.resize(0);
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!("job consumer failed: {}", e);
            }
        }
    }
}

async fn run_worker(id: usize, queue: Queue, executor: Arc<Executor>, mut shutdown: watch::Receiver<bool>) {
    debug!("job consumer {} started", id);
    loop {
        let work = tokio::select! {
            work = async { queue.lock().await.recv().await } => work,
            _ = shutdown_requested(&mut shutdown) => None,
        };
        let Some(Work::Run { job, plugin }) = work else { break };

        let delay = job.scheduled_at().saturating_sub(now_ms());
        if delay > 0 {
            tokio::select! {
                _ = sleep(Duration::from_millis(delay)) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        executor.submit(job, plugin).await;
    }
    debug!("job consumer {} received stop event", id);
}
