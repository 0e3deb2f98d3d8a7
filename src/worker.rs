// worker.rs - One background worker per session
//
// Long operations (extraction, spectrum loading, training) run on a worker
// thread. The worker talks back through an mpsc channel: any number of
// Progress/Status events, then exactly one Complete, even if the job panics.
// The engine lives behind a mutex so that two workers never drive it at once.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::engine::ExperimentEngine;
use crate::error::{PipelineError, PipelineResult};

/// Notifications sent from a worker to the control thread, in order
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// One more unit of work done
    Progress { completed: usize, total: usize },
    /// Free-text label for the current step
    Status(String),
    /// Terminal event, sent exactly once
    Complete { success: bool, message: String },
}

/// Sending side handed to jobs
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: Sender<WorkerEvent>,
}

impl Reporter {
    pub fn new(tx: Sender<WorkerEvent>) -> Self {
        Self { tx }
    }

    pub fn progress(&self, completed: usize, total: usize) {
        self.tx.send(WorkerEvent::Progress { completed, total }).ok();
    }

    pub fn status(&self, text: impl Into<String>) {
        let text = text.into();
        log::info!("{}", text);
        self.tx.send(WorkerEvent::Status(text)).ok();
    }

    fn complete(&self, success: bool, message: String) {
        self.tx.send(WorkerEvent::Complete { success, message }).ok();
    }
}

/// Engine shared by every worker of a session
pub type SharedEngine = Arc<Mutex<Box<dyn ExperimentEngine>>>;

/// Clears the busy flag when the worker ends, panic or not
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A user session: at most one live worker, one engine
pub struct Session {
    engine: SharedEngine,
    busy: Arc<AtomicBool>,
}

impl Session {
    pub fn new(engine: Box<dyn ExperimentEngine>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start `job` on a new worker thread
    ///
    /// Fails with `WorkerBusy` while another worker of this session is live.
    /// The job's `Ok` message or error text becomes the `Complete` event.
    pub fn spawn<F>(&self, name: &str, job: F) -> PipelineResult<WorkerHandle>
    where
        F: FnOnce(&mut dyn ExperimentEngine, &Reporter) -> anyhow::Result<String> + Send + 'static,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::WorkerBusy);
        }

        let (tx, rx) = mpsc::channel();
        let reporter = Reporter::new(tx);
        let engine = Arc::clone(&self.engine);
        let guard = BusyGuard(Arc::clone(&self.busy));
        let label = name.to_string();

        let spawned = thread::Builder::new().name(label.clone()).spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut engine = engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                job(&mut **engine, &reporter)
            }));

            let (success, message) = match outcome {
                Ok(Ok(message)) => (true, message),
                Ok(Err(err)) => {
                    log::error!("{} failed: {:#}", label, err);
                    (false, format!("{:#}", err))
                }
                Err(payload) => {
                    let reason = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    log::error!("{} panicked: {}", label, reason);
                    (false, format!("{} panicked: {}", label, reason))
                }
            };

            // free the session before announcing completion
            drop(guard);
            reporter.complete(success, message);
        });

        match spawned {
            Ok(handle) => Ok(WorkerHandle { events: rx, handle }),
            Err(e) => {
                self.busy.store(false, Ordering::SeqCst);
                Err(PipelineError::Io(e))
            }
        }
    }
}

/// Receiving side of one worker
pub struct WorkerHandle {
    pub events: Receiver<WorkerEvent>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Feed every event to `on_event` until the terminal one, then join
    ///
    /// # Returns
    /// (success, message) from the `Complete` event
    pub fn drain<F>(self, mut on_event: F) -> (bool, String)
    where
        F: FnMut(&WorkerEvent),
    {
        let mut result = (false, "worker ended without reporting completion".to_string());
        for event in self.events.iter() {
            on_event(&event);
            if let WorkerEvent::Complete { success, message } = event {
                result = (success, message);
                break;
            }
        }
        self.handle.join().ok();
        result
    }

    /// Wait for completion, ignoring intermediate events
    pub fn wait(self) -> (bool, String) {
        self.drain(|_| {})
    }
}
