use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A background thread running at most one job at a time.
///
/// Jobs submitted while another one is running are dropped, so there is never more than a
/// single job queued or running. A panicking job is logged and does not stop the worker.
#[derive(Debug)]
pub struct SlotWorker {
    name: String,
    busy: Arc<AtomicBool>,
    sender: Mutex<Option<SyncSender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SlotWorker {
    /// Starts the worker thread.
    pub fn start(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Job>(1);
        let busy = Arc::new(AtomicBool::new(false));

        let thread_busy = Arc::clone(&busy);
        let thread_name = name.to_owned();
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!(worker = %thread_name, "Background job panicked");
                    }
                    thread_busy.store(false, Ordering::Release);
                }
            })?;

        Ok(Self {
            name: name.to_owned(),
            busy,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Whether a job is queued or running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Hands `job` to the worker, unless it is busy or shut down.
    ///
    /// Returns `true` if the job was accepted.
    pub fn run_if_not_busy<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let sender = self.sender.lock().unwrap();
        let sent = match sender.as_ref() {
            Some(sender) => match sender.try_send(Box::new(job)) {
                Ok(()) => true,
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
            },
            None => false,
        };
        if !sent {
            self.busy.store(false, Ordering::Release);
        }
        sent
    }

    /// Stops accepting jobs and waits for the running one to finish.
    pub fn shut_down(&self) {
        self.sender.lock().unwrap().take();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            // a job dropping the last owner of the worker must not join itself
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "Background worker panicked");
            }
        }
    }
}

impl Drop for SlotWorker {
    fn drop(&mut self) {
        self.shut_down();
    }
}
