//! Dedicated thread that owns a native event loop.
//!
//! Native Bluetooth objects are thread-affine: their callbacks fire on the
//! thread that started the operation, and only while that thread pumps its
//! event loop. The executor creates the loop object on its own thread (the
//! loop type need not be `Send`), then cycles between draining submitted
//! jobs and pumping the loop for a short slice. Other threads reach native
//! objects only through [`RunLoopExecutor::schedule_and_wait`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::errors::{Result, TransportError};

const START_TIMEOUT: Duration = Duration::from_secs(5);

/// A native event loop that can be pumped for a bounded slice.
pub trait EventLoop {
    /// Dispatch pending native callbacks for at most `slice`.
    fn run_for(&mut self, slice: Duration);
}

type Job<L> = Box<dyn FnOnce(&mut L) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

pub struct RunLoopExecutor<L: EventLoop + 'static> {
    name: String,
    slice: Duration,
    state: ExecutorState,
    jobs: Option<Sender<Job<L>>>,
    stop: Arc<AtomicBool>,
    exited: Option<Receiver<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<L: EventLoop + 'static> RunLoopExecutor<L> {
    /// `slice` bounds each pump of the native loop, and therefore how long a
    /// submitted job can wait before it starts.
    pub fn new(name: impl Into<String>, slice: Duration) -> Self {
        Self {
            name: name.into(),
            slice,
            state: ExecutorState::NotStarted,
            jobs: None,
            stop: Arc::new(AtomicBool::new(false)),
            exited: None,
            handle: None,
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ExecutorState::Running
    }

    /// Spawn the loop thread and build the loop object on it.
    ///
    /// Returns once `create` has run; its error is returned here and the
    /// executor ends up `Stopped`.
    pub fn start<F>(&mut self, create: F) -> Result<()>
    where
        F: FnOnce() -> Result<L> + Send + 'static,
    {
        if self.state == ExecutorState::Running {
            return Ok(());
        }

        let (job_tx, job_rx) = mpsc::channel::<Job<L>>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let slice = self.slice;

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut event_loop = match create() {
                    Ok(l) => {
                        let _ = ready_tx.send(Ok(()));
                        l
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        let _ = exit_tx.send(());
                        return;
                    }
                };
                debug!("run loop thread started");
                run(&mut event_loop, &job_rx, &thread_stop, slice);
                // Native objects are released here, on their owning thread.
                drop(event_loop);
                debug!("run loop thread stopped");
                let _ = exit_tx.send(());
            })?;

        self.handle = Some(handle);
        self.exited = Some(exit_rx);
        self.stop = stop;

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => {
                self.jobs = Some(job_tx);
                self.state = ExecutorState::Running;
                Ok(())
            }
            Ok(Err(e)) => {
                self.reap(START_TIMEOUT);
                self.state = ExecutorState::Stopped;
                Err(e)
            }
            Err(_) => {
                self.stop.store(true, Ordering::SeqCst);
                self.reap(START_TIMEOUT);
                self.state = ExecutorState::Stopped;
                Err(TransportError::Executor(format!(
                    "{} did not start within {:?}",
                    self.name, START_TIMEOUT
                )))
            }
        }
    }

    /// Run `f` on the loop thread and wait up to `timeout` for its result.
    ///
    /// Jobs run in submission order. A job that panics is reported as an
    /// executor error. On timeout the job may still run later; its result is
    /// discarded.
    pub fn schedule_and_wait<R, F>(&self, timeout: Duration, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut L) -> Result<R> + Send + 'static,
    {
        let jobs = match (&self.jobs, self.state) {
            (Some(jobs), ExecutorState::Running) => jobs,
            _ => {
                return Err(TransportError::Executor(format!(
                    "{} is not running",
                    self.name
                )))
            }
        };

        let (done_tx, done_rx) = mpsc::sync_channel::<Result<R>>(1);
        let job: Job<L> = Box::new(move |event_loop: &mut L| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(event_loop)))
                .unwrap_or_else(|payload| {
                    Err(TransportError::Executor(format!(
                        "scheduled job panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            let _ = done_tx.send(outcome);
        });

        jobs.send(job).map_err(|_| {
            TransportError::Executor(format!("{} has exited", self.name))
        })?;

        match done_rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout(format!(
                "{} did not run the job within {:?}",
                self.name, timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Executor(format!(
                "{} exited before running the job",
                self.name
            ))),
        }
    }

    /// Ask the loop to exit and wait up to `join_timeout` for the thread.
    /// A thread that does not exit in time is detached.
    pub fn stop(&mut self, join_timeout: Duration) {
        match self.state {
            ExecutorState::NotStarted => {
                self.state = ExecutorState::Stopped;
                return;
            }
            ExecutorState::Stopped => return,
            ExecutorState::Running | ExecutorState::Stopping => {}
        }

        self.state = ExecutorState::Stopping;
        self.stop.store(true, Ordering::SeqCst);
        self.jobs = None;
        self.reap(join_timeout);
        self.state = ExecutorState::Stopped;
    }

    fn reap(&mut self, join_timeout: Duration) {
        let exited = self
            .exited
            .take()
            .map(|rx| !matches!(rx.recv_timeout(join_timeout), Err(RecvTimeoutError::Timeout)))
            .unwrap_or(true);

        match self.handle.take() {
            Some(handle) if exited => {
                if handle.join().is_err() {
                    warn!("{} panicked during shutdown", self.name);
                }
            }
            Some(_) => warn!(
                "{} did not exit within {:?}; detaching",
                self.name, join_timeout
            ),
            None => {}
        }
    }
}

impl<L: EventLoop + 'static> Drop for RunLoopExecutor<L> {
    fn drop(&mut self) {
        self.stop(START_TIMEOUT);
    }
}

fn run<L: EventLoop>(
    event_loop: &mut L,
    jobs: &Receiver<Job<L>>,
    stop: &AtomicBool,
    slice: Duration,
) {
    while !stop.load(Ordering::SeqCst) {
        loop {
            match jobs.try_recv() {
                Ok(job) => job(event_loop),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }
        event_loop.run_for(slice);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}
