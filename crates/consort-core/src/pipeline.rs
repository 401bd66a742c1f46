//! Staged asynchronous command pipeline.
//!
//! A command is issued on the audio thread, does its blocking work on a
//! worker thread (stage 2), optionally comes back to the audio thread to
//! publish the result (stage 3), and is released on a worker thread
//! (stage 4):
//!
//! ```text
//! submit ──► [worker] stage 2 ──► [audio] stage 3 ──► [worker] stage 4 + drop
//!                  │ returns false                          ▲
//!                  └────────────────────────────────────────┘
//! ```
//!
//! The owner of a command (a plugin session) may be torn down while the
//! command is in flight. Stage 3 only runs while the owner reports itself
//! alive; otherwise it is skipped and the command goes straight to stage 4.

use crate::rt::RtToken;
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Something a command can belong to.
pub trait Liveness: Send + Sync + 'static {
    /// False once the owner has begun destruction.
    fn is_alive(&self) -> bool;
}

/// Owner type for commands that do not reference-count any owner.
///
/// Used when the owner is itself being destroyed and only needs some
/// resource (e.g. a plugin instance) released off the audio thread.
#[derive(Debug, Default)]
pub struct Detached;

impl Liveness for Detached {
    fn is_alive(&self) -> bool {
        true
    }
}

/// Result of a stage-3 call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// Run stage 3 again on the next [`CommandPipeline::run_rt`] call
    /// (e.g. a try-lock failed).
    Retry,
}

pub type Stage2<O, T> = fn(Option<&O>, &mut T) -> bool;
pub type Stage3<O, T> = fn(&RtToken, Option<&O>, &mut T) -> Completion;
pub type Stage4<O, T> = fn(Option<&O>, &mut T);

/// A command under construction. Build it, then hand it to [`CommandPipeline::submit`].
pub struct AsyncCommand<O: Liveness, T: Send + 'static> {
    name: &'static str,
    owner: Option<Arc<O>>,
    data: T,
    stage2: Stage2<O, T>,
    stage3: Option<Stage3<O, T>>,
    stage4: Option<Stage4<O, T>>,
}

fn noop_stage2<O, T>(_owner: Option<&O>, _data: &mut T) -> bool {
    true
}

impl<O: Liveness, T: Send + 'static> AsyncCommand<O, T> {
    /// Command holding a strong reference to its owner.
    pub fn new(name: &'static str, owner: Arc<O>, data: T) -> Self {
        Self {
            name,
            owner: Some(owner),
            data,
            stage2: noop_stage2::<O, T>,
            stage3: None,
            stage4: None,
        }
    }

    /// Non-worker stage: blocking work. Returns whether stage 3 should run.
    pub fn stage2(mut self, f: Stage2<O, T>) -> Self {
        self.stage2 = f;
        self
    }

    /// Audio-thread completion stage.
    pub fn stage3(mut self, f: Stage3<O, T>) -> Self {
        self.stage3 = Some(f);
        self
    }

    /// Final release stage, always run exactly once.
    pub fn stage4(mut self, f: Stage4<O, T>) -> Self {
        self.stage4 = Some(f);
        self
    }
}

impl<T: Send + 'static> AsyncCommand<Detached, T> {
    /// Command without an owner.
    pub fn detached(name: &'static str, data: T) -> Self {
        Self {
            name,
            owner: None,
            data,
            stage2: noop_stage2::<Detached, T>,
            stage3: None,
            stage4: None,
        }
    }
}

/// Type-erased view of a command as it travels between threads.
trait Staged: Send {
    fn name(&self) -> &'static str;
    fn run_stage2(&mut self) -> bool;
    fn run_stage3(&mut self, rt: &RtToken) -> Completion;
    fn run_stage4(&mut self);
}

impl<O: Liveness, T: Send + 'static> Staged for AsyncCommand<O, T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run_stage2(&mut self) -> bool {
        let stage2 = self.stage2;
        let owner = self.owner.as_deref();
        let data = &mut self.data;
        match catch_unwind(AssertUnwindSafe(|| stage2(owner, data))) {
            Ok(cont) => cont && self.stage3.is_some(),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("command '{}' failed in stage 2: {}", self.name, reason);
                // Stage 3 still runs so it can report the failure.
                self.stage3.is_some()
            }
        }
    }

    fn run_stage3(&mut self, rt: &RtToken) -> Completion {
        let Some(stage3) = self.stage3 else {
            return Completion::Done;
        };
        if let Some(owner) = &self.owner {
            if !owner.is_alive() {
                tracing::debug!("command '{}': owner is gone, skipping stage 3", self.name);
                return Completion::Done;
            }
        }
        stage3(rt, self.owner.as_deref(), &mut self.data)
    }

    fn run_stage4(&mut self) {
        if let Some(stage4) = self.stage4 {
            stage4(self.owner.as_deref(), &mut self.data);
        }
    }
}

type BoxedCommand = Box<dyn Staged>;

enum Job {
    Stage2(BoxedCommand),
    Stage4(BoxedCommand),
    Shutdown,
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of worker threads. With 0 workers the host drives the
    /// non-real-time side itself through [`CommandPipeline::run_nrt`].
    pub worker_threads: usize,
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    QueueFull,
    ShutDown,
}

struct Shared {
    nrt_tx: Sender<Job>,
    nrt_rx: Receiver<Job>,
    rt_queue: ArrayQueue<BoxedCommand>,
    /// Commands whose stage 3 asked for another block. Audio thread only.
    rt_retry: ArrayQueue<BoxedCommand>,
    /// Commands past stage 3 waiting for room in the worker queue.
    /// Audio thread only; stage 3 never runs again for these.
    release: ArrayQueue<BoxedCommand>,
    in_flight: AtomicUsize,
}

impl Shared {
    /// Stage 2 and the hand-off that follows it. Runs on a worker.
    fn process_stage2(&self, mut cmd: BoxedCommand) {
        if cmd.run_stage2() {
            self.push_rt(cmd);
        } else {
            self.finish(cmd);
        }
    }

    fn finish(&self, mut cmd: BoxedCommand) {
        cmd.run_stage4();
        tracing::trace!("command '{}' finished", cmd.name());
        drop(cmd);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn push_rt(&self, cmd: BoxedCommand) {
        let mut cmd = cmd;
        loop {
            match self.rt_queue.push(cmd) {
                Ok(()) => return,
                Err(back) => {
                    // audio thread is behind; wait for it to drain
                    cmd = back;
                    thread::sleep(Duration::from_micros(250));
                }
            }
        }
    }

    fn handle(&self, job: Job) -> bool {
        match job {
            Job::Stage2(cmd) => self.process_stage2(cmd),
            Job::Stage4(cmd) => self.finish(cmd),
            Job::Shutdown => return false,
        }
        true
    }
}

/// The staged command runner.
pub struct CommandPipeline {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl CommandPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (nrt_tx, nrt_rx) = crossbeam_channel::bounded(capacity);
        let shared = Arc::new(Shared {
            nrt_tx,
            nrt_rx,
            rt_queue: ArrayQueue::new(capacity),
            rt_retry: ArrayQueue::new(capacity),
            release: ArrayQueue::new(capacity),
            in_flight: AtomicUsize::new(0),
        });

        let workers = (0..config.worker_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("consort-nrt-{}", i))
                    .spawn(move || {
                        while let Ok(job) = shared.nrt_rx.recv() {
                            if !shared.handle(job) {
                                break;
                            }
                        }
                    })
                    .expect("failed to spawn pipeline worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    /// Queue a command for stage 2. Callable from the audio thread.
    ///
    /// On refusal the command is released right away (its stage 4 runs on the
    /// calling thread).
    pub fn submit<O: Liveness, T: Send + 'static>(
        &self,
        cmd: AsyncCommand<O, T>,
    ) -> Result<(), SubmitError> {
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        match self.shared.nrt_tx.try_send(Job::Stage2(Box::new(cmd))) {
            Ok(()) => Ok(()),
            Err(err) => {
                let (job, reason) = match err {
                    TrySendError::Full(job) => (job, SubmitError::QueueFull),
                    TrySendError::Disconnected(job) => (job, SubmitError::ShutDown),
                };
                if let Job::Stage2(cmd) = job {
                    tracing::warn!("command '{}' refused: {:?}", cmd.name(), reason);
                    self.shared.finish(cmd);
                }
                Err(reason)
            }
        }
    }

    /// Run pending stage-3 completions. Call once per audio block.
    ///
    /// Commands held back for release from an earlier block go to the workers
    /// first. A command whose release cannot be queued waits in its own queue,
    /// so stage 3 runs at most once per command.
    ///
    /// Returns the number of commands completed.
    pub fn run_rt(&self, rt: &RtToken) -> usize {
        let shared = &*self.shared;
        while let Some(cmd) = shared.release.pop() {
            if let Err(err) = shared.nrt_tx.try_send(Job::Stage4(cmd)) {
                if let Job::Stage4(cmd) = err.into_inner() {
                    // popped above, so the slot is free
                    let _ = shared.release.push(cmd);
                }
                break;
            }
        }

        let retries = shared.rt_retry.len();
        let pending = shared.rt_queue.len();
        let mut completed = 0;
        for i in 0..retries + pending {
            // Every stage 3 ends in one of these two queues; stop while either is full.
            if shared.release.is_full() || (i >= retries && shared.rt_retry.is_full()) {
                break;
            }
            let next = if i < retries {
                shared.rt_retry.pop()
            } else {
                shared.rt_queue.pop()
            };
            let Some(mut cmd) = next else {
                continue;
            };
            match cmd.run_stage3(rt) {
                Completion::Done => {
                    completed += 1;
                    if let Err(err) = shared.nrt_tx.try_send(Job::Stage4(cmd)) {
                        if let Job::Stage4(cmd) = err.into_inner() {
                            let _ = shared.release.push(cmd);
                        }
                    }
                }
                Completion::Retry => {
                    let _ = shared.rt_retry.push(cmd);
                }
            }
        }
        completed
    }

    /// Drain queued non-real-time jobs on the calling thread.
    ///
    /// This is how a host without worker threads (and the tests) drives stages 2 and 4.
    pub fn run_nrt(&self) -> usize {
        let mut handled = 0;
        while let Ok(job) = self.shared.nrt_rx.try_recv() {
            handled += 1;
            if !self.shared.handle(job) {
                break;
            }
        }
        handled
    }

    /// Commands submitted but not yet released.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Block until every command has been released, pumping stage 3 on the
    /// calling thread. For hosts running without an audio thread (offline
    /// rendering, tests).
    pub fn wait_idle(&self, rt: &RtToken, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            if self.workers.is_empty() {
                self.run_nrt();
            }
            self.run_rt(rt);
            thread::sleep(Duration::from_micros(200));
        }
        true
    }
}

impl Default for CommandPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl Drop for CommandPipeline {
    fn drop(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.shared.nrt_tx.send(Job::Shutdown);
        }
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            // the last owner reference may be released by a worker itself
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        // Release whatever is still parked between stages.
        while let Ok(job) = self.shared.nrt_rx.try_recv() {
            match job {
                Job::Stage2(cmd) | Job::Stage4(cmd) => self.shared.finish(cmd),
                Job::Shutdown => {}
            }
        }
        let parked = [
            &self.shared.rt_queue,
            &self.shared.rt_retry,
            &self.shared.release,
        ];
        for queue in parked {
            while let Some(cmd) = queue.pop() {
                self.shared.finish(cmd);
            }
        }
    }
}
