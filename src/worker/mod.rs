//! Worker runtime.
//!
//! A fixed pool of single-threaded event-loop workers. Each worker is an OS
//! thread running a current-thread tokio runtime with a `LocalSet`: all
//! session state on a worker is `!Send`, so the compiler enforces that no
//! session is ever touched from another thread. The only cross-worker
//! channels are the per-worker message queue and the shared read-mostly
//! snapshots.
//!
//! Alongside the message queue each worker owns a wheel of delayed calls, a
//! registry of raw file descriptors and a load meter.

pub mod clock;
pub mod load;
pub mod wheel;

pub use load::{LoadMeter, LoadSnapshot, SlidingAverage};
pub use wheel::{Action, DelayedCallId, DelayedFn, Wheel};

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::{Interest, Ready};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The timer is re-armed at least this often even when no delayed call is
/// due sooner
const TIMER_GRANULARITY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a task posted to a worker should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteMode {
    /// Run inline; only valid on the owning worker thread
    Direct,
    /// Post to the worker's message queue
    Queued,
    /// Direct iff the caller is the owning worker, Queued otherwise
    Auto,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("file descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),
    #[error("reactor error: {0}")]
    Reactor(String),
    #[error("queued call from the owning worker would deadlock")]
    WouldBlock,
    #[error("direct execution requires the owning worker thread")]
    NotOnWorker,
    #[error("worker is shutting down")]
    ShuttingDown,
}

/// Counting semaphore with blocking wait; the only wait offered to task
/// submitters is wait-with-timeout, so a timed-out submitter must assume
/// the task still runs later.
#[derive(Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        *self.count.lock() += 1;
        self.cv.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cv.wait(&mut count);
        }
        *count -= 1;
    }

    /// Returns false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cv.wait_until(&mut count, deadline).timed_out() {
                return false;
            }
        }
        *count -= 1;
        true
    }
}

type Task = Box<dyn FnOnce(&Rc<WorkerCore>) + Send>;

struct Message {
    task: Task,
    sem: Option<Arc<Semaphore>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<WorkerCore>>> = const { RefCell::new(None) };
}

/// The worker-local core, reachable by every task and session running on
/// the worker
pub struct WorkerCore {
    id: WorkerId,
    wheel: RefCell<Wheel>,
    fds: RefCell<HashMap<RawFd, CancellationToken>>,
    tick_hooks: RefCell<Vec<Box<dyn FnMut()>>>,
    /// Worker-owned service state (pools, caches), installed at startup
    service_state: RefCell<Option<Rc<dyn std::any::Any>>>,
    wake: Notify,
    shutdown: CancellationToken,
    load_shared: Arc<Mutex<LoadSnapshot>>,
}

impl WorkerCore {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The core of the worker the caller is running on, if any
    pub fn current() -> Option<Rc<WorkerCore>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Token cancelled when the worker shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Schedule `f` to run `delay` from now, repeating every `delay` while
    /// it returns true. A call that overruns its period fires next
    /// immediately instead of accumulating missed fires.
    pub fn delayed_call(
        &self,
        delay: Duration,
        f: impl FnMut(Action) -> bool + 'static,
    ) -> DelayedCallId {
        let id = self
            .wheel
            .borrow_mut()
            .insert(clock::now(), delay, Box::new(f));
        // The loop may be waiting on an older, later deadline
        self.wake.notify_one();
        id
    }

    /// Cancel a delayed call. Synchronous: `f(Cancel)` has been invoked
    /// exactly once when this returns true.
    pub fn cancel_delayed_call(&self, id: DelayedCallId) -> bool {
        let cancelled = self.wheel.borrow_mut().cancel(id);
        match cancelled {
            Some(mut f) => {
                f(Action::Cancel);
                true
            }
            None => false,
        }
    }

    /// Register a readiness-driven I/O source owned by this worker. The
    /// handler runs on the worker thread only and must consume readiness
    /// until it would block.
    pub fn add_fd<T: AsRawFd + 'static>(
        self: &Rc<Self>,
        io: T,
        interest: Interest,
        mut handler: impl FnMut(&T, Ready) + 'static,
    ) -> Result<RawFd, WorkerError> {
        let fd = io.as_raw_fd();
        if self.fds.borrow().contains_key(&fd) {
            return Err(WorkerError::AlreadyRegistered(fd));
        }

        let afd = AsyncFd::with_interest(io, interest)
            .map_err(|e| WorkerError::Reactor(e.to_string()))?;

        let token = self.shutdown.child_token();
        self.fds.borrow_mut().insert(fd, token.clone());

        let worker = self.id;
        tokio::task::spawn_local(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    ready = afd.ready(interest) => match ready {
                        Ok(mut guard) => {
                            handler(afd.get_ref(), guard.ready());
                            guard.clear_ready();
                        }
                        Err(e) => {
                            debug!(worker = %worker, fd, error = %e, "fd wait failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(fd)
    }

    /// Deregister an fd added with `add_fd`; the I/O source is dropped
    pub fn remove_fd(&self, fd: RawFd) -> bool {
        match self.fds.borrow_mut().remove(&fd) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run `f` at the end of every loop iteration
    pub fn add_tick_hook(&self, f: impl FnMut() + 'static) {
        self.tick_hooks.borrow_mut().push(Box::new(f));
    }

    /// Install the worker's service state; everything sessions share on
    /// this worker (pools, classification cache) lives in it
    pub fn set_service_state<T: 'static>(&self, state: Rc<T>) {
        *self.service_state.borrow_mut() = Some(state);
    }

    pub fn service_state<T: 'static>(&self) -> Option<Rc<T>> {
        self.service_state
            .borrow()
            .clone()
            .and_then(|any| any.downcast::<T>().ok())
    }
}

/// Cloneable, Send handle to a worker
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    tx: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    load: Arc<Mutex<LoadSnapshot>>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// True when the caller is running on this worker's thread
    pub fn is_current(&self) -> bool {
        CURRENT.with(|c| c.borrow().as_ref().map(|core| core.id) == Some(self.id))
    }

    pub fn load(&self) -> LoadSnapshot {
        *self.load.lock()
    }

    /// Run a task on the worker. An optional semaphore is posted after the
    /// task returns.
    pub fn execute(
        &self,
        f: impl FnOnce(&Rc<WorkerCore>) + Send + 'static,
        mode: ExecuteMode,
        sem: Option<Arc<Semaphore>>,
    ) -> Result<(), WorkerError> {
        let mode = match mode {
            ExecuteMode::Auto if self.is_current() => ExecuteMode::Direct,
            ExecuteMode::Auto => ExecuteMode::Queued,
            other => other,
        };

        match mode {
            ExecuteMode::Direct => {
                if !self.is_current() {
                    return Err(WorkerError::NotOnWorker);
                }
                let core = WorkerCore::current().ok_or(WorkerError::NotOnWorker)?;
                f(&core);
                if let Some(sem) = sem {
                    sem.post();
                }
                Ok(())
            }
            _ => {
                if self.shutdown.is_cancelled() {
                    return Err(WorkerError::ShuttingDown);
                }
                self.tx
                    .send(Message {
                        task: Box::new(f),
                        sem,
                    })
                    .map_err(|_| WorkerError::ShuttingDown)
            }
        }
    }

    /// Run a task on the worker and block until it has completed. Queued
    /// mode from the owning worker itself would never complete and is
    /// rejected.
    pub fn call(
        &self,
        f: impl FnOnce(&Rc<WorkerCore>) + Send + 'static,
        mode: ExecuteMode,
    ) -> Result<(), WorkerError> {
        if self.is_current() {
            return match mode {
                ExecuteMode::Queued => Err(WorkerError::WouldBlock),
                _ => self.execute(f, ExecuteMode::Direct, None),
            };
        }

        let sem = Arc::new(Semaphore::new());
        self.execute(f, ExecuteMode::Queued, Some(sem.clone()))?;
        sem.wait();
        Ok(())
    }

    /// Spawn an async session pinned to this worker. The future is built on
    /// the worker thread, so it may freely hold worker-local state.
    pub fn spawn<F, Fut>(&self, f: F) -> Result<(), WorkerError>
    where
        F: FnOnce(Rc<WorkerCore>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.execute(
            move |core| {
                tokio::task::spawn_local(f(core.clone()));
            },
            ExecuteMode::Queued,
            None,
        )
    }

    /// Cancel a delayed call from any thread; blocks until the
    /// cancellation callback has run
    pub fn cancel_delayed_call(&self, id: DelayedCallId) -> Result<bool, WorkerError> {
        if self.is_current() {
            let core = WorkerCore::current().ok_or(WorkerError::NotOnWorker)?;
            return Ok(core.cancel_delayed_call(id));
        }

        let result = Arc::new(Mutex::new(false));
        let out = result.clone();
        self.call(
            move |core| {
                *out.lock() = core.cancel_delayed_call(id);
            },
            ExecuteMode::Queued,
        )?;
        let cancelled = *result.lock();
        Ok(cancelled)
    }

    /// Signal-safe shutdown request: set the flag and wake the loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        // A no-op message doubles as the wake-up byte
        let _ = self.tx.send(Message {
            task: Box::new(|_| {}),
            sem: None,
        });
    }
}

/// An owned worker thread
pub struct Worker {
    handle: WorkerHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Start a worker. `max_events` bounds how many queued messages one
    /// loop iteration dispatches before delayed calls get a chance to run.
    pub fn spawn(id: WorkerId, max_events: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let load = Arc::new(Mutex::new(LoadSnapshot::default()));

        let handle = WorkerHandle {
            id,
            tx,
            shutdown: shutdown.clone(),
            load: load.clone(),
        };

        let thread = thread::Builder::new()
            .name(format!("worker-{}", id.0))
            .spawn(move || worker_main(id, rx, shutdown, load, max_events))?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Request shutdown and wait for the thread to exit
    pub fn join(mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_main(
    id: WorkerId,
    rx: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
    load: Arc<Mutex<LoadSnapshot>>,
    max_events: usize,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker = %id, error = %e, "Failed to build worker runtime");
            return;
        }
    };

    let core = Rc::new(WorkerCore {
        id,
        wheel: RefCell::new(Wheel::new()),
        fds: RefCell::new(HashMap::new()),
        tick_hooks: RefCell::new(Vec::new()),
        service_state: RefCell::new(None),
        wake: Notify::new(),
        shutdown,
        load_shared: load,
    });

    CURRENT.with(|c| *c.borrow_mut() = Some(core.clone()));
    debug!(worker = %id, "Worker started");

    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(event_loop(core.clone(), rx, max_events)));

    CURRENT.with(|c| c.borrow_mut().take());
    info!(worker = %id, "Worker stopped");
}

async fn event_loop(
    core: Rc<WorkerCore>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    max_events: usize,
) {
    let mut meter = LoadMeter::new(clock::update_tick());
    let mut busy_since = clock::now();

    loop {
        let now = clock::update_tick();

        // Next timer deadline, bounded by the 1 s granularity
        let next_due = core.wheel.borrow_mut().next_due();
        let deadline = match next_due {
            Some(due) => due.min(now + TIMER_GRANULARITY),
            None => now + TIMER_GRANULARITY,
        };

        // Entering the wait: account the time spent outside it
        meter.record(now.saturating_duration_since(busy_since), now);
        *core.load_shared.lock() = meter.snapshot();

        tokio::select! {
            biased;
            _ = core.shutdown.cancelled() => {
                drain_messages(&core, &mut rx, usize::MAX);
                break;
            }
            _ = core.wake.notified() => {}
            message = rx.recv() => {
                busy_since = clock::update_tick();
                match message {
                    Some(message) => {
                        run_message(&core, message);
                        drain_messages(&core, &mut rx, max_events.saturating_sub(1));
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(deadline.into()) => {}
        }
        busy_since = clock::update_tick();

        fire_due_calls(&core);
        run_tick_hooks(&core);
    }
}

fn run_message(core: &Rc<WorkerCore>, message: Message) {
    (message.task)(core);
    if let Some(sem) = message.sem {
        sem.post();
    }
}

fn drain_messages(core: &Rc<WorkerCore>, rx: &mut mpsc::UnboundedReceiver<Message>, limit: usize) {
    for _ in 0..limit {
        match rx.try_recv() {
            Ok(message) => run_message(core, message),
            Err(_) => break,
        }
    }
}

fn fire_due_calls(core: &Rc<WorkerCore>) {
    loop {
        let due = core.wheel.borrow_mut().pop_due(clock::now());
        let Some(mut call) = due else { break };

        // The call is out of the wheel while it runs; callbacks may use
        // the wheel freely
        if (call.f)(Action::Execute) {
            core.wheel.borrow_mut().reinsert(call, clock::now());
        }
    }
}

fn run_tick_hooks(core: &Rc<WorkerCore>) {
    let mut hooks = core.tick_hooks.take();
    for hook in hooks.iter_mut() {
        hook();
    }
    let mut cell = core.tick_hooks.borrow_mut();
    let added = std::mem::take(&mut *cell);
    *cell = hooks;
    cell.extend(added);
}
