//! Execution contexts for channel handlers.
//!
//! * [`PlatformTaskQueue`] – one dedicated thread, the default for every channel.
//! * [`SerialTaskQueue`] – background, strictly FIFO, on the tokio blocking pool.
//! * [`ConcurrentTaskQueue`] – background, unordered, on the tokio blocking pool.
//!
//! Background queues are handed out as [`TaskQueueToken`]s and resolved through a
//! [`QueueRegistry`]; a queue lives exactly as long as some clone of its token.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use strum_macros::{AsRefStr, Display, EnumIter};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::MessengerError;
use crate::util::lock;

/// A unit of work handed to a queue.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum QueueKind {
    Platform,
    Serial,
    Concurrent,
}

pub trait TaskQueue: Send + Sync {
    /// Schedule `task` and return without waiting for it.
    fn dispatch(&self, task: Task);

    fn kind(&self) -> QueueKind;
}

/// Options for [`TaskQueueFactory::make_background_task_queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskQueueOptions {
    is_serial: bool,
}

impl Default for TaskQueueOptions {
    fn default() -> Self {
        Self { is_serial: true }
    }
}

impl TaskQueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// A non-serial queue runs its tasks in parallel and gives up ordering.
    pub fn serial(mut self, is_serial: bool) -> Self {
        self.is_serial = is_serial;
        self
    }

    pub fn is_serial(&self) -> bool {
        self.is_serial
    }
}

// -----------------------------------------------------------------------------
// Platform queue
// -----------------------------------------------------------------------------

/// Runs every task on one named OS thread, in submission order.
pub struct PlatformTaskQueue {
    tx: mpsc::UnboundedSender<Task>,
    thread_name: String,
}

impl PlatformTaskQueue {
    pub fn spawn(thread_name: impl Into<String>) -> Result<Self, MessengerError> {
        let thread_name = thread_name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Some(task) = rx.blocking_recv() {
                    task();
                }
                debug!("platform queue worker exiting");
            })?;
        Ok(Self { tx, thread_name })
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }
}

impl TaskQueue for PlatformTaskQueue {
    fn dispatch(&self, task: Task) {
        // A dropped task still releases its message and answers its reply.
        if self.tx.send(task).is_err() {
            error!(thread = %self.thread_name, "platform queue worker has stopped; dropping task");
        }
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Platform
    }
}

impl fmt::Debug for PlatformTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformTaskQueue")
            .field("thread_name", &self.thread_name)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Background queues
// -----------------------------------------------------------------------------

/// Strictly serial queue multiplexed onto the tokio blocking pool.
///
/// At most one drain job exists per queue. The job runs tasks until the queue is
/// empty, so a slow task only delays tasks behind it on this queue.
pub struct SerialTaskQueue {
    state: Arc<SerialState>,
}

struct SerialState {
    handle: Handle,
    tasks: Mutex<VecDeque<Task>>,
    running: AtomicBool,
}

impl SerialTaskQueue {
    pub fn new(handle: Handle) -> Self {
        Self {
            state: Arc::new(SerialState {
                handle,
                tasks: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
            }),
        }
    }
}

impl SerialState {
    fn flush(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let job = DrainJob {
            state: Arc::clone(self),
            started: false,
        };
        drop(self.handle.spawn_blocking(move || job.run()));
    }

    /// Clear the running flag and start a new job for tasks that slipped in
    /// after the last pop.
    fn finish(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        let pending = !lock(&self.tasks).is_empty();
        if pending {
            self.flush();
        }
    }
}

/// The one drain job of a serial queue.
///
/// Dropping it ends the job, whether it finished, panicked, or was discarded
/// unrun by a runtime that is shutting down. An unrun job takes the queued
/// tasks down with it so their drop guards still fire.
struct DrainJob {
    state: Arc<SerialState>,
    started: bool,
}

impl DrainJob {
    fn run(mut self) {
        self.started = true;
        loop {
            let next = lock(&self.state.tasks).pop_front();
            match next {
                Some(task) => task(),
                None => break,
            }
        }
    }
}

impl Drop for DrainJob {
    fn drop(&mut self) {
        if self.started {
            self.state.finish();
            return;
        }
        let state = Arc::clone(&self.state);
        reap_off_thread(move || {
            let abandoned: Vec<Task> = lock(&state.tasks).drain(..).collect();
            if !abandoned.is_empty() {
                warn!(count = abandoned.len(), "serial queue job never ran; dropping its tasks");
            }
            drop(abandoned);
            state.finish();
        });
    }
}

/// Run `reap` on a thread of its own. Tokio discards blocking jobs spawned after
/// shutdown while holding its pool lock, so what they drop must not run there.
fn reap_off_thread(reap: impl FnOnce() + Send + 'static) {
    if let Err(err) = std::thread::Builder::new()
        .name("queue-reaper".to_owned())
        .spawn(reap)
    {
        error!(%err, "could not spawn a thread to drop discarded tasks");
    }
}

impl TaskQueue for SerialTaskQueue {
    fn dispatch(&self, task: Task) {
        lock(&self.state.tasks).push_back(task);
        self.state.flush();
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Serial
    }
}

/// Hands every task straight to the tokio blocking pool.
pub struct ConcurrentTaskQueue {
    handle: Handle,
}

impl ConcurrentTaskQueue {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

/// A task on its way to the blocking pool. Dropped unrun, it drops the task off
/// the pool's thread.
struct BlockingJob(Option<Task>);

impl Drop for BlockingJob {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            reap_off_thread(move || drop(task));
        }
    }
}

impl TaskQueue for ConcurrentTaskQueue {
    fn dispatch(&self, task: Task) {
        let job = BlockingJob(Some(task));
        drop(self.handle.spawn_blocking(move || {
            let mut job = job;
            if let Some(task) = job.0.take() {
                task();
            }
        }));
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Concurrent
    }
}

pub trait TaskQueueFactory: Send + Sync {
    fn make_background_task_queue(&self, options: TaskQueueOptions) -> Arc<dyn TaskQueue>;
}

/// Builds background queues on a tokio runtime's blocking pool.
#[derive(Clone, Debug)]
pub struct DefaultTaskQueueFactory {
    handle: Handle,
}

impl DefaultTaskQueueFactory {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime the caller is running in.
    pub fn current() -> Result<Self, MessengerError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| MessengerError::NoRuntime)
    }
}

impl TaskQueueFactory for DefaultTaskQueueFactory {
    fn make_background_task_queue(&self, options: TaskQueueOptions) -> Arc<dyn TaskQueue> {
        if options.is_serial() {
            Arc::new(SerialTaskQueue::new(self.handle.clone()))
        } else {
            Arc::new(ConcurrentTaskQueue::new(self.handle.clone()))
        }
    }
}

// -----------------------------------------------------------------------------
// Tokens
// -----------------------------------------------------------------------------

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

type QueueTable = DashMap<u64, Arc<dyn TaskQueue>>;

/// Names a background queue created by one messenger.
///
/// Clones share identity. When the last clone drops, the queue is unregistered
/// and its worker can wind down.
#[derive(Clone)]
pub struct TaskQueueToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    id: u64,
    table: Weak<QueueTable>,
}

impl TaskQueueToken {
    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl PartialEq for TaskQueueToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TaskQueueToken {}

impl fmt::Debug for TaskQueueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueueToken").field("id", &self.inner.id).finish()
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            if table.remove(&self.id).is_some() {
                debug!(token = self.id, "background task queue released");
            }
        }
    }
}

/// Token → queue table owned by one messenger.
#[derive(Default)]
pub struct QueueRegistry {
    table: Arc<QueueTable>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, queue: Arc<dyn TaskQueue>) -> TaskQueueToken {
        let id = NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed);
        self.table.insert(id, queue);
        TaskQueueToken {
            inner: Arc::new(TokenInner {
                id,
                table: Arc::downgrade(&self.table),
            }),
        }
    }

    /// `None` for tokens minted by another registry.
    pub fn resolve(&self, token: &TaskQueueToken) -> Option<Arc<dyn TaskQueue>> {
        if !Weak::ptr_eq(&token.inner.table, &Arc::downgrade(&self.table)) {
            return None;
        }
        self.table
            .get(&token.inner.id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
