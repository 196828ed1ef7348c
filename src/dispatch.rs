//! Single-threaded execution context.
//!
//! All channels share one [`Dispatcher`], which is passed explicitly at
//! construction. It owns a current-thread Tokio runtime and a [`LocalSet`]:
//! posted tasks are local tasks that run in posting order, and delayed tasks
//! are local tasks that sleep until their deadline. The runtime clock is
//! paused by default, so tests move time forward with [`Dispatcher::advance`]
//! and Tokio fires every timer that becomes due in deadline order.
//! [`Dispatcher::with_system_clock`] ties the clock to the system time for
//! [`Dispatcher::run`].
//!
//! [`Dispatcher::run_until_idle`], [`Dispatcher::advance`], and
//! [`Dispatcher::run`] block on the runtime and must not be called from a
//! dispatcher task or from another runtime's async context.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, LocalSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Shared handle to a single-threaded task queue with timers.
#[derive(Clone)]
#[must_use]
pub struct Dispatcher(Rc<Inner>);

struct Inner {
    // Tasks must be dropped before the runtime that drives their timers
    local: LocalSet,
    rt: Runtime,
    start: Instant,
    next_id: Cell<u64>,
    /// Posted tasks that have not started.
    ready: Cell<usize>,
    /// Number of tasks that were started.
    ran: Cell<usize>,
    timers: RefCell<HashMap<TimerId, Timer>>,
    panic: RefCell<Option<Box<dyn Any + Send>>>,
    panicked: Notify,
}

struct Timer {
    deadline: Instant,
    task: JoinHandle<()>,
}

/// Identifier of a delayed task.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimerId(u64);

impl Dispatcher {
    /// Creates a new dispatcher with a paused clock at zero. Time only moves
    /// forward through [`Self::advance`] or, while [`Self::run`] is waiting
    /// for a timer, by jumping to the timer's deadline.
    #[inline]
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Creates a new dispatcher that follows the system clock.
    #[inline]
    pub fn with_system_clock() -> Self {
        Self::build(false)
    }

    fn build(paused: bool) -> Self {
        let rt = (Builder::new_current_thread().enable_time())
            .start_paused(paused)
            .build()
            .expect("failed to create dispatcher runtime");
        let start = {
            let _rt = rt.enter();
            Instant::now()
        };
        Self(Rc::new(Inner {
            local: LocalSet::new(),
            rt,
            start,
            next_id: Cell::new(0),
            ready: Cell::new(0),
            ran: Cell::new(0),
            timers: RefCell::default(),
            panic: RefCell::default(),
            panicked: Notify::new(),
        }))
    }

    /// Returns the time elapsed since the dispatcher was created.
    #[inline]
    #[must_use]
    pub fn now(&self) -> Duration {
        self.0.clock().saturating_duration_since(self.0.start)
    }

    /// Schedules `f` to run after all previously posted tasks.
    pub fn post(&self, f: impl FnOnce() + 'static) {
        let inner = &self.0;
        inner.ready.set(inner.ready.get() + 1);
        let weak = Rc::downgrade(inner);
        let _local = inner.local.enter();
        inner.local.spawn_local(async move {
            if let Some(inner) = weak.upgrade() {
                inner.ready.set(inner.ready.get() - 1);
                inner.start_task(f);
            }
        });
    }

    /// Schedules `f` to run once `delay` has elapsed.
    pub fn post_delayed(&self, delay: Duration, f: impl FnOnce() + 'static) -> TimerId {
        let inner = &self.0;
        let id = TimerId(inner.next_id.get());
        inner.next_id.set(id.0 + 1);
        let now = inner.clock();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);
        let weak = Rc::downgrade(inner);
        let _local = inner.local.enter();
        let task = inner.local.spawn_local(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = weak.upgrade() else { return };
            // A canceled timer may already be due
            if inner.timers.borrow_mut().remove(&id).is_none() {
                return;
            }
            inner.start_task(f);
        });
        inner.timers.borrow_mut().insert(id, Timer { deadline, task });
        trace!("Timer {id:?} armed for {delay:?}");
        id
    }

    /// Cancels a delayed task. Returns `false` if the task already ran or was
    /// canceled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let t = self.0.timers.borrow_mut().remove(&id);
        t.map_or(false, |t| {
            t.task.abort();
            true
        })
    }

    /// Returns whether there are no ready tasks and no armed timers.
    #[inline]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.0.ready.get() == 0 && self.0.timers.borrow().is_empty()
    }

    /// Returns the number of armed timers.
    #[inline]
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.0.timers.borrow().len()
    }

    /// Runs ready tasks, including any that they post, until the queue is
    /// empty. The clock does not move. Returns the number of tasks executed.
    pub fn run_until_idle(&self) -> usize {
        self.block_on(self.0.settle())
    }

    /// Moves the clock forward by `by`, firing every timer that becomes due
    /// and running ready tasks after each one. Returns the number of tasks
    /// executed.
    pub fn advance(&self, by: Duration) -> usize {
        let now = self.0.clock();
        let until = now.checked_add(by).unwrap_or(now + FAR_FUTURE);
        self.block_on(async {
            self.0.settle().await;
            tokio::time::sleep_until(until).await;
            self.0.settle().await;
        })
    }

    /// Executes tasks and timers until `cancel` is triggered.
    pub fn run(&self, cancel: &CancellationToken) {
        debug!("Dispatcher started");
        self.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.0.panicked.notified() => {}
            }
        });
        debug!("Dispatcher stopped");
    }

    /// Drives the local tasks until `f` completes and returns the number of
    /// tasks started. A panic from any task resumes here.
    fn block_on<T>(&self, f: impl Future<Output = T>) -> usize {
        let inner = &self.0;
        let ran = inner.ran.get();
        inner.rt.block_on(inner.local.run_until(f));
        let p = inner.panic.borrow_mut().take();
        if let Some(p) = p {
            panic::resume_unwind(p);
        }
        inner.ran.get().wrapping_sub(ran)
    }
}

/// Deadline offset used when a delay overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

impl Inner {
    /// Returns the runtime clock.
    #[inline]
    fn clock(&self) -> Instant {
        let _rt = self.rt.enter();
        Instant::now()
    }

    /// Runs a task, capturing its panic for the caller that drives the
    /// dispatcher.
    fn start_task(&self, f: impl FnOnce()) {
        self.ran.set(self.ran.get() + 1);
        if let Err(p) = panic::catch_unwind(AssertUnwindSafe(f)) {
            error!("Dispatcher task panicked");
            let mut slot = self.panic.borrow_mut();
            if slot.is_none() {
                *slot = Some(p);
                self.panicked.notify_waiters();
            }
        }
    }

    /// Yields to the local tasks until no posted task is waiting and no timer
    /// is due.
    async fn settle(&self) {
        loop {
            let now = Instant::now();
            let due = (self.timers.borrow().values()).any(|t| t.deadline <= now);
            if self.ready.get() == 0 && !due {
                return;
            }
            tokio::task::yield_now().await;
        }
    }
}

impl Default for Dispatcher {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("now", &self.now())
            .field("ready", &self.0.ready.get())
            .field("timers", &self.0.timers.borrow().len())
            .finish()
    }
}
