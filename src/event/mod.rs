mod config;
mod executor;
mod promise;
mod trace;

pub use self::{
    config::{Config, ConfigBuilder, FastPathPolicy},
    executor::{CrossThreadFulfiller, Executor},
    promise::{promise_and_fulfiller, Fulfiller, Promise},
    trace::TraceBuilder,
};
pub(crate) use self::{executor::cross_thread_pair, promise::PromiseNode};

use crate::{bridge::LoopToken, error::Error, Result};
use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    mem,
    rc::{Rc, Weak},
    sync::Arc,
};

/// Something the event loop can fire once it has been armed.
pub(crate) trait Event {
    fn fire(self: Rc<Self>);
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LoopStats {
    pub turns: u64,
    pub events_fired: u64,
    /// Cross-thread settlements delivered to a promise that was still waiting.
    pub cross_thread_wakes: u64,
    pub cross_thread_pairs: u64,
}

pub(crate) struct LoopInner {
    pub config: Config,
    pub executor: Arc<Executor>,
    queue: RefCell<VecDeque<Weak<dyn Event>>>,
    channels: RefCell<HashMap<u64, Weak<dyn Event>>>,
    running: Cell<bool>,
    stats: Cell<LoopStats>,
}

impl LoopInner {
    fn with_tls<F>(f: impl FnOnce(&mut Option<Rc<Self>>) -> F) -> F {
        thread_local!(static TLS: RefCell<Option<Rc<LoopInner>>> = RefCell::new(None));
        TLS.with(|ref_cell| f(&mut *ref_cell.borrow_mut()))
    }

    pub fn try_current() -> Option<Rc<Self>> {
        Self::with_tls(|tls| tls.as_ref().map(Rc::clone))
    }

    pub fn current(what: &str) -> Rc<Self> {
        Self::try_current().unwrap_or_else(|| panic!("{} called outside of an event loop", what))
    }

    fn update_stats(&self, f: impl FnOnce(&mut LoopStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    pub fn arm(&self, event: Weak<dyn Event>) {
        log::trace!("{}: arming event", self.config.name);
        self.queue.borrow_mut().push_back(event);
    }

    pub fn register_channel(&self, id: u64, event: Weak<dyn Event>) {
        let old = self.channels.borrow_mut().insert(id, event);
        assert!(old.is_none(), "cross-thread channel registered twice");
    }

    pub fn unregister_channel(&self, id: u64) {
        self.channels.borrow_mut().remove(&id);
    }

    pub fn count_cross_thread_pair(&self) {
        self.update_stats(|stats| stats.cross_thread_pairs += 1);
    }

    /// Fires at most one event. Returns false if there was nothing to do.
    fn turn(&self) -> bool {
        // Ids whose promise is already gone are disconnects nobody listens to.
        for id in self.executor.drain() {
            let event = self.channels.borrow_mut().remove(&id);
            if let Some(event) = event {
                self.update_stats(|stats| stats.cross_thread_wakes += 1);
                self.arm(event);
            }
        }

        let event = match self.queue.borrow_mut().pop_front() {
            Some(event) => event,
            None => return false,
        };

        self.update_stats(|stats| stats.turns += 1);
        if let Some(event) = event.upgrade() {
            self.update_stats(|stats| stats.events_fired += 1);
            event.fire();
        }

        true
    }

    fn enter_running(&self) -> RunningGuard<'_> {
        assert!(
            !self.running.replace(true),
            "wait() and run() are not allowed from within event callbacks"
        );
        RunningGuard { event_loop: self }
    }
}

struct RunningGuard<'a> {
    event_loop: &'a LoopInner,
}

impl<'a> Drop for RunningGuard<'a> {
    fn drop(&mut self) {
        self.event_loop.running.set(false);
    }
}

#[derive(Default)]
struct WaitEvent {
    fired: Cell<bool>,
}

impl Event for WaitEvent {
    fn fire(self: Rc<Self>) {
        self.fired.set(true);
    }
}

/// The one-shot readiness slot every promise node embeds.
pub(crate) enum OnReadyEvent {
    Empty,
    Waiting {
        event: Weak<dyn Event>,
        event_loop: Weak<LoopInner>,
    },
    AlreadyReady,
    Armed,
}

impl Default for OnReadyEvent {
    fn default() -> Self {
        Self::Empty
    }
}

impl OnReadyEvent {
    pub fn init(&mut self, event: Weak<dyn Event>) {
        let event_loop = LoopInner::current("on_ready()");
        *self = match mem::replace(self, Self::Empty) {
            Self::Empty => Self::Waiting {
                event,
                event_loop: Rc::downgrade(&event_loop),
            },
            Self::AlreadyReady => {
                event_loop.arm(event);
                Self::Armed
            }
            Self::Waiting { .. } | Self::Armed => {
                unreachable!("on_ready() called twice on the same promise")
            }
        };
    }

    pub fn arm(&mut self) {
        *self = match mem::replace(self, Self::Empty) {
            Self::Empty => Self::AlreadyReady,
            Self::Waiting { event, event_loop } => {
                if let Some(event_loop) = event_loop.upgrade() {
                    event_loop.arm(event);
                }
                Self::Armed
            }
            Self::AlreadyReady | Self::Armed => unreachable!("promise settled twice"),
        };
    }
}

/// A single-threaded, completion-style event loop.
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Rc::new(LoopInner {
                config,
                executor: Executor::new(),
                queue: RefCell::new(VecDeque::new()),
                channels: RefCell::new(HashMap::new()),
                running: Cell::new(false),
                stats: Cell::new(LoopStats::default()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.inner.executor
    }

    pub fn stats(&self) -> LoopStats {
        self.inner.stats.get()
    }

    /// Makes this loop the current loop of the calling thread until the scope is dropped.
    pub fn enter(&self) -> WaitScope<'_> {
        LoopInner::with_tls(|tls| {
            assert!(tls.is_none(), "Nested event loops are not supported");
            *tls = Some(self.inner.clone());
        });

        log::trace!("{}: entered", self.inner.config.name);
        WaitScope { event_loop: self }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.inner.executor.close();
    }
}

pub struct WaitScope<'a> {
    event_loop: &'a EventLoop,
}

impl<'a> Drop for WaitScope<'a> {
    fn drop(&mut self) {
        match LoopInner::with_tls(|tls| mem::replace(tls, None)) {
            Some(old) => assert!(Rc::ptr_eq(&old, &self.event_loop.inner)),
            None => unreachable!("EventLoop was removed from thread_local storage"),
        }
    }
}

impl<'a> WaitScope<'a> {
    pub fn event_loop(&self) -> &'a EventLoop {
        self.event_loop
    }

    /// The capability thread-sensitive bridge components are constructed with.
    pub fn token(&self) -> LoopToken {
        LoopToken::new(self.event_loop.inner.executor.clone())
    }

    /// Fires events until there is nothing left to do. Returns the number of turns taken.
    pub fn run(&self) -> usize {
        let inner = &*self.event_loop.inner;
        let _running = inner.enter_running();

        let mut turns = 0;
        while inner.turn() {
            turns += 1;
        }
        turns
    }

    /// Turns the event loop until `promise` settles and returns its result.
    ///
    /// Fails with a deadlock error once nothing queued and no cross-thread fulfiller could
    /// settle the promise. A future that keeps a clone of its waker holds such a fulfiller, so
    /// waiting on one that never completes blocks instead of reporting the deadlock.
    pub fn wait<T: 'static>(&self, mut promise: Promise<T>) -> Result<T> {
        let inner = &*self.event_loop.inner;
        let _running = inner.enter_running();

        let waiter = Rc::new(WaitEvent::default());
        let weak = Rc::downgrade(&waiter);
        let event: Weak<dyn Event> = weak;
        promise.node_mut().on_ready(event);

        while !waiter.fired.get() {
            if inner.turn() {
                continue;
            }

            if inner.config.detect_deadlock
                && inner.executor.live_fulfillers() == 0
                && !inner.executor.has_pending()
            {
                log::debug!("{}: waiting on a promise that can never settle", inner.config.name);
                log::debug!("{}", promise.trace());
                return Err(Error::deadlock());
            }

            inner.executor.park();
        }

        promise.into_result()
    }

    /// Creates a promise that can be settled from any thread.
    #[track_caller]
    pub fn cross_thread_pair<T: 'static>(&self) -> (Promise<T>, CrossThreadFulfiller<T>) {
        executor::cross_thread_pair(&self.event_loop.inner)
    }
}
