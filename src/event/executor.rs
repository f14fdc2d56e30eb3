use super::{Event, LoopInner, Promise, PromiseNode, TraceBuilder};
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::{
    fmt, mem,
    panic::Location,
    rc::{Rc, Weak},
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    sync::Arc,
};
use try_lock::TryLock;

#[derive(Default)]
struct Inbox {
    ready: Vec<u64>,
    closed: bool,
}

/// The `Send + Sync` side of an [`EventLoop`](super::EventLoop).
///
/// Other threads never touch the loop's promises directly. They push the id of a settled
/// cross-thread channel into the inbox, and the loop thread arms whatever was waiting on it.
pub struct Executor {
    inbox: Mutex<Inbox>,
    condvar: Condvar,
    next_id: AtomicU64,
    live_fulfillers: AtomicUsize,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("live_fulfillers", &self.live_fulfillers())
            .finish()
    }
}

impl Executor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inbox: Mutex::new(Inbox::default()),
            condvar: Condvar::new(),
            next_id: AtomicU64::new(0),
            live_fulfillers: AtomicUsize::new(0),
        })
    }

    /// Number of cross-thread fulfillers that can still settle a promise on this loop.
    pub fn live_fulfillers(&self) -> usize {
        self.live_fulfillers.load(Ordering::Acquire)
    }

    fn notify(&self, id: u64) {
        let mut inbox = self.inbox.lock();
        if inbox.closed {
            return;
        }

        inbox.ready.push(id);
        mem::drop(inbox);
        self.condvar.notify_one();
    }

    pub(crate) fn drain(&self) -> Vec<u64> {
        mem::take(&mut self.inbox.lock().ready)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.inbox.lock().ready.is_empty()
    }

    #[cold]
    pub(crate) fn park(&self) {
        let mut inbox = self.inbox.lock();
        while inbox.ready.is_empty() && !inbox.closed {
            self.condvar.wait(&mut inbox);
        }
    }

    pub(crate) fn close(&self) {
        let mut inbox = self.inbox.lock();
        inbox.closed = true;
        inbox.ready.clear();
    }
}

struct Channel<T> {
    id: u64,
    executor: Arc<Executor>,
    settled: AtomicBool,
    result: TryLock<Option<Result<T>>>,
}

/// Settles a promise owned by an event loop from any thread.
///
/// Dropping the fulfiller without settling rejects the promise as disconnected.
pub struct CrossThreadFulfiller<T> {
    channel: Option<Arc<Channel<T>>>,
}

impl<T> fmt::Debug for CrossThreadFulfiller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossThreadFulfiller")
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

impl<T> CrossThreadFulfiller<T> {
    pub fn fulfill(mut self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(mut self, error: Error) {
        self.settle(Err(error));
    }

    /// Returns false once the receiving promise has been dropped.
    pub fn is_waiting(&self) -> bool {
        self.channel
            .as_ref()
            .map(|channel| Arc::strong_count(channel) > 1)
            .unwrap_or(false)
    }

    fn settle(&mut self, result: Result<T>) {
        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => return,
        };

        *channel
            .result
            .try_lock()
            .expect("cross-thread result slot contended before settling") = Some(result);
        channel.settled.store(true, Ordering::Release);
        channel.executor.notify(channel.id);
        channel.executor.live_fulfillers.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T> Drop for CrossThreadFulfiller<T> {
    fn drop(&mut self) {
        if self.channel.is_some() {
            self.settle(Err(Error::disconnected(
                "cross-thread fulfiller dropped without settling",
            )));
        }
    }
}

struct CrossThreadNode<T> {
    channel: Arc<Channel<T>>,
    event_loop: Weak<LoopInner>,
    registered: bool,
    location: &'static Location<'static>,
}

impl<T> PromiseNode<T> for CrossThreadNode<T> {
    fn on_ready(&mut self, event: Weak<dyn Event>) {
        assert!(!self.registered, "on_ready() called twice on the same promise");
        self.registered = true;

        let event_loop = match self.event_loop.upgrade() {
            Some(event_loop) => event_loop,
            None => return,
        };

        if self.channel.settled.load(Ordering::Acquire) {
            event_loop.arm(event);
        } else {
            event_loop.register_channel(self.channel.id, event);
        }
    }

    fn is_ready(&self) -> bool {
        self.channel.settled.load(Ordering::Acquire)
    }

    fn get(&mut self) -> Result<T> {
        assert!(self.is_ready(), "cross-thread promise consumed before it settled");
        self.channel
            .result
            .try_lock()
            .expect("cross-thread result slot contended after settling")
            .take()
            .expect("cross-thread promise consumed twice")
    }

    fn trace_promise(&self, builder: &mut TraceBuilder) {
        builder.add("cross-thread promise", Some(self.location));
    }
}

impl<T> Drop for CrossThreadNode<T> {
    fn drop(&mut self) {
        if self.registered {
            if let Some(event_loop) = self.event_loop.upgrade() {
                event_loop.unregister_channel(self.channel.id);
            }
        }
    }
}

#[track_caller]
pub(crate) fn cross_thread_pair<T: 'static>(
    event_loop: &Rc<LoopInner>,
) -> (Promise<T>, CrossThreadFulfiller<T>) {
    let executor = event_loop.executor.clone();
    let id = executor.next_id.fetch_add(1, Ordering::Relaxed);
    executor.live_fulfillers.fetch_add(1, Ordering::AcqRel);
    event_loop.count_cross_thread_pair();

    let channel = Arc::new(Channel {
        id,
        executor,
        settled: AtomicBool::new(false),
        result: TryLock::new(None),
    });

    let node = CrossThreadNode {
        channel: channel.clone(),
        event_loop: Rc::downgrade(event_loop),
        registered: false,
        location: Location::caller(),
    };

    let fulfiller = CrossThreadFulfiller {
        channel: Some(channel),
    };

    (Promise::from_node(node), fulfiller)
}

#[cfg(test)]
mod tests {
    use crate::event::EventLoop;
    use std::{thread, time::Duration};

    #[test]
    fn fulfilled_from_another_thread() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let (promise, fulfiller) = scope.cross_thread_pair::<u32>();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            fulfiller.fulfill(17);
        });

        assert_eq!(promise.wait(&scope).unwrap(), 17);
        handle.join().unwrap();

        let stats = event_loop.stats();
        assert_eq!(stats.cross_thread_pairs, 1);
        assert_eq!(stats.cross_thread_wakes, 1);
        assert_eq!(event_loop.executor().live_fulfillers(), 0);
    }

    #[test]
    fn fulfilled_before_waiting() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let (promise, fulfiller) = scope.cross_thread_pair::<&'static str>();
        thread::spawn(move || fulfiller.fulfill("early")).join().unwrap();

        assert_eq!(promise.wait(&scope).unwrap(), "early");
    }

    #[test]
    fn dropped_fulfiller_disconnects() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let (promise, fulfiller) = scope.cross_thread_pair::<()>();
        thread::spawn(move || drop(fulfiller)).join().unwrap();

        let err = promise.wait(&scope).unwrap_err();
        assert!(err.is_disconnected());
    }

    #[test]
    fn fulfilling_a_dropped_promise_is_harmless() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let (promise, fulfiller) = scope.cross_thread_pair::<u8>();
        drop(promise);
        assert!(!fulfiller.is_waiting());

        thread::spawn(move || fulfiller.fulfill(1)).join().unwrap();
        assert_eq!(scope.run(), 0);
    }
}
