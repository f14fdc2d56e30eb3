use super::{
    linked::LinkedGroup,
    waker::{PollScope, ScopeWaker, SCOPE_WAKER_BASELINE},
};
use crate::{
    error::{Error, Result},
    event::{cross_thread_pair, Event, LoopInner, OnReadyEvent, Promise, PromiseNode, TraceBuilder},
};
use std::{
    any::type_name,
    cell::{Cell, RefCell},
    future::Future,
    mem,
    panic::{self, AssertUnwindSafe, Location},
    pin::Pin,
    rc::{Rc, Weak},
    sync::Arc,
    task::{Context, Poll, Waker},
};

/// A driver as seen by the listeners it polls.
pub(crate) trait PollEvent {
    fn links(&self) -> &LinkedGroup;

    /// The waker handed to the driver's future.
    fn waker(&self) -> &Waker;

    /// Schedules a poll pass on the driver's event loop. Idempotent until the pass runs.
    fn arm(self: Rc<Self>);
}

enum DriverState<T> {
    Pending,
    Ready(Result<T>),
    Consumed,
}

/// Owns a future and polls it from its event loop, exposing the result as a [`Promise`].
pub(crate) struct PollDriver<T, F> {
    future: RefCell<Option<Pin<Box<F>>>>,
    state: RefCell<DriverState<T>>,
    links: LinkedGroup,
    armed: Cell<bool>,
    on_ready: RefCell<OnReadyEvent>,
    scope_waker: Arc<ScopeWaker>,
    waker: Waker,
    waker_promise: RefCell<Option<Promise<()>>>,
    event_loop: Weak<LoopInner>,
    location: &'static Location<'static>,
}

impl<T, F> PollDriver<T, F>
where
    T: 'static,
    F: Future<Output = Result<T>> + 'static,
{
    #[track_caller]
    fn new(future: F) -> Rc<Self> {
        let event_loop = LoopInner::current("Promise::from_future()");
        let scope_waker = Arc::new(ScopeWaker::default());

        Rc::new(Self {
            future: RefCell::new(Some(Box::pin(future))),
            state: RefCell::new(DriverState::Pending),
            links: LinkedGroup::default(),
            armed: Cell::new(false),
            on_ready: RefCell::new(OnReadyEvent::default()),
            waker: Waker::from(scope_waker.clone()),
            scope_waker,
            waker_promise: RefCell::new(None),
            event_loop: Rc::downgrade(&event_loop),
            location: Location::caller(),
        })
    }

    fn is_done(&self) -> bool {
        !matches!(*self.state.borrow(), DriverState::Pending)
    }

    fn poll_future(self: &Rc<Self>) {
        if self.is_done() {
            return;
        }

        let settled = self
            .waker_promise
            .borrow()
            .as_ref()
            .map(|promise| promise.node().is_ready())
            .unwrap_or(false);
        if settled {
            self.waker_promise.borrow_mut().take();
        }
        self.scope_waker.reset();

        log::trace!("polling {} from {}", type_name::<F>(), self.location);
        let poll_result = {
            let weak = Rc::downgrade(self);
            let driver: Weak<dyn PollEvent> = weak;
            let _scope = PollScope::enter(driver);

            let mut future = self.future.borrow_mut();
            let future = future
                .as_mut()
                .expect("driver polled after its future was released");

            let mut cx = Context::from_waker(&self.waker);
            panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        };

        let result = match poll_result {
            Ok(Poll::Pending) => return self.suspend(),
            Ok(Poll::Ready(result)) => result,
            Err(payload) => {
                let error = Error::panicked(payload);
                log::debug!("future at {} panicked: {}", self.location, error);
                Err(error)
            }
        };

        self.complete(result);
    }

    /// The future returned `Pending`. Decide how the next wake reaches us.
    fn suspend(self: &Rc<Self>) {
        if self.scope_waker.take_woken() {
            log::trace!("future at {} woke itself, re-arming", self.location);
            self.clone().arm();
        }

        let escaped = Arc::strong_count(&self.scope_waker) > SCOPE_WAKER_BASELINE;
        if !escaped {
            if self.scope_waker.release() {
                self.waker_promise.borrow_mut().take();
            }
            return;
        }

        if self.scope_waker.has_fulfiller() {
            return;
        }

        let event_loop = match self.event_loop.upgrade() {
            Some(event_loop) => event_loop,
            None => return,
        };

        log::debug!(
            "future at {} kept its waker, routing wakes through the event loop",
            self.location
        );

        let (mut promise, fulfiller) = cross_thread_pair::<()>(&event_loop);
        let weak = Rc::downgrade(self);
        let event: Weak<dyn Event> = weak;
        promise.node_mut().on_ready(event);

        let old = mem::replace(&mut *self.waker_promise.borrow_mut(), Some(promise));
        mem::drop(old);
        self.scope_waker.install(fulfiller);
    }

    fn complete(&self, result: Result<T>) {
        log::trace!(
            "future at {} completed, unlinking {} listeners",
            self.location,
            self.links.len()
        );

        let future = self.future.borrow_mut().take();
        mem::drop(future);

        self.links.clear();
        self.waker_promise.borrow_mut().take();
        self.scope_waker.release();

        *self.state.borrow_mut() = DriverState::Ready(result);
        self.on_ready.borrow_mut().arm();
    }
}

impl<T, F> Event for PollDriver<T, F>
where
    T: 'static,
    F: Future<Output = Result<T>> + 'static,
{
    fn fire(self: Rc<Self>) {
        self.armed.set(false);
        self.poll_future();
    }
}

impl<T, F> PollEvent for PollDriver<T, F>
where
    T: 'static,
    F: Future<Output = Result<T>> + 'static,
{
    fn links(&self) -> &LinkedGroup {
        &self.links
    }

    fn waker(&self) -> &Waker {
        &self.waker
    }

    fn arm(self: Rc<Self>) {
        if self.is_done() || self.armed.replace(true) {
            return;
        }

        if let Some(event_loop) = self.event_loop.upgrade() {
            let weak = Rc::downgrade(&self);
            let event: Weak<dyn Event> = weak;
            event_loop.arm(event);
        }
    }
}

impl<T, F> Drop for PollDriver<T, F> {
    fn drop(&mut self) {
        // The driver is unreachable by now, so listeners the future owns cannot unlink
        // themselves. `clear` orphans whatever is left.
        let future = self.future.get_mut().take();
        mem::drop(future);

        self.links.clear();
        self.waker_promise.get_mut().take();
        self.scope_waker.release();
    }
}

struct DriverNode<T, F> {
    driver: Rc<PollDriver<T, F>>,
}

impl<T, F> PromiseNode<T> for DriverNode<T, F>
where
    T: 'static,
    F: Future<Output = Result<T>> + 'static,
{
    fn on_ready(&mut self, event: Weak<dyn Event>) {
        self.driver.on_ready.borrow_mut().init(event);
        self.driver.clone().arm();
    }

    fn is_ready(&self) -> bool {
        matches!(*self.driver.state.borrow(), DriverState::Ready(_))
    }

    fn get(&mut self) -> Result<T> {
        match mem::replace(&mut *self.driver.state.borrow_mut(), DriverState::Consumed) {
            DriverState::Ready(result) => result,
            DriverState::Pending => unreachable!("future promise consumed before it completed"),
            DriverState::Consumed => unreachable!("future promise consumed twice"),
        }
    }

    fn trace_promise(&self, builder: &mut TraceBuilder) {
        builder.add(
            &format!("future {}", type_name::<F>()),
            Some(self.driver.location),
        );
        self.driver.links.trace(builder);

        if let Some(promise) = self.driver.waker_promise.borrow().as_ref() {
            promise.node().trace_promise(builder);
        }
    }
}

impl<T: 'static> Promise<T> {
    /// Drives `future` from the current event loop and settles with its output.
    ///
    /// Nothing is polled until the promise is waited on or otherwise consumed. A panic inside
    /// the future is caught and settles the promise with an error instead of unwinding through
    /// the event loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside of an event loop.
    #[track_caller]
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + 'static,
    {
        Self::from_node(DriverNode {
            driver: PollDriver::new(future),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::{CompletionListener, LoopToken},
        event::{promise_and_fulfiller, EventLoop},
    };
    use std::future::{pending, poll_fn};

    #[test]
    fn lazy_start() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let polled = Rc::new(Cell::new(false));
        let promise = Promise::from_future({
            let polled = polled.clone();
            async move {
                polled.set(true);
                Ok(7)
            }
        });

        assert_eq!(scope.run(), 0);
        assert!(!polled.get());

        assert_eq!(promise.wait(&scope).unwrap(), 7);
        assert!(polled.get());
    }

    #[test]
    fn panics_become_errors() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let promise = Promise::<()>::from_future(async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        let err = promise.wait(&scope).unwrap_err();
        assert!(err.is_panic());
        assert!(err.to_string().contains("boom"), "{}", err);
    }

    #[test]
    fn self_wake_rearms_without_cross_thread_machinery() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let mut yields = 3;
        let promise = Promise::from_future(poll_fn(move |cx| {
            if yields == 0 {
                return Poll::Ready(Ok(()));
            }
            yields -= 1;
            cx.waker().wake_by_ref();
            Poll::Pending
        }));

        promise.wait(&scope).unwrap();
        assert_eq!(event_loop.stats().cross_thread_pairs, 0);
    }

    #[test]
    fn escaped_waker_routes_through_the_event_loop() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let mut polls = 0;
        let mut wakes = Vec::new();
        let promise = Promise::from_future(poll_fn(move |cx| {
            polls += 1;
            if polls > 1 {
                return Poll::Ready(Ok(polls));
            }

            let waker = cx.waker().clone();
            wakes.push(Promise::eval_later(move || {
                waker.wake();
                Ok(())
            }));
            Poll::Pending
        }));

        assert_eq!(promise.wait(&scope).unwrap(), 2);

        let stats = event_loop.stats();
        assert_eq!(stats.cross_thread_pairs, 1);
        assert_eq!(stats.cross_thread_wakes, 1);
        assert_eq!(event_loop.executor().live_fulfillers(), 0);
    }

    #[test]
    fn released_waker_is_not_counted_as_a_wake() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let stash = Rc::new(RefCell::new(None::<Waker>));
        let mut listener = None;
        let promise = Promise::from_future({
            let stash = stash.clone();
            poll_fn(move |cx| {
                let listener = listener.get_or_insert_with(|| {
                    *stash.borrow_mut() = Some(cx.waker().clone());
                    let stash = stash.clone();
                    let forget = Promise::eval_later(move || {
                        stash.borrow_mut().take();
                        Ok(3)
                    });
                    CompletionListener::new(forget, &LoopToken::current().unwrap())
                });

                match listener.poll_with(cx) {
                    true => Poll::Ready(listener.extract_result()),
                    false => Poll::Pending,
                }
            })
        });

        assert_eq!(promise.wait(&scope).unwrap(), 3);
        scope.run();

        let stats = event_loop.stats();
        assert_eq!(stats.cross_thread_pairs, 1);
        assert_eq!(stats.cross_thread_wakes, 0);
        assert_eq!(event_loop.executor().live_fulfillers(), 0);
    }

    #[test]
    fn dropping_a_pending_driver_releases_everything() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let (inner, fulfiller) = promise_and_fulfiller::<u8>();
        let mut outer = Promise::from_future(async move { inner.await });

        let waiter = Rc::new(Noop);
        let weak = Rc::downgrade(&waiter);
        let event: Weak<dyn Event> = weak;
        outer.node_mut().on_ready(event);
        scope.run();

        assert!(!outer.node().is_ready());
        drop(outer);
        assert!(!fulfiller.is_waiting());
        assert_eq!(scope.run(), 0);
    }

    #[test]
    fn trace_names_the_future_and_its_awaits() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let (inner, _fulfiller) = promise_and_fulfiller::<()>();
        let mut outer = Promise::from_future(async move { inner.await });

        let waiter = Rc::new(Noop);
        let weak = Rc::downgrade(&waiter);
        let event: Weak<dyn Event> = weak;
        outer.node_mut().on_ready(event);
        scope.run();

        let trace = outer.trace();
        let lines: Vec<_> = trace.lines().collect();
        assert!(lines[0].starts_with("future "), "{}", trace);
        assert!(lines.iter().any(|line| line.starts_with("fulfiller promise")), "{}", trace);
    }

    #[test]
    fn never_completing_future_is_a_deadlock() {
        let event_loop = EventLoop::new();
        let scope = event_loop.enter();

        let promise = Promise::<()>::from_future(pending());
        assert!(promise.wait(&scope).unwrap_err().is_deadlock());
    }

    struct Noop;

    impl Event for Noop {
        fn fire(self: Rc<Self>) {}
    }
}
