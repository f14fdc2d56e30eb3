use super::{
    guard::{LoopToken, ThreadAffinityGuard},
    linked::{Link, LinkedListener},
    waker::{FastPathHint, WakerBridge, WakerKind},
};
use crate::{
    error::Result,
    event::{Event, FastPathPolicy, LoopInner, Promise, TraceBuilder},
};
use std::{
    cell::RefCell,
    fmt,
    future::{Future, IntoFuture},
    mem,
    panic::Location,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

enum ListenerState {
    /// Not yet registered with the promise.
    Idle,
    /// Registered. `None` until first suspended, or after the driver it linked to went away.
    Waiting(Option<WakerBridge>),
    Ready,
}

struct ListenerInner<T> {
    // Dropped before `promise` so a driver link is gone before the node is.
    state: RefCell<ListenerState>,
    promise: RefCell<Option<Promise<T>>>,
    location: &'static Location<'static>,
}

impl<T: 'static> Event for ListenerInner<T> {
    fn fire(self: Rc<Self>) {
        let bridge = match mem::replace(&mut *self.state.borrow_mut(), ListenerState::Ready) {
            ListenerState::Waiting(bridge) => bridge,
            ListenerState::Idle => unreachable!("listener fired before it registered"),
            ListenerState::Ready => unreachable!("listener fired twice"),
        };

        log::trace!("promise awaited at {} is ready", self.location);
        if let Some(bridge) = bridge {
            bridge.wake();
        }
    }
}

impl<T: 'static> LinkedListener for ListenerInner<T> {
    fn orphan(&self) {
        let link = match &mut *self.state.borrow_mut() {
            ListenerState::Waiting(bridge @ Some(WakerBridge::Direct(_))) => bridge.take(),
            _ => None,
        };
        mem::drop(link);
    }

    fn trace_promise(&self, builder: &mut TraceBuilder) {
        builder.add("awaiting promise", Some(self.location));
        if let Ok(promise) = self.promise.try_borrow() {
            if let Some(promise) = promise.as_ref() {
                promise.node().trace_promise(builder);
            }
        }
    }
}

/// Lets a future suspend on a [`Promise`].
///
/// The listener registers with the promise the first time it is polled and remembers how to
/// wake whoever polled it last. When the poller is a driver from
/// [`Promise::from_future`](crate::Promise::from_future) on the same thread, waking re-arms
/// that driver directly. Any other waker is cloned and woken through its own runtime.
///
/// A listener belongs to the event loop it was created under; touching it from anywhere else
/// panics.
pub struct CompletionListener<T> {
    inner: ThreadAffinityGuard<Rc<ListenerInner<T>>>,
}

impl<T> fmt::Debug for CompletionListener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionListener").finish()
    }
}

impl<T: 'static> CompletionListener<T> {
    #[track_caller]
    pub fn new(promise: Promise<T>, token: &LoopToken) -> Self {
        let inner = Rc::new(ListenerInner {
            state: RefCell::new(ListenerState::Idle),
            promise: RefCell::new(Some(promise)),
            location: Location::caller(),
        });

        Self {
            inner: ThreadAffinityGuard::new(inner, token),
        }
    }

    /// Returns true once the promise has settled. Otherwise arranges for `waker`, or the driver
    /// named by `hint`, to be woken when it does.
    #[track_caller]
    pub fn poll(&self, waker: &Waker, hint: Option<FastPathHint>) -> bool {
        let inner = self.inner.get();
        let mut state = inner.state.borrow_mut();

        if let ListenerState::Idle = *state {
            let mut promise = inner.promise.borrow_mut();
            let promise = promise
                .as_mut()
                .expect("listener polled after its result was extracted");

            if promise.node().is_ready() {
                *state = ListenerState::Ready;
                return true;
            }

            let weak = Rc::downgrade(inner);
            let event: Weak<dyn Event> = weak;
            promise.node_mut().on_ready(event);
            *state = ListenerState::Waiting(None);
        }

        let bridge = match &mut *state {
            ListenerState::Waiting(bridge) => bridge,
            ListenerState::Ready => return true,
            ListenerState::Idle => unreachable!(),
        };

        match hint {
            Some(hint) => {
                let linked = matches!(
                    bridge,
                    Some(WakerBridge::Direct(link)) if link.is_linked_to(&hint.driver)
                );

                if !linked {
                    let weak = Rc::downgrade(inner);
                    let member: Weak<dyn LinkedListener> = weak;
                    *bridge = Some(WakerBridge::Direct(Link::new(&hint.driver, member)));
                }
            }
            None => {
                let strict = LoopInner::try_current()
                    .map(|event_loop| event_loop.config.fast_path == FastPathPolicy::Strict)
                    .unwrap_or(false);

                assert!(
                    !strict,
                    "promise awaited at {} was polled by a waker from outside this event loop",
                    inner.location
                );

                let cloned = matches!(
                    bridge,
                    Some(WakerBridge::Opaque(old)) if old.will_wake(waker)
                );

                if !cloned {
                    log::debug!(
                        "promise awaited at {} has no fast path, cloning the waker",
                        inner.location
                    );
                    *bridge = Some(WakerBridge::Opaque(waker.clone()));
                }
            }
        }

        false
    }

    /// Like [`poll`](Self::poll), taking the fast path whenever `cx` comes from a driver on this
    /// thread.
    #[track_caller]
    pub fn poll_with(&self, cx: &mut Context<'_>) -> bool {
        self.poll(cx.waker(), FastPathHint::current(cx.waker()))
    }

    #[track_caller]
    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.get().state.borrow(), ListenerState::Ready)
    }

    /// How a wake would currently be delivered, if the listener is suspended.
    #[track_caller]
    pub fn waker_kind(&self) -> Option<WakerKind> {
        match &*self.inner.get().state.borrow() {
            ListenerState::Waiting(Some(bridge)) => Some(bridge.kind()),
            _ => None,
        }
    }

    /// Moves the settled value or failure out of the promise.
    ///
    /// # Panics
    ///
    /// Panics if the promise has not settled yet, or if the result was already extracted.
    #[track_caller]
    pub fn extract_result(&self) -> Result<T> {
        let inner = self.inner.get();
        assert!(
            matches!(*inner.state.borrow(), ListenerState::Ready),
            "extract_result() called before the promise was ready"
        );

        let promise = inner
            .promise
            .borrow_mut()
            .take()
            .expect("extract_result() called twice");
        promise.into_result()
    }

    #[track_caller]
    pub fn trace(&self) -> String {
        let mut builder = TraceBuilder::new();
        self.inner.get().trace_promise(&mut builder);
        builder.to_string()
    }
}

/// The future returned by awaiting a [`Promise`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[derive(Debug)]
pub struct PromiseFuture<T> {
    listener: Option<CompletionListener<T>>,
}

impl<T: 'static> PromiseFuture<T> {
    #[track_caller]
    pub fn new(promise: Promise<T>, token: &LoopToken) -> Self {
        Self {
            listener: Some(CompletionListener::new(promise, token)),
        }
    }
}

impl<T: 'static> Future for PromiseFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let listener = self
            .listener
            .as_ref()
            .expect("PromiseFuture polled after completion");

        if !listener.poll_with(cx) {
            return Poll::Pending;
        }

        let result = listener.extract_result();
        self.listener = None;
        Poll::Ready(result)
    }
}

impl<T: 'static> IntoFuture for Promise<T> {
    type Output = Result<T>;
    type IntoFuture = PromiseFuture<T>;

    /// # Panics
    ///
    /// Panics if called outside of an event loop.
    #[track_caller]
    fn into_future(self) -> PromiseFuture<T> {
        let token = LoopToken::current().expect("Promise awaited outside of an event loop");
        PromiseFuture::new(self, &token)
    }
}
