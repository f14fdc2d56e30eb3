#![allow(dead_code)]

use pin_project_lite::pin_project;
use promise_bridge::Promise;
use std::{
    cell::{Cell, RefCell},
    future::{poll_fn, Future},
    pin::Pin,
    rc::Rc,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll, Wake, Waker},
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pin_project! {
    /// Counts how many times the inner future is polled.
    pub struct Counted<F> {
        #[pin]
        future: F,
        polls: Rc<Cell<usize>>,
    }
}

impl<F> Counted<F> {
    pub fn new(future: F) -> (Self, Rc<Cell<usize>>) {
        let polls = Rc::new(Cell::new(0));
        let counted = Self {
            future,
            polls: polls.clone(),
        };
        (counted, polls)
    }
}

impl<F: Future> Future for Counted<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.polls.set(this.polls.get() + 1);
        this.future.poll(cx)
    }
}

/// A waker that forwards to another one, the way combinators that track their children do.
pub struct ForwardingWaker {
    inner: Waker,
    pub wakes: AtomicUsize,
}

impl Wake for ForwardingWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
        self.inner.wake_by_ref();
    }
}

pin_project! {
    /// Polls the inner future with a [`ForwardingWaker`] instead of the caller's waker.
    pub struct Wrapped<F> {
        #[pin]
        future: F,
    }
}

impl<F> Wrapped<F> {
    pub fn new(future: F) -> Self {
        Self { future }
    }
}

impl<F: Future> Future for Wrapped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let waker = Waker::from(Arc::new(ForwardingWaker {
            inner: cx.waker().clone(),
            wakes: AtomicUsize::new(0),
        }));

        self.project().future.poll(&mut Context::from_waker(&waker))
    }
}

/// Resolves with whichever future finishes first, dropping the other.
pub async fn select<T>(a: impl Future<Output = T>, b: impl Future<Output = T>) -> (usize, T) {
    pin_utils::pin_mut!(a);
    pin_utils::pin_mut!(b);

    poll_fn(|cx| {
        if let Poll::Ready(value) = a.as_mut().poll(cx) {
            return Poll::Ready((0, value));
        }
        if let Poll::Ready(value) = b.as_mut().poll(cx) {
            return Poll::Ready((1, value));
        }
        Poll::Pending
    })
    .await
}

/// Awaits both futures, polling each until it finishes.
pub async fn join<A: Future, B: Future>(a: A, b: B) -> (A::Output, B::Output) {
    pin_utils::pin_mut!(a);
    pin_utils::pin_mut!(b);

    let (mut a_out, mut b_out) = (None, None);
    poll_fn(|cx| {
        if a_out.is_none() {
            if let Poll::Ready(value) = a.as_mut().poll(cx) {
                a_out = Some(value);
            }
        }
        if b_out.is_none() {
            if let Poll::Ready(value) = b.as_mut().poll(cx) {
                b_out = Some(value);
            }
        }

        match (a_out.take(), b_out.take()) {
            (Some(a), Some(b)) => Poll::Ready((a, b)),
            (a, b) => {
                a_out = a;
                b_out = b;
                Poll::Pending
            }
        }
    })
    .await
}

/// Schedules callbacks on later turns of the current event loop.
#[derive(Clone, Default)]
pub struct Deferred {
    keep: Rc<RefCell<Vec<Promise<()>>>>,
}

impl Deferred {
    pub fn run(&self, f: impl FnOnce(&Deferred) + 'static) {
        let deferred = self.clone();
        let promise = Promise::eval_later(move || {
            f(&deferred);
            Ok(())
        });
        self.keep.borrow_mut().push(promise);
    }
}
