use super::{Event, LoopInner, OnReadyEvent, TraceBuilder, WaitScope};
use crate::error::{Error, Result};
use std::{
    cell::RefCell,
    fmt,
    panic::Location,
    rc::{Rc, Weak},
};

/// The interface every completion-promise node exposes to the event loop and the bridge.
pub(crate) trait PromiseNode<T> {
    /// Registers the one-shot readiness callback.
    fn on_ready(&mut self, event: Weak<dyn Event>);

    /// Settled and not yet consumed.
    fn is_ready(&self) -> bool;

    /// Moves the settled value or failure out. Only valid once ready.
    fn get(&mut self) -> Result<T>;

    fn trace_promise(&self, builder: &mut TraceBuilder);
}

/// A value that will become available once, driven by an [`EventLoop`](super::EventLoop).
///
/// Awaiting a `Promise` inside a future goes through a
/// [`CompletionListener`](crate::CompletionListener).
pub struct Promise<T> {
    node: Box<dyn PromiseNode<T>>,
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("ready", &self.node.is_ready())
            .finish()
    }
}

impl<T: 'static> Promise<T> {
    pub(crate) fn from_node(node: impl PromiseNode<T> + 'static) -> Self {
        Self {
            node: Box::new(node),
        }
    }

    #[track_caller]
    pub fn ready(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    #[track_caller]
    pub fn rejected(error: Error) -> Self {
        Self::from_result(Err(error))
    }

    #[track_caller]
    pub fn from_result(result: Result<T>) -> Self {
        Self::from_node(ImmediateNode {
            result: Some(result),
            on_ready: OnReadyEvent::AlreadyReady,
            location: Location::caller(),
        })
    }

    /// A promise that never settles.
    #[track_caller]
    pub fn never() -> Self {
        Self::from_node(NeverNode {
            location: Location::caller(),
        })
    }

    /// Runs `f` on a later turn of the current event loop and settles with its result.
    ///
    /// # Panics
    ///
    /// Panics if called outside of an event loop.
    #[track_caller]
    pub fn eval_later<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T> + 'static,
    {
        let event_loop = LoopInner::current("eval_later()");
        let state = Rc::new(EvalLater {
            func: RefCell::new(Some(f)),
            result: RefCell::new(None),
            on_ready: RefCell::new(OnReadyEvent::default()),
        });

        let weak = Rc::downgrade(&state);
        let event: Weak<dyn Event> = weak;
        event_loop.arm(event);

        Self::from_node(EvalLaterNode {
            state,
            location: Location::caller(),
        })
    }

    pub fn wait(self, scope: &WaitScope<'_>) -> Result<T> {
        scope.wait(self)
    }

    /// Describes what this promise is currently blocked on, outermost first.
    pub fn trace(&self) -> String {
        let mut builder = TraceBuilder::new();
        self.node.trace_promise(&mut builder);
        builder.to_string()
    }

    pub(crate) fn node(&self) -> &dyn PromiseNode<T> {
        &*self.node
    }

    pub(crate) fn node_mut(&mut self) -> &mut dyn PromiseNode<T> {
        &mut *self.node
    }

    pub(crate) fn into_result(mut self) -> Result<T> {
        self.node.get()
    }
}

struct ImmediateNode<T> {
    result: Option<Result<T>>,
    on_ready: OnReadyEvent,
    location: &'static Location<'static>,
}

impl<T> PromiseNode<T> for ImmediateNode<T> {
    fn on_ready(&mut self, event: Weak<dyn Event>) {
        self.on_ready.init(event);
    }

    fn is_ready(&self) -> bool {
        self.result.is_some()
    }

    fn get(&mut self) -> Result<T> {
        self.result.take().expect("immediate promise consumed twice")
    }

    fn trace_promise(&self, builder: &mut TraceBuilder) {
        builder.add("immediate promise", Some(self.location));
    }
}

struct NeverNode {
    location: &'static Location<'static>,
}

impl<T> PromiseNode<T> for NeverNode {
    fn on_ready(&mut self, _event: Weak<dyn Event>) {}

    fn is_ready(&self) -> bool {
        false
    }

    fn get(&mut self) -> Result<T> {
        unreachable!("never() promise consumed")
    }

    fn trace_promise(&self, builder: &mut TraceBuilder) {
        builder.add("never-settling promise", Some(self.location));
    }
}

struct EvalLater<T, F> {
    func: RefCell<Option<F>>,
    result: RefCell<Option<Result<T>>>,
    on_ready: RefCell<OnReadyEvent>,
}

impl<T, F> Event for EvalLater<T, F>
where
    F: FnOnce() -> Result<T>,
{
    fn fire(self: Rc<Self>) {
        let func = self
            .func
            .borrow_mut()
            .take()
            .expect("eval_later() fired twice");

        *self.result.borrow_mut() = Some(func());
        self.on_ready.borrow_mut().arm();
    }
}

struct EvalLaterNode<T, F> {
    state: Rc<EvalLater<T, F>>,
    location: &'static Location<'static>,
}

impl<T, F> PromiseNode<T> for EvalLaterNode<T, F> {
    fn on_ready(&mut self, event: Weak<dyn Event>) {
        self.state.on_ready.borrow_mut().init(event);
    }

    fn is_ready(&self) -> bool {
        self.state.result.borrow().is_some()
    }

    fn get(&mut self) -> Result<T> {
        self.state
            .result
            .borrow_mut()
            .take()
            .expect("eval_later() promise consumed before it settled")
    }

    fn trace_promise(&self, builder: &mut TraceBuilder) {
        builder.add("eval_later", Some(self.location));
    }
}

struct PafState<T> {
    result: Option<Result<T>>,
    on_ready: OnReadyEvent,
    location: &'static Location<'static>,
}

struct PafNode<T> {
    state: Rc<RefCell<PafState<T>>>,
}

impl<T> PromiseNode<T> for PafNode<T> {
    fn on_ready(&mut self, event: Weak<dyn Event>) {
        self.state.borrow_mut().on_ready.init(event);
    }

    fn is_ready(&self) -> bool {
        self.state.borrow().result.is_some()
    }

    fn get(&mut self) -> Result<T> {
        self.state
            .borrow_mut()
            .result
            .take()
            .expect("promise consumed before it was fulfilled")
    }

    fn trace_promise(&self, builder: &mut TraceBuilder) {
        builder.add("fulfiller promise", Some(self.state.borrow().location));
    }
}

/// Settles the promise returned alongside it by [`promise_and_fulfiller`].
///
/// Dropping the fulfiller without settling rejects the promise as disconnected.
pub struct Fulfiller<T> {
    state: Option<Rc<RefCell<PafState<T>>>>,
}

impl<T> fmt::Debug for Fulfiller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fulfiller")
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

impl<T> Fulfiller<T> {
    pub fn fulfill(mut self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(mut self, error: Error) {
        self.settle(Err(error));
    }

    /// Returns false once the receiving promise has been dropped.
    pub fn is_waiting(&self) -> bool {
        self.state
            .as_ref()
            .map(|state| Rc::strong_count(state) > 1)
            .unwrap_or(false)
    }

    fn settle(&mut self, result: Result<T>) {
        if let Some(state) = self.state.take() {
            let mut state = state.borrow_mut();
            state.result = Some(result);
            state.on_ready.arm();
        }
    }
}

impl<T> Drop for Fulfiller<T> {
    fn drop(&mut self) {
        if self.state.is_some() {
            self.settle(Err(Error::disconnected("fulfiller dropped without settling")));
        }
    }
}

/// Creates a promise together with the fulfiller that settles it on the loop thread.
#[track_caller]
pub fn promise_and_fulfiller<T: 'static>() -> (Promise<T>, Fulfiller<T>) {
    let state = Rc::new(RefCell::new(PafState {
        result: None,
        on_ready: OnReadyEvent::default(),
        location: Location::caller(),
    }));

    let node = PafNode {
        state: state.clone(),
    };

    (Promise::from_node(node), Fulfiller { state: Some(state) })
}
