use crate::event::{Executor, LoopInner};
use std::{fmt, sync::Arc};

/// Proof of which event loop a thread-sensitive component belongs to.
///
/// Obtained from [`WaitScope::token`](crate::WaitScope::token) or [`LoopToken::current`]. The
/// token itself may travel to other threads; only the loop's own thread can pass a check.
#[derive(Clone)]
pub struct LoopToken {
    executor: Arc<Executor>,
}

impl fmt::Debug for LoopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopToken")
            .field("current", &self.is_current())
            .finish()
    }
}

impl LoopToken {
    pub(crate) fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }

    /// The token of the event loop entered on the calling thread, if any.
    pub fn current() -> Option<Self> {
        LoopInner::try_current().map(|event_loop| Self::new(event_loop.executor.clone()))
    }

    /// Returns true if the calling thread is currently running this token's event loop.
    pub fn is_current(&self) -> bool {
        LoopInner::try_current()
            .map(|event_loop| Arc::ptr_eq(&event_loop.executor, &self.executor))
            .unwrap_or(false)
    }
}

/// Wraps a value that may only be touched while its event loop is current on the calling
/// thread. Every access is checked; a mismatch is a programming error and panics.
pub struct ThreadAffinityGuard<T> {
    value: T,
    token: LoopToken,
}

impl<T> ThreadAffinityGuard<T> {
    pub fn new(value: T, token: &LoopToken) -> Self {
        Self {
            value,
            token: token.clone(),
        }
    }

    pub fn token(&self) -> &LoopToken {
        &self.token
    }

    #[track_caller]
    pub fn get(&self) -> &T {
        self.check();
        &self.value
    }

    #[track_caller]
    pub fn get_mut(&mut self) -> &mut T {
        self.check();
        &mut self.value
    }

    #[track_caller]
    pub fn into_inner(self) -> T {
        self.check();
        self.value
    }

    #[track_caller]
    fn check(&self) {
        assert!(
            self.token.is_current(),
            "ThreadAffinityGuard accessed from a thread that is not running its event loop"
        );
    }
}
