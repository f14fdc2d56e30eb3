use super::{driver::PollEvent, linked::Link};
use crate::event::CrossThreadFulfiller;
use parking_lot::Mutex;
use std::{
    cell::RefCell,
    fmt, mem,
    rc::{Rc, Weak},
    sync::Arc,
    task::{Wake, Waker},
};

/// How a listener wakes whoever is suspended on it.
pub(crate) enum WakerBridge {
    /// The driver that polled the listener from this thread. Waking arms it directly.
    Direct(Link),
    /// Any other waker. Waking goes through the waker's own runtime.
    Opaque(Waker),
}

impl WakerBridge {
    pub fn kind(&self) -> WakerKind {
        match self {
            Self::Direct(_) => WakerKind::Direct,
            Self::Opaque(_) => WakerKind::Opaque,
        }
    }

    pub fn wake(self) {
        match self {
            Self::Direct(link) => {
                if let Some(driver) = link.driver() {
                    driver.arm();
                }
            }
            Self::Opaque(waker) => waker.wake(),
        }
    }
}

/// Which form of [`WakerBridge`] a listener currently holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WakerKind {
    Direct,
    Opaque,
}

/// Evidence that a listener is being polled by a driver on this thread, with that driver's own
/// waker. Only obtainable from [`FastPathHint::current`].
pub struct FastPathHint {
    pub(crate) driver: Rc<dyn PollEvent>,
}

impl fmt::Debug for FastPathHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastPathHint").finish()
    }
}

impl FastPathHint {
    fn with_tls<F>(f: impl FnOnce(&mut Option<Weak<dyn PollEvent>>) -> F) -> F {
        thread_local!(static TLS: RefCell<Option<Weak<dyn PollEvent>>> = RefCell::new(None));
        TLS.with(|ref_cell| f(&mut *ref_cell.borrow_mut()))
    }

    /// Returns a hint if a driver's poll scope is active on this thread and `waker` is that
    /// driver's waker.
    pub fn current(waker: &Waker) -> Option<Self> {
        let driver = Self::with_tls(|tls| tls.as_ref().and_then(Weak::upgrade))?;
        if !driver.waker().will_wake(waker) {
            return None;
        }

        Some(Self { driver })
    }
}

/// The dynamic extent of one call into a driver's future.
pub(crate) struct PollScope {
    previous: Option<Weak<dyn PollEvent>>,
}

impl PollScope {
    pub fn enter(driver: Weak<dyn PollEvent>) -> Self {
        Self {
            previous: FastPathHint::with_tls(|tls| mem::replace(tls, Some(driver))),
        }
    }
}

impl Drop for PollScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        FastPathHint::with_tls(|tls| *tls = previous);
    }
}

#[derive(Default)]
struct ScopeWakerState {
    woken: bool,
    fulfiller: Option<CrossThreadFulfiller<()>>,
}

/// The waker a driver hands to its future.
///
/// Waking it never touches the driver. A wake during a poll pass is recorded and picked up when
/// the pass ends; a wake at any other time, from any thread, goes through the cross-thread
/// fulfiller the driver installs once a clone of this waker has escaped a poll pass.
#[derive(Default)]
pub(crate) struct ScopeWaker {
    state: Mutex<ScopeWakerState>,
}

/// References held by the driver itself: its `Arc<ScopeWaker>` and its `Waker`.
pub(crate) const SCOPE_WAKER_BASELINE: usize = 2;

impl Wake for ScopeWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let fulfiller = {
            let mut state = self.state.lock();
            state.woken = true;
            state.fulfiller.take()
        };

        if let Some(fulfiller) = fulfiller {
            fulfiller.fulfill(());
        }
    }
}

impl ScopeWaker {
    pub fn reset(&self) {
        self.state.lock().woken = false;
    }

    pub fn take_woken(&self) -> bool {
        mem::replace(&mut self.state.lock().woken, false)
    }

    pub fn has_fulfiller(&self) -> bool {
        self.state.lock().fulfiller.is_some()
    }

    /// Hands the waker a way back into the event loop. If a wake raced ahead of the install, the
    /// fulfiller is settled right away.
    pub fn install(&self, fulfiller: CrossThreadFulfiller<()>) {
        let mut state = self.state.lock();
        if mem::replace(&mut state.woken, false) {
            mem::drop(state);
            fulfiller.fulfill(());
        } else {
            state.fulfiller = Some(fulfiller);
        }
    }

    /// Returns true if a fulfiller was installed.
    pub fn release(&self) -> bool {
        let fulfiller = self.state.lock().fulfiller.take();
        fulfiller.is_some()
    }
}
