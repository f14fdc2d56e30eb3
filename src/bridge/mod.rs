mod driver;
mod guard;
mod linked;
mod listener;
mod waker;

pub use self::{
    guard::{LoopToken, ThreadAffinityGuard},
    listener::{CompletionListener, PromiseFuture},
    waker::{FastPathHint, WakerKind},
};
