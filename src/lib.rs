#![forbid(unsafe_code)]

mod bridge;
mod error;
mod event;

pub use self::{
    bridge::{
        CompletionListener, FastPathHint, LoopToken, PromiseFuture, ThreadAffinityGuard, WakerKind,
    },
    error::{BoxError, Error, Result},
    event::{
        promise_and_fulfiller, Config, ConfigBuilder, CrossThreadFulfiller, EventLoop, Executor,
        FastPathPolicy, Fulfiller, LoopStats, Promise, TraceBuilder, WaitScope,
    },
};
