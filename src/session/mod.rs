//! Query sessions: execution lifecycle, event buffering and the registry
//! that multiplexes sessions by resource id.

mod event_queue;
mod events;
mod registry;
mod runner;

pub use event_queue::{
    EventQueue, EventReceiver, EventSender, PushOutcome, DEFAULT_EVENT_QUEUE_CAPACITY,
};
pub use events::QueueEvent;
pub use registry::{RunOutcome, SessionRegistry, SessionRegistryHandle, SessionSnapshot};
pub use runner::{
    parse_elapsed_ms, RunnerEvent, RunnerEventSender, RunnerSignal, SessionRunner, SessionState,
};
