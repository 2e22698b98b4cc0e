//! Id generation for traces, spans and captured events.

use std::cell::RefCell;
use std::fmt;

use rand::{rngs, Rng, SeedableRng};
use revi::event::EventId;
use revi::trace::{SpanId, TraceId};

/// Interface for generating ids.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TraceId`.
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new `SpanId`.
    fn new_span_id(&self) -> SpanId;

    /// Generate a new `EventId`.
    fn new_event_id(&self) -> EventId;
}

/// Default [`IdGenerator`] implementation.
///
/// Generates ids using a per-thread random number generator.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| TraceId::from(rng.borrow_mut().gen::<u128>()))
    }

    fn new_span_id(&self) -> SpanId {
        CURRENT_RNG.with(|rng| SpanId::from(rng.borrow_mut().gen::<u64>()))
    }

    fn new_event_id(&self) -> EventId {
        CURRENT_RNG.with(|rng| EventId::from(rng.borrow_mut().gen::<u128>()))
    }
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}
