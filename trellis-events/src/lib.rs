//! Trellis Events - Emitter and Event Store Contract
//!
//! This crate defines the [`EventStore`] trait for the append-only,
//! per-tenant event log, an in-memory implementation of it, and the
//! [`EventEmitter`] that fans persisted events out to registered handlers.
//!
//! # Ordering
//!
//! Events produced inside one transaction are emitted in production order.
//! Across transactions, ordering is `(occurred_at, id)` - event ids are
//! time-ordered UUIDv7 so the tiebreaker preserves emission order within a
//! millisecond. Subscribers observe events in this order per tenant.
//!
//! # Handler isolation
//!
//! Handlers run sequentially in registration order, each inside an isolated
//! failure scope: a handler that returns an error or panics is logged and
//! skipped, and never affects later handlers or the emit call itself.

mod emitter;
mod store;
mod in_memory;

pub use emitter::{handler_fn, EmitOptions, EventEmitter, EventHandler, HandlerFuture};
pub use in_memory::InMemoryEventStore;
pub use store::{EventQuery, EventStore};

// Re-export core event types for convenience
pub use trellis_core::{ChangeType, EventRecord, EventType};
