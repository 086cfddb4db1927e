//! Event emitter
//!
//! Fans a persisted event out to registered handlers: typed handlers first,
//! then wildcard handlers, each group in registration order. Handler
//! failures and panics are logged and isolated.

use crate::store::EventStore;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tracing::{debug, error};
use trellis_core::{EventRecord, EventType, TrellisResult};

/// Future returned by a handler invocation.
pub type HandlerFuture<'a> = BoxFuture<'a, TrellisResult<()>>;

/// A subscriber to emitted events.
pub trait EventHandler: Send + Sync {
    /// Name used in failure logs.
    fn name(&self) -> &str;

    fn handle<'a>(&'a self, event: &'a EventRecord) -> HandlerFuture<'a>;
}

/// Options for one emit call.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    /// The event batch was already persisted (inside the mutation
    /// transaction); skip the store write.
    pub skip_persist: bool,
    /// Persist only; do not invoke handlers.
    pub skip_handlers: bool,
}

/// Process-wide event emitter.
///
/// Handlers are registered at startup; registration after the first emit is
/// allowed but not expected, so a plain `RwLock` over the registration
/// tables is sufficient (reads clone the handler list before awaiting).
pub struct EventEmitter {
    store: Arc<dyn EventStore>,
    typed: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    wildcard: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventEmitter {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            typed: RwLock::new(HashMap::new()),
            wildcard: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler for one event type.
    pub fn on(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.typed
            .write()
            .expect("handler registry poisoned")
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Register a handler for every event type.
    pub fn on_all(&self, handler: Arc<dyn EventHandler>) {
        self.wildcard
            .write()
            .expect("handler registry poisoned")
            .push(handler);
    }

    /// Persist (unless already persisted) and dispatch one event.
    pub async fn emit(&self, event: &EventRecord, options: EmitOptions) -> TrellisResult<()> {
        if !options.skip_persist {
            self.store.save(event).await?;
        }
        if !options.skip_handlers {
            self.dispatch(event).await;
        }
        Ok(())
    }

    /// Persist and dispatch a batch, preserving in-transaction order.
    pub async fn emit_all(
        &self,
        events: &[EventRecord],
        options: EmitOptions,
    ) -> TrellisResult<()> {
        if !options.skip_persist {
            self.store.save_many(events).await?;
        }
        if !options.skip_handlers {
            for event in events {
                self.dispatch(event).await;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, event: &EventRecord) {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let typed = self.typed.read().expect("handler registry poisoned");
            let wildcard = self.wildcard.read().expect("handler registry poisoned");
            typed
                .get(&event.event_type)
                .into_iter()
                .flatten()
                .chain(wildcard.iter())
                .cloned()
                .collect()
        };

        debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            handlers = handlers.len(),
            "dispatching event"
        );

        for handler in handlers {
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(
                        handler = handler.name(),
                        event_type = %event.event_type,
                        event_id = %event.id,
                        error = %err,
                        "event handler failed"
                    );
                }
                Err(_) => {
                    error!(
                        handler = handler.name(),
                        event_type = %event.event_type,
                        event_id = %event.id,
                        "event handler panicked"
                    );
                }
            }
        }
    }
}

// ============================================================================
// CLOSURE HANDLERS
// ============================================================================

struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> EventHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a EventRecord) -> HandlerFuture<'a> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, event: &'a EventRecord) -> HandlerFuture<'a> {
        (self.f)(event)
    }
}

/// Wrap a closure as an [`EventHandler`].
pub fn handler_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: for<'a> Fn(&'a EventRecord) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryEventStore;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use trellis_core::{ActorId, RecordIdType, StorageError, TenantId};

    fn make_event(event_type: EventType) -> EventRecord {
        EventRecord::new(
            TenantId::now_v7(),
            event_type,
            None,
            ActorId::now_v7(),
            Utc::now(),
            json!({}),
        )
    }

    fn emitter() -> (EventEmitter, Arc<InMemoryEventStore>) {
        let store = Arc::new(InMemoryEventStore::new());
        (EventEmitter::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_emit_persists_and_dispatches() {
        let (emitter, store) = emitter();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        emitter.on(
            EventType::EntityCreated,
            handler_fn("counter", move |_| {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );

        emitter
            .emit(&make_event(EventType::EntityCreated), EmitOptions::default())
            .await
            .expect("emit");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_typed_handlers_only_see_their_type() {
        let (emitter, _store) = emitter();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        emitter.on(
            EventType::EntityDeleted,
            handler_fn("deletes-only", move |_| {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );

        emitter
            .emit(&make_event(EventType::EntityCreated), EmitOptions::default())
            .await
            .expect("emit");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        emitter
            .emit(&make_event(EventType::EntityDeleted), EmitOptions::default())
            .await
            .expect("emit");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wildcard_sees_everything() {
        let (emitter, _store) = emitter();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        emitter.on_all(handler_fn("wildcard", move |_| {
            let hits = hits_clone.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }));

        for event_type in [
            EventType::EntityCreated,
            EventType::PropertyChanged,
            EventType::RelationshipDeleted,
        ] {
            emitter
                .emit(&make_event(event_type), EmitOptions::default())
                .await
                .expect("emit");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let (emitter, _store) = emitter();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            emitter.on(
                EventType::EntityCreated,
                handler_fn(format!("h{}", i), move |_| {
                    let order = order.clone();
                    async move {
                        order.lock().expect("order lock").push(i);
                        Ok(())
                    }
                    .boxed()
                }),
            );
        }

        emitter
            .emit(&make_event(EventType::EntityCreated), EmitOptions::default())
            .await
            .expect("emit");
        assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_later_handlers() {
        let (emitter, _store) = emitter();
        let hits = Arc::new(AtomicUsize::new(0));

        emitter.on(
            EventType::EntityCreated,
            handler_fn("fails", |_| {
                async {
                    Err(StorageError::Internal {
                        reason: "boom".to_string(),
                    }
                    .into())
                }
                .boxed()
            }),
        );
        emitter.on(
            EventType::EntityCreated,
            handler_fn("panics", |_| {
                async { panic!("handler panic") }.boxed()
            }),
        );
        let hits_clone = hits.clone();
        emitter.on(
            EventType::EntityCreated,
            handler_fn("survives", move |_| {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );

        emitter
            .emit(&make_event(EventType::EntityCreated), EmitOptions::default())
            .await
            .expect("emit succeeds despite handler failures");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skip_flags() {
        let (emitter, store) = emitter();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        emitter.on_all(handler_fn("counter", move |_| {
            let hits = hits_clone.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }));

        emitter
            .emit(
                &make_event(EventType::EntityCreated),
                EmitOptions {
                    skip_persist: true,
                    skip_handlers: false,
                },
            )
            .await
            .expect("emit");
        assert_eq!(store.len().await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        emitter
            .emit(
                &make_event(EventType::EntityCreated),
                EmitOptions {
                    skip_persist: false,
                    skip_handlers: true,
                },
            )
            .await
            .expect("emit");
        assert_eq!(store.len().await, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_all_preserves_order() {
        let (emitter, _store) = emitter();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        emitter.on_all(handler_fn("recorder", move |event| {
            let seen = seen_clone.clone();
            let id = event.id;
            async move {
                seen.lock().expect("seen lock").push(id);
                Ok(())
            }
            .boxed()
        }));

        let events: Vec<EventRecord> = (0..4)
            .map(|_| make_event(EventType::PropertyChanged))
            .collect();
        emitter
            .emit_all(&events, EmitOptions::default())
            .await
            .expect("emit_all");

        let expected: Vec<_> = events.iter().map(|e| e.id).collect();
        assert_eq!(*seen.lock().expect("seen lock"), expected);
    }
}
