//! Staleness propagator
//!
//! Registered as a `property_changed` handler. When a property is added or
//! modified, every derived property that (transitively) reads it gets its
//! status downgraded to `stale` through a dedicated low-level update that
//! produces no event of its own - a cascading `property_changed` per mark
//! would amplify the log combinatorially. Removals do not propagate; a
//! computed property whose input vanished fails naturally at its next
//! evaluation.

use crate::dependents::DependentIndex;
use futures_util::FutureExt;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use trellis_core::{
    ChangeType, EntityId, EventRecord, EventType, PropertyChangedPayload, RequestScope,
    TrellisResult,
};
use trellis_events::{handler_fn, EventEmitter};
use trellis_storage::{Backend, EntityStore};

pub struct StalenessPropagator {
    backend: Arc<dyn Backend>,
    index: Arc<DependentIndex>,
}

impl StalenessPropagator {
    pub fn new(backend: Arc<dyn Backend>, index: Arc<DependentIndex>) -> Self {
        Self { backend, index }
    }

    /// Subscribe to `property_changed` on the emitter.
    pub fn register(self: &Arc<Self>, emitter: &EventEmitter) {
        let propagator = self.clone();
        emitter.on(
            EventType::PropertyChanged,
            handler_fn("staleness-propagator", move |event| {
                let propagator = propagator.clone();
                let event = event.clone();
                async move { propagator.handle(&event).await }.boxed()
            }),
        );
    }

    async fn handle(&self, event: &EventRecord) -> TrellisResult<()> {
        let payload: PropertyChangedPayload = match serde_json::from_value(event.payload.clone())
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "malformed property_changed payload");
                return Ok(());
            }
        };
        if payload.change_type == ChangeType::Removed {
            return Ok(());
        }
        let Some(entity_id) = event.entity_id else {
            return Ok(());
        };

        let scope = RequestScope::new(event.tenant_id, event.actor_id);
        let marked = self
            .propagate(&scope, entity_id, &payload.property_name)
            .await?;
        if marked > 0 {
            debug!(
                tenant_id = %event.tenant_id,
                entity_id = %entity_id,
                property = %payload.property_name,
                marked,
                "staleness propagated"
            );
        }
        Ok(())
    }

    /// Mark every transitive dependent of `(entity_id, property)` stale.
    /// The visited set bounds the cascade and breaks dependency cycles.
    /// Returns how many properties were downgraded.
    pub async fn propagate(
        &self,
        scope: &RequestScope,
        entity_id: EntityId,
        property: &str,
    ) -> TrellisResult<usize> {
        let mut visited: HashSet<(EntityId, String)> = HashSet::new();
        let mut queue: VecDeque<(EntityId, String)> = self
            .index
            .dependents_of(scope.tenant_id, entity_id, property)
            .into_iter()
            .collect();
        let mut marked = 0;

        while let Some((dependent_id, dependent_property)) = queue.pop_front() {
            if !visited.insert((dependent_id, dependent_property.clone())) {
                continue;
            }
            if self
                .backend
                .mark_property_stale(scope, dependent_id, &dependent_property)
                .await?
            {
                marked += 1;
            }
            // Transitive: the dependent's own readers go stale too, in
            // marking order.
            for next in self
                .index
                .dependents_of(scope.tenant_id, dependent_id, &dependent_property)
            {
                if !visited.contains(&next) {
                    queue.push_back(next);
                }
            }
        }

        Ok(marked)
    }
}
