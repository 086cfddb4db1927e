//! Trellis Engine - Reactive Computation Core
//!
//! Orchestrates everything between the HTTP surface and storage:
//!
//! - [`EntityService`] / [`RelationshipService`]: validated mutations that
//!   commit with their events, keep the dependent index current, and emit.
//! - [`DependentIndex`]: reverse index from `(entity, property)` to the
//!   computed/inherited properties that read it.
//! - [`StalenessPropagator`]: `property_changed` handler that cascades
//!   `stale` marks through the index.
//! - [`ComputationService`]: batch-loads an expression's reachable inputs,
//!   evaluates computed properties in intra-entity topological order, and
//!   writes caches back under the optimistic lock.

mod dependents;
mod propagator;
mod compute;
mod service;

pub use compute::{ComputationService, RefreshOptions};
pub use dependents::DependentIndex;
pub use propagator::StalenessPropagator;
pub use service::{
    CreateEntityRequest, CreateRelationshipRequest, EntityService, GetOptions,
    RelationshipService, UpdateEntityRequest,
};

use std::sync::Arc;
use trellis_core::KernelConfig;
use trellis_events::EventEmitter;
use trellis_storage::Backend;

/// The wired-up engine: one constructor builds the services, the emitter,
/// and registers the staleness propagator.
pub struct Engine {
    pub entities: Arc<EntityService>,
    pub relationships: Arc<RelationshipService>,
    pub compute: Arc<ComputationService>,
    pub index: Arc<DependentIndex>,
    pub emitter: Arc<EventEmitter>,
    pub backend: Arc<dyn Backend>,
    pub config: KernelConfig,
}

impl Engine {
    pub fn new(backend: Arc<dyn Backend>, config: KernelConfig) -> Self {
        let emitter = Arc::new(EventEmitter::new(backend.clone()));
        let index = Arc::new(DependentIndex::new());
        let compute = Arc::new(ComputationService::new(backend.clone(), config.clone()));

        let propagator = Arc::new(StalenessPropagator::new(backend.clone(), index.clone()));
        propagator.register(&emitter);

        let entities = Arc::new(EntityService::new(
            backend.clone(),
            emitter.clone(),
            index.clone(),
            compute.clone(),
            config.clone(),
        ));
        let relationships = Arc::new(RelationshipService::new(backend.clone(), emitter.clone()));

        Self {
            entities,
            relationships,
            compute,
            index,
            emitter,
            backend,
            config,
        }
    }
}
