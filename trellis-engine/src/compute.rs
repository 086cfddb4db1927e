//! Computation service
//!
//! Refreshes the derived properties of one entity: resolves inherited
//! chains, batch-loads every entity and relationship an expression's
//! dependencies can reach, evaluates computed properties in intra-entity
//! topological order, and writes the caches back under the optimistic lock.
//!
//! Cache write-backs (like staleness marks) do not bump the entity version
//! and produce no events: they change derived state only, and bumping would
//! surface spurious `VERSION_CONFLICT`s to clients that only read.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use trellis_core::{
    DependencyPath, DependencyRef, Entity, EntityId, ExpressionError, KernelConfig, Property,
    PropertyStatus, RequestScope, StorageError, TrellisError, TrellisResult, Value,
};
use trellis_expr::{evaluate, extract_dependencies, parse, EvalContext, Expr};
use trellis_storage::{Backend, EntityStore, RelationshipStore};

/// What a refresh pass should touch.
#[derive(Debug, Clone, Copy)]
pub struct RefreshOptions {
    /// Re-evaluate computed properties.
    pub computed: bool,
    /// Re-resolve inherited properties.
    pub inherited: bool,
    /// Skip properties whose status is already `valid`.
    pub only_invalid: bool,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            computed: true,
            inherited: true,
            only_invalid: true,
        }
    }
}

pub struct ComputationService {
    backend: Arc<dyn Backend>,
    config: KernelConfig,
}

impl ComputationService {
    pub fn new(backend: Arc<dyn Backend>, config: KernelConfig) -> Self {
        Self { backend, config }
    }

    /// Refresh an entity's derived properties and persist the result.
    ///
    /// A concurrent writer can win the optimistic lock between evaluation
    /// and write-back; the refresh then re-runs against the fresh snapshot,
    /// up to the configured retry budget.
    pub async fn refresh_entity(
        &self,
        scope: &RequestScope,
        entity: Entity,
        options: RefreshOptions,
    ) -> TrellisResult<Entity> {
        let mut snapshot = entity;
        let mut attempts = 0u32;
        loop {
            let (refreshed, changed) = self.refresh_pass(scope, snapshot.clone(), options).await?;
            if !changed {
                return Ok(refreshed);
            }
            match self
                .backend
                .update_entity(scope, &refreshed, refreshed.version, &[])
                .await
            {
                Ok(()) => return Ok(refreshed),
                Err(TrellisError::Storage(StorageError::VersionConflict { .. }))
                    if attempts < self.config.compute_retry_budget =>
                {
                    attempts += 1;
                    debug!(
                        entity_id = %refreshed.id,
                        attempts,
                        "computed write-back lost the optimistic lock, retrying"
                    );
                    snapshot = self
                        .backend
                        .fetch_entity(scope, refreshed.id)
                        .await?
                        .ok_or_else(|| TrellisError::not_found("entity", refreshed.id))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One evaluation pass over a snapshot. Returns the refreshed entity
    /// and whether anything actually changed.
    async fn refresh_pass(
        &self,
        scope: &RequestScope,
        entity: Entity,
        options: RefreshOptions,
    ) -> TrellisResult<(Entity, bool)> {
        let computed_targets: Vec<String> = if options.computed {
            entity
                .properties
                .iter()
                .filter(|(_, p)| p.is_computed())
                .filter(|(_, p)| {
                    !options.only_invalid || p.status() != Some(PropertyStatus::Valid)
                })
                .map(|(name, _)| name.clone())
                .collect()
        } else {
            Vec::new()
        };

        let inherited_targets: Vec<String> = if options.inherited {
            entity
                .properties
                .iter()
                .filter_map(|(name, p)| match p {
                    Property::Inherited {
                        override_value,
                        status,
                        ..
                    } if override_value.is_none()
                        && (!options.only_invalid || *status != PropertyStatus::Valid) =>
                    {
                        Some(name.clone())
                    }
                    _ => None,
                })
                .collect()
        } else {
            Vec::new()
        };

        if computed_targets.is_empty() && inherited_targets.is_empty() {
            return Ok((entity, false));
        }

        // Parse every target expression up front; a parse failure poisons
        // only its own property.
        let mut parsed: BTreeMap<String, Expr> = BTreeMap::new();
        let mut work = entity;
        for name in &computed_targets {
            let Some(Property::Computed { expression, .. }) = work.properties.get(name) else {
                continue;
            };
            match parse(expression) {
                Ok(expr) => {
                    parsed.insert(name.clone(), expr);
                }
                Err(e) => {
                    set_computed_error(&mut work, name, &e);
                }
            }
        }

        let dependencies: Vec<DependencyPath> = parsed
            .values()
            .flat_map(extract_dependencies)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let inherited_sources: Vec<EntityId> = inherited_targets
            .iter()
            .filter_map(|name| match work.properties.get(name) {
                Some(Property::Inherited { from_entity, .. }) => Some(*from_entity),
                _ => None,
            })
            .collect();

        let (entity_cache, relationship_cache) = self
            .load_caches(scope, &work, &dependencies, &inherited_sources)
            .await?;

        // Inherited first: computed expressions may read the resolved
        // values.
        for name in &inherited_targets {
            self.resolve_inherited(scope, &entity_cache, &mut work, name)
                .await?;
        }

        let (order, cyclic) = evaluation_order(&work, &parsed);
        for name in &cyclic {
            let chain = format!("{}.{}", work.id, name);
            set_computed_error(
                &mut work,
                name,
                &ExpressionError::CircularDependency { chain },
            );
        }

        let mut ctx = EvalContext::new(scope.tenant_id, work)
            .with_caches(entity_cache, relationship_cache);
        for name in &order {
            let Some(expr) = parsed.get(name) else {
                continue;
            };
            let entity_id = ctx.current_entity.id;
            if let Err(e) = ctx.enter_property(entity_id, name) {
                set_computed_error(&mut ctx.current_entity, name, &e);
                continue;
            }
            let outcome = evaluate(expr, &mut ctx);
            ctx.exit_property(entity_id, name);

            if let Some(Property::Computed {
                cached_value,
                status,
                last_error,
                ..
            }) = ctx.current_entity.properties.get_mut(name)
            {
                match outcome.error {
                    None => {
                        *cached_value = outcome.value;
                        *status = PropertyStatus::Valid;
                        *last_error = None;
                    }
                    Some(e) => {
                        warn!(
                            entity_id = %entity_id,
                            property = %name,
                            error = %e,
                            "computed property evaluation failed"
                        );
                        *status = PropertyStatus::Error;
                        *last_error = Some(e.to_string());
                    }
                }
            }
        }

        Ok((ctx.current_entity.clone(), true))
    }

    /// Batch-load every entity and relationship mapping the dependency set
    /// can reach: explicit `@{uuid}` references, inherited sources, and the
    /// frontier of each relationship chain, one hop at a time.
    async fn load_caches(
        &self,
        scope: &RequestScope,
        entity: &Entity,
        dependencies: &[DependencyPath],
        inherited_sources: &[EntityId],
    ) -> TrellisResult<(
        HashMap<EntityId, Entity>,
        HashMap<EntityId, HashMap<String, Vec<EntityId>>>,
    )> {
        let mut entity_cache: HashMap<EntityId, Entity> = HashMap::new();

        let mut explicit: BTreeSet<EntityId> = inherited_sources.iter().copied().collect();
        for dep in dependencies {
            if let DependencyRef::Entity(id) = dep.entity_ref {
                explicit.insert(id);
            }
        }
        explicit.remove(&entity.id);
        if !explicit.is_empty() {
            let ids: Vec<EntityId> = explicit.into_iter().collect();
            for loaded in self.backend.fetch_entities(scope, &ids).await? {
                entity_cache.insert(loaded.id, loaded);
            }
        }

        let mut relationship_cache: HashMap<EntityId, HashMap<String, Vec<EntityId>>> =
            HashMap::new();
        let chain_depth = dependencies
            .iter()
            .map(|d| d.relationships.len())
            .max()
            .unwrap_or(0);

        let mut frontier: Vec<EntityId> = std::iter::once(entity.id)
            .chain(entity_cache.keys().copied())
            .collect();
        let mut visited: HashSet<EntityId> = frontier.iter().copied().collect();

        for hop in 0..chain_depth {
            let wanted: HashSet<&str> = dependencies
                .iter()
                .filter_map(|d| d.relationships.get(hop))
                .map(String::as_str)
                .collect();
            if wanted.is_empty() || frontier.is_empty() {
                break;
            }

            let adjacency = self.backend.related_map(scope, &frontier).await?;
            let mut next: Vec<EntityId> = Vec::new();
            for (from, by_type) in adjacency {
                for (rtype, targets) in &by_type {
                    if wanted.contains(rtype.as_str()) {
                        for target in targets {
                            if visited.insert(*target) {
                                next.push(*target);
                            }
                        }
                    }
                }
                relationship_cache.entry(from).or_default().extend(by_type);
            }

            if !next.is_empty() {
                for loaded in self.backend.fetch_entities(scope, &next).await? {
                    entity_cache.insert(loaded.id, loaded);
                }
            }
            frontier = next;
        }

        Ok((entity_cache, relationship_cache))
    }

    /// Resolve one inherited property by walking its source chain. The
    /// chain is bounded; broken links surface as an error status on the
    /// property, never as a request failure.
    async fn resolve_inherited(
        &self,
        scope: &RequestScope,
        entity_cache: &HashMap<EntityId, Entity>,
        work: &mut Entity,
        name: &str,
    ) -> TrellisResult<()> {
        let Some(Property::Inherited {
            from_entity,
            from_property,
            ..
        }) = work.properties.get(name)
        else {
            return Ok(());
        };

        let resolution = self
            .walk_inheritance(scope, entity_cache, *from_entity, from_property.clone())
            .await;

        if let Some(Property::Inherited {
            resolved_value,
            status,
            ..
        }) = work.properties.get_mut(name)
        {
            match resolution {
                Ok(value) => {
                    *resolved_value = value;
                    *status = PropertyStatus::Valid;
                }
                Err(e) => {
                    warn!(
                        entity_id = %work.id,
                        property = %name,
                        error = %e,
                        "inherited property resolution failed"
                    );
                    *resolved_value = None;
                    *status = PropertyStatus::Error;
                }
            }
        }
        Ok(())
    }

    async fn walk_inheritance(
        &self,
        scope: &RequestScope,
        entity_cache: &HashMap<EntityId, Entity>,
        from_entity: EntityId,
        from_property: String,
    ) -> TrellisResult<Option<Value>> {
        let mut current = (from_entity, from_property);
        for _ in 0..self.config.max_inheritance_depth {
            let source = match entity_cache.get(&current.0) {
                Some(source) => source.clone(),
                None => self
                    .backend
                    .fetch_entity(scope, current.0)
                    .await?
                    .ok_or(StorageError::ReferenceBroken {
                        entity_id: current.0,
                        reason: "inheritance source does not exist".to_string(),
                    })?,
            };
            match source.property(&current.1) {
                None => {
                    return Err(StorageError::ReferenceBroken {
                        entity_id: source.id,
                        reason: format!("inherited property '{}' is missing", current.1),
                    }
                    .into());
                }
                Some(Property::Inherited {
                    override_value: Some(value),
                    ..
                }) => return Ok(Some(value.clone())),
                Some(Property::Inherited {
                    from_entity,
                    from_property,
                    resolved_value,
                    status,
                    ..
                }) => {
                    if *status == PropertyStatus::Valid {
                        if let Some(value) = resolved_value {
                            return Ok(Some(value.clone()));
                        }
                    }
                    current = (*from_entity, from_property.clone());
                }
                Some(property) => return Ok(property.effective_value().cloned()),
            }
        }
        Err(StorageError::ReferenceBroken {
            entity_id: from_entity,
            reason: "inheritance chain too deep".to_string(),
        }
        .into())
    }
}

// ============================================================================
// TOPOLOGICAL ORDERING
// ============================================================================

/// Order the parsed computed properties so that a property reading another
/// computed property on the same entity evaluates after it. Returns the
/// order and the members of any intra-entity cycle.
fn evaluation_order(
    entity: &Entity,
    parsed: &BTreeMap<String, Expr>,
) -> (Vec<String>, Vec<String>) {
    // edges: prerequisite -> dependents
    let mut dependents_of: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut indegree: BTreeMap<&str, usize> = parsed.keys().map(|k| (k.as_str(), 0)).collect();

    for (name, expr) in parsed {
        for dep in extract_dependencies(expr) {
            let own = dep.relationships.is_empty()
                && matches!(dep.entity_ref, DependencyRef::Current);
            if !own || dep.property == *name {
                continue;
            }
            let prerequisite = match parsed.get_key_value(&dep.property) {
                Some((key, _)) => key.as_str(),
                None => continue,
            };
            if entity
                .property(prerequisite)
                .map(Property::is_computed)
                .unwrap_or(false)
            {
                dependents_of
                    .entry(prerequisite)
                    .or_default()
                    .push(name.as_str());
                if let Some(count) = indegree.get_mut(name.as_str()) {
                    *count += 1;
                }
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(parsed.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        for dependent in dependents_of.get(name).into_iter().flatten() {
            if let Some(count) = indegree.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    // Whatever Kahn's algorithm never drained sits on a cycle.
    let cyclic: Vec<String> = indegree
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(name, _)| name.to_string())
        .collect();
    (order, cyclic)
}

fn set_computed_error(entity: &mut Entity, name: &str, error: &ExpressionError) {
    if let Some(Property::Computed {
        status, last_error, ..
    }) = entity.properties.get_mut(name)
    {
        *status = PropertyStatus::Error;
        *last_error = Some(error.to_string());
    }
}
