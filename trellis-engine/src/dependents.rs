//! Dependent index
//!
//! Reverse index answering "which derived properties read this one?". It is
//! derived from the `dependencies` of every computed property (and the
//! source of every inherited property) and maintained incrementally on
//! every entity write.
//!
//! Two maps back it:
//! - *direct*: dependencies that name their source exactly (`self` paths
//!   without relationship hops, explicit `@{uuid}` references, inherited
//!   sources), keyed by `(tenant, entity, property)`.
//! - *by property*: relationship-traversal dependencies, keyed by
//!   `(tenant, property)` only. Which entities a chain like
//!   `parent.category.markup` reaches changes as relationships change, so
//!   the index stays conservative: any change to a `markup` anywhere in the
//!   tenant invalidates the dependent. Over-invalidation only costs a
//!   recomputation; under-invalidation would serve wrong values.

use dashmap::DashMap;
use std::collections::HashSet;
use trellis_core::{DependencyRef, Entity, EntityId, Property, TenantId};

/// A derived property that depends on something: `(owner, property_name)`.
pub type Dependent = (EntityId, String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Direct(EntityId, String),
    ByProperty(String),
}

/// Process-wide dependent index.
#[derive(Debug, Default)]
pub struct DependentIndex {
    direct: DashMap<(TenantId, EntityId, String), HashSet<Dependent>>,
    by_property: DashMap<(TenantId, String), HashSet<Dependent>>,
    /// Keys contributed by each entity, for incremental removal.
    owned: DashMap<(TenantId, EntityId), Vec<IndexKey>>,
}

impl DependentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)index an entity's derived properties. Replaces whatever the
    /// entity contributed before; call on create and on every update.
    pub fn index_entity(&self, entity: &Entity) {
        self.remove_entity(entity.tenant_id, entity.id);

        let tenant = entity.tenant_id;
        let mut keys = Vec::new();
        for (name, property) in &entity.properties {
            match property {
                Property::Computed { dependencies, .. } => {
                    for dep in dependencies {
                        if dep.relationships.is_empty() {
                            let source = match dep.entity_ref {
                                DependencyRef::Current => entity.id,
                                DependencyRef::Entity(id) => id,
                            };
                            self.direct
                                .entry((tenant, source, dep.property.clone()))
                                .or_default()
                                .insert((entity.id, name.clone()));
                            keys.push(IndexKey::Direct(source, dep.property.clone()));
                        } else {
                            self.by_property
                                .entry((tenant, dep.property.clone()))
                                .or_default()
                                .insert((entity.id, name.clone()));
                            keys.push(IndexKey::ByProperty(dep.property.clone()));
                        }
                    }
                }
                Property::Inherited {
                    from_entity,
                    from_property,
                    ..
                } => {
                    self.direct
                        .entry((tenant, *from_entity, from_property.clone()))
                        .or_default()
                        .insert((entity.id, name.clone()));
                    keys.push(IndexKey::Direct(*from_entity, from_property.clone()));
                }
                Property::Literal { .. } | Property::Measured { .. } => {}
            }
        }

        if !keys.is_empty() {
            self.owned.insert((tenant, entity.id), keys);
        }
    }

    /// Drop everything an entity contributed (on delete, and as the first
    /// half of re-indexing).
    pub fn remove_entity(&self, tenant: TenantId, entity_id: EntityId) {
        let Some((_, keys)) = self.owned.remove(&(tenant, entity_id)) else {
            return;
        };
        for key in keys {
            match key {
                IndexKey::Direct(source, property) => {
                    let map_key = (tenant, source, property);
                    if let Some(mut entry) = self.direct.get_mut(&map_key) {
                        entry.retain(|(owner, _)| *owner != entity_id);
                        if entry.is_empty() {
                            drop(entry);
                            self.direct.remove(&map_key);
                        }
                    }
                }
                IndexKey::ByProperty(property) => {
                    let map_key = (tenant, property);
                    if let Some(mut entry) = self.by_property.get_mut(&map_key) {
                        entry.retain(|(owner, _)| *owner != entity_id);
                        if entry.is_empty() {
                            drop(entry);
                            self.by_property.remove(&map_key);
                        }
                    }
                }
            }
        }
    }

    /// Everyone who reads `(entity_id, property)`, deduplicated, with the
    /// changed property itself excluded.
    pub fn dependents_of(
        &self,
        tenant: TenantId,
        entity_id: EntityId,
        property: &str,
    ) -> Vec<Dependent> {
        let mut out: HashSet<Dependent> = HashSet::new();
        if let Some(entry) = self
            .direct
            .get(&(tenant, entity_id, property.to_string()))
        {
            out.extend(entry.iter().cloned());
        }
        if let Some(entry) = self.by_property.get(&(tenant, property.to_string())) {
            out.extend(entry.iter().cloned());
        }
        out.remove(&(entity_id, property.to_string()));
        let mut out: Vec<Dependent> = out.into_iter().collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use trellis_core::{ActorId, DependencyPath, PropertyStatus, RecordIdType, TypePath};

    fn entity_with_computed(
        tenant: TenantId,
        deps: Vec<DependencyPath>,
    ) -> Entity {
        let mut properties = BTreeMap::new();
        properties.insert(
            "derived".to_string(),
            Property::Computed {
                expression: "#x".to_string(),
                dependencies: deps,
                cached_value: None,
                status: PropertyStatus::Pending,
                last_error: None,
            },
        );
        Entity {
            id: EntityId::now_v7(),
            tenant_id: tenant,
            entity_type: TypePath::new_unchecked("part"),
            properties,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by: ActorId::now_v7(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_self_dependency_indexed_directly() {
        let tenant = TenantId::now_v7();
        let index = DependentIndex::new();
        let entity = entity_with_computed(tenant, vec![DependencyPath::own("x")]);
        index.index_entity(&entity);

        let dependents = index.dependents_of(tenant, entity.id, "x");
        assert_eq!(dependents, vec![(entity.id, "derived".to_string())]);
    }

    #[test]
    fn test_explicit_reference_indexed_under_source() {
        let tenant = TenantId::now_v7();
        let index = DependentIndex::new();
        let source = EntityId::now_v7();
        let entity = entity_with_computed(
            tenant,
            vec![DependencyPath::new(
                DependencyRef::Entity(source),
                vec![],
                "price",
                false,
            )],
        );
        index.index_entity(&entity);

        assert_eq!(
            index.dependents_of(tenant, source, "price"),
            vec![(entity.id, "derived".to_string())]
        );
        assert!(index.dependents_of(tenant, entity.id, "price").is_empty());
    }

    #[test]
    fn test_relationship_dependency_is_property_wide() {
        let tenant = TenantId::now_v7();
        let index = DependentIndex::new();
        let entity = entity_with_computed(
            tenant,
            vec![DependencyPath::new(
                DependencyRef::Current,
                vec!["items".to_string()],
                "price",
                true,
            )],
        );
        index.index_entity(&entity);

        // Any entity's `price` change in the tenant reaches the dependent.
        let other = EntityId::now_v7();
        assert_eq!(
            index.dependents_of(tenant, other, "price"),
            vec![(entity.id, "derived".to_string())]
        );
    }

    #[test]
    fn test_tenant_isolation() {
        let tenant_a = TenantId::now_v7();
        let tenant_b = TenantId::now_v7();
        let index = DependentIndex::new();
        let entity = entity_with_computed(tenant_a, vec![DependencyPath::own("x")]);
        index.index_entity(&entity);

        assert!(index.dependents_of(tenant_b, entity.id, "x").is_empty());
    }

    #[test]
    fn test_inherited_source_indexed() {
        let tenant = TenantId::now_v7();
        let index = DependentIndex::new();
        let parent = EntityId::now_v7();

        let mut properties = BTreeMap::new();
        properties.insert(
            "markup".to_string(),
            Property::Inherited {
                from_entity: parent,
                from_property: "markup".to_string(),
                override_value: None,
                resolved_value: None,
                status: PropertyStatus::Pending,
            },
        );
        let entity = Entity {
            id: EntityId::now_v7(),
            tenant_id: tenant,
            entity_type: TypePath::new_unchecked("part"),
            properties,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by: ActorId::now_v7(),
            deleted_at: None,
        };
        index.index_entity(&entity);

        assert_eq!(
            index.dependents_of(tenant, parent, "markup"),
            vec![(entity.id, "markup".to_string())]
        );
    }

    #[test]
    fn test_reindex_replaces_previous_contribution() {
        let tenant = TenantId::now_v7();
        let index = DependentIndex::new();
        let mut entity = entity_with_computed(tenant, vec![DependencyPath::own("x")]);
        index.index_entity(&entity);

        // Expression changed: now reads y instead of x
        entity.properties.insert(
            "derived".to_string(),
            Property::Computed {
                expression: "#y".to_string(),
                dependencies: vec![DependencyPath::own("y")],
                cached_value: None,
                status: PropertyStatus::Pending,
                last_error: None,
            },
        );
        index.index_entity(&entity);

        assert!(index.dependents_of(tenant, entity.id, "x").is_empty());
        assert_eq!(
            index.dependents_of(tenant, entity.id, "y"),
            vec![(entity.id, "derived".to_string())]
        );
    }

    #[test]
    fn test_remove_entity_clears_index() {
        let tenant = TenantId::now_v7();
        let index = DependentIndex::new();
        let entity = entity_with_computed(tenant, vec![DependencyPath::own("x")]);
        index.index_entity(&entity);
        index.remove_entity(tenant, entity.id);

        assert!(index.dependents_of(tenant, entity.id, "x").is_empty());
    }

    #[test]
    fn test_changed_property_itself_excluded() {
        let tenant = TenantId::now_v7();
        let index = DependentIndex::new();
        // A computed property that (pathologically) reads itself
        let entity = entity_with_computed(tenant, vec![DependencyPath::own("derived")]);
        index.index_entity(&entity);

        assert!(index
            .dependents_of(tenant, entity.id, "derived")
            .is_empty());
    }
}
