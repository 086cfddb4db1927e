//! Entity structure

use crate::{ActorId, EntityId, Property, TenantId, Timestamp, TypePath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The primary unit of data: a tenant-scoped record with typed properties
/// and a monotonic version.
///
/// In-memory `Entity` values are snapshots of storage rows. Holders must not
/// cache them across mutations; `EntityId` references are always re-resolved
/// through the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub tenant_id: TenantId,
    #[serde(rename = "type")]
    pub entity_type: TypePath,
    pub properties: BTreeMap<String, Property>,
    /// Incremented by exactly 1 on every successful mutation.
    pub version: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub created_by: ActorId,
    /// Set when soft-deleted; soft-deleted entities are invisible to reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<Timestamp>,
}

impl Entity {
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Names of the computed properties, in stable (sorted) order.
    pub fn computed_property_names(&self) -> Vec<String> {
        self.properties
            .iter()
            .filter(|(_, p)| p.is_computed())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Names of the inherited properties, in stable (sorted) order.
    pub fn inherited_property_names(&self) -> Vec<String> {
        self.properties
            .iter()
            .filter(|(_, p)| p.is_inherited())
            .map(|(name, _)| name.clone())
            .collect()
    }
}
