//! Schema registry over PostgreSQL
//!
//! Schemas are product-level configuration, registered by the product
//! loader at startup. Writes upsert the persisted row and refresh the
//! in-memory cache; lookups are cache-only and synchronous.

use super::{internal, PgStore};
use crate::traits::SchemaRegistry;
use async_trait::async_trait;
use tokio_postgres::Row;
use trellis_core::{
    Cardinality, RelationshipSchema, TrellisResult, TypePath, TypeSchema, ValidationError,
};

pub(crate) fn relationship_schema_from_row(row: &Row) -> TrellisResult<RelationshipSchema> {
    let from_types: Vec<String> = row.get("from_types");
    let to_types: Vec<String> = row.get("to_types");
    let cardinality: String = row.get("cardinality");
    let cardinality = parse_cardinality(&cardinality)?;
    Ok(RelationshipSchema {
        relationship_type: row.get("type"),
        from_types: from_types.into_iter().map(TypePath::new_unchecked).collect(),
        to_types: to_types.into_iter().map(TypePath::new_unchecked).collect(),
        cardinality,
        bidirectional: row.get("bidirectional"),
        inverse_type: row.get("inverse_type"),
    })
}

fn parse_cardinality(text: &str) -> TrellisResult<Cardinality> {
    match text {
        "one_to_one" => Ok(Cardinality::OneToOne),
        "one_to_many" => Ok(Cardinality::OneToMany),
        "many_to_one" => Ok(Cardinality::ManyToOne),
        "many_to_many" => Ok(Cardinality::ManyToMany),
        other => Err(ValidationError::InvalidValue {
            field: "cardinality".to_string(),
            reason: format!("unknown cardinality '{}'", other),
        }
        .into()),
    }
}

#[async_trait]
impl SchemaRegistry for PgStore {
    async fn register_type_schema(&self, schema: &TypeSchema) -> TrellisResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO type_schemas (type_path, definition) VALUES ($1, $2) \
             ON CONFLICT (type_path) DO UPDATE SET definition = EXCLUDED.definition",
            &[&schema.type_path.as_str(), &schema.definition],
        )
        .await
        .map_err(internal)?;
        self.type_schema_cache()
            .insert(schema.type_path.as_str().to_string(), schema.clone());
        Ok(())
    }

    async fn register_relationship_schema(
        &self,
        schema: &RelationshipSchema,
    ) -> TrellisResult<()> {
        let conn = self.conn().await?;
        let from_types: Vec<&str> = schema.from_types.iter().map(TypePath::as_str).collect();
        let to_types: Vec<&str> = schema.to_types.iter().map(TypePath::as_str).collect();
        conn.execute(
            "INSERT INTO relationship_schemas \
             (type, from_types, to_types, cardinality, bidirectional, inverse_type) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (type) DO UPDATE SET \
               from_types = EXCLUDED.from_types, \
               to_types = EXCLUDED.to_types, \
               cardinality = EXCLUDED.cardinality, \
               bidirectional = EXCLUDED.bidirectional, \
               inverse_type = EXCLUDED.inverse_type",
            &[
                &schema.relationship_type,
                &from_types,
                &to_types,
                &schema.cardinality.as_str(),
                &schema.bidirectional,
                &schema.inverse_type,
            ],
        )
        .await
        .map_err(internal)?;
        self.relationship_schema_cache()
            .insert(schema.relationship_type.clone(), schema.clone());
        Ok(())
    }

    fn relationship_schema(&self, relationship_type: &str) -> Option<RelationshipSchema> {
        self.relationship_schema_cache()
            .get(relationship_type)
            .map(|entry| entry.value().clone())
    }

    fn type_schema(&self, path: &TypePath) -> Option<TypeSchema> {
        self.type_schema_cache()
            .get(path.as_str())
            .map(|entry| entry.value().clone())
    }
}
