//! Trellis Storage - Traits and PostgreSQL Backend
//!
//! Defines the storage abstraction the engine is written against
//! ([`EntityStore`], [`RelationshipStore`], [`SchemaRegistry`], plus the
//! [`trellis_events::EventStore`] contract) and the production PostgreSQL
//! implementation.
//!
//! Every operation takes a [`trellis_core::RequestScope`]; tenant isolation
//! is enforced by scoping every SQL statement with `tenant_id`, and
//! cross-tenant lookups come back empty rather than erroring.

pub mod pool;
pub mod query;
pub mod traits;

mod pg;

pub use pg::PgStore;
pub use pool::DbConfig;
pub use query::{
    build_entity_query, cursor_for_entity, decode_cursor, encode_cursor, BuiltQuery, Cursor,
    SqlQuery, SqlValue,
};
pub use traits::{Backend, EntityStore, RelationshipStore, SchemaRegistry};
