//! Subscription fabric
//!
//! Long-lived WebSocket connections with tenant-scoped, per-subscription
//! filtering. The line protocol:
//!
//! Client → Server: `auth` (must be first), `subscribe`, `unsubscribe`,
//! `ping`. Server → Client: `authenticated`, `subscribed`, `unsubscribed`,
//! `pong`, `event`, `error`.
//!
//! Broadcast runs synchronously with every successful event emission (the
//! registry is attached to the emitter as a wildcard handler). Frames go
//! through per-connection unbounded channels so broadcast never blocks on
//! socket I/O; a closed or errored socket is silently dropped from the
//! registry. No buffering for disconnected clients - delivery is
//! at-most-once per socket.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use trellis_core::{
    ActorId, EntityId, EventRecord, EventType, RecordIdType, SubscriptionId, TenantId, TypePath,
};
use trellis_events::{EventEmitter, EventHandler};
use uuid::Uuid;

// ============================================================================
// PROTOCOL FRAMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        tenant_id: TenantId,
        actor_id: ActorId,
    },
    Subscribe {
        #[serde(default)]
        entity_type: Option<String>,
        #[serde(default)]
        entity_id: Option<EntityId>,
        #[serde(default)]
        event_types: Option<Vec<EventType>>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Authenticated,
    Subscribed {
        subscription_id: SubscriptionId,
    },
    Unsubscribed {
        subscription_id: SubscriptionId,
    },
    Pong,
    Event {
        subscription_id: SubscriptionId,
        event: EventRecord,
    },
    Error {
        code: String,
        message: String,
    },
}

// ============================================================================
// FILTERS
// ============================================================================

/// Per-subscription filter; unset fields are wildcards.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscriptionFilter {
    /// Matches by path prefix: `product` matches `product.variant`.
    pub entity_type: Option<String>,
    pub entity_id: Option<EntityId>,
    pub event_types: Option<Vec<EventType>>,
}

impl SubscriptionFilter {
    /// Whether an event (with its payload-carried entity type, if any)
    /// passes this filter. Tenant scoping happens before this is called.
    pub fn matches(&self, event: &EventRecord, entity_type: Option<&TypePath>) -> bool {
        if let Some(wanted) = &self.entity_type {
            match entity_type {
                Some(actual) => {
                    if !actual.starts_with_path(wanted) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(wanted) = self.entity_id {
            if event.entity_id != Some(wanted) {
                return false;
            }
        }
        if let Some(wanted) = &self.event_types {
            if !wanted.contains(&event.event_type) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

struct Connection {
    tenant_id: TenantId,
    sender: mpsc::UnboundedSender<ServerFrame>,
    subscriptions: HashMap<SubscriptionId, SubscriptionFilter>,
}

/// Process-wide registry of live subscription connections.
///
/// Sharded by connection via `DashMap`, so broadcast traversal never blocks
/// registration of new connections for long; the actual socket writes
/// happen outside any lock, on each connection's writer task.
#[derive(Default)]
pub struct SubscriptionRegistry {
    connections: DashMap<Uuid, Connection>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a broadcast handler on the emitter.
    pub fn attach(self: &Arc<Self>, emitter: &EventEmitter) {
        emitter.on_all(Arc::new(BroadcastHandler {
            registry: self.clone(),
        }));
    }

    fn register(
        &self,
        connection_id: Uuid,
        tenant_id: TenantId,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) {
        self.connections.insert(
            connection_id,
            Connection {
                tenant_id,
                sender,
                subscriptions: HashMap::new(),
            },
        );
    }

    /// Closing a transport removes all subscriptions owned by the socket.
    fn unregister(&self, connection_id: Uuid) {
        self.connections.remove(&connection_id);
    }

    fn subscribe(&self, connection_id: Uuid, filter: SubscriptionFilter) -> Option<SubscriptionId> {
        let mut connection = self.connections.get_mut(&connection_id)?;
        let subscription_id = SubscriptionId::now_v7();
        connection.subscriptions.insert(subscription_id, filter);
        Some(subscription_id)
    }

    fn unsubscribe(&self, connection_id: Uuid, subscription_id: SubscriptionId) -> bool {
        match self.connections.get_mut(&connection_id) {
            Some(mut connection) => connection.subscriptions.remove(&subscription_id).is_some(),
            None => false,
        }
    }

    /// Number of live connections (observability).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Fan an event out to every matching subscription. At-most-once per
    /// socket even when several of its subscriptions match.
    pub fn broadcast(&self, event: &EventRecord) {
        let entity_type = event.entity_type();
        let mut dropped: Vec<Uuid> = Vec::new();

        for entry in self.connections.iter() {
            if entry.tenant_id != event.tenant_id {
                continue;
            }
            let matched = entry
                .subscriptions
                .iter()
                .find(|(_, filter)| filter.matches(event, entity_type.as_ref()));
            if let Some((subscription_id, _)) = matched {
                let frame = ServerFrame::Event {
                    subscription_id: *subscription_id,
                    event: event.clone(),
                };
                if entry.sender.send(frame).is_err() {
                    dropped.push(*entry.key());
                }
            }
        }

        for connection_id in dropped {
            debug!(%connection_id, "dropping closed subscription connection");
            self.unregister(connection_id);
        }
    }
}

struct BroadcastHandler {
    registry: Arc<SubscriptionRegistry>,
}

impl EventHandler for BroadcastHandler {
    fn name(&self) -> &str {
        "subscription-broadcast"
    }

    fn handle<'a>(&'a self, event: &'a EventRecord) -> BoxFuture<'a, trellis_core::TrellisResult<()>> {
        self.registry.broadcast(event);
        async { Ok(()) }.boxed()
    }
}

// ============================================================================
// SOCKET HANDLING
// ============================================================================

/// WebSocket upgrade endpoint. Authentication happens in-band with the
/// first protocol frame, not at upgrade time.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::now_v7();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    // Writer task: the only place that touches the sink.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to serialize server frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Phase 1: the first frame must be auth.
    let tenant_id = loop {
        match next_client_frame(&mut stream, &state).await {
            SocketStep::Frame(ClientFrame::Auth {
                tenant_id,
                actor_id,
            }) => {
                info!(%connection_id, %tenant_id, %actor_id, "subscription socket authenticated");
                let _ = tx.send(ServerFrame::Authenticated);
                break tenant_id;
            }
            SocketStep::Frame(_) => {
                let _ = tx.send(ServerFrame::Error {
                    code: "AUTH_REQUIRED".to_string(),
                    message: "the first message must be an auth frame".to_string(),
                });
            }
            SocketStep::Malformed(message) => {
                let _ = tx.send(ServerFrame::Error {
                    code: "AUTH_REQUIRED".to_string(),
                    message,
                });
            }
            SocketStep::Ignored => {}
            SocketStep::Closed => {
                writer.abort();
                return;
            }
        }
    };

    state.registry.register(connection_id, tenant_id, tx.clone());

    // Phase 2: subscription management until the transport dies.
    loop {
        match next_client_frame(&mut stream, &state).await {
            SocketStep::Frame(frame) => match frame {
                ClientFrame::Auth { .. } => {
                    let _ = tx.send(ServerFrame::Error {
                        code: "ALREADY_AUTHENTICATED".to_string(),
                        message: "this connection is already authenticated".to_string(),
                    });
                }
                ClientFrame::Subscribe {
                    entity_type,
                    entity_id,
                    event_types,
                } => {
                    let filter = SubscriptionFilter {
                        entity_type,
                        entity_id,
                        event_types,
                    };
                    match state.registry.subscribe(connection_id, filter) {
                        Some(subscription_id) => {
                            let _ = tx.send(ServerFrame::Subscribed { subscription_id });
                        }
                        None => break,
                    }
                }
                ClientFrame::Unsubscribe { subscription_id } => {
                    if state.registry.unsubscribe(connection_id, subscription_id) {
                        let _ = tx.send(ServerFrame::Unsubscribed { subscription_id });
                    } else {
                        let _ = tx.send(ServerFrame::Error {
                            code: "SUBSCRIPTION_NOT_FOUND".to_string(),
                            message: format!("no subscription {}", subscription_id),
                        });
                    }
                }
                ClientFrame::Ping => {
                    let _ = tx.send(ServerFrame::Pong);
                }
            },
            SocketStep::Malformed(message) => {
                let _ = tx.send(ServerFrame::Error {
                    code: "VALIDATION_ERROR".to_string(),
                    message,
                });
            }
            SocketStep::Ignored => {}
            SocketStep::Closed => break,
        }
    }

    state.registry.unregister(connection_id);
    drop(tx);
    let _ = writer.await;
    info!(%connection_id, "subscription socket closed");
}

enum SocketStep {
    Frame(ClientFrame),
    Malformed(String),
    /// Transport-level frame that needs no protocol response.
    Ignored,
    Closed,
}

/// Read the next client frame, enforcing the idle policy: after the idle
/// timeout a protocol ping goes out, and a socket silent through the grace
/// period is closed.
async fn next_client_frame(
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
    state: &AppState,
) -> SocketStep {
    let idle = state.config.ws_idle_timeout;
    let grace = state.config.ws_pong_grace;

    let message = match tokio::time::timeout(idle, stream.next()).await {
        Ok(message) => message,
        Err(_) => {
            // Idle: one more chance within the grace period.
            match tokio::time::timeout(grace, stream.next()).await {
                Ok(message) => message,
                Err(_) => return SocketStep::Closed,
            }
        }
    };

    match message {
        None => SocketStep::Closed,
        Some(Err(_)) => SocketStep::Closed,
        Some(Ok(Message::Close(_))) => SocketStep::Closed,
        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => SocketStep::Ignored,
        Some(Ok(Message::Binary(_))) => {
            SocketStep::Malformed("binary frames are not part of the protocol".to_string())
        }
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => SocketStep::Frame(frame),
            Err(e) => SocketStep::Malformed(format!("malformed frame: {}", e)),
        },
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn make_event(
        tenant: TenantId,
        event_type: EventType,
        entity_id: Option<EntityId>,
        entity_type: Option<&str>,
    ) -> EventRecord {
        let payload = match entity_type {
            Some(t) => json!({"type": t}),
            None => json!({}),
        };
        EventRecord::new(
            tenant,
            event_type,
            entity_id,
            ActorId::now_v7(),
            Utc::now(),
            payload,
        )
    }

    #[test]
    fn test_wildcard_filter_matches_everything_in_tenant() {
        let tenant = TenantId::now_v7();
        let filter = SubscriptionFilter::default();
        let event = make_event(tenant, EventType::EntityCreated, None, None);
        assert!(filter.matches(&event, event.entity_type().as_ref()));
    }

    #[test]
    fn test_entity_type_filter_is_prefix_based() {
        let tenant = TenantId::now_v7();
        let filter = SubscriptionFilter {
            entity_type: Some("product".to_string()),
            ..Default::default()
        };

        let variant = make_event(
            tenant,
            EventType::EntityCreated,
            None,
            Some("product.variant"),
        );
        assert!(filter.matches(&variant, variant.entity_type().as_ref()));

        let other = make_event(tenant, EventType::EntityCreated, None, Some("order"));
        assert!(!filter.matches(&other, other.entity_type().as_ref()));

        // Similar name, different path segment
        let lookalike = make_event(tenant, EventType::EntityCreated, None, Some("products"));
        assert!(!filter.matches(&lookalike, lookalike.entity_type().as_ref()));

        // No type in the payload: a type filter cannot match
        let untyped = make_event(tenant, EventType::RelationshipCreated, None, None);
        assert!(!filter.matches(&untyped, untyped.entity_type().as_ref()));
    }

    #[test]
    fn test_entity_id_filter_is_exact() {
        let tenant = TenantId::now_v7();
        let id = EntityId::now_v7();
        let filter = SubscriptionFilter {
            entity_id: Some(id),
            ..Default::default()
        };

        let matching = make_event(tenant, EventType::EntityUpdated, Some(id), None);
        assert!(filter.matches(&matching, None));

        let other = make_event(
            tenant,
            EventType::EntityUpdated,
            Some(EntityId::now_v7()),
            None,
        );
        assert!(!filter.matches(&other, None));
    }

    #[test]
    fn test_event_type_filter_is_membership() {
        let tenant = TenantId::now_v7();
        let filter = SubscriptionFilter {
            event_types: Some(vec![EventType::EntityDeleted, EventType::EntityCreated]),
            ..Default::default()
        };

        let deleted = make_event(tenant, EventType::EntityDeleted, None, None);
        assert!(filter.matches(&deleted, None));

        let changed = make_event(tenant, EventType::PropertyChanged, None, None);
        assert!(!filter.matches(&changed, None));
    }

    #[test]
    fn test_all_filters_conjoin() {
        let tenant = TenantId::now_v7();
        let id = EntityId::now_v7();
        let filter = SubscriptionFilter {
            entity_type: Some("product".to_string()),
            entity_id: Some(id),
            event_types: Some(vec![EventType::EntityUpdated]),
        };

        let matching = make_event(tenant, EventType::EntityUpdated, Some(id), Some("product"));
        assert!(filter.matches(&matching, matching.entity_type().as_ref()));

        let wrong_type = make_event(tenant, EventType::EntityCreated, Some(id), Some("product"));
        assert!(!filter.matches(&wrong_type, wrong_type.entity_type().as_ref()));
    }

    #[test]
    fn test_broadcast_respects_tenant_and_filters() {
        let registry = SubscriptionRegistry::new();
        let tenant_a = TenantId::now_v7();
        let tenant_b = TenantId::now_v7();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let conn_a = Uuid::now_v7();
        let conn_b = Uuid::now_v7();
        registry.register(conn_a, tenant_a, tx_a);
        registry.register(conn_b, tenant_b, tx_b);

        let sub_a = registry
            .subscribe(
                conn_a,
                SubscriptionFilter {
                    entity_type: Some("product".to_string()),
                    ..Default::default()
                },
            )
            .expect("subscribe a");
        registry
            .subscribe(conn_b, SubscriptionFilter::default())
            .expect("subscribe b");

        // entity_created in tenant A, type product.variant
        let event = make_event(
            tenant_a,
            EventType::EntityCreated,
            Some(EntityId::now_v7()),
            Some("product.variant"),
        );
        registry.broadcast(&event);

        match rx_a.try_recv() {
            Ok(ServerFrame::Event {
                subscription_id, ..
            }) => assert_eq!(subscription_id, sub_a),
            other => panic!("expected an event frame for S1, got {:?}", other),
        }
        assert!(rx_b.try_recv().is_err(), "tenant B must receive nothing");
    }

    #[test]
    fn test_closed_socket_dropped_from_registry() {
        let registry = SubscriptionRegistry::new();
        let tenant = TenantId::now_v7();

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Uuid::now_v7();
        registry.register(conn, tenant, tx);
        registry
            .subscribe(conn, SubscriptionFilter::default())
            .expect("subscribe");
        assert_eq!(registry.connection_count(), 1);

        // Simulate the transport dying
        drop(rx);
        let event = make_event(tenant, EventType::EntityCreated, None, None);
        registry.broadcast(&event);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = SubscriptionRegistry::new();
        let tenant = TenantId::now_v7();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::now_v7();
        registry.register(conn, tenant, tx);
        let sub = registry
            .subscribe(conn, SubscriptionFilter::default())
            .expect("subscribe");
        assert!(registry.unsubscribe(conn, sub));
        assert!(!registry.unsubscribe(conn, sub), "double unsubscribe");

        let event = make_event(tenant, EventType::EntityCreated, None, None);
        registry.broadcast(&event);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_client_frame_wire_shapes() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "subscribe",
            "entity_type": "product",
            "event_types": ["entity_created", "property_changed"],
        }))
        .expect("deserialize");
        match frame {
            ClientFrame::Subscribe {
                entity_type,
                entity_id,
                event_types,
            } => {
                assert_eq!(entity_type.as_deref(), Some("product"));
                assert!(entity_id.is_none());
                assert_eq!(
                    event_types,
                    Some(vec![EventType::EntityCreated, EventType::PropertyChanged])
                );
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "ping"})).expect("deserialize");
        assert_eq!(frame, ClientFrame::Ping);
    }

    #[test]
    fn test_server_frame_wire_shapes() {
        let json = serde_json::to_value(ServerFrame::Pong).expect("serialize");
        assert_eq!(json["type"], "pong");

        let sub = SubscriptionId::now_v7();
        let json =
            serde_json::to_value(ServerFrame::Subscribed { subscription_id: sub }).expect("serialize");
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["subscription_id"], sub.to_string());
    }
}
