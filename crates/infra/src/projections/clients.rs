use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use tally_clients::{ClientDetails, ClientEvent, ClientId, ClientStatus, normalize_email};
use tally_core::TenantId;
use tally_events::EventEnvelope;

use super::ProjectionError;
use super::cursor_store::{CursorDecision, StreamCursors};
use crate::read_model::TenantStore;

pub const CLIENT_AGGREGATE: &str = "clients.client";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReadModel {
    pub client_id: ClientId,
    pub details: ClientDetails,
    pub status: ClientStatus,
    pub registered_at: DateTime<Utc>,
}

/// Tenant client directory. Deleted clients are dropped.
#[derive(Debug)]
pub struct ClientDirectoryProjection<S>
where
    S: TenantStore<ClientId, ClientReadModel>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> ClientDirectoryProjection<S>
where
    S: TenantStore<ClientId, ClientReadModel>,
{
    pub fn new(store: S) -> Self {
        Self::with_cursors(store, StreamCursors::new("clients.directory"))
    }

    pub fn with_cursors(store: S, cursors: StreamCursors) -> Self {
        Self { store, cursors }
    }

    pub fn get(&self, tenant_id: TenantId, client_id: &ClientId) -> Option<ClientReadModel> {
        self.store.get(tenant_id, client_id)
    }

    /// Sorted by name, then registration time.
    pub fn list(&self, tenant_id: TenantId, status: Option<ClientStatus>) -> Vec<ClientReadModel> {
        let mut clients: Vec<ClientReadModel> = self
            .store
            .list(tenant_id)
            .into_iter()
            .filter(|c| status.is_none_or(|s| c.status == s))
            .collect();
        clients.sort_by(|a, b| {
            a.details
                .name
                .to_lowercase()
                .cmp(&b.details.name.to_lowercase())
                .then(a.registered_at.cmp(&b.registered_at))
        });
        clients
    }

    /// Case-insensitive lookup.
    pub fn find_by_email(&self, tenant_id: TenantId, email: &str) -> Option<ClientReadModel> {
        let wanted = normalize_email(email);
        self.store
            .list(tenant_id)
            .into_iter()
            .find(|c| normalize_email(&c.details.email) == wanted)
    }

    pub fn active_count(&self, tenant_id: TenantId) -> u32 {
        let count = self
            .store
            .list(tenant_id)
            .iter()
            .filter(|c| c.status == ClientStatus::Active)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != CLIENT_AGGREGATE {
            return Ok(());
        }

        let seq = match self.cursors.decide(envelope)? {
            CursorDecision::Skip => return Ok(()),
            CursorDecision::Apply(seq) => seq,
        };

        let tenant_id = envelope.tenant_id();
        let ev: ClientEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        if ev.tenant_id() != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        let client_id = ev.client_id();
        if client_id.0 != envelope.aggregate_id() {
            return Err(ProjectionError::TenantIsolation(
                "event client_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            ClientEvent::ClientRegistered(e) => {
                self.store.upsert(
                    tenant_id,
                    client_id,
                    ClientReadModel {
                        client_id,
                        details: e.details,
                        status: ClientStatus::Active,
                        registered_at: e.occurred_at,
                    },
                );
            }
            ClientEvent::ClientDeleted(_) => {
                self.store.remove(tenant_id, &client_id);
            }
            other => {
                let mut rm = self.store.get(tenant_id, &client_id).ok_or_else(|| {
                    ProjectionError::MissingRecord(format!("client {client_id} has no read model"))
                })?;
                match other {
                    ClientEvent::ClientUpdated(e) => rm.details = e.details,
                    ClientEvent::ClientDeactivated(_) => rm.status = ClientStatus::Inactive,
                    ClientEvent::ClientReactivated(_) => rm.status = ClientStatus::Active,
                    ClientEvent::ClientRegistered(_) | ClientEvent::ClientDeleted(_) => {}
                }
                self.store.upsert(tenant_id, client_id, rm);
            }
        }

        self.cursors.advance(tenant_id, envelope.aggregate_id(), seq);
        Ok(())
    }

    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        let envelopes = super::prepare_rebuild(envelopes, |tenant_id| {
            self.store.clear_tenant(tenant_id);
            self.cursors.clear(tenant_id);
        });
        for env in &envelopes {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tally_clients::{ClientDeactivated, ClientRegistered};
    use tally_core::AggregateId;
    use uuid::Uuid;

    use crate::read_model::InMemoryTenantStore;

    fn envelope(tenant_id: TenantId, client_id: ClientId, seq: u64, ev: &ClientEvent) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            client_id.0,
            CLIENT_AGGREGATE,
            seq,
            serde_json::to_value(ev).unwrap(),
        )
    }

    fn registered(tenant_id: TenantId, client_id: ClientId, name: &str, email: &str) -> ClientEvent {
        ClientEvent::ClientRegistered(ClientRegistered {
            tenant_id,
            client_id,
            details: ClientDetails {
                name: name.to_string(),
                email: email.to_string(),
                ..ClientDetails::default()
            },
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn directory_tracks_status_and_email() {
        let projection = ClientDirectoryProjection::new(Arc::new(InMemoryTenantStore::new()));
        let tenant_id = TenantId::new();
        let acme = ClientId::new(AggregateId::new());
        let globex = ClientId::new(AggregateId::new());

        projection
            .apply_envelope(&envelope(tenant_id, acme, 1, &registered(tenant_id, acme, "Acme", "billing@acme.test")))
            .unwrap();
        projection
            .apply_envelope(&envelope(tenant_id, globex, 1, &registered(tenant_id, globex, "Globex", "ap@globex.test")))
            .unwrap();
        projection
            .apply_envelope(&envelope(
                tenant_id,
                globex,
                2,
                &ClientEvent::ClientDeactivated(ClientDeactivated {
                    tenant_id,
                    client_id: globex,
                    occurred_at: Utc::now(),
                }),
            ))
            .unwrap();

        assert_eq!(projection.active_count(tenant_id), 1);
        assert_eq!(
            projection.find_by_email(tenant_id, " Billing@ACME.test").map(|c| c.client_id),
            Some(acme)
        );
        assert!(projection.find_by_email(TenantId::new(), "billing@acme.test").is_none());

        let names: Vec<String> = projection
            .list(tenant_id, None)
            .into_iter()
            .map(|c| c.details.name)
            .collect();
        assert_eq!(names, vec!["Acme", "Globex"]);
        assert_eq!(projection.list(tenant_id, Some(ClientStatus::Inactive)).len(), 1);
    }

    #[test]
    fn rebuild_replays_the_same_directory() {
        let projection = ClientDirectoryProjection::new(Arc::new(InMemoryTenantStore::new()));
        let tenant_id = TenantId::new();
        let acme = ClientId::new(AggregateId::new());
        let history = vec![envelope(tenant_id, acme, 1, &registered(tenant_id, acme, "Acme", "a@acme.test"))];

        projection.rebuild_from_scratch(history.clone()).unwrap();
        projection.rebuild_from_scratch(history).unwrap();

        assert_eq!(projection.list(tenant_id, None).len(), 1);
    }
}
