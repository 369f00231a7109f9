use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{Aggregate, AggregateId, AggregateRoot, DomainError, TenantId};
use tally_events::Event;

/// Client identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub AggregateId);

impl ClientId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ClientId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Active,
    Inactive,
    Deleted,
}

/// Editable client attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientDetails {
    pub name: String,
    /// Contact email; unique per tenant (case-insensitive).
    pub email: String,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// Lower-cased, trimmed form used for uniqueness checks.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_details(details: &ClientDetails) -> Result<ClientDetails, DomainError> {
    let name = details.name.trim();
    if name.is_empty() {
        return Err(DomainError::validation("client name cannot be empty"));
    }

    let email = normalize_email(&details.email);
    let valid_email = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    };
    if !valid_email || email.chars().any(char::is_whitespace) {
        return Err(DomainError::validation(format!("invalid client email '{}'", details.email)));
    }

    Ok(ClientDetails {
        name: name.to_string(),
        email,
        company: details.company.clone(),
        phone: details.phone.clone(),
        address: details.address.clone(),
    })
}

/// Aggregate root: Client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    id: ClientId,
    tenant_id: Option<TenantId>,
    details: ClientDetails,
    status: ClientStatus,
    version: u64,
    created: bool,
}

impl Client {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: ClientId) -> Self {
        Self {
            id,
            tenant_id: None,
            details: ClientDetails::default(),
            status: ClientStatus::Active,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ClientId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn details(&self) -> &ClientDetails {
        &self.details
    }

    pub fn status(&self) -> ClientStatus {
        self.status
    }

    /// Whether the client exists for its tenant (registered and not hard-deleted).
    pub fn exists(&self) -> bool {
        self.created && self.status != ClientStatus::Deleted
    }

    /// Only active clients can be invoiced.
    pub fn can_be_invoiced(&self) -> bool {
        self.exists() && self.status == ClientStatus::Active
    }
}

impl AggregateRoot for Client {
    type Id = ClientId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterClient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterClient {
    pub tenant_id: TenantId,
    pub client_id: ClientId,
    pub details: ClientDetails,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateClient (full replace of the editable details).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateClient {
    pub tenant_id: TenantId,
    pub client_id: ClientId,
    pub details: ClientDetails,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeactivateClient (soft delete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateClient {
    pub tenant_id: TenantId,
    pub client_id: ClientId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReactivateClient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactivateClient {
    pub tenant_id: TenantId,
    pub client_id: ClientId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeleteClient (hard delete; the caller has checked no invoice references it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteClient {
    pub tenant_id: TenantId,
    pub client_id: ClientId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientCommand {
    RegisterClient(RegisterClient),
    UpdateClient(UpdateClient),
    DeactivateClient(DeactivateClient),
    ReactivateClient(ReactivateClient),
    DeleteClient(DeleteClient),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistered {
    pub tenant_id: TenantId,
    pub client_id: ClientId,
    pub details: ClientDetails,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUpdated {
    pub tenant_id: TenantId,
    pub client_id: ClientId,
    pub details: ClientDetails,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDeactivated {
    pub tenant_id: TenantId,
    pub client_id: ClientId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReactivated {
    pub tenant_id: TenantId,
    pub client_id: ClientId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDeleted {
    pub tenant_id: TenantId,
    pub client_id: ClientId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    ClientRegistered(ClientRegistered),
    ClientUpdated(ClientUpdated),
    ClientDeactivated(ClientDeactivated),
    ClientReactivated(ClientReactivated),
    ClientDeleted(ClientDeleted),
}

impl ClientEvent {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            ClientEvent::ClientRegistered(e) => e.tenant_id,
            ClientEvent::ClientUpdated(e) => e.tenant_id,
            ClientEvent::ClientDeactivated(e) => e.tenant_id,
            ClientEvent::ClientReactivated(e) => e.tenant_id,
            ClientEvent::ClientDeleted(e) => e.tenant_id,
        }
    }

    pub fn client_id(&self) -> ClientId {
        match self {
            ClientEvent::ClientRegistered(e) => e.client_id,
            ClientEvent::ClientUpdated(e) => e.client_id,
            ClientEvent::ClientDeactivated(e) => e.client_id,
            ClientEvent::ClientReactivated(e) => e.client_id,
            ClientEvent::ClientDeleted(e) => e.client_id,
        }
    }
}

impl Event for ClientEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::ClientRegistered(_) => "clients.client.registered",
            ClientEvent::ClientUpdated(_) => "clients.client.updated",
            ClientEvent::ClientDeactivated(_) => "clients.client.deactivated",
            ClientEvent::ClientReactivated(_) => "clients.client.reactivated",
            ClientEvent::ClientDeleted(_) => "clients.client.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ClientEvent::ClientRegistered(e) => e.occurred_at,
            ClientEvent::ClientUpdated(e) => e.occurred_at,
            ClientEvent::ClientDeactivated(e) => e.occurred_at,
            ClientEvent::ClientReactivated(e) => e.occurred_at,
            ClientEvent::ClientDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Client {
    type Command = ClientCommand;
    type Event = ClientEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ClientEvent::ClientRegistered(e) => {
                self.id = e.client_id;
                self.tenant_id = Some(e.tenant_id);
                self.details = e.details.clone();
                self.status = ClientStatus::Active;
                self.created = true;
            }
            ClientEvent::ClientUpdated(e) => {
                self.details = e.details.clone();
            }
            ClientEvent::ClientDeactivated(_) => {
                self.status = ClientStatus::Inactive;
            }
            ClientEvent::ClientReactivated(_) => {
                self.status = ClientStatus::Active;
            }
            ClientEvent::ClientDeleted(_) => {
                self.status = ClientStatus::Deleted;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ClientCommand::RegisterClient(cmd) => self.handle_register(cmd),
            ClientCommand::UpdateClient(cmd) => self.handle_update(cmd),
            ClientCommand::DeactivateClient(cmd) => self.handle_deactivate(cmd),
            ClientCommand::ReactivateClient(cmd) => self.handle_reactivate(cmd),
            ClientCommand::DeleteClient(cmd) => self.handle_delete(cmd),
        }
    }
}

impl Client {
    /// Existing, same-tenant, not deleted. Anything else reads as "not found".
    fn ensure_visible(&self, tenant_id: TenantId, client_id: ClientId) -> Result<(), DomainError> {
        if !self.exists() || self.tenant_id != Some(tenant_id) {
            return Err(DomainError::not_found());
        }
        if self.id != client_id {
            return Err(DomainError::invariant("client_id mismatch"));
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterClient) -> Result<Vec<ClientEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("client already exists"));
        }

        let details = validate_details(&cmd.details)?;

        Ok(vec![ClientEvent::ClientRegistered(ClientRegistered {
            tenant_id: cmd.tenant_id,
            client_id: cmd.client_id,
            details,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update(&self, cmd: &UpdateClient) -> Result<Vec<ClientEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.client_id)?;

        let details = validate_details(&cmd.details)?;
        if details == self.details {
            return Ok(vec![]);
        }

        Ok(vec![ClientEvent::ClientUpdated(ClientUpdated {
            tenant_id: cmd.tenant_id,
            client_id: cmd.client_id,
            details,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deactivate(&self, cmd: &DeactivateClient) -> Result<Vec<ClientEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.client_id)?;

        if self.status == ClientStatus::Inactive {
            return Ok(vec![]);
        }

        Ok(vec![ClientEvent::ClientDeactivated(ClientDeactivated {
            tenant_id: cmd.tenant_id,
            client_id: cmd.client_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reactivate(&self, cmd: &ReactivateClient) -> Result<Vec<ClientEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.client_id)?;

        if self.status == ClientStatus::Active {
            return Ok(vec![]);
        }

        Ok(vec![ClientEvent::ClientReactivated(ClientReactivated {
            tenant_id: cmd.tenant_id,
            client_id: cmd.client_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_delete(&self, cmd: &DeleteClient) -> Result<Vec<ClientEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.client_id)?;

        Ok(vec![ClientEvent::ClientDeleted(ClientDeleted {
            tenant_id: cmd.tenant_id,
            client_id: cmd.client_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client_id() -> ClientId {
        ClientId::new(AggregateId::new())
    }

    fn details(email: &str) -> ClientDetails {
        ClientDetails {
            name: "Acme Ltd".to_string(),
            email: email.to_string(),
            company: Some("Acme".to_string()),
            phone: None,
            address: None,
        }
    }

    fn registered(tenant_id: TenantId, client_id: ClientId) -> Client {
        let mut client = Client::empty(client_id);
        let events = client
            .handle(&ClientCommand::RegisterClient(RegisterClient {
                tenant_id,
                client_id,
                details: details("a@x.com"),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            client.apply(e);
        }
        client
    }

    #[test]
    fn register_normalizes_email_and_activates() {
        let client_id = test_client_id();
        let client = Client::empty(client_id);
        let events = client
            .handle(&ClientCommand::RegisterClient(RegisterClient {
                tenant_id: TenantId::new(),
                client_id,
                details: details("  A@X.com "),
                occurred_at: Utc::now(),
            }))
            .unwrap();

        match &events[0] {
            ClientEvent::ClientRegistered(e) => assert_eq!(e.details.email, "a@x.com"),
            _ => panic!("Expected ClientRegistered event"),
        }
    }

    #[test]
    fn register_rejects_bad_email_and_empty_name() {
        let client_id = test_client_id();
        let client = Client::empty(client_id);
        for bad in ["", "nope", "a@b", "@x.com", "a b@x.com"] {
            let err = client
                .handle(&ClientCommand::RegisterClient(RegisterClient {
                    tenant_id: TenantId::new(),
                    client_id,
                    details: details(bad),
                    occurred_at: Utc::now(),
                }))
                .unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "accepted '{bad}'");
        }

        let mut nameless = details("a@x.com");
        nameless.name = "  ".to_string();
        let err = client
            .handle(&ClientCommand::RegisterClient(RegisterClient {
                tenant_id: TenantId::new(),
                client_id,
                details: nameless,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn other_tenant_sees_not_found() {
        let client_id = test_client_id();
        let client = registered(TenantId::new(), client_id);

        let err = client
            .handle(&ClientCommand::DeactivateClient(DeactivateClient {
                tenant_id: TenantId::new(),
                client_id,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn deactivate_is_idempotent_and_blocks_invoicing() {
        let tenant_id = TenantId::new();
        let client_id = test_client_id();
        let mut client = registered(tenant_id, client_id);
        assert!(client.can_be_invoiced());

        let cmd = ClientCommand::DeactivateClient(DeactivateClient {
            tenant_id,
            client_id,
            occurred_at: Utc::now(),
        });
        let events = client.handle(&cmd).unwrap();
        assert_eq!(events.len(), 1);
        client.apply(&events[0]);

        assert_eq!(client.status(), ClientStatus::Inactive);
        assert!(!client.can_be_invoiced());
        assert!(client.handle(&cmd).unwrap().is_empty());
    }

    #[test]
    fn deleted_client_no_longer_exists() {
        let tenant_id = TenantId::new();
        let client_id = test_client_id();
        let mut client = registered(tenant_id, client_id);

        let events = client
            .handle(&ClientCommand::DeleteClient(DeleteClient {
                tenant_id,
                client_id,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        client.apply(&events[0]);

        assert!(!client.exists());
        let err = client
            .handle(&ClientCommand::UpdateClient(UpdateClient {
                tenant_id,
                client_id,
                details: details("b@x.com"),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
        assert_eq!(client.version(), 2);
    }

    #[test]
    fn update_with_identical_details_is_a_no_op() {
        let tenant_id = TenantId::new();
        let client_id = test_client_id();
        let client = registered(tenant_id, client_id);

        let events = client
            .handle(&ClientCommand::UpdateClient(UpdateClient {
                tenant_id,
                client_id,
                details: details("A@x.com"),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        assert!(events.is_empty());
    }
}
