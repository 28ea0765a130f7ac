//! Delivery of one mutation to the backend.
//!
//! Every request carries the mutation's idempotency key. The backend treats a
//! repeated key as a no-op that returns the original result, which is what
//! makes resending after a timeout safe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use stowage_core::TenantId;

use crate::error::{SessionError, TransportError};
use crate::idempotency::IdempotencyKey;
use crate::payload::{EntityPayload, Fields};
use crate::session::SessionProvider;
use crate::types::{EntityKind, MutationEntry, Operation};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Wire request for one queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationRequest {
    pub idempotency_key: IdempotencyKey,
    pub tenant_id: TenantId,
    pub operation: Operation,
    pub entity: EntityKind,
    pub entity_id: Option<String>,
    pub payload: EntityPayload,
}

impl MutationRequest {
    pub fn from_entry(entry: &MutationEntry) -> Self {
        Self {
            idempotency_key: entry.idempotency_key,
            tenant_id: entry.tenant_id,
            operation: entry.operation,
            entity: entry.entity,
            entity_id: entry.entity_id.clone(),
            payload: entry.payload.clone(),
        }
    }
}

/// The authoritative record returned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResponse {
    pub entity_id: String,
    pub record: Fields,
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(&self, request: &MutationRequest) -> Result<MutationResponse, TransportError>;
}

#[async_trait]
impl<T> SyncTransport for Arc<T>
where
    T: SyncTransport + ?Sized,
{
    async fn send(&self, request: &MutationRequest) -> Result<MutationResponse, TransportError> {
        (**self).send(request).await
    }
}

#[derive(Clone)]
enum Credential {
    None,
    Token(String),
    Session(Arc<dyn SessionProvider>),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::None => f.write_str("None"),
            Credential::Token(_) => f.write_str("Token(..)"),
            Credential::Session(_) => f.write_str("Session(..)"),
        }
    }
}

/// REST transport.
///
/// - Create: `POST {base}/workspaces/{tenant}/{collection}`
/// - Update: `PATCH {base}/workspaces/{tenant}/{collection}/{id}`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    credential: Credential,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: Credential::None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.credential = Credential::Token(token.into());
        self
    }

    /// Ask `session` for the bearer token before every request, so a
    /// renewed session takes effect without rebuilding the transport.
    pub fn with_session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.credential = Credential::Session(session);
        self
    }

    async fn bearer(&self, tenant_id: TenantId) -> Result<Option<String>, TransportError> {
        match &self.credential {
            Credential::None => Ok(None),
            Credential::Token(token) => Ok(Some(token.clone())),
            Credential::Session(session) => match session.fresh_credential(tenant_id).await {
                Ok(token) => Ok(Some(token)),
                Err(SessionError::Invalid) => Err(TransportError::Unauthorized),
                Err(e @ SessionError::Unavailable(_)) => Err(TransportError::Network(e.to_string())),
            },
        }
    }

    fn endpoint(&self, request: &MutationRequest) -> String {
        let collection = format!(
            "{}/workspaces/{}/{}",
            self.base_url,
            request.tenant_id,
            request.entity.collection()
        );
        match (&request.operation, &request.entity_id) {
            (Operation::Update, Some(id)) => format!("{collection}/{id}"),
            _ => collection,
        }
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn send(&self, request: &MutationRequest) -> Result<MutationResponse, TransportError> {
        let url = self.endpoint(request);
        let body = request.payload.to_value();
        let bearer = self.bearer(request.tenant_id).await?;

        let mut req = match request.operation {
            Operation::Create => self.client.post(&url),
            Operation::Update => self.client.patch(&url),
        }
        .header(IDEMPOTENCY_HEADER, request.idempotency_key.to_string())
        .json(&body);

        if let Some(token) = &bearer {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            tracing::debug!(
                idempotency_key = %request.idempotency_key,
                status = status.as_u16(),
                "mutation rejected"
            );
            return Err(TransportError::from_status(status.as_u16(), error_text));
        }

        let record: Value = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(format!("unreadable response body: {e}"))
            }
        })?;

        parse_record(record, request)
    }
}

/// Pull the id out of an authoritative record. Updates fall back to the id
/// the request was addressed to.
fn parse_record(record: Value, request: &MutationRequest) -> Result<MutationResponse, TransportError> {
    let Value::Object(record) = record else {
        return Err(TransportError::Server {
            status: 200,
            message: "response is not a JSON object".to_string(),
        });
    };

    let entity_id = match record.get("id") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => request.entity_id.clone(),
    };

    match entity_id {
        Some(entity_id) => Ok(MutationResponse { entity_id, record }),
        None => Err(TransportError::Server {
            status: 200,
            message: "response carries no entity id".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::IdempotencyKeyGenerator;
    use crate::session::StaticSession;
    use serde_json::json;

    fn request(operation: Operation, entity_id: Option<&str>) -> MutationRequest {
        MutationRequest {
            idempotency_key: IdempotencyKeyGenerator::new().next_key(),
            tenant_id: TenantId::new(),
            operation,
            entity: EntityKind::Category,
            entity_id: entity_id.map(str::to_string),
            payload: EntityPayload::new(EntityKind::Category, json!({"name": "Tools"})).unwrap(),
        }
    }

    #[test]
    fn endpoints_follow_the_rest_layout() {
        let transport = HttpTransport::new("http://api.test/v1/", Duration::from_secs(1)).unwrap();

        let create = request(Operation::Create, None);
        assert_eq!(
            transport.endpoint(&create),
            format!("http://api.test/v1/workspaces/{}/categories", create.tenant_id)
        );

        let update = request(Operation::Update, Some("cat_1"));
        assert_eq!(
            transport.endpoint(&update),
            format!("http://api.test/v1/workspaces/{}/categories/cat_1", update.tenant_id)
        );
    }

    #[test]
    fn record_id_comes_from_body_or_request() {
        let create = request(Operation::Create, None);
        let response = parse_record(json!({"id": "cat_7", "name": "Tools"}), &create).unwrap();
        assert_eq!(response.entity_id, "cat_7");

        assert!(parse_record(json!({"name": "Tools"}), &create).is_err());

        let update = request(Operation::Update, Some("cat_1"));
        let response = parse_record(json!({"name": "Tools"}), &update).unwrap();
        assert_eq!(response.entity_id, "cat_1");
    }

    #[tokio::test]
    async fn bearer_follows_the_session() {
        let session = Arc::new(StaticSession::new("old"));
        let transport = HttpTransport::new("http://api.test", Duration::from_secs(1))
            .unwrap()
            .with_session(session.clone());
        let tenant = TenantId::new();

        assert_eq!(transport.bearer(tenant).await.unwrap().as_deref(), Some("old"));

        session.revoke();
        assert_eq!(transport.bearer(tenant).await, Err(TransportError::Unauthorized));

        session.renew("new");
        assert_eq!(transport.bearer(tenant).await.unwrap().as_deref(), Some("new"));
    }
}
