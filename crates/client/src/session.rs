//! Session credentials as seen by the sync engine.
//!
//! Authentication itself lives elsewhere; the engine only asks for a fresh
//! credential before it (re)connects and learns whether the session is still
//! valid.

use std::sync::RwLock;

use async_trait::async_trait;
use stowage_core::TenantId;

use crate::error::SessionError;

#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// A credential for `tenant_id`, refreshed if needed.
    ///
    /// `SessionError::Invalid` means the user has to sign in again.
    async fn fresh_credential(&self, tenant_id: TenantId) -> Result<String, SessionError>;
}

/// A fixed token that can be revoked.
#[derive(Debug)]
pub struct StaticSession {
    token: RwLock<Option<String>>,
}

impl StaticSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn revoke(&self) {
        if let Ok(mut token) = self.token.write() {
            *token = None;
        }
    }

    pub fn renew(&self, token: impl Into<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = Some(token.into());
        }
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn fresh_credential(&self, _tenant_id: TenantId) -> Result<String, SessionError> {
        let token = self
            .token
            .read()
            .map_err(|_| SessionError::Unavailable("session lock poisoned".into()))?;
        token.clone().ok_or(SessionError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revoked_session_is_invalid() {
        let session = StaticSession::new("t0k3n");
        let tenant = TenantId::new();
        assert_eq!(session.fresh_credential(tenant).await.unwrap(), "t0k3n");

        session.revoke();
        assert_eq!(session.fresh_credential(tenant).await, Err(SessionError::Invalid));

        session.renew("fresh");
        assert_eq!(session.fresh_credential(tenant).await.unwrap(), "fresh");
    }
}
