//! Authentication and authorization gates.
//!
//! Authentication is a boolean gate plus a token-verification hook: the
//! coordinator calls [`AuthService::authenticate`] on AUTHENTICATE frames
//! and consults the per-document access/edit hooks on join and operation
//! delivery. Hosts plug in their own implementation; the two built-ins
//! cover the open (auth disabled) and shared-secret configurations.

use thiserror::Error;

use crate::protocol::ClientInfo;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    #[error("authentication token required")]
    MissingToken,
    #[error("invalid authentication token")]
    InvalidToken,
}

/// Token verification and per-document permission hooks.
pub trait AuthService: Send + Sync {
    /// Verify a token and produce the connection's identity.
    fn authenticate(&self, client_id: &str, token: Option<&str>) -> Result<ClientInfo, AuthError>;

    /// May this client join (read) the document?
    fn can_access(&self, client: &ClientInfo, document_id: &str) -> bool {
        let _ = (client, document_id);
        true
    }

    /// May this client submit operations to the document?
    fn can_edit(&self, client: &ClientInfo, document_id: &str) -> bool {
        let _ = (client, document_id);
        true
    }
}

/// Auth disabled: every connection is accepted as-is.
pub struct OpenAuth;

impl AuthService for OpenAuth {
    fn authenticate(&self, client_id: &str, _token: Option<&str>) -> Result<ClientInfo, AuthError> {
        Ok(ClientInfo::anonymous(client_id))
    }
}

/// Token must equal a shared secret configured at startup.
pub struct SharedSecretAuth {
    secret: String,
}

impl SharedSecretAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        SharedSecretAuth {
            secret: secret.into(),
        }
    }
}

impl AuthService for SharedSecretAuth {
    fn authenticate(&self, client_id: &str, token: Option<&str>) -> Result<ClientInfo, AuthError> {
        match token {
            None => Err(AuthError::MissingToken),
            Some(t) if t == self.secret => Ok(ClientInfo::anonymous(client_id)),
            Some(_) => Err(AuthError::InvalidToken),
        }
    }
}

/// Any non-empty token passes. Used when authentication is required but no
/// shared secret is configured, leaving verification to a fronting proxy.
pub struct AnyTokenAuth;

impl AuthService for AnyTokenAuth {
    fn authenticate(&self, client_id: &str, token: Option<&str>) -> Result<ClientInfo, AuthError> {
        match token {
            Some(t) if !t.is_empty() => Ok(ClientInfo::anonymous(client_id)),
            _ => Err(AuthError::MissingToken),
        }
    }
}
