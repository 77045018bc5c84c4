//! Auth collaborator seam for stream connections.
//!
//! The gateway does not decide who a caller is; it asks an [`Authenticator`]
//! and only applies the role check itself.

use std::collections::HashMap;

use async_trait::async_trait;

use pulse_types::config::TokenGrant;
use pulse_types::role::{Identity, Role};

/// What the gateway knows about an inbound stream request.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Bearer token from the `Authorization` header or `access_token` query.
    pub token: Option<String>,
    /// Raw `scopes` query parameter.
    pub scopes: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `None` means the caller could not be identified.
    async fn authenticate(&self, request: &ConnectRequest) -> Option<Identity>;
}

/// Accepts a fixed set of bearer tokens from config.
pub struct StaticTokenAuthenticator {
    grants: HashMap<String, Identity>,
}

impl StaticTokenAuthenticator {
    pub fn new(grants: &[TokenGrant]) -> Self {
        let grants = grants
            .iter()
            .map(|g| {
                (
                    g.token.clone(),
                    Identity {
                        user_id: g.user_id.clone(),
                        role: g.role,
                    },
                )
            })
            .collect();
        Self { grants }
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, request: &ConnectRequest) -> Option<Identity> {
        let token = request.token.as_deref()?;
        self.grants.get(token).cloned()
    }
}

pub fn role_permitted(role: Role, allowed: &[Role]) -> bool {
    allowed.contains(&role)
}
