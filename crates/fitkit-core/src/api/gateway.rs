//! Authenticated request gateway.
//!
//! `send` attaches the current access token, dispatches once, and on a
//! `401` asks the renewal coordinator for a new token before dispatching
//! exactly once more. The transport is never called more than twice per
//! `send`. If another caller already replaced the rejected token by the time
//! the 401 arrives, the retry uses that token and no renewal is started.

use std::sync::Arc;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use tracing::{debug, warn};

use super::error::ApiError;
use super::transport::{ApiRequest, ApiResponse, Transport, TransportError};
use crate::auth::{CredentialStore, RenewalCoordinator};

pub struct AuthGateway {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    renewal: Arc<RenewalCoordinator>,
}

impl AuthGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        renewal: Arc<RenewalCoordinator>,
    ) -> Self {
        Self {
            transport,
            store,
            renewal,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn renewal(&self) -> &Arc<RenewalCoordinator> {
        &self.renewal
    }

    /// Send `request` with the session's access token.
    ///
    /// Non-401 responses are returned unchanged. After a 401 the token is
    /// renewed (or the in-flight renewal is joined) and the original request
    /// is sent once more; that second response is final, even if it is
    /// another 401. A failed renewal is returned as `ApiError::SessionExpired`.
    /// When the store already holds a different token than the one rejected,
    /// the retry uses it directly.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let token = self.store.access_token();
        if token.is_none() {
            debug!(url = %request.url, "No access token, sending unauthenticated");
        }

        let response = self.dispatch(&request, token.as_deref()).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        let token = match self.store.access_token() {
            Some(current) if token.as_deref() != Some(current.as_str()) => {
                debug!(url = %request.url, "Access token already replaced, retrying with it");
                current
            }
            _ => {
                debug!(url = %request.url, "Access token rejected, renewing");
                self.renewal.renew_or_wait().await?
            }
        };

        let retry = self.dispatch(&request, Some(&token)).await?;
        if retry.is_unauthorized() {
            warn!(url = %request.url, "Still unauthorized after token renewal");
        }
        Ok(retry)
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let mut outbound = request.clone();
        outbound.headers.remove(AUTHORIZATION);
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                TransportError::InvalidRequest(
                    "access token is not a valid header value".to_string(),
                )
            })?;
            value.set_sensitive(true);
            outbound.headers.insert(AUTHORIZATION, value);
        }
        Ok(self.transport.dispatch(outbound).await?)
    }
}
