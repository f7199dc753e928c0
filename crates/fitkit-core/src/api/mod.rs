//! REST API access for the FitKit server.
//!
//! This module provides the `AuthGateway`, which every protected request
//! goes through, the `Transport` seam it dispatches on, and the typed
//! `FitkitClient` for the application's endpoints.
//!
//! The API uses short-lived JWT bearer tokens. Expired tokens are renewed
//! through `/api/v1/auth/refresh` using the longer-lived refresh token.

pub mod client;
pub mod error;
pub mod gateway;
pub mod transport;

pub use client::FitkitClient;
pub use error::ApiError;
pub use gateway::AuthGateway;
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport, TransportError};

#[cfg(test)]
pub(crate) mod mock {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::header::AUTHORIZATION;

    use super::{ApiRequest, ApiResponse, Transport, TransportError};

    pub(crate) const REFRESH_PATH: &str = "/api/v1/auth/refresh";

    type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync;

    /// Scripted transport: answers with `handler`, records every request,
    /// and holds renewal calls for `renewal_delay` so concurrent callers
    /// pile up behind them.
    pub(crate) struct MockTransport {
        handler: Box<Handler>,
        renewal_delay: Duration,
        log: Mutex<Vec<ApiRequest>>,
    }

    impl MockTransport {
        pub(crate) fn new<F>(handler: F) -> Self
        where
            F: Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                renewal_delay: Duration::from_millis(20),
                log: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_renewal_delay(mut self, delay: Duration) -> Self {
            self.renewal_delay = delay;
            self
        }

        pub(crate) fn requests(&self) -> Vec<ApiRequest> {
            self.log.lock().clone()
        }

        pub(crate) fn count(&self, path: &str) -> usize {
            self.log.lock().iter().filter(|r| r.url.path() == path).count()
        }

        pub(crate) fn renewals(&self) -> usize {
            self.count(REFRESH_PATH)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn dispatch(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
            self.log.lock().push(request.clone());
            if request.url.path() == REFRESH_PATH {
                tokio::time::sleep(self.renewal_delay).await;
            } else {
                tokio::task::yield_now().await;
            }
            (self.handler)(&request)
        }
    }

    /// Token carried in the request's Authorization header.
    pub(crate) fn bearer(request: &ApiRequest) -> Option<String> {
        request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    }

    /// Renewal body sent by the coordinator.
    pub(crate) fn refresh_token_sent(request: &ApiRequest) -> Option<String> {
        let body: serde_json::Value = serde_json::from_slice(request.body.as_deref()?).ok()?;
        body["refresh_token"].as_str().map(str::to_string)
    }
}
