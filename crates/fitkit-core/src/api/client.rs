//! API client for the FitKit REST API.
//!
//! Login, registration and password reset go straight to the transport;
//! everything else is sent through the `AuthGateway` so expired access
//! tokens are renewed transparently.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::gateway::AuthGateway;
use super::transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
use super::ApiError;
use crate::auth::{CredentialStore, RenewalCoordinator};
use crate::config::Config;
use crate::models::{
    LoginResponse, RecoveryCodes, RegistrationRequest, ResetPasswordRequest, UserIdentity,
};

// ============================================================================
// Endpoints
// ============================================================================

const LOGIN_PATH: &str = "api/v1/auth/login";
const REGISTER_PATH: &str = "api/v1/auth/register";
const REFRESH_PATH: &str = "api/v1/auth/refresh";
const RESET_PASSWORD_PATH: &str = "api/v1/auth/reset-password-with-code";
const RECOVERY_CODES_PATH: &str = "api/v1/auth/generate-recovery-codes";
const ME_PATH: &str = "api/v1/auth/me";
const LOGBOOK_PATH: &str = "api/v1/logbook";
const TOTAL_COUNT_PATH: &str = "api/v1/logbook/stats/total-count";
const AUDIT_BY_DATE_PATH: &str = "api/v1/audit/by-date";

/// API client for the FitKit server.
pub struct FitkitClient {
    base_url: Url,
    transport: Arc<dyn Transport>,
    gateway: AuthGateway,
}

impl FitkitClient {
    /// Wire up a client from configuration, sharing `store` with the caller.
    pub fn new(config: &Config, store: Arc<CredentialStore>) -> anyhow::Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
        let client = Self::with_transport(
            config.base_url()?,
            transport,
            store,
            config.renewal_timeout(),
        )?;
        Ok(client)
    }

    /// Build on an existing transport. `base_url` must end with `/` and be
    /// able to hold the API paths.
    pub fn with_transport(
        base_url: Url,
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        renewal_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let refresh_url = base_url
            .join(REFRESH_PATH)
            .map_err(|e| ApiError::InvalidBaseUrl(format!("{}: {}", base_url, e)))?;
        let renewal = Arc::new(
            RenewalCoordinator::new(transport.clone(), store.clone(), refresh_url)
                .with_timeout(renewal_timeout),
        );
        let gateway = AuthGateway::new(transport.clone(), store, renewal);

        Ok(Self {
            base_url,
            transport,
            gateway,
        })
    }

    pub fn gateway(&self) -> &AuthGateway {
        &self.gateway
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.gateway.store()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store().is_active()
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::InvalidResponse(format!("Invalid endpoint {}: {}", path, e)))
    }

    // ===== Session =====

    /// Log in with username and password and start a session.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserIdentity>, ApiError> {
        let request = ApiRequest::post(self.endpoint(LOGIN_PATH)?)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .form(&[("username", username), ("password", password)]);

        let response = self.transport.dispatch(request).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::LoginFailed(Self::login_failure_detail(&response)));
        }
        let response = Self::check_response(response)?;

        let login: LoginResponse = Self::parse(&response, LOGIN_PATH)?;
        self.start_session(login, username)
    }

    /// Create an account. The server logs the new user in directly.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<Option<UserIdentity>, ApiError> {
        let body = RegistrationRequest {
            username,
            email,
            password,
        };
        let request = ApiRequest::post(self.endpoint(REGISTER_PATH)?).json(&body)?;

        let response = Self::check_response(self.transport.dispatch(request).await?)?;
        let login: LoginResponse = Self::parse(&response, REGISTER_PATH)?;
        self.start_session(login, username)
    }

    /// Set a new password using a one-time recovery code.
    pub async fn reset_password_with_code(
        &self,
        username: &str,
        recovery_code: &str,
        new_password: &str,
    ) -> Result<(), ApiError> {
        let body = ResetPasswordRequest {
            username,
            recovery_code,
            new_password,
        };
        let request = ApiRequest::post(self.endpoint(RESET_PASSWORD_PATH)?).json(&body)?;

        Self::check_response(self.transport.dispatch(request).await?)?;
        info!("Password reset with recovery code");
        Ok(())
    }

    /// End the session. Safe to call when already logged out.
    pub fn logout(&self) {
        self.store().clear();
        info!("Logged out");
    }

    fn start_session(
        &self,
        login: LoginResponse,
        username: &str,
    ) -> Result<Option<UserIdentity>, ApiError> {
        if login.access_token.is_empty() {
            return Err(ApiError::InvalidResponse(
                "Login returned an empty access token".to_string(),
            ));
        }
        if login.refresh_token.is_none() {
            warn!("Login response carried no refresh token; session cannot be renewed");
        }

        let identity = login.user;
        self.store()
            .set_session(login.access_token, login.refresh_token, identity.clone());
        info!(username = username, "Session started");
        Ok(identity)
    }

    fn login_failure_detail(response: &ApiResponse) -> String {
        let detail = ApiError::detail_from_body(&response.text());
        if detail.is_empty() {
            "Please check your credentials".to_string()
        } else {
            detail
        }
    }

    // ===== Helpers =====

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.text()))
        }
    }

    fn parse<T: DeserializeOwned>(response: &ApiResponse, what: &str) -> Result<T, ApiError> {
        response.json().map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse {} response: {}", what, e))
        })
    }

    async fn send<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let url = request.url.clone();
        let response = Self::check_response(self.gateway.send(request).await?)?;
        if response.body.is_empty() {
            // Endpoints that answer with no content decode as JSON null
            return serde_json::from_value(Value::Null).map_err(|e| {
                ApiError::InvalidResponse(format!("Empty response from {}: {}", url, e))
            });
        }
        debug!(url = %url, bytes = response.body.len(), "Response received");
        response.json().map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        self.send(ApiRequest::get(url)).await
    }

    async fn put<T, B>(&self, url: Url, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        self.send(ApiRequest::put(url).json(body)?).await
    }

    // ===== Account =====

    /// Fetch the current user's profile and refresh the cached identity.
    pub async fn me(&self) -> Result<UserIdentity, ApiError> {
        let identity: UserIdentity = self.get(self.endpoint(ME_PATH)?).await?;
        self.store().set_identity(identity.clone());
        Ok(identity)
    }

    pub async fn generate_recovery_codes(&self) -> Result<RecoveryCodes, ApiError> {
        self.send(ApiRequest::post(self.endpoint(RECOVERY_CODES_PATH)?)).await
    }

    // ===== Logbook =====

    pub async fn dashboard_stats(&self) -> Result<Value, ApiError> {
        self.get(self.endpoint(TOTAL_COUNT_PATH)?).await
    }

    pub async fn log_for_date(&self, date: NaiveDate) -> Result<Value, ApiError> {
        let url = self.endpoint(&format!("{}/{}", LOGBOOK_PATH, date.format("%Y-%m-%d")))?;
        self.get(url).await
    }

    /// Most recent journal entries, newest first.
    pub async fn recent_journals(&self, page: u32, size: u32) -> Result<Value, ApiError> {
        let mut url = self.endpoint(LOGBOOK_PATH)?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("size", &size.to_string())
            .append_pair("sort", "logDate,desc");
        self.get(url).await
    }

    pub async fn save_log_section(
        &self,
        date: NaiveDate,
        section: &str,
        body: &Value,
    ) -> Result<Value, ApiError> {
        let mut url = self.endpoint(&format!("{}/{}", LOGBOOK_PATH, date.format("%Y-%m-%d")))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidResponse("Base URL cannot hold paths".to_string()))?
            .push(section);
        self.put(url, body).await
    }

    // ===== Audit =====

    pub async fn audit_log_for_date(
        &self,
        date: NaiveDate,
        page: u32,
        size: u32,
    ) -> Result<Value, ApiError> {
        let mut url = self.endpoint(AUDIT_BY_DATE_PATH)?;
        url.query_pairs_mut()
            .append_pair("date", &date.format("%Y-%m-%d").to_string())
            .append_pair("page", &page.to_string())
            .append_pair("size", &size.to_string())
            .append_pair("sort", "timestamp,desc");
        self.get(url).await
    }
}
