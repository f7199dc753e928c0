use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Profile of the logged-in user. Informational only; nothing in the
/// request path reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    #[serde(rename = "dateJoined")]
    pub date_joined: Option<NaiveDate>,
}

impl UserIdentity {
    pub fn display_name(&self) -> String {
        match self.email {
            Some(ref email) if !email.is_empty() => format!("{} <{}>", self.username, email),
            _ => self.username.clone(),
        }
    }
}

/// Body returned by both login and registration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub user: Option<UserIdentity>,
}

/// Body returned by the renewal endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Present only when the server rotates the renewal token.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RefreshTokenRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
pub struct RegistrationRequest<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ResetPasswordRequest<'a> {
    pub username: &'a str,
    #[serde(rename = "recoveryCode")]
    pub recovery_code: &'a str,
    #[serde(rename = "newPassword")]
    pub new_password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryCodes {
    #[serde(rename = "recoveryCodes")]
    pub codes: Vec<String>,
    pub message: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}
