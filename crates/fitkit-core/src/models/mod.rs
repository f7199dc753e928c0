//! Wire models for the FitKit API.
//!
//! - `UserIdentity`: the cached user profile returned at login and by `/auth/me`
//! - `LoginResponse`, `AccessTokenResponse`: token payloads from the auth endpoints
//! - `RecoveryCodes`: one-time account recovery codes

pub mod auth;

pub use auth::{
    AccessTokenResponse, LoginResponse, RecoveryCodes, RefreshTokenRequest, RegistrationRequest,
    ResetPasswordRequest, UserIdentity,
};
