//! Core library for the FitKit client.
//!
//! Every request to a protected FitKit endpoint goes through the
//! [`AuthGateway`](api::AuthGateway), which attaches the current access
//! token and, when the server answers `401`, renews the token once through
//! the shared [`RenewalCoordinator`](auth::RenewalCoordinator) before
//! retrying. Concurrent callers that hit `401` during the same renewal
//! wait for that renewal instead of starting their own.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{
    ApiError, ApiRequest, ApiResponse, AuthGateway, FitkitClient, ReqwestTransport, Transport,
    TransportError,
};
pub use auth::{CredentialStore, Credentials, RenewalCoordinator, RenewalError};
pub use config::Config;
