//! Authentication module for managing the API session.
//!
//! This module provides:
//! - `CredentialStore`: the shared access/renewal token holder
//! - `CredentialPersistence`: mirrors the store to disk or the OS keychain
//! - `RenewalCoordinator`: single-flight access token renewal
//!
//! The store is written at login, updated by the coordinator after each
//! successful renewal, and cleared on logout or when renewal fails.

pub mod persistence;
pub mod renewal;
pub mod store;

pub use persistence::{CredentialPersistence, FilePersistence, KeyringPersistence};
pub use renewal::{RenewalCoordinator, RenewalError};
pub use store::{CredentialStore, Credentials};
