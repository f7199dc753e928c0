use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::persistence::CredentialPersistence;
use crate::models::UserIdentity;

/// The three session fields plus the time they were last written.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub identity: Option<UserIdentity>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.identity.is_none()
    }
}

// Token values never reach logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("identity", &self.identity)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Current session plus its counters.
///
/// `generation` changes only when a session starts or ends, so a renewal
/// can tell whether the session it renewed is still the current one.
/// `revision` changes on every write and orders persistence.
#[derive(Default)]
struct SessionSlot {
    credentials: Credentials,
    generation: u64,
    revision: u64,
}

enum Mirror {
    Save(Credentials),
    Clear,
}

/// Process-wide holder for the current session.
///
/// Reads and writes are synchronous and never fail. Every write replaces the
/// state under one lock, so a concurrent reader sees either the old or the new
/// session, never a half-cleared one. When a persistence backend is attached,
/// each write is mirrored to it after the lock is released; a mirror that
/// arrives after a newer one is dropped. Backend failures are logged and
/// otherwise ignored.
pub struct CredentialStore {
    state: RwLock<SessionSlot>,
    persistence: Option<Box<dyn CredentialPersistence>>,
    /// Revision last handed to the backend.
    persisted: Mutex<u64>,
}

impl CredentialStore {
    /// Create an empty, memory-only store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionSlot::default()),
            persistence: None,
            persisted: Mutex::new(0),
        }
    }

    /// Create an empty store that mirrors every write to `persistence`.
    pub fn with_persistence(persistence: Box<dyn CredentialPersistence>) -> Self {
        Self {
            state: RwLock::new(SessionSlot::default()),
            persistence: Some(persistence),
            persisted: Mutex::new(0),
        }
    }

    /// Load previously persisted credentials into the store.
    /// Returns true if a session was restored.
    pub fn restore(&self) -> bool {
        let Some(ref persistence) = self.persistence else {
            return false;
        };

        match persistence.load() {
            Ok(Some(credentials)) => {
                let active = credentials.access_token.is_some();
                debug!(active, "Restored persisted credentials");
                let revision = {
                    let mut slot = self.state.write();
                    slot.credentials = credentials;
                    slot.generation += 1;
                    slot.revision += 1;
                    slot.revision
                };
                // Already on disk
                let mut persisted = self.persisted.lock();
                *persisted = (*persisted).max(revision);
                active
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted credentials");
                false
            }
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.read().credentials.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state.read().credentials.refresh_token.clone()
    }

    pub fn identity(&self) -> Option<UserIdentity> {
        self.state.read().credentials.identity.clone()
    }

    /// Copy of the whole session.
    pub fn snapshot(&self) -> Credentials {
        self.state.read().credentials.clone()
    }

    /// A session is active exactly when an access token is held.
    pub fn is_active(&self) -> bool {
        self.state.read().credentials.access_token.is_some()
    }

    /// Identifies the current session; changes on login and logout.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Refresh token together with the generation it belongs to.
    pub fn refresh_token_with_generation(&self) -> (u64, Option<String>) {
        let slot = self.state.read();
        (slot.generation, slot.credentials.refresh_token.clone())
    }

    /// Replace the whole session, as login and registration do.
    pub fn set_session(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        identity: Option<UserIdentity>,
    ) {
        self.update(|slot| {
            slot.generation += 1;
            slot.credentials = Credentials {
                access_token: Some(access_token),
                refresh_token,
                identity,
                updated_at: None,
            };
        });
    }

    pub fn set_access_token(&self, token: String) {
        self.update(|slot| slot.credentials.access_token = Some(token));
    }

    /// Store a renewed access token (and a rotated refresh token, if any),
    /// but only while `generation` is still the current session.
    /// Returns false, leaving the store untouched, if the session has ended or
    /// been replaced since.
    pub fn set_access_token_if(
        &self,
        generation: u64,
        token: String,
        rotated_refresh_token: Option<String>,
    ) -> bool {
        let mut applied = false;
        self.update(|slot| {
            if slot.generation != generation {
                return;
            }
            slot.credentials.access_token = Some(token);
            if let Some(rotated) = rotated_refresh_token {
                slot.credentials.refresh_token = Some(rotated);
            }
            applied = true;
        });
        applied
    }

    pub fn set_refresh_token(&self, token: String) {
        self.update(|slot| slot.credentials.refresh_token = Some(token));
    }

    pub fn set_identity(&self, identity: UserIdentity) {
        self.update(|slot| slot.credentials.identity = Some(identity));
    }

    /// Drop all three fields at once. Clearing an empty store is a no-op.
    pub fn clear(&self) {
        let revision = {
            let mut slot = self.state.write();
            slot.credentials = Credentials::default();
            slot.generation += 1;
            slot.revision += 1;
            slot.revision
        };
        self.mirror(revision, Mirror::Clear);
    }

    /// Clear the store only if `generation` is still the current session.
    /// Returns false if a newer login has replaced it.
    pub fn clear_if(&self, generation: u64) -> bool {
        let revision = {
            let mut slot = self.state.write();
            if slot.generation != generation {
                return false;
            }
            slot.credentials = Credentials::default();
            slot.generation += 1;
            slot.revision += 1;
            slot.revision
        };
        self.mirror(revision, Mirror::Clear);
        true
    }

    fn update(&self, apply: impl FnOnce(&mut SessionSlot)) {
        let (revision, credentials) = {
            let mut slot = self.state.write();
            let before = slot.generation;
            let previous = slot.credentials.clone();
            apply(&mut *slot);
            if slot.credentials == previous && slot.generation == before {
                return;
            }
            slot.credentials.updated_at = Some(Utc::now());
            slot.revision += 1;
            (slot.revision, slot.credentials.clone())
        };
        self.mirror(revision, Mirror::Save(credentials));
    }

    /// Write `revision` to the backend unless a newer one already got there.
    fn mirror(&self, revision: u64, mirror: Mirror) {
        let Some(ref persistence) = self.persistence else {
            return;
        };

        let mut persisted = self.persisted.lock();
        if revision <= *persisted {
            return;
        }
        *persisted = revision;

        let result = match mirror {
            Mirror::Save(ref credentials) => persistence.save(credentials),
            Mirror::Clear => persistence.clear(),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist credentials");
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("state", &self.state.read().credentials)
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}
