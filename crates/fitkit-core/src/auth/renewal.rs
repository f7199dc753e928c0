//! Single-flight access token renewal.
//!
//! The first caller to ask for a renewal performs it; every caller arriving
//! while it is outstanding parks on a oneshot channel and receives the same
//! outcome. Waiters are released in arrival order, after the store has been
//! updated (or cleared), and before the cycle is marked finished.
//!
//! A renewal only writes back into the session it started from. If the user
//! logs out or logs in while the call is outstanding, the result is discarded.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::store::CredentialStore;
use crate::api::transport::{ApiRequest, Transport, TransportError};
use crate::models::{AccessTokenResponse, RefreshTokenRequest};

/// Default upper bound on a single renewal call.
pub const DEFAULT_RENEWAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a renewal cycle failed.
#[derive(Error, Debug, Clone)]
pub enum RenewalError {
    #[error("No refresh token available - please log in again")]
    MissingRefreshToken,

    #[error("Refresh token rejected (status {0})")]
    Rejected(StatusCode),

    #[error("Renewal request failed: {0}")]
    Transport(#[source] Arc<TransportError>),

    #[error("Invalid renewal response: {0}")]
    InvalidResponse(String),

    #[error("Renewal timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Renewal was abandoned before completing")]
    Abandoned,

    #[error("Session ended or changed while renewing")]
    SessionChanged,
}

impl RenewalError {
    /// False for outcomes that say nothing about whether the session is dead:
    /// a cancelled cycle, or one whose session was replaced underneath it.
    pub fn ends_session(&self) -> bool {
        !matches!(self, RenewalError::Abandoned | RenewalError::SessionChanged)
    }
}

impl From<TransportError> for RenewalError {
    fn from(e: TransportError) -> Self {
        RenewalError::Transport(Arc::new(e))
    }
}

type RenewalOutcome = Result<String, RenewalError>;

#[derive(Default)]
struct RenewalState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RenewalOutcome>>,
}

pub struct RenewalCoordinator {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    endpoint: Url,
    timeout: Duration,
    state: Mutex<RenewalState>,
}

impl RenewalCoordinator {
    /// `endpoint` is the full URL of the refresh endpoint.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        endpoint: Url,
    ) -> Self {
        Self {
            transport,
            store,
            endpoint,
            timeout: DEFAULT_RENEWAL_TIMEOUT,
            state: Mutex::new(RenewalState::default()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// True while a renewal call is outstanding.
    pub fn is_renewing(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Number of callers parked on the current cycle.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Obtain a fresh access token, joining the renewal already in flight
    /// if there is one.
    pub async fn renew_or_wait(&self) -> RenewalOutcome {
        let waiter = {
            let mut state = self.state.lock();
            if state.in_flight {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                debug!(position = state.waiters.len(), "Renewal in flight, waiting");
                Some(rx)
            } else {
                state.in_flight = true;
                None
            }
        };

        match waiter {
            Some(rx) => rx.await.unwrap_or(Err(RenewalError::Abandoned)),
            None => self.lead().await,
        }
    }

    async fn lead(&self) -> RenewalOutcome {
        let cycle = RenewalCycle {
            coordinator: self,
            finished: false,
        };

        let (generation, refresh_token) = self.store.refresh_token_with_generation();
        let renewal = self.renew(generation, refresh_token);
        let outcome = match tokio::time::timeout(self.timeout, renewal).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RenewalError::TimedOut(self.timeout)),
        };

        match outcome {
            Ok(_) => info!("Access token renewed"),
            Err(ref e) if e.ends_session() => {
                warn!(error = %e, "Access token renewal failed, ending session");
                if !self.store.clear_if(generation) {
                    debug!("Session already replaced, leaving it in place");
                }
            }
            Err(ref e) => debug!(error = %e, "Renewal result discarded"),
        }

        cycle.finish(&outcome);
        outcome
    }

    async fn renew(&self, generation: u64, refresh_token: Option<String>) -> RenewalOutcome {
        let refresh_token = refresh_token.ok_or(RenewalError::MissingRefreshToken)?;

        debug!(endpoint = %self.endpoint, "Requesting new access token");
        let request = ApiRequest::post(self.endpoint.clone()).json(&RefreshTokenRequest {
            refresh_token: &refresh_token,
        })?;
        let response = self.transport.dispatch(request).await?;

        if !response.is_success() {
            return Err(RenewalError::Rejected(response.status));
        }

        let body: AccessTokenResponse = response
            .json()
            .map_err(|e| RenewalError::InvalidResponse(e.to_string()))?;
        if body.access_token.is_empty() {
            return Err(RenewalError::InvalidResponse("empty access token".to_string()));
        }

        let stored = self.store.set_access_token_if(
            generation,
            body.access_token.clone(),
            body.refresh_token,
        );
        if !stored {
            return Err(RenewalError::SessionChanged);
        }
        Ok(body.access_token)
    }

    /// Hand `outcome` to every parked caller and close the cycle.
    fn release(&self, outcome: &RenewalOutcome) {
        let mut state = self.state.lock();
        let waiters = std::mem::take(&mut state.waiters);
        if !waiters.is_empty() {
            debug!(
                count = waiters.len(),
                ok = outcome.is_ok(),
                "Releasing renewal waiters"
            );
        }
        for waiter in waiters {
            // A waiter whose caller went away has nothing to receive.
            let _ = waiter.send(outcome.clone());
        }
        state.in_flight = false;
    }
}

/// Closes a renewal cycle even if the leading caller is cancelled mid-flight.
struct RenewalCycle<'a> {
    coordinator: &'a RenewalCoordinator,
    finished: bool,
}

impl RenewalCycle<'_> {
    fn finish(mut self, outcome: &RenewalOutcome) {
        self.finished = true;
        self.coordinator.release(outcome);
    }
}

impl Drop for RenewalCycle<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Renewal cancelled before completion");
            self.coordinator.release(&Err(RenewalError::Abandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{refresh_token_sent, MockTransport, REFRESH_PATH};
    use crate::api::ApiResponse;
    use futures::future::join_all;
    use tokio::sync::Barrier;

    fn endpoint() -> Url {
        Url::parse("http://localhost:8080/api/v1/auth/refresh").expect("valid url")
    }

    fn logged_in_store(refresh: Option<&str>) -> Arc<CredentialStore> {
        let store = Arc::new(CredentialStore::new());
        store.set_session("A1".to_string(), refresh.map(str::to_string), None);
        store
    }

    fn renews_to(token: &'static str) -> MockTransport {
        MockTransport::new(move |request| {
            assert_eq!(request.url.path(), REFRESH_PATH);
            Ok(ApiResponse::new(
                StatusCode::OK,
                format!(r#"{{"access_token":"{}","token_type":"Bearer"}}"#, token),
            ))
        })
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_renewal() {
        let transport = Arc::new(renews_to("A2"));
        let store = logged_in_store(Some("R1"));
        let coordinator = RenewalCoordinator::new(transport.clone(), store.clone(), endpoint());

        let results = join_all((0..8).map(|_| coordinator.renew_or_wait())).await;

        assert_eq!(transport.renewals(), 1);
        for result in results {
            assert_eq!(result.expect("renewal should succeed"), "A2");
        }
        assert_eq!(store.access_token().as_deref(), Some("A2"));
        let sent = refresh_token_sent(&transport.requests()[0]);
        assert_eq!(sent.as_deref(), Some("R1"));
        assert!(!coordinator.is_renewing());
        assert_eq!(coordinator.waiting(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_failure() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, ""))
        }));
        let store = logged_in_store(Some("R1"));
        let coordinator = RenewalCoordinator::new(transport.clone(), store.clone(), endpoint());

        let results = join_all((0..5).map(|_| coordinator.renew_or_wait())).await;

        assert_eq!(transport.renewals(), 1);
        for result in results {
            assert!(matches!(
                result,
                Err(RenewalError::Rejected(StatusCode::UNAUTHORIZED))
            ));
        }
        assert!(store.snapshot().is_empty());
        assert!(!coordinator.is_renewing());
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_network() {
        let transport = Arc::new(renews_to("A2"));
        let store = logged_in_store(None);
        let coordinator = RenewalCoordinator::new(transport.clone(), store.clone(), endpoint());

        let result = coordinator.renew_or_wait().await;

        assert!(matches!(result, Err(RenewalError::MissingRefreshToken)));
        assert_eq!(transport.requests().len(), 0);
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_waiters_observe_updated_store() {
        let transport = Arc::new(renews_to("A2"));
        let store = logged_in_store(Some("R1"));
        let coordinator = RenewalCoordinator::new(transport, store.clone(), endpoint());

        let observed = join_all((0..4).map(|_| async {
            let token = coordinator.renew_or_wait().await.expect("renewal should succeed");
            (token, store.access_token())
        }))
        .await;

        for (token, stored) in observed {
            assert_eq!(stored.as_deref(), Some(token.as_str()));
        }
    }

    #[tokio::test]
    async fn test_sequential_cycles_each_renew() {
        let transport = Arc::new(renews_to("A2"));
        let store = logged_in_store(Some("R1"));
        let coordinator = RenewalCoordinator::new(transport.clone(), store, endpoint());

        coordinator.renew_or_wait().await.expect("first cycle");
        coordinator.renew_or_wait().await.expect("second cycle");
        assert_eq!(transport.renewals(), 2);
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_stored() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(ApiResponse::new(
                StatusCode::OK,
                r#"{"access_token":"A2","refresh_token":"R2"}"#,
            ))
        }));
        let store = logged_in_store(Some("R1"));
        let coordinator = RenewalCoordinator::new(transport, store.clone(), endpoint());

        coordinator.renew_or_wait().await.expect("renewal should succeed");
        assert_eq!(store.refresh_token().as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_malformed_response_ends_session() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(ApiResponse::new(StatusCode::OK, "<html>oops</html>"))
        }));
        let store = logged_in_store(Some("R1"));
        let coordinator = RenewalCoordinator::new(transport, store.clone(), endpoint());

        let result = coordinator.renew_or_wait().await;
        assert!(matches!(result, Err(RenewalError::InvalidResponse(_))));
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_ends_session() {
        let transport = Arc::new(MockTransport::new(|_| {
            Err(TransportError::Connection("connection refused".to_string()))
        }));
        let store = logged_in_store(Some("R1"));
        let coordinator = RenewalCoordinator::new(transport, store.clone(), endpoint());

        let results = join_all((0..3).map(|_| coordinator.renew_or_wait())).await;
        for result in results {
            assert!(matches!(result, Err(RenewalError::Transport(_))));
        }
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_renewal_timeout() {
        let transport =
            Arc::new(renews_to("A2").with_renewal_delay(Duration::from_millis(500)));
        let store = logged_in_store(Some("R1"));
        let coordinator = RenewalCoordinator::new(transport, store.clone(), endpoint())
            .with_timeout(Duration::from_millis(20));

        let results = join_all((0..2).map(|_| coordinator.renew_or_wait())).await;
        for result in results {
            assert!(matches!(result, Err(RenewalError::TimedOut(_))));
        }
        assert!(store.snapshot().is_empty());
        assert!(!coordinator.is_renewing());
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_waiters() {
        let transport = Arc::new(renews_to("A2").with_renewal_delay(Duration::from_secs(5)));
        let store = logged_in_store(Some("R1"));
        let coordinator = Arc::new(RenewalCoordinator::new(transport, store, endpoint()));

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.renew_or_wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.is_renewing());

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.renew_or_wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.waiting(), 1);

        leader.abort();
        let result = waiter.await.expect("waiter task should not panic");
        assert!(matches!(result, Err(RenewalError::Abandoned)));
        assert!(!coordinator.is_renewing());
    }

    #[tokio::test]
    async fn test_logout_during_renewal_stays_logged_out() {
        let transport =
            Arc::new(renews_to("A2").with_renewal_delay(Duration::from_millis(200)));
        let store = logged_in_store(Some("R1"));
        let coordinator = Arc::new(RenewalCoordinator::new(transport, store.clone(), endpoint()));

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.renew_or_wait().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(coordinator.is_renewing());
        store.clear();

        let result = leader.await.expect("leader task should not panic");
        assert!(matches!(result, Err(RenewalError::SessionChanged)));
        assert!(store.snapshot().is_empty());
        assert!(!store.is_active());
        assert!(!coordinator.is_renewing());
    }

    #[tokio::test]
    async fn test_login_during_renewal_keeps_new_session() {
        let transport = Arc::new(
            MockTransport::new(|_| Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, "")))
                .with_renewal_delay(Duration::from_millis(200)),
        );
        let store = logged_in_store(Some("R1"));
        let coordinator = Arc::new(RenewalCoordinator::new(transport, store.clone(), endpoint()));

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.renew_or_wait().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.set_session("B1".to_string(), Some("S1".to_string()), None);

        // The old session's rejection must not log the new user out
        let result = leader.await.expect("leader task should not panic");
        assert!(matches!(result, Err(RenewalError::Rejected(_))));
        assert_eq!(store.access_token().as_deref(), Some("B1"));
        assert_eq!(store.refresh_token().as_deref(), Some("S1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_parallel_callers_share_one_renewal() {
        const CALLERS: usize = 64;

        let transport =
            Arc::new(renews_to("A2").with_renewal_delay(Duration::from_millis(100)));
        let store = logged_in_store(Some("R1"));
        let coordinator = Arc::new(RenewalCoordinator::new(
            transport.clone(),
            store.clone(),
            endpoint(),
        ));
        let start = Arc::new(Barrier::new(CALLERS));

        let tasks: Vec<_> = (0..CALLERS)
            .map(|_| {
                let coordinator = coordinator.clone();
                let store = store.clone();
                let start = start.clone();
                tokio::spawn(async move {
                    start.wait().await;
                    let token = coordinator.renew_or_wait().await;
                    (token, store.access_token())
                })
            })
            .collect();

        for task in join_all(tasks).await {
            let (token, stored) = task.expect("caller task should not panic");
            let token = token.expect("renewal should succeed");
            assert_eq!(token, "A2");
            assert_eq!(stored.as_deref(), Some("A2"));
        }
        assert_eq!(transport.renewals(), 1);
        assert!(!coordinator.is_renewing());
        assert_eq!(coordinator.waiting(), 0);
    }
}
