use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::auth::storage::{LogoutService, TokenStorage, UserInfoStorage};


#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Why a token refresh did not produce a new access token. This is shared by all requests that
///  waited for the same refresh, so it is `Clone` and carries messages rather than sources.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RefreshError {
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("no user id available")]
    MissingUserId,
    #[error("refresh token was rejected: {0}")]
    Rejected(String),
    #[error("refresh call failed: {0}")]
    Transport(String),
    #[error("refreshed tokens could not be stored: {0}")]
    Storage(String),
    #[error("refresh was abandoned before it completed")]
    Abandoned,
}

/// The actual refresh call. Implementations must not go through anything that consults the
///  [TokenCoordinator], otherwise an expired refresh would recurse into itself.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
    async fn refresh(&self, user_id: &str, refresh_token: &str) -> Result<TokenPair, RefreshError>;
}


#[derive(Debug, Default)]
struct TokenCache {
    user_id: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: VecDeque<oneshot::Sender<Result<String, RefreshError>>>,
}


/// Holds the current credentials for REST calls and single-flights their renewal: no matter
///  how many requests fail with 'unauthorized' concurrently, there is at most one refresh
///  call in flight, and everybody who arrives while it runs waits for its outcome.
pub struct TokenCoordinator {
    token_storage: Arc<dyn TokenStorage>,
    user_info_storage: Arc<dyn UserInfoStorage>,
    logout_service: Arc<dyn LogoutService>,
    refresher: Arc<dyn TokenRefresher>,
    cache: RwLock<TokenCache>,
    refresh: Mutex<RefreshState>,
}

impl TokenCoordinator {
    pub fn new(
        token_storage: Arc<dyn TokenStorage>,
        user_info_storage: Arc<dyn UserInfoStorage>,
        logout_service: Arc<dyn LogoutService>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> TokenCoordinator {
        TokenCoordinator {
            token_storage,
            user_info_storage,
            logout_service,
            refresher,
            cache: Default::default(),
            refresh: Default::default(),
        }
    }

    /// Restores the session of the current user from storage. A user without stored tokens is
    ///  not an error, REST calls simply go out without credentials until [TokenCoordinator::on_login].
    pub async fn load(&self) -> anyhow::Result<()> {
        let user_id = match self.user_info_storage.user_info().await {
            Ok(Some(user_info)) => Some(user_info.user_id),
            Ok(None) => {
                debug!("no stored user info");
                None
            }
            Err(e) => {
                warn!("failed to load user info, logging out: {}", e);
                self.logout_service.logout().await;
                return Err(e);
            }
        };

        let (access_token, refresh_token) = match &user_id {
            Some(user_id) => (
                self.token_storage.access_token(user_id).await?,
                self.token_storage.refresh_token(user_id).await?,
            ),
            None => (None, None),
        };

        info!("loaded session for user {:?}: access token present: {}, refresh token present: {}", user_id, access_token.is_some(), refresh_token.is_some());
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = TokenCache {
            user_id,
            access_token,
            refresh_token,
        };
        Ok(())
    }

    pub async fn on_login(&self, user_id: &str, tokens: TokenPair) -> anyhow::Result<()> {
        self.token_storage.set_tokens(user_id, &tokens.access_token, &tokens.refresh_token).await?;
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = TokenCache {
            user_id: Some(user_id.to_string()),
            access_token: Some(tokens.access_token),
            refresh_token: Some(tokens.refresh_token),
        };
        Ok(())
    }

    pub fn access_token(&self) -> Option<String> {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).access_token.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).user_id.clone()
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.refresh.lock().unwrap_or_else(|e| e.into_inner()).in_flight
    }

    pub fn num_refresh_waiters(&self) -> usize {
        self.refresh.lock().unwrap_or_else(|e| e.into_inner()).waiters.len()
    }

    /// To be called when a request was rejected as unauthorized. Returns the access token to
    ///  retry the request with, either from a refresh this call performs itself or from the
    ///  refresh that was already in flight.
    ///
    /// If the refresh fails, the logout collaborator was invoked, and the caller should give up
    ///  on the request.
    pub async fn refresh_after_unauthorized(&self) -> Result<String, RefreshError> {
        let waiter = {
            let mut state = self.refresh.lock().unwrap_or_else(|e| e.into_inner());
            if state.in_flight {
                let (send, recv) = oneshot::channel();
                state.waiters.push_back(send);
                debug!("token refresh in flight, waiting as #{}", state.waiters.len());
                Some(recv)
            }
            else {
                state.in_flight = true;
                None
            }
        };

        if let Some(recv) = waiter {
            return recv.await
                .unwrap_or(Err(RefreshError::Abandoned));
        }

        let mut flight = RefreshFlight {
            coordinator: self,
            outcome: None,
        };
        let result = self.do_refresh().await;
        flight.outcome = Some(result.clone());
        drop(flight);
        result
    }

    async fn do_refresh(&self) -> Result<String, RefreshError> {
        let (user_id, refresh_token) = {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            (cache.user_id.clone(), cache.refresh_token.clone())
        };

        let Some(refresh_token) = refresh_token else {
            warn!("no refresh token, logging out");
            self.logout_service.logout().await;
            return Err(RefreshError::MissingRefreshToken);
        };
        let Some(user_id) = user_id else {
            warn!("no user id, logging out");
            self.logout_service.logout().await;
            return Err(RefreshError::MissingUserId);
        };

        info!("refreshing access token for user {}", user_id);
        match self.refresher.refresh(&user_id, &refresh_token).await {
            Ok(tokens) => {
                if let Err(e) = self.token_storage.set_tokens(&user_id, &tokens.access_token, &tokens.refresh_token).await {
                    warn!("failed to persist refreshed tokens for user {}, logging out: {}", user_id, e);
                    self.logout_service.logout().await;
                    return Err(RefreshError::Storage(e.to_string()));
                }
                let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
                cache.access_token = Some(tokens.access_token.clone());
                cache.refresh_token = Some(tokens.refresh_token);
                Ok(tokens.access_token)
            }
            Err(e) => {
                warn!("token refresh failed, logging out: {}", e);
                self.logout_service.logout().await;
                Err(e)
            }
        }
    }
}


/// Clears the in-flight flag and hands the refresh outcome to all waiters in the order they
///  arrived. Dropping it without an outcome (i.e. the refreshing future was cancelled) releases
///  the waiters with [RefreshError::Abandoned].
struct RefreshFlight<'a> {
    coordinator: &'a TokenCoordinator,
    outcome: Option<Result<String, RefreshError>>,
}

impl Drop for RefreshFlight<'_> {
    fn drop(&mut self) {
        let waiters = {
            let mut state = self.coordinator.refresh.lock().unwrap_or_else(|e| e.into_inner());
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };

        let outcome = self.outcome.take()
            .unwrap_or(Err(RefreshError::Abandoned));
        debug!("token refresh done, resuming {} waiting requests", waiters.len());
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use tokio::sync::Semaphore;
    use tokio::task::yield_now;

    use super::*;
    use crate::auth::storage::{InMemoryTokenStorage, InMemoryUserInfoStorage, MockLogoutService, MockTokenStorage, UserInfo};

    /// blocks every refresh until the test releases it
    struct GatedRefresher {
        gate: Semaphore,
        calls: AtomicUsize,
        result: Result<TokenPair, RefreshError>,
    }

    #[async_trait]
    impl TokenRefresher for GatedRefresher {
        async fn refresh(&self, user_id: &str, refresh_token: &str) -> Result<TokenPair, RefreshError> {
            assert_eq!(user_id, "u1");
            assert_eq!(refresh_token, "r1");
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await;
            self.result.clone()
        }
    }

    fn new_tokens() -> TokenPair {
        TokenPair { access_token: "a2".to_string(), refresh_token: "r2".to_string() }
    }

    async fn coordinator(refresher: Arc<dyn TokenRefresher>, logout: MockLogoutService) -> (Arc<TokenCoordinator>, Arc<InMemoryTokenStorage>) {
        let token_storage = Arc::new(InMemoryTokenStorage::new());
        token_storage.set_tokens("u1", "a1", "r1").await.unwrap();
        let user_info_storage = Arc::new(InMemoryUserInfoStorage::with_user(UserInfo { user_id: "u1".to_string(), ..Default::default() }));

        let coordinator = TokenCoordinator::new(token_storage.clone(), user_info_storage, Arc::new(logout), refresher);
        coordinator.load().await.unwrap();
        (Arc::new(coordinator), token_storage)
    }

    #[tokio::test]
    async fn test_load() {
        let (coordinator, _) = coordinator(Arc::new(MockTokenRefresher::new()), MockLogoutService::new()).await;
        assert_eq!(coordinator.user_id().as_deref(), Some("u1"));
        assert_eq!(coordinator.access_token().as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_concurrent_unauthorized_single_refresh() {
        const N: usize = 5;

        let refresher = Arc::new(GatedRefresher {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
            result: Ok(new_tokens()),
        });
        let (coordinator, token_storage) = coordinator(refresher.clone(), MockLogoutService::new()).await;

        let resumed = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..N {
            let task_coordinator = coordinator.clone();
            let resumed = resumed.clone();
            handles.push(tokio::spawn(async move {
                let token = task_coordinator.refresh_after_unauthorized().await;
                resumed.lock().unwrap().push(i);
                token
            }));

            // let each caller register before the next one arrives
            while !coordinator.refresh_in_flight() || coordinator.num_refresh_waiters() < i {
                yield_now().await;
            }
        }

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.num_refresh_waiters(), N - 1);

        refresher.gate.add_permits(1);
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("a2".to_string()));
        }

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*resumed.lock().unwrap(), (0..N).collect::<Vec<_>>());
        assert!(!coordinator.refresh_in_flight());
        assert_eq!(coordinator.access_token().as_deref(), Some("a2"));
        assert_eq!(token_storage.access_token("u1").await.unwrap().as_deref(), Some("a2"));
        assert_eq!(token_storage.refresh_token("u1").await.unwrap().as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_failed_refresh_rejects_all_and_logs_out() {
        let refresher = Arc::new(GatedRefresher {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
            result: Err(RefreshError::Rejected("expired".to_string())),
        });
        let mut logout = MockLogoutService::new();
        logout.expect_logout()
            .times(1)
            .returning(|| ());
        let (coordinator, _) = coordinator(refresher.clone(), logout).await;

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh_after_unauthorized().await })
        };
        while !coordinator.refresh_in_flight() {
            yield_now().await;
        }
        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh_after_unauthorized().await })
        };
        while coordinator.num_refresh_waiters() < 1 {
            yield_now().await;
        }

        refresher.gate.add_permits(1);
        assert_eq!(first.await.unwrap(), Err(RefreshError::Rejected("expired".to_string())));
        assert_eq!(second.await.unwrap(), Err(RefreshError::Rejected("expired".to_string())));
        assert!(!coordinator.refresh_in_flight());
        assert_eq!(coordinator.access_token().as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_unstorable_refresh_fails_and_logs_out() {
        let mut token_storage = MockTokenStorage::new();
        token_storage.expect_access_token()
            .returning(|_| Ok(Some("a1".to_string())));
        token_storage.expect_refresh_token()
            .returning(|_| Ok(Some("r1".to_string())));
        token_storage.expect_set_tokens()
            .times(1)
            .returning(|_, _, _| Err(anyhow!("disk full")));

        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh()
            .times(1)
            .returning(|_, _| Ok(new_tokens()));
        let mut logout = MockLogoutService::new();
        logout.expect_logout()
            .times(1)
            .returning(|| ());

        let coordinator = TokenCoordinator::new(
            Arc::new(token_storage),
            Arc::new(InMemoryUserInfoStorage::with_user(UserInfo { user_id: "u1".to_string(), ..Default::default() })),
            Arc::new(logout),
            Arc::new(refresher),
        );
        coordinator.load().await.unwrap();

        assert_eq!(coordinator.refresh_after_unauthorized().await, Err(RefreshError::Storage("disk full".to_string())));
        assert!(!coordinator.refresh_in_flight());
        assert_eq!(coordinator.access_token().as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_missing_refresh_token_logs_out() {
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().never();
        let mut logout = MockLogoutService::new();
        logout.expect_logout()
            .times(2)
            .returning(|| ());

        let coordinator = TokenCoordinator::new(
            Arc::new(InMemoryTokenStorage::new()),
            Arc::new(InMemoryUserInfoStorage::with_user(UserInfo { user_id: "u1".to_string(), ..Default::default() })),
            Arc::new(logout),
            Arc::new(refresher),
        );
        coordinator.load().await.unwrap();

        assert_eq!(coordinator.refresh_after_unauthorized().await, Err(RefreshError::MissingRefreshToken));
        assert!(!coordinator.refresh_in_flight());
        // the flag was cleared, so the next attempt runs (and fails) again
        assert_eq!(coordinator.refresh_after_unauthorized().await, Err(RefreshError::MissingRefreshToken));
    }

    #[tokio::test]
    async fn test_missing_user_id_logs_out() {
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().never();
        let mut logout = MockLogoutService::new();
        logout.expect_logout()
            .times(1)
            .returning(|| ());

        let coordinator = TokenCoordinator::new(
            Arc::new(InMemoryTokenStorage::new()),
            Arc::new(InMemoryUserInfoStorage::new()),
            Arc::new(logout),
            Arc::new(refresher),
        );
        coordinator.load().await.unwrap();
        // a refresh token without a user
        coordinator.cache.write().unwrap().refresh_token = Some("r1".to_string());

        assert_eq!(coordinator.refresh_after_unauthorized().await, Err(RefreshError::MissingUserId));
    }

    #[tokio::test]
    async fn test_cancelled_refresh_releases_waiters() {
        let refresher = Arc::new(GatedRefresher {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
            result: Ok(new_tokens()),
        });
        let (coordinator, _) = coordinator(refresher.clone(), MockLogoutService::new()).await;

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh_after_unauthorized().await })
        };
        while !coordinator.refresh_in_flight() {
            yield_now().await;
        }
        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh_after_unauthorized().await })
        };
        while coordinator.num_refresh_waiters() < 1 {
            yield_now().await;
        }

        first.abort();
        assert_eq!(second.await.unwrap(), Err(RefreshError::Abandoned));
        assert!(!coordinator.refresh_in_flight());
    }

    #[tokio::test]
    async fn test_on_login() {
        let (coordinator, token_storage) = coordinator(Arc::new(MockTokenRefresher::new()), MockLogoutService::new()).await;
        coordinator.on_login("u7", TokenPair { access_token: "x".to_string(), refresh_token: "y".to_string() }).await.unwrap();

        assert_eq!(coordinator.user_id().as_deref(), Some("u7"));
        assert_eq!(coordinator.access_token().as_deref(), Some("x"));
        assert_eq!(token_storage.refresh_token("u7").await.unwrap().as_deref(), Some("y"));
    }
}
