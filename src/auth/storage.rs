//! Persistence and session collaborators the client consumes. Applications plug in their own
//!  implementations, the in-memory ones are good enough for tests and short-lived tools.

use std::sync::Mutex;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;


#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenStorage: Send + Sync + 'static {
    async fn set_tokens(&self, user_id: &str, access_token: &str, refresh_token: &str) -> anyhow::Result<()>;
    async fn access_token(&self, user_id: &str) -> anyhow::Result<Option<String>>;
    async fn set_access_token(&self, user_id: &str, token: &str) -> anyhow::Result<()>;
    async fn refresh_token(&self, user_id: &str) -> anyhow::Result<Option<String>>;
    async fn set_refresh_token(&self, user_id: &str, token: &str) -> anyhow::Result<()>;
    async fn clear_tokens(&self, user_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub app_id: u32,
    pub user_id: String,
    #[serde(default)]
    pub sequence: i64,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub gender: Option<u32>,
    #[serde(default)]
    pub self_signature: Option<String>,
    #[serde(default)]
    pub settings: Value,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserInfoStorage: Send + Sync + 'static {
    /// the currently logged in user, if any
    async fn user_info(&self) -> anyhow::Result<Option<UserInfo>>;
    async fn set_user_info(&self, user_info: UserInfo) -> anyhow::Result<()>;
    async fn clear_user_info(&self, user_id: &str) -> anyhow::Result<()>;
}

/// Ends the local session, e.g. by clearing state and returning to a login screen. This is
///  invoked when credentials can not be renewed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LogoutService: Send + Sync + 'static {
    async fn logout(&self);
}


#[derive(Debug, Default)]
pub struct InMemoryTokenStorage {
    tokens: Mutex<FxHashMap<String, (Option<String>, Option<String>)>>,
}

impl InMemoryTokenStorage {
    pub fn new() -> InMemoryTokenStorage {
        Default::default()
    }

    fn with_entry<R>(&self, user_id: &str, f: impl FnOnce(&mut (Option<String>, Option<String>)) -> R) -> R {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        f(tokens.entry(user_id.to_string()).or_default())
    }
}

#[async_trait]
impl TokenStorage for InMemoryTokenStorage {
    async fn set_tokens(&self, user_id: &str, access_token: &str, refresh_token: &str) -> anyhow::Result<()> {
        self.with_entry(user_id, |e| *e = (Some(access_token.to_string()), Some(refresh_token.to_string())));
        Ok(())
    }

    async fn access_token(&self, user_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.with_entry(user_id, |e| e.0.clone()))
    }

    async fn set_access_token(&self, user_id: &str, token: &str) -> anyhow::Result<()> {
        self.with_entry(user_id, |e| e.0 = Some(token.to_string()));
        Ok(())
    }

    async fn refresh_token(&self, user_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.with_entry(user_id, |e| e.1.clone()))
    }

    async fn set_refresh_token(&self, user_id: &str, token: &str) -> anyhow::Result<()> {
        self.with_entry(user_id, |e| e.1 = Some(token.to_string()));
        Ok(())
    }

    async fn clear_tokens(&self, user_id: &str) -> anyhow::Result<()> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).remove(user_id);
        Ok(())
    }
}


#[derive(Debug, Default)]
pub struct InMemoryUserInfoStorage {
    current: Mutex<Option<UserInfo>>,
}

impl InMemoryUserInfoStorage {
    pub fn new() -> InMemoryUserInfoStorage {
        Default::default()
    }

    pub fn with_user(user_info: UserInfo) -> InMemoryUserInfoStorage {
        InMemoryUserInfoStorage {
            current: Mutex::new(Some(user_info)),
        }
    }
}

#[async_trait]
impl UserInfoStorage for InMemoryUserInfoStorage {
    async fn user_info(&self) -> anyhow::Result<Option<UserInfo>> {
        Ok(self.current.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn set_user_info(&self, user_info: UserInfo) -> anyhow::Result<()> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(user_info);
        Ok(())
    }

    async fn clear_user_info(&self, user_id: &str) -> anyhow::Result<()> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().map(|u| u.user_id.as_str()) == Some(user_id) {
            *current = None;
        }
        Ok(())
    }
}


/// logs and does nothing else
#[derive(Debug, Default)]
pub struct NoopLogoutService {}

#[async_trait]
impl LogoutService for NoopLogoutService {
    async fn logout(&self) {
        info!("logout requested");
    }
}
