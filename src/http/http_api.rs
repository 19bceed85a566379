use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::storage::UserInfo;
use crate::auth::token_coordinator::{RefreshError, TokenCoordinator, TokenPair, TokenRefresher};
use crate::clock::time_calibrator::{ServerTimestamps, TimeSyncSource};
use crate::http::dto::*;


#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub app_id: u32,
    pub client_type: u32,
    pub device_id: String,
    pub request_timeout: Duration,
    /// time sync probes are only useful if they are fast
    pub time_sync_timeout: Duration,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>, app_id: u32, device_id: impl Into<String>) -> HttpConfig {
        HttpConfig {
            base_url: base_url.into(),
            app_id,
            client_type: 1,
            device_id: device_id.into(),
            request_timeout: Duration::from_secs(10),
            time_sync_timeout: Duration::from_millis(1500),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            bail!("base URL must be http(s): {}", self.base_url);
        }
        if self.request_timeout.is_zero() || self.time_sync_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// the headers that identify the client on every request
    fn client_headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-app-id", HeaderValue::from(self.app_id));
        headers.insert("x-client-type", HeaderValue::from(self.client_type));
        headers.insert("x-device-id", HeaderValue::from_str(&self.device_id)
            .context("device id is not a valid header value")?);
        Ok(headers)
    }

    fn build_client(&self) -> anyhow::Result<Client> {
        Ok(Client::builder()
            .timeout(self.request_timeout)
            .default_headers(self.client_headers()?)
            .build()?)
    }
}


/// The REST API of the IM server. Requests carry the coordinator's current access token, and a
///  request that is rejected as unauthorized is retried once after the coordinator renewed the
///  token.
pub struct HttpApi {
    config: HttpConfig,
    client: Client,
    tokens: Arc<TokenCoordinator>,
}

impl HttpApi {
    pub fn new(config: HttpConfig, tokens: Arc<TokenCoordinator>) -> anyhow::Result<HttpApi> {
        config.validate()?;
        Ok(HttpApi {
            client: config.build_client()?,
            config,
            tokens,
        })
    }

    async fn execute<T: DeserializeOwned>(&self, request: impl Fn(&Client) -> RequestBuilder) -> anyhow::Result<ApiResponse<T>> {
        let mut builder = request(&self.client);
        if let Some(token) = self.tokens.access_token() {
            builder = builder.bearer_auth(token);
        }

        let mut response = builder.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("request to {} was unauthorized, renewing the access token", response.url());
            let token = self.tokens.refresh_after_unauthorized().await
                .context("unauthorized, and the access token could not be renewed")?;
            response = request(&self.client)
                .bearer_auth(token)
                .send().await?;
        }

        let response = response.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Logs in with a password. On success, the returned tokens are used for all further
    ///  requests, and they are persisted.
    pub async fn login(&self, user_id: &str, password: &str) -> anyhow::Result<ApiResponse<LoginResponse>> {
        let url = self.config.url("/v1/auth/login");
        let response: ApiResponse<LoginResponse> = self.execute(|client| client.post(&url)
            .json(&LoginRequest { user_id, password })
        ).await?;

        match &response.data {
            Some(login) => {
                info!("logged in as {}", user_id);
                self.tokens.on_login(user_id, TokenPair {
                    access_token: login.access_token.clone(),
                    refresh_token: login.refresh_token.clone(),
                }).await?;
            }
            None => warn!("login for {} returned no tokens (code {})", user_id, response.code),
        }
        Ok(response)
    }

    pub async fn user_info(&self) -> anyhow::Result<ApiResponse<UserInfo>> {
        let url = self.config.url("/v1/user/info");
        self.execute(|client| client.get(&url)).await
    }

    pub async fn im_server_address(&self) -> anyhow::Result<ApiResponse<ImServerAddress>> {
        let url = self.config.url("/v1/user/im-server-address");
        self.execute(|client| client.get(&url)).await
    }

    pub async fn user_sequence(&self) -> anyhow::Result<ApiResponse<UserSequence>> {
        let url = self.config.url("/v1/user/sequence");
        self.execute(|client| client.get(&url)).await
    }

    /// checks whether the current access token is accepted, renewing it if it is not
    pub async fn test_token(&self) -> anyhow::Result<ApiResponse<Value>> {
        let url = self.config.url("/v1/auth/test-token");
        self.execute(|client| client.post(&url)).await
    }

    pub async fn sync_time(&self) -> anyhow::Result<ApiResponse<ServerTimestamps>> {
        let url = self.config.url("/v1/time/sync");
        let timeout = self.config.time_sync_timeout;
        self.execute(|client| client.get(&url).timeout(timeout)).await
    }

    pub async fn friend_info(&self) -> anyhow::Result<ApiResponse<Friend>> {
        let url = self.config.url("/v1/friend/info");
        self.execute(|client| client.get(&url)).await
    }

    pub async fn friend_list(&self, cursor: Option<i64>, limit: Option<u32>) -> anyhow::Result<ApiResponse<FriendListPage>> {
        let url = self.config.url("/v1/friend/list");
        let query = FriendListQuery { cursor, limit };
        self.execute(|client| client.get(&url).query(&query)).await
    }

    pub async fn friend_online_status(&self) -> anyhow::Result<ApiResponse<Vec<FriendStatus>>> {
        let url = self.config.url("/v1/friend/online-status");
        self.execute(|client| client.get(&url)).await
    }

    pub async fn friend_group_sequence(&self) -> anyhow::Result<ApiResponse<i64>> {
        let url = self.config.url("/v1/friend/group/sequence");
        self.execute(|client| client.get(&url)).await
    }

    pub async fn friend_groups(&self) -> anyhow::Result<ApiResponse<Vec<FriendGroup>>> {
        let url = self.config.url("/v1/friend/group/list-with-friend-id");
        self.execute(|client| client.get(&url)).await
    }

    pub async fn sync_offline_messages(&self) -> anyhow::Result<ApiResponse<SyncResponse<OfflineMessage>>> {
        let url = self.config.url("/v1/message/offline-sync");
        self.execute(|client| client.get(&url)).await
    }

    pub async fn sync_conversations(&self, last_sequence: i64, limit: u32) -> anyhow::Result<ApiResponse<SyncResponse<Conversation>>> {
        let url = self.config.url("/v1/conversation/list/sync");
        let body = ConversationSyncRequest { last_sequence, limit };
        self.execute(|client| client.post(&url).json(&body)).await
    }

    /// returns the new conversation's id
    pub async fn create_conversation(&self, to_id: &str, conversation_type: u32) -> anyhow::Result<ApiResponse<String>> {
        let url = self.config.url("/v1/conversation/create");
        let body = CreateConversationRequest { to_id, conversation_type };
        self.execute(|client| client.post(&url).json(&body)).await
    }

    pub async fn update_conversation(&self, to_id: &str, is_mute: Option<u32>, is_top: Option<u32>) -> anyhow::Result<ApiResponse<i64>> {
        let url = self.config.url("/v1/conversation/update");
        let body = UpdateConversationRequest {
            from_id: self.tokens.user_id(),
            to_id,
            is_top,
            is_mute,
        };
        self.execute(|client| client.post(&url).json(&body)).await
    }
}

#[async_trait]
impl TimeSyncSource for HttpApi {
    async fn fetch_server_time(&self) -> anyhow::Result<ServerTimestamps> {
        self.sync_time().await?.into_data()
    }
}


/// Renews tokens over a client of its own, so a refresh never passes through the
///  unauthorized handling of [HttpApi].
pub struct RefreshChannel {
    url: String,
    client: Client,
}

impl RefreshChannel {
    pub fn new(config: &HttpConfig) -> anyhow::Result<RefreshChannel> {
        config.validate()?;
        Ok(RefreshChannel {
            url: config.url("/v1/auth/refresh-token"),
            client: config.build_client()?,
        })
    }
}

#[async_trait]
impl TokenRefresher for RefreshChannel {
    async fn refresh(&self, user_id: &str, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        let response = self.client.post(&self.url)
            .json(&RefreshTokenRequest { refresh_token, user_id })
            .send().await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RefreshError::Rejected(format!("HTTP status {}", response.status())));
        }
        let response: ApiResponse<RefreshTokenResponse> = response.json().await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        // NB: the refresh endpoint signals failure with code 0
        if response.code == 0 {
            return Err(RefreshError::Rejected(response.message.unwrap_or_default()));
        }
        let tokens = response.into_data()
            .map_err(|e| RefreshError::Rejected(e.to_string()))?;
        Ok(TokenPair {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        })
    }
}
