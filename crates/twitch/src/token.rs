use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::oauth::{OAuthError, TwitchOAuthClient};

/// Tokens are treated as expired this long before the provider says so.
pub const DEFAULT_EXPIRY_MARGIN_SECS: i64 = 60;

/// App access token plus its computed expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum TokenCacheError {
    #[error("failed to obtain app access token: {0}")]
    Refresh(#[from] OAuthError),
}

/// Caches a single app access token and refreshes it through the
/// client-credentials grant once it is about to expire.
///
/// The lock is held across the refresh so concurrent callers wait for one
/// token request instead of issuing their own. Failed refreshes are not cached.
#[derive(Clone)]
pub struct AppTokenCache {
    oauth: TwitchOAuthClient,
    current: Arc<Mutex<Option<AccessToken>>>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    margin: Duration,
}

impl AppTokenCache {
    pub fn new(oauth: TwitchOAuthClient) -> Self {
        Self {
            oauth,
            current: Arc::new(Mutex::new(None)),
            clock: Arc::new(Utc::now),
            margin: Duration::seconds(DEFAULT_EXPIRY_MARGIN_SECS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    pub fn client_id(&self) -> &str {
        self.oauth.client_id()
    }

    pub async fn get_token(&self) -> Result<String, TokenCacheError> {
        let mut current = self.current.lock().await;
        let now = (self.clock)();
        if let Some(token) = current.as_ref().filter(|token| token.is_fresh(now, self.margin)) {
            return Ok(token.value.clone());
        }

        let response = match self.oauth.client_credentials().await {
            Ok(response) => response,
            Err(err) => {
                counter!("app_token_refresh_total", "result" => "error").increment(1);
                return Err(err.into());
            }
        };
        counter!("app_token_refresh_total", "result" => "ok").increment(1);

        let token = AccessToken {
            expires_at: response.expires_at(now),
            value: response.access_token,
        };
        let value = token.value.clone();
        *current = Some(token);
        Ok(value)
    }

    /// Drops the cached token if it is still `rejected`, so the next
    /// [`AppTokenCache::get_token`] refreshes. A newer token is kept.
    pub async fn invalidate(&self, rejected: &str) -> bool {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|token| token.value == rejected) {
            *current = None;
            true
        } else {
            false
        }
    }

    pub async fn cached(&self) -> Option<AccessToken> {
        self.current.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use reqwest::Client;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use url::Url;

    struct Fixture {
        server: MockServer,
        now: Arc<StdMutex<DateTime<Utc>>>,
        cache: AppTokenCache,
    }

    async fn fixture() -> Fixture {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/oauth2/")).expect("url");
        let oauth = TwitchOAuthClient::new("client", "secret", base, Client::new());
        let now = Arc::new(StdMutex::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let clock_now = now.clone();
        let cache = AppTokenCache::new(oauth)
            .with_clock(Arc::new(move || *clock_now.lock().expect("clock")));
        Fixture { server, now, cache }
    }

    #[tokio::test]
    async fn reuses_token_until_margin() {
        let fx = fixture().await;
        let mock = fx
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth2/token");
                then.status(200)
                    .json_body(json!({"access_token": "first", "expires_in": 120}));
            })
            .await;

        assert_eq!(fx.cache.get_token().await.unwrap(), "first");
        *fx.now.lock().unwrap() += Duration::seconds(59);
        assert_eq!(fx.cache.get_token().await.unwrap(), "first");
        mock.assert_hits_async(1).await;

        *fx.now.lock().unwrap() += Duration::seconds(1);
        fx.cache.get_token().await.unwrap();
        mock.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn failed_refresh_is_not_cached() {
        let fx = fixture().await;
        let mut failing = fx
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth2/token");
                then.status(500).body("boom");
            })
            .await;

        assert!(fx.cache.get_token().await.is_err());
        assert!(fx.cache.cached().await.is_none());

        failing.delete_async().await;
        fx.server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth2/token");
                then.status(200)
                    .json_body(json!({"access_token": "recovered", "expires_in": 3600}));
            })
            .await;
        assert_eq!(fx.cache.get_token().await.unwrap(), "recovered");
    }

    #[tokio::test]
    async fn invalidate_only_drops_the_rejected_token() {
        let fx = fixture().await;
        let mock = fx
            .server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth2/token");
                then.status(200)
                    .json_body(json!({"access_token": "tok", "expires_in": 3600}));
            })
            .await;

        let token = fx.cache.get_token().await.unwrap();
        assert!(!fx.cache.invalidate("someone-elses").await);
        assert!(fx.cache.cached().await.is_some());

        assert!(fx.cache.invalidate(&token).await);
        fx.cache.get_token().await.unwrap();
        mock.assert_hits_async(2).await;
    }
}
