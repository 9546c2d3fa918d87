use std::collections::HashSet;

use eventsub_hub_core::{DesiredSubscription, Subscription};
use eventsub_hub_twitch::{
    AppTokenCache, CreateOutcome, CreateSubscriptionRequest, EventSubClient, EventSubError,
    TokenCacheError, TransportRequest,
};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Token(#[from] TokenCacheError),
    #[error("failed to list subscriptions: {0}")]
    List(EventSubError),
    #[error("authorization revoked for user {user_id}")]
    AuthorizationRevoked { user_id: String },
    #[error("subscription create failed with {status}: {body}")]
    CreateFailed { status: StatusCode, body: String },
    #[error("subscription create request failed: {0}")]
    Request(EventSubError),
}

/// Lists and creates the app's remote webhook subscriptions.
pub struct SubscriptionRegistry {
    client: EventSubClient,
    tokens: AppTokenCache,
    callback: String,
    secret: String,
}

impl SubscriptionRegistry {
    pub fn new(
        client: EventSubClient,
        tokens: AppTokenCache,
        callback: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            tokens,
            callback: callback.into(),
            secret: secret.into(),
        }
    }

    /// Fetches every page of the remote subscription list.
    pub async fn list(&self) -> Result<Vec<Subscription>, RegistryError> {
        let token = self.tokens.get_token().await?;
        let mut subscriptions = Vec::new();
        let mut seen_cursors = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = match self
                .client
                .list_subscriptions(&token, cursor.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    self.forget_rejected_token(&token, &err).await;
                    return Err(RegistryError::List(err));
                }
            };
            subscriptions.extend(page.data);

            match page.cursor {
                Some(next) if seen_cursors.insert(next.clone()) => cursor = Some(next),
                Some(repeated) => {
                    warn!(stage = "registry", cursor = %repeated, "pagination cursor repeated, stopping");
                    break;
                }
                None => break,
            }
        }

        debug!(stage = "registry", count = subscriptions.len(), "listed remote subscriptions");
        Ok(subscriptions)
    }

    /// Submits `desired`. A conflict counts as success; a 403 means the user
    /// withdrew the authorization.
    pub async fn create(&self, desired: &DesiredSubscription) -> Result<CreateOutcome, RegistryError> {
        let token = self.tokens.get_token().await?;
        let request = CreateSubscriptionRequest {
            event_type: &desired.event_type,
            version: &desired.version,
            condition: &desired.condition,
            transport: TransportRequest::webhook(&self.callback, &self.secret),
        };

        match self.client.create_subscription(&token, &request).await {
            Ok(outcome) => Ok(outcome),
            Err(EventSubError::Status { status, .. }) if status == StatusCode::FORBIDDEN => {
                Err(RegistryError::AuthorizationRevoked {
                    user_id: desired.user_id.clone(),
                })
            }
            Err(err) => {
                self.forget_rejected_token(&token, &err).await;
                Err(match err {
                    EventSubError::Status { status, body } => {
                        RegistryError::CreateFailed { status, body }
                    }
                    other => RegistryError::Request(other),
                })
            }
        }
    }

    async fn forget_rejected_token(&self, token: &str, err: &EventSubError) {
        if err.status() == Some(StatusCode::UNAUTHORIZED) && self.tokens.invalidate(token).await {
            warn!(stage = "registry", "app token rejected, cleared cached token");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mock_app_token, twitch_clients};
    use eventsub_hub_core::Condition;
    use httpmock::prelude::*;
    use serde_json::json;

    fn desired(user_id: &str) -> DesiredSubscription {
        DesiredSubscription {
            user_id: user_id.to_string(),
            event_type: "channel.cheer".to_string(),
            version: "1".to_string(),
            condition: Condition::new().with("broadcaster_user_id", user_id),
        }
    }

    fn remote(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "status": "enabled",
            "type": "channel.update",
            "version": "2",
            "condition": {"broadcaster_user_id": id},
            "transport": {"method": "webhook", "callback": "https://example.com/callback"},
            "created_at": "2024-01-01T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn list_drains_pagination() {
        let server = MockServer::start_async().await;
        mock_app_token(&server).await;
        let second = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/helix/eventsub/subscriptions")
                    .query_param("after", "page-2");
                then.status(200).json_body(json!({
                    "data": [remote("2")],
                    "pagination": {}
                }));
            })
            .await;
        let first = server
            .mock_async(|when, then| {
                when.method(GET).path("/helix/eventsub/subscriptions");
                then.status(200).json_body(json!({
                    "data": [remote("1")],
                    "pagination": {"cursor": "page-2"}
                }));
            })
            .await;

        let (client, tokens) = twitch_clients(&server);
        let registry = SubscriptionRegistry::new(client, tokens, "https://example.com/callback", "0123456789");
        let listed = registry.list().await.expect("list");

        assert_eq!(
            listed.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["1", "2"]
        );
        first.assert_hits_async(1).await;
        second.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn forbidden_create_is_revocation() {
        let server = MockServer::start_async().await;
        mock_app_token(&server).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/helix/eventsub/subscriptions");
                then.status(403).json_body(json!({"status": 403, "message": "forbidden"}));
            })
            .await;

        let (client, tokens) = twitch_clients(&server);
        let registry = SubscriptionRegistry::new(client, tokens, "https://example.com/callback", "0123456789");
        let err = registry.create(&desired("42")).await.expect_err("revoked");
        assert!(matches!(err, RegistryError::AuthorizationRevoked { ref user_id } if user_id == "42"));
    }

    #[tokio::test]
    async fn conflict_is_success_and_other_failures_keep_body() {
        let server = MockServer::start_async().await;
        mock_app_token(&server).await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains(r#""broadcaster_user_id":"1""#);
                then.status(409).json_body(json!({"status": 409}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains(r#""broadcaster_user_id":"2""#);
                then.status(400).body("invalid condition");
            })
            .await;

        let (client, tokens) = twitch_clients(&server);
        let registry = SubscriptionRegistry::new(client, tokens, "https://example.com/callback", "0123456789");

        assert_eq!(
            registry.create(&desired("1")).await.expect("conflict"),
            CreateOutcome::AlreadyExists
        );
        match registry.create(&desired("2")).await.expect_err("bad request") {
            RegistryError::CreateFailed { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "invalid condition");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_clears_app_token() {
        let server = MockServer::start_async().await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth2/token");
                then.status(200)
                    .json_body(json!({"access_token": "app", "expires_in": 3600}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/helix/eventsub/subscriptions");
                then.status(401).body("invalid oauth token");
            })
            .await;

        let (client, tokens) = twitch_clients(&server);
        let registry = SubscriptionRegistry::new(client, tokens, "https://example.com/callback", "0123456789");

        assert!(matches!(registry.list().await, Err(RegistryError::List(_))));
        assert!(matches!(registry.list().await, Err(RegistryError::List(_))));
        token.assert_hits_async(2).await;
    }
}
