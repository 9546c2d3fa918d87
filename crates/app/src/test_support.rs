use std::{sync::Arc, time::Duration};

use eventsub_hub_storage::Database;
use eventsub_hub_twitch::{AppTokenCache, EventSubClient, TwitchOAuthClient};
use httpmock::prelude::*;
use serde_json::json;
use tempfile::TempDir;
use url::Url;

use crate::{
    router::AppState,
    shutdown::{self, ShutdownTrigger},
    telemetry,
};

pub(crate) const WEBHOOK_SECRET: &str = "test-webhook-secret";

pub(crate) async fn setup_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("eventsub.db").display());
    let db = Database::connect(&url).await.expect("connect");
    db.run_migrations().await.expect("migrations");
    (dir, db)
}

/// EventSub client and app token cache pointed at `server`.
pub(crate) fn twitch_clients(server: &MockServer) -> (EventSubClient, AppTokenCache) {
    let http = reqwest::Client::new();
    let oauth = TwitchOAuthClient::new(
        "client",
        "secret",
        Url::parse(&server.url("/oauth2/")).expect("url"),
        http.clone(),
    );
    let eventsub = EventSubClient::new(
        "client",
        Url::parse(&server.url("/helix/")).expect("url"),
        http,
    );
    (eventsub, AppTokenCache::new(oauth))
}

pub(crate) async fn mock_app_token(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200)
                .json_body(json!({"access_token": "app", "expires_in": 3600}));
        })
        .await;
}

pub(crate) struct TestApp {
    pub state: AppState,
    pub db: Database,
    pub trigger: ShutdownTrigger,
    _dir: TempDir,
}

pub(crate) async fn test_app() -> TestApp {
    test_app_with(|state| state, Duration::from_secs(1)).await
}

pub(crate) async fn test_app_with<F>(configure: F, long_poll_timeout: Duration) -> TestApp
where
    F: FnOnce(AppState) -> AppState,
{
    let metrics = telemetry::init_metrics().expect("metrics init");
    let (dir, db) = setup_db().await;
    let (trigger, shutdown) = shutdown::channel();
    // Never contacted unless a test swaps in a mock server.
    let oauth = TwitchOAuthClient::new(
        "client",
        "secret",
        Url::parse("http://127.0.0.1:9/oauth2/").expect("url"),
        reqwest::Client::new(),
    );
    let secret: Arc<[u8]> = Arc::from(WEBHOOK_SECRET.as_bytes());

    let state = configure(AppState::new(
        metrics,
        db.clone(),
        secret,
        oauth,
        long_poll_timeout,
        shutdown,
    ));
    TestApp {
        state,
        db,
        trigger,
        _dir: dir,
    }
}
