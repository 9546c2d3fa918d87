use std::{sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use eventsub_hub_storage::Database;
use eventsub_hub_twitch::TwitchOAuthClient;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::{poll::PollCache, problem::ProblemResponse, shutdown::Shutdown, telemetry, user, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    webhook_secret: Arc<[u8]>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    poll: PollCache,
    oauth: TwitchOAuthClient,
    long_poll_timeout: Duration,
    dev_user_id: Option<Arc<str>>,
    shutdown: Shutdown,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        webhook_secret: Arc<[u8]>,
        oauth: TwitchOAuthClient,
        long_poll_timeout: Duration,
        shutdown: Shutdown,
    ) -> Self {
        let poll = PollCache::new(storage.events());
        Self {
            metrics,
            storage,
            webhook_secret,
            clock: Arc::new(Utc::now),
            poll,
            oauth,
            long_poll_timeout,
            dev_user_id: None,
            shutdown,
        }
    }

    /// Serves every long-poll as this user regardless of the request header.
    pub fn with_dev_user(mut self, user_id: Option<String>) -> Self {
        self.dev_user_id = user_id.map(Arc::from);
        self
    }

    #[cfg(test)]
    pub fn with_oauth(mut self, oauth: TwitchOAuthClient) -> Self {
        self.oauth = oauth;
        self
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn webhook_secret(&self) -> &[u8] {
        &self.webhook_secret
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn poll(&self) -> &PollCache {
        &self.poll
    }

    pub fn oauth(&self) -> &TwitchOAuthClient {
        &self.oauth
    }

    pub fn long_poll_timeout(&self) -> Duration {
        self.long_poll_timeout
    }

    pub fn dev_user_id(&self) -> Option<&str> {
        self.dev_user_id.as_deref()
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/callback", post(webhook::handle).fallback(not_found))
        .route(
            "/user",
            get(user::poll).post(user::register).fallback(not_found),
        )
        .fallback(not_found)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn not_found() -> ProblemResponse {
    ProblemResponse::new(StatusCode::NOT_FOUND, "not_found", "no such route")
}
