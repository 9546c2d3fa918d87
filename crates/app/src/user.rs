use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use metrics::counter;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::{problem::ProblemResponse, router::AppState};

/// Carries the recipient id of a long-poll.
const HEADER_USER_ID: &str = "Sogebot-Event-Userid";

/// `POST /user`: validates the caller's user token and records the user with
/// the scopes it grants.
pub async fn register(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ProblemResponse> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(strip_scheme)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            ProblemResponse::unauthorized("missing_authorization", "missing Authorization header")
        })?;

    let validated = state.oauth().validate_token(token).await.map_err(|err| {
        if err.is_unauthorized() {
            warn!(stage = "user", error = %err, "token rejected by identity provider");
            ProblemResponse::unauthorized("invalid_token", "token rejected by identity provider")
        } else {
            error!(stage = "user", error = %err, "token validation failed");
            ProblemResponse::internal("identity_provider_error", "failed to validate token")
        }
    })?;

    let user_id = validated
        .user_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProblemResponse::unauthorized("invalid_token", "token is not bound to a user"))?;
    let scopes = validated.scopes.join(" ");

    let outcome = state
        .storage()
        .users()
        .upsert(&user_id, &scopes, state.now())
        .await
        .map_err(|err| {
            error!(stage = "user", %user_id, error = %err, "failed to store user");
            ProblemResponse::internal("storage_error", "failed to store user")
        })?;

    info!(
        stage = "user",
        %user_id,
        login = validated.login.as_deref().unwrap_or_default(),
        outcome = outcome.as_str(),
        %scopes,
        "user registered"
    );
    Ok(([(header::CONTENT_TYPE, "text/plain")], "Success").into_response())
}

fn strip_scheme(value: &str) -> &str {
    let value = value.trim();
    for scheme in ["Bearer ", "OAuth "] {
        if let Some(prefix) = value.get(..scheme.len()) {
            if prefix.eq_ignore_ascii_case(scheme) {
                return value[scheme.len()..].trim();
            }
        }
    }
    value
}

/// `GET /user`: long-poll for the oldest stored event of the recipient.
///
/// Answers 200 with the raw notification once one is available, 204 once the
/// configured wait elapses, and 410 if the server starts shutting down first.
/// A client that disconnects drops this future, which releases its cache entry.
pub async fn poll(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match state.dev_user_id() {
        Some(dev_user_id) => Some(dev_user_id.to_owned()),
        None => headers
            .get(HEADER_USER_ID)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned),
    };
    let Some(user_id) = user_id else {
        counter!("long_poll_requests_total", "result" => "bad_request").increment(1);
        return no_cache(
            ProblemResponse::bad_request("missing_header", format!("missing header {HEADER_USER_ID}"))
                .into_response(),
        );
    };

    let (result, response) = wait_for_event(&state, &user_id).await;
    counter!("long_poll_requests_total", "result" => result).increment(1);
    debug!(stage = "poll", %user_id, result, "long-poll finished");
    no_cache(response)
}

async fn wait_for_event(state: &AppState, user_id: &str) -> (&'static str, Response) {
    let cache = state.poll();
    let registration = cache.listen(user_id);
    let deadline = Instant::now() + state.long_poll_timeout();
    let shutdown = state.shutdown();

    loop {
        if let Err(err) = cache.refresh_user(user_id).await {
            warn!(stage = "poll", %user_id, error = %err, "failed to read pending events");
        }

        if let Some(event) = cache.take(&registration) {
            match state.storage().events().delete(&event).await {
                Ok(true) => {
                    let response = (
                        StatusCode::OK,
                        [(header::CONTENT_TYPE, "application/json")],
                        event.payload,
                    )
                        .into_response();
                    return ("delivered", response);
                }
                // Another poll for the same user delivered it first.
                Ok(false) => continue,
                Err(err) => {
                    error!(stage = "poll", %user_id, error = %err, "failed to delete delivered event");
                    let problem =
                        ProblemResponse::internal("storage_error", "failed to dequeue event");
                    return ("error", problem.into_response());
                }
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.wait() => {
                let problem = ProblemResponse::new(
                    StatusCode::GONE,
                    "shutting_down",
                    "server is shutting down",
                );
                return ("gone", problem.into_response());
            }
            _ = registration.notified() => {}
            _ = sleep_until(deadline) => {
                return ("timeout", StatusCode::NO_CONTENT.into_response());
            }
        }
    }
}

fn no_cache(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        router::app_router,
        test_support::{test_app, test_app_with, TestApp},
    };
    use axum::{body::Body, http::Request};
    use chrono::Utc;
    use eventsub_hub_storage::NewEvent;
    use eventsub_hub_twitch::TwitchOAuthClient;
    use http_body_util::BodyExt;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;
    use url::Url;

    async fn send(app: &TestApp, request: Request<Body>) -> Response {
        app_router(app.state.clone())
            .oneshot(request)
            .await
            .expect("handler should respond")
    }

    fn poll_request(user_id: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri("/user");
        if let Some(user_id) = user_id {
            builder = builder.header(HEADER_USER_ID, user_id);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn register_request(authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/user");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf-8")
    }

    async fn append(app: &TestApp, user_id: &str, message_id: &str, payload: &str) {
        app.db
            .events()
            .append(NewEvent {
                user_id,
                event_type: "channel.cheer",
                message_id,
                payload,
                received_at: Utc::now(),
            })
            .await
            .expect("append");
    }

    fn oauth_for(server: &MockServer) -> TwitchOAuthClient {
        TwitchOAuthClient::new(
            "client",
            "secret",
            Url::parse(&server.url("/oauth2/")).expect("url"),
            reqwest::Client::new(),
        )
    }

    #[test]
    fn strips_known_schemes() {
        assert_eq!(strip_scheme("Bearer abc"), "abc");
        assert_eq!(strip_scheme("oauth abc"), "abc");
        assert_eq!(strip_scheme("  abc "), "abc");
        assert_eq!(strip_scheme("Bearer"), "Bearer");
    }

    #[tokio::test]
    async fn poll_without_user_header_is_bad_request() {
        let app = test_app().await;
        let response = send(&app, poll_request(None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );
    }

    #[tokio::test]
    async fn poll_times_out_with_no_content() {
        let app = test_app_with(|state| state, Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let response = send(&app, poll_request(Some("42"))).await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(app.state.poll().is_empty(), "entry released after timeout");
    }

    #[tokio::test]
    async fn poll_delivers_oldest_event_and_deletes_it() {
        let app = test_app().await;
        append(&app, "42", "m-1", r#"{"n":1}"#).await;
        append(&app, "42", "m-2", r#"{"n":2}"#).await;

        let response = send(&app, poll_request(Some("42"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(body_text(response).await, r#"{"n":1}"#);
        assert_eq!(app.db.events().count_for_user("42").await.unwrap(), 1);

        let response = send(&app, poll_request(Some("42"))).await;
        assert_eq!(body_text(response).await, r#"{"n":2}"#);
        assert_eq!(app.db.events().count_for_user("42").await.unwrap(), 0);
        assert!(app.state.poll().is_empty());
    }

    #[tokio::test]
    async fn poll_wakes_when_event_arrives() {
        let app = test_app_with(|state| state, Duration::from_secs(5)).await;
        let state = app.state.clone();
        let waiting = tokio::spawn(async move {
            app_router(state)
                .oneshot(poll_request(Some("7")))
                .await
                .expect("response")
        });

        while app.state.poll().get("7").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        append(&app, "7", "m-1", r#"{"late":true}"#).await;
        app.state.poll().refresh_user("7").await.expect("refresh");

        let response = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("woken before timeout")
            .expect("join");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, r#"{"late":true}"#);
    }

    #[tokio::test]
    async fn poll_returns_gone_on_shutdown() {
        let app = test_app_with(|state| state, Duration::from_secs(30)).await;
        let state = app.state.clone();
        let waiting = tokio::spawn(async move {
            app_router(state)
                .oneshot(poll_request(Some("9")))
                .await
                .expect("response")
        });

        while app.state.poll().get("9").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        app.trigger.trigger();

        let response = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("answered on shutdown")
            .expect("join");
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn dev_user_overrides_header() {
        let app = test_app_with(
            |state| state.with_dev_user(Some("96965261".to_string())),
            Duration::from_secs(1),
        )
        .await;
        append(&app, "96965261", "m-1", "{}").await;

        let response = send(&app, poll_request(None)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_requires_authorization() {
        let app = test_app().await;
        let response = send(&app, register_request(None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_upserts_user_with_scopes() {
        let server = MockServer::start_async().await;
        let validate = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/oauth2/validate")
                    .header("Authorization", "OAuth user-token");
                then.status(200).json_body(json!({
                    "client_id": "client",
                    "login": "streamer",
                    "scopes": ["bits:read", "channel:read:polls"],
                    "user_id": "42",
                    "expires_in": 3600
                }));
            })
            .await;

        let oauth = oauth_for(&server);
        let app = test_app_with(move |state| state.with_oauth(oauth), Duration::from_secs(1)).await;

        let response = send(&app, register_request(Some("Bearer user-token"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Success");
        validate.assert_async().await;

        let stored = app.db.users().fetch("42").await.unwrap().expect("user stored");
        assert_eq!(stored.scopes, "bits:read channel:read:polls");
        assert!(stored.updated);
    }

    #[tokio::test]
    async fn register_maps_provider_failures() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/oauth2/validate")
                    .header("Authorization", "OAuth expired");
                then.status(401)
                    .json_body(json!({"status": 401, "message": "invalid access token"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/oauth2/validate")
                    .header("Authorization", "OAuth broken");
                then.status(503).body("unavailable");
            })
            .await;

        let oauth = oauth_for(&server);
        let app = test_app_with(move |state| state.with_oauth(oauth), Duration::from_secs(1)).await;

        let response = send(&app, register_request(Some("expired"))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = send(&app, register_request(Some("OAuth broken"))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
