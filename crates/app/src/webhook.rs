use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use eventsub_hub_core::Condition;
use eventsub_hub_storage::{AppendOutcome, NewEvent};
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use crate::problem::ProblemResponse;
use crate::router::AppState;

const HEADER_MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
const HEADER_TIMESTAMP: &str = "Twitch-Eventsub-Message-Timestamp";
const HEADER_SIGNATURE: &str = "Twitch-Eventsub-Message-Signature";
const HEADER_MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";

/// Messages further than this from the server clock are treated as replays.
const MAX_CLOCK_SKEW_SECS: i64 = 600;

/// `POST /callback`: EventSub webhook ingress.
pub async fn handle(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let start = Instant::now();
    let message_type = get_required_header(&headers, HEADER_MESSAGE_TYPE)
        .and_then(|value| {
            MessageType::try_from(value).map_err(|detail| {
                ProblemResponse::bad_request("invalid_message_type", detail)
            })
        });

    let (label, response) = match message_type {
        Ok(message_type) => (
            message_type.metric_label(),
            process(&state, message_type, &headers, &body)
                .await
                .unwrap_or_else(IntoResponse::into_response),
        ),
        Err(problem) => ("unknown", problem.into_response()),
    };

    histogram!("webhook_ack_latency_seconds", "type" => label)
        .record(start.elapsed().as_secs_f64());
    response
}

async fn process(
    state: &AppState,
    message_type: MessageType,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ProblemResponse> {
    let label = message_type.metric_label();
    let message_id = get_required_header(headers, HEADER_MESSAGE_ID)?;
    let timestamp_raw = get_required_header(headers, HEADER_TIMESTAMP)?;
    let signature = get_required_header(headers, HEADER_SIGNATURE)?;

    let timestamp = parse_timestamp(timestamp_raw)
        .map_err(|err| ProblemResponse::bad_request("invalid_timestamp", err))?;

    let now = state.now();
    let skew = now.signed_duration_since(timestamp).num_seconds().abs();
    if skew > MAX_CLOCK_SKEW_SECS {
        warn!(
            stage = "ingress",
            %message_id,
            %timestamp_raw,
            now = %now.to_rfc3339(),
            skew_seconds = skew,
            "timestamp outside ±10 minute window"
        );
        return Err(ProblemResponse::bad_request(
            "timestamp_out_of_range",
            "timestamp outside the allowed ±10 minute window",
        ));
    }

    verify_signature(state.webhook_secret(), message_id, timestamp_raw, body, signature).map_err(
        |err| {
            counter!("eventsub_invalid_signature_total", "type" => label).increment(1);
            warn!(stage = "ingress", %message_id, error = %err, "signature rejected");
            ProblemResponse::bad_request("invalid_signature", err)
        },
    )?;

    let payload = std::str::from_utf8(body).map_err(|_| {
        ProblemResponse::bad_request("invalid_payload", "request body must be valid UTF-8")
    })?;
    let json: Value = serde_json::from_str(payload).map_err(|err| {
        ProblemResponse::bad_request("invalid_json", format!("failed to parse payload: {err}"))
    })?;

    counter!("eventsub_ingress_total", "type" => label).increment(1);

    match message_type {
        MessageType::Verification => verification(&json, message_id),
        MessageType::Notification => {
            notification(state, &json, payload, message_id).await
        }
        MessageType::Revocation => revocation(state, &json, message_id).await,
    }
}

fn verification(json: &Value, message_id: &str) -> Result<Response, ProblemResponse> {
    let challenge = json
        .get("challenge")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ProblemResponse::bad_request(
                "missing_challenge",
                "verification payload must include challenge",
            )
        })?;

    info!(
        stage = "ingress",
        %message_id,
        event_type = subscription_type(json).unwrap_or("unknown"),
        "webhook callback verified"
    );
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        challenge.to_owned(),
    )
        .into_response())
}

async fn notification(
    state: &AppState,
    json: &Value,
    payload: &str,
    message_id: &str,
) -> Result<Response, ProblemResponse> {
    let event_type = subscription_type(json).ok_or_else(|| {
        ProblemResponse::bad_request("missing_event_type", "subscription.type is required")
    })?;
    let user_id = subject_id(json)?;

    let outcome = state
        .storage()
        .events()
        .append(NewEvent {
            user_id: &user_id,
            event_type,
            message_id,
            payload,
            received_at: state.now(),
        })
        .await
        .map_err(|err| {
            error!(stage = "ingress", %message_id, error = %err, "failed to store notification");
            ProblemResponse::internal("storage_error", "failed to persist webhook payload")
        })?;

    match outcome {
        AppendOutcome::Inserted => {
            debug!(stage = "ingress", %message_id, %user_id, event_type, "notification stored");
            if let Err(err) = state.poll().refresh_user(&user_id).await {
                warn!(stage = "poll", %user_id, error = %err, "failed to wake long-poll");
            }
        }
        AppendOutcome::Duplicate => {
            info!(stage = "ingress", %message_id, %user_id, "duplicate webhook message skipped");
        }
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn revocation(
    state: &AppState,
    json: &Value,
    message_id: &str,
) -> Result<Response, ProblemResponse> {
    let user_id = subject_id(json)?;
    let status = json
        .get("subscription")
        .and_then(|subscription| subscription.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    let deleted = state.storage().users().delete(&user_id).await.map_err(|err| {
        error!(stage = "ingress", %message_id, %user_id, error = %err, "failed to remove revoked user");
        ProblemResponse::internal("storage_error", "failed to remove revoked user")
    })?;

    warn!(
        stage = "ingress",
        %message_id,
        %user_id,
        status,
        deleted,
        event_type = subscription_type(json).unwrap_or("unknown"),
        "subscription revoked"
    );
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn subscription_type(json: &Value) -> Option<&str> {
    json.get("subscription")
        .and_then(|subscription| subscription.get("type"))
        .and_then(Value::as_str)
}

/// Resolves the user a message belongs to from `subscription.condition`.
fn subject_id(json: &Value) -> Result<String, ProblemResponse> {
    let condition = json
        .get("subscription")
        .ok_or_else(|| {
            ProblemResponse::bad_request("missing_subscription", "payload missing subscription block")
        })?
        .get("condition")
        .ok_or_else(|| {
            ProblemResponse::bad_request("missing_subject", "subscription.condition is required")
        })?;

    let condition = Condition::from_json(condition).map_err(|err| {
        ProblemResponse::bad_request("missing_subject", format!("invalid condition: {err}"))
    })?;
    condition.subject_id().map(str::to_owned).ok_or_else(|| {
        ProblemResponse::bad_request(
            "missing_subject",
            "condition carries no broadcaster or user id",
        )
    })
}

fn get_required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ProblemResponse> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ProblemResponse::bad_request("missing_header", format!("missing header {name}")))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC3339 timestamp: {err}"))
}

/// Checks `sha256=<hex>` against HMAC-SHA256(secret, id || timestamp || body).
fn verify_signature(
    secret: &[u8],
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    provided: &str,
) -> Result<(), String> {
    let hex_part = provided
        .strip_prefix("sha256=")
        .ok_or_else(|| "signature must start with 'sha256='".to_string())?;
    let provided_bytes =
        hex::decode(hex_part).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.as_slice().ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageType {
    Verification,
    Notification,
    Revocation,
}

impl TryFrom<&str> for MessageType {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "webhook_callback_verification" => Ok(Self::Verification),
            "notification" => Ok(Self::Notification),
            "revocation" => Ok(Self::Revocation),
            _ => Err(format!("unsupported message type: {value}")),
        }
    }
}

impl MessageType {
    fn metric_label(self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::Notification => "notification",
            Self::Revocation => "revocation",
        }
    }
}
