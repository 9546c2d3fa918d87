use eventsub_hub_core::{Condition, Subscription};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Client for the Helix `eventsub/subscriptions` resource.
#[derive(Clone)]
pub struct EventSubClient {
    http: Client,
    base_url: Url,
    client_id: String,
}

impl EventSubClient {
    pub fn new(client_id: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            client_id: client_id.into(),
        }
    }

    /// Fetches one page of the app's subscriptions, starting after `after`.
    pub async fn list_subscriptions(
        &self,
        access_token: &str,
        after: Option<&str>,
    ) -> Result<SubscriptionPage, EventSubError> {
        let mut url = self.base_url.join("eventsub/subscriptions")?;
        if let Some(after) = after {
            url.query_pairs_mut().append_pair("after", after);
        }

        let response = self
            .authorized_request(Method::GET, url, access_token)
            .send()
            .await?;

        parse_json::<SubscriptionListResponse>(response)
            .await
            .map(SubscriptionPage::from)
    }

    /// Submits a new subscription. A conflict means the provider already has it.
    pub async fn create_subscription(
        &self,
        access_token: &str,
        request: &CreateSubscriptionRequest<'_>,
    ) -> Result<CreateOutcome, EventSubError> {
        let url = self.base_url.join("eventsub/subscriptions")?;
        let response = self
            .authorized_request(Method::POST, url, access_token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Ok(CreateOutcome::AlreadyExists);
        }
        if !status.is_success() {
            return Err(status_error(response).await);
        }
        Ok(CreateOutcome::Created)
    }

    fn authorized_request(
        &self,
        method: Method,
        url: Url,
        access_token: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Client-Id", &self.client_id)
            .header("Authorization", format!("Bearer {access_token}"))
    }
}

/// Body of a subscription create call.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSubscriptionRequest<'a> {
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub version: &'a str,
    pub condition: &'a Condition,
    pub transport: TransportRequest<'a>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportRequest<'a> {
    pub method: &'a str,
    pub callback: &'a str,
    pub secret: &'a str,
}

impl<'a> TransportRequest<'a> {
    pub fn webhook(callback: &'a str, secret: &'a str) -> Self {
        Self {
            method: "webhook",
            callback,
            secret,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Page of subscription results.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionPage {
    pub data: Vec<Subscription>,
    pub cursor: Option<String>,
}

impl From<SubscriptionListResponse> for SubscriptionPage {
    fn from(value: SubscriptionListResponse) -> Self {
        Self {
            data: value.data,
            cursor: value
                .pagination
                .and_then(|p| p.cursor)
                .filter(|cursor| !cursor.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionListResponse {
    data: Vec<Subscription>,
    pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
struct Pagination {
    cursor: Option<String>,
}

/// Errors produced by the EventSub client.
#[derive(Debug, Error)]
pub enum EventSubError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl EventSubError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

async fn status_error(response: Response) -> EventSubError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<unavailable>"));
    EventSubError::Status { status, body }
}

async fn parse_json<T>(response: Response) -> Result<T, EventSubError>
where
    T: DeserializeOwned,
{
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }

    Ok(response.json().await?)
}
