use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// Mirror of a subscription as reported by the remote EventSub API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    #[serde(default)]
    pub cost: i64,
    pub condition: Condition,
    pub transport: Transport,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            event_type: self.event_type.clone(),
            version: self.version.clone(),
            condition: self.condition.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A subscription one user should have, derived from their granted scopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DesiredSubscription {
    pub user_id: String,
    pub event_type: String,
    pub version: String,
    pub condition: Condition,
}

impl DesiredSubscription {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            event_type: self.event_type.clone(),
            version: self.version.clone(),
            condition: self.condition.clone(),
        }
    }

    /// Short `type.vN` label used in logs.
    pub fn label(&self) -> String {
        format!("{}.v{}", self.event_type, self.version)
    }
}

/// Identity of a subscription on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub event_type: String,
    pub version: String,
    pub condition: Condition,
}
