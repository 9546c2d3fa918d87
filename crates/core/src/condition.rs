use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Keys that may carry the id of the user a subscription belongs to, in lookup order.
pub const SUBJECT_KEYS: [&str; 4] = [
    "broadcaster_user_id",
    "to_broadcaster_user_id",
    "from_broadcaster_user_id",
    "user_id",
];

/// Key/value filter attached to a subscription.
///
/// Fields live in an ordered map and empty values are dropped, so two conditions
/// are equal exactly when they filter on the same non-empty fields, regardless of
/// how the JSON that produced them was ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Condition(BTreeMap<String, String>);

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Condition::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            return;
        }
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the first non-empty id among [`SUBJECT_KEYS`].
    pub fn subject_id(&self) -> Option<&str> {
        SUBJECT_KEYS.iter().find_map(|key| self.get(key))
    }

    /// Decodes a JSON object into a condition.
    ///
    /// Strings are kept as-is, numbers and booleans use their JSON text, and nulls
    /// count as absent. Nested values are rejected.
    pub fn from_json(value: &Value) -> Result<Self, ConditionError> {
        let object = value.as_object().ok_or(ConditionError::NotAnObject)?;
        let mut condition = Self::new();
        for (key, field) in object {
            match field {
                Value::Null => {}
                Value::String(text) => condition.insert(key.as_str(), text.as_str()),
                Value::Number(number) => condition.insert(key.as_str(), number.to_string()),
                Value::Bool(flag) => condition.insert(key.as_str(), flag.to_string()),
                Value::Array(_) | Value::Object(_) => {
                    return Err(ConditionError::NestedValue(key.clone()))
                }
            }
        }
        Ok(condition)
    }
}

impl<K, V> FromIterator<(K, V)> for Condition
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut condition = Self::new();
        for (key, value) in iter {
            condition.insert(key, value);
        }
        condition
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("condition must be a JSON object")]
    NotAnObject,
    #[error("condition field '{0}' must be a scalar")]
    NestedValue(String),
}
