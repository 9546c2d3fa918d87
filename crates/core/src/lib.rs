//! Domain model for EventSub subscription reconciliation.
//!
//! Everything in this crate is pure: no I/O, no clocks. The app crate feeds it
//! remote subscription lists and stored users and acts on the returned plans.

pub mod condition;
pub mod plan;
pub mod scopes;
pub mod subscription;

pub use condition::{Condition, ConditionError, SUBJECT_KEYS};
pub use plan::missing_subscriptions;
pub use scopes::{desired_subscriptions, ConditionShape, EventRule, GrantedScopes, ScopeRule};
pub use subscription::{DesiredSubscription, Subscription, SubscriptionKey, Transport};
