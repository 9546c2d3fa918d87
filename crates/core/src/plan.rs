use std::collections::HashSet;

use crate::subscription::{DesiredSubscription, Subscription, SubscriptionKey};

/// Returns the desired subscriptions that have no remote counterpart.
///
/// A remote subscription counts as present whatever its status. Duplicate
/// desired entries collapse to the first occurrence.
pub fn missing_subscriptions<I>(desired: I, existing: &[Subscription]) -> Vec<DesiredSubscription>
where
    I: IntoIterator<Item = DesiredSubscription>,
{
    let mut seen: HashSet<SubscriptionKey> = existing.iter().map(Subscription::key).collect();
    desired
        .into_iter()
        .filter(|candidate| seen.insert(candidate.key()))
        .collect()
}
