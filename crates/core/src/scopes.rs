use std::collections::BTreeSet;

use crate::{condition::Condition, subscription::DesiredSubscription};

/// Space separated scope list granted to a user token.
///
/// Matching is by whole scope name, so `channel:read:polls` does not satisfy a
/// rule keyed on `channel:read`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantedScopes(BTreeSet<String>);

impl GrantedScopes {
    pub fn parse(raw: &str) -> Self {
        Self(raw.split_whitespace().map(str::to_owned).collect())
    }

    /// The empty scope is always granted.
    pub fn contains(&self, scope: &str) -> bool {
        scope.is_empty() || self.0.contains(scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Which condition fields a rule fills with the user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionShape {
    Broadcaster,
    ToBroadcaster,
    FromBroadcaster,
    User,
    BroadcasterModerator,
}

impl ConditionShape {
    pub fn build(self, user_id: &str) -> Condition {
        match self {
            Self::Broadcaster => Condition::new().with("broadcaster_user_id", user_id),
            Self::ToBroadcaster => Condition::new().with("to_broadcaster_user_id", user_id),
            Self::FromBroadcaster => Condition::new().with("from_broadcaster_user_id", user_id),
            Self::User => Condition::new().with("user_id", user_id),
            Self::BroadcasterModerator => Condition::new()
                .with("broadcaster_user_id", user_id)
                .with("moderator_user_id", user_id),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventRule {
    pub event_type: &'static str,
    pub version: &'static str,
    pub shape: ConditionShape,
}

#[derive(Debug, Clone, Copy)]
pub struct ScopeRule {
    pub scope: &'static str,
    pub events: &'static [EventRule],
}

const fn rule(event_type: &'static str, version: &'static str, shape: ConditionShape) -> EventRule {
    EventRule {
        event_type,
        version,
        shape,
    }
}

use ConditionShape::{Broadcaster, BroadcasterModerator, FromBroadcaster, ToBroadcaster, User};

/// Scope to subscription mapping. The rule keyed on the empty scope applies to every user.
pub const SCOPE_TABLE: &[ScopeRule] = &[
    ScopeRule {
        scope: "",
        events: &[
            rule("channel.raid", "1", ToBroadcaster),
            rule("channel.raid", "1", FromBroadcaster),
            rule("channel.update", "2", Broadcaster),
        ],
    },
    ScopeRule {
        scope: "user:read:email",
        events: &[rule("user.update", "1", User)],
    },
    ScopeRule {
        scope: "moderator:read:followers",
        events: &[rule("channel.follow", "2", BroadcasterModerator)],
    },
    ScopeRule {
        scope: "channel:read:redemptions",
        events: &[
            rule("channel.channel_points_custom_reward_redemption.add", "1", Broadcaster),
            rule("channel.channel_points_custom_reward_redemption.update", "1", Broadcaster),
            rule("channel.channel_points_custom_reward.add", "1", Broadcaster),
            rule("channel.channel_points_custom_reward.update", "1", Broadcaster),
            rule("channel.channel_points_custom_reward.remove", "1", Broadcaster),
        ],
    },
    ScopeRule {
        scope: "bits:read",
        events: &[rule("channel.cheer", "1", Broadcaster)],
    },
    ScopeRule {
        scope: "channel:moderate",
        events: &[
            rule("channel.ban", "1", Broadcaster),
            rule("channel.unban", "1", Broadcaster),
        ],
    },
    ScopeRule {
        scope: "channel:read:predictions",
        events: &[
            rule("channel.prediction.begin", "1", Broadcaster),
            rule("channel.prediction.progress", "1", Broadcaster),
            rule("channel.prediction.lock", "1", Broadcaster),
            rule("channel.prediction.end", "1", Broadcaster),
        ],
    },
    ScopeRule {
        scope: "channel:read:polls",
        events: &[
            rule("channel.poll.begin", "1", Broadcaster),
            rule("channel.poll.progress", "1", Broadcaster),
            rule("channel.poll.end", "1", Broadcaster),
        ],
    },
    ScopeRule {
        scope: "channel:read:hype_train",
        events: &[
            rule("channel.hype_train.begin", "1", Broadcaster),
            rule("channel.hype_train.progress", "1", Broadcaster),
            rule("channel.hype_train.end", "1", Broadcaster),
        ],
    },
    ScopeRule {
        scope: "channel:read:charity",
        events: &[
            rule("channel.charity_campaign.donate", "1", Broadcaster),
            rule("channel.charity_campaign.start", "1", Broadcaster),
            rule("channel.charity_campaign.progress", "1", Broadcaster),
            rule("channel.charity_campaign.stop", "1", Broadcaster),
        ],
    },
    ScopeRule {
        scope: "channel:read:goals",
        events: &[
            rule("channel.goal.begin", "1", Broadcaster),
            rule("channel.goal.progress", "1", Broadcaster),
            rule("channel.goal.end", "1", Broadcaster),
        ],
    },
    ScopeRule {
        scope: "moderation:read",
        events: &[
            rule("channel.moderator.add", "1", Broadcaster),
            rule("channel.moderator.remove", "1", Broadcaster),
        ],
    },
    ScopeRule {
        scope: "moderator:read:shield_mode",
        events: &[
            rule("channel.shield_mode.begin", "1", BroadcasterModerator),
            rule("channel.shield_mode.end", "1", BroadcasterModerator),
        ],
    },
    ScopeRule {
        scope: "channel:read:ads",
        events: &[rule("channel.ad_break.begin", "1", Broadcaster)],
    },
    ScopeRule {
        scope: "moderator:read:shoutouts",
        events: &[
            rule("channel.shoutout.create", "1", BroadcasterModerator),
            rule("channel.shoutout.receive", "1", BroadcasterModerator),
        ],
    },
];

/// Expands [`SCOPE_TABLE`] for one user.
pub fn desired_subscriptions(user_id: &str, granted: &GrantedScopes) -> Vec<DesiredSubscription> {
    desired_subscriptions_from(SCOPE_TABLE, user_id, granted)
}

pub fn desired_subscriptions_from(
    table: &[ScopeRule],
    user_id: &str,
    granted: &GrantedScopes,
) -> Vec<DesiredSubscription> {
    table
        .iter()
        .filter(|rule| granted.contains(rule.scope))
        .flat_map(|rule| rule.events.iter())
        .map(|event| DesiredSubscription {
            user_id: user_id.to_owned(),
            event_type: event.event_type.to_owned(),
            version: event.version.to_owned(),
            condition: event.shape.build(user_id),
        })
        .collect()
}
