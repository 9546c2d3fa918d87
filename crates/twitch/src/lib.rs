pub mod eventsub;
pub mod oauth;
pub mod token;

pub use eventsub::{
    CreateOutcome, CreateSubscriptionRequest, EventSubClient, EventSubError, SubscriptionPage,
    TransportRequest,
};
pub use oauth::{OAuthError, TokenResponse, TwitchOAuthClient, ValidateTokenResponse};
pub use token::{AccessToken, AppTokenCache, TokenCacheError};
