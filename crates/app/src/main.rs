mod poll;
mod problem;
mod reconcile;
mod refresh;
mod registry;
mod retention;
mod router;
mod shutdown;
mod telemetry;
mod user;
mod webhook;

#[cfg(test)]
mod test_support;

use std::{sync::Arc, time::Duration};

use eventsub_hub_storage::{Database, RetryPolicy};
use eventsub_hub_twitch::{AppTokenCache, EventSubClient, TwitchOAuthClient};
use eventsub_hub_util::{load_env_file, AppConfig};
use tracing::{error, info};

use crate::{
    reconcile::{ReconcileSettings, Reconciler},
    refresh::PollRefreshWorker,
    registry::SubscriptionRegistry,
    retention::RetentionWorker,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let retry = RetryPolicy::new(config.database.connect_attempts, config.database.retry_backoff);
    let database = Database::connect_with_retry(&config.database.url, &retry).await?;
    database.run_migrations().await?;
    info!(stage = "storage", "database ready");

    let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    let twitch = &config.twitch;
    let oauth = TwitchOAuthClient::new(
        twitch.client_id.clone(),
        twitch.client_secret.expose(),
        twitch.oauth_base_url.clone(),
        http.clone(),
    );
    let tokens = AppTokenCache::new(oauth.clone());
    let eventsub = EventSubClient::new(twitch.client_id.clone(), twitch.helix_base_url.clone(), http);
    let registry = Arc::new(SubscriptionRegistry::new(
        eventsub,
        tokens,
        twitch.callback_url.as_str(),
        twitch.webhook_secret.expose(),
    ));

    let (trigger, shutdown) = shutdown::channel();
    let workers = &config.workers;
    let state = router::AppState::new(
        metrics,
        database.clone(),
        Arc::from(twitch.webhook_secret.as_bytes()),
        oauth,
        workers.long_poll_timeout,
        shutdown.clone(),
    )
    .with_dev_user(workers.dev_user_id.clone());

    let refresh = PollRefreshWorker::new(state.poll().clone(), workers.poll_refresh_interval)
        .spawn(shutdown.clone());
    let retention = RetentionWorker::new(
        database.events(),
        workers.event_retention,
        workers.retention_sweep_interval,
    )
    .spawn(shutdown.clone());
    let reconciler = Reconciler::new(
        registry,
        database.users(),
        retry,
        ReconcileSettings::from(workers),
    );
    let mut reconcile = tokio::spawn(reconciler.run(shutdown.clone()));

    let addr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = config.environment.as_str(),
        callback = %twitch.callback_url,
        "starting HTTP server"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router::app_router(state))
                .with_graceful_shutdown(async move { shutdown.wait().await })
                .await
        })
    };

    let reconcile_result = tokio::select! {
        _ = shutdown::signal() => None,
        joined = &mut reconcile => Some(joined),
    };
    trigger.trigger();

    let reconcile_result = match reconcile_result {
        Some(joined) => joined,
        None => reconcile.await,
    };
    server.await??;
    for worker in [refresh, retention] {
        if let Err(err) = worker.await {
            error!(stage = "app", error = %err, "worker task failed");
        }
    }

    match reconcile_result {
        Ok(Ok(())) => {
            info!(stage = "app", "shutdown complete");
            Ok(())
        }
        Ok(Err(err)) => {
            error!(stage = "app", error = %err, "reconciler stopped on fatal error");
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}
