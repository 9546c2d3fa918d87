use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use eventsub_hub_core::{desired_subscriptions, missing_subscriptions, DesiredSubscription, GrantedScopes};
use eventsub_hub_storage::{RetryPolicy, StoredUser, Transient, UserError, UserRepository};
use eventsub_hub_twitch::CreateOutcome;
use eventsub_hub_util::WorkerConfig;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    registry::{RegistryError, SubscriptionRegistry},
    shutdown::Shutdown,
};

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub interval: Duration,
    pub max_concurrency: usize,
    /// How long a creation keeps its slot after the request returns.
    pub slot_hold: Duration,
    pub full_scan_every: u32,
    pub dev_user_id: Option<String>,
}

impl From<&WorkerConfig> for ReconcileSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            interval: config.reconcile_interval,
            max_concurrency: config.reconcile_max_concurrency.max(1),
            slot_hold: config.reconcile_slot_hold,
            full_scan_every: config.reconcile_full_scan_every.max(1),
            dev_user_id: config.dev_user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    Full,
    Incremental,
}

impl ScanKind {
    /// The first cycle and every `full_scan_every`-th one after it read all users.
    pub fn for_cycle(cycle: u64, full_scan_every: u32) -> Self {
        if cycle % u64::from(full_scan_every.max(1)) == 0 {
            Self::Full
        } else {
            Self::Incremental
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

/// Counts for one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub scan: ScanKind,
    pub users: usize,
    pub remote: usize,
    pub missing: usize,
    pub created: usize,
    pub already_existed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub revoked: Vec<String>,
}

impl CycleReport {
    fn new(scan: ScanKind) -> Self {
        Self {
            scan,
            users: 0,
            remote: 0,
            missing: 0,
            created: 0,
            already_existed: 0,
            failed: 0,
            skipped: 0,
            revoked: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to load users: {0}")]
    Users(#[from] UserError),
}

enum CreateResult {
    Created,
    AlreadyExists,
    Revoked(String),
    Failed,
}

/// Creates the subscriptions each user's granted scopes call for and that the
/// remote side does not have yet.
pub struct Reconciler {
    registry: Arc<SubscriptionRegistry>,
    users: UserRepository,
    retry: RetryPolicy,
    settings: ReconcileSettings,
    cycle: u64,
}

impl Reconciler {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        users: UserRepository,
        retry: RetryPolicy,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            registry,
            users,
            retry,
            settings,
            cycle: 0,
        }
    }

    /// Runs cycles until shutdown. Only a store that stays unreachable past the
    /// retry limit ends the loop with an error.
    pub async fn run(mut self, shutdown: Shutdown) -> Result<(), ReconcileError> {
        loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                outcome = self.run_cycle() => outcome,
            };

            match outcome {
                Ok(report) => info!(
                    stage = "reconcile",
                    scan = report.scan.as_str(),
                    users = report.users,
                    remote = report.remote,
                    missing = report.missing,
                    created = report.created,
                    already_existed = report.already_existed,
                    failed = report.failed,
                    revoked = report.revoked.len(),
                    "reconciliation cycle completed"
                ),
                Err(ReconcileError::Users(err)) if err.is_transient() => {
                    error!(stage = "reconcile", error = %err, "store unavailable, giving up");
                    return Err(ReconcileError::Users(err));
                }
                Err(err) => warn!(stage = "reconcile", error = %err, "reconciliation cycle failed"),
            }

            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        info!(stage = "reconcile", "reconciler stopped");
        Ok(())
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport, ReconcileError> {
        let scan = ScanKind::for_cycle(self.cycle, self.settings.full_scan_every);
        self.cycle += 1;
        let started = Instant::now();
        counter!("reconcile_cycles_total", "scan" => scan.as_str()).increment(1);

        let result = self.reconcile(scan).await;
        histogram!("reconcile_cycle_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn reconcile(&self, scan: ScanKind) -> Result<CycleReport, ReconcileError> {
        let mut report = CycleReport::new(scan);

        let remote = self.registry.list().await?;
        report.remote = remote.len();

        let users = self.load_users(scan).await?;
        report.users = users.len();

        let desired = users.iter().flat_map(|user| {
            desired_subscriptions(&user.user_id, &GrantedScopes::parse(&user.scopes))
        });
        let missing = missing_subscriptions(desired, &remote);
        report.missing = missing.len();
        debug!(
            stage = "reconcile",
            scan = scan.as_str(),
            users = report.users,
            missing = report.missing,
            "computed subscription diff"
        );

        self.create_missing(missing, &mut report).await;
        Ok(report)
    }

    async fn load_users(&self, scan: ScanKind) -> Result<Vec<StoredUser>, UserError> {
        let mut users = match scan {
            ScanKind::Full => self.retry.run("take_all_users", || self.users.take_all()).await?,
            ScanKind::Incremental => {
                self.retry
                    .run("take_updated_users", || self.users.take_updated())
                    .await?
            }
        };
        if let Some(dev_user_id) = &self.settings.dev_user_id {
            users.retain(|user| &user.user_id == dev_user_id);
        }
        Ok(users)
    }

    async fn create_missing(&self, missing: Vec<DesiredSubscription>, report: &mut CycleReport) {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency));
        let revoked: Arc<Mutex<HashSet<String>>> = Arc::default();
        let mut tasks = JoinSet::new();

        for desired in missing {
            if is_revoked(&revoked, &desired.user_id) {
                report.skipped += 1;
                continue;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            // The user may have been revoked while this task waited for a slot.
            if is_revoked(&revoked, &desired.user_id) {
                report.skipped += 1;
                continue;
            }

            let registry = self.registry.clone();
            let users = self.users.clone();
            let revoked = revoked.clone();
            let slot_hold = self.settings.slot_hold;
            tasks.spawn(async move {
                let result = create_one(&registry, &users, &revoked, &desired).await;
                tokio::time::sleep(slot_hold).await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(CreateResult::Created) => report.created += 1,
                Ok(CreateResult::AlreadyExists) => report.already_existed += 1,
                Ok(CreateResult::Revoked(user_id)) => report.revoked.push(user_id),
                Ok(CreateResult::Failed) => report.failed += 1,
                Err(err) => {
                    error!(stage = "reconcile", error = %err, "subscription task aborted");
                    report.failed += 1;
                }
            }
        }

        if report.skipped > 0 {
            counter!("subscription_create_total", "outcome" => "skipped").increment(report.skipped as u64);
        }
        report.revoked.sort();
    }
}

fn is_revoked(revoked: &Mutex<HashSet<String>>, user_id: &str) -> bool {
    revoked
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(user_id)
}

async fn create_one(
    registry: &SubscriptionRegistry,
    users: &UserRepository,
    revoked: &Mutex<HashSet<String>>,
    desired: &DesiredSubscription,
) -> CreateResult {
    match registry.create(desired).await {
        Ok(CreateOutcome::Created) => {
            counter!("subscription_create_total", "outcome" => "created").increment(1);
            info!(
                stage = "reconcile",
                user_id = %desired.user_id,
                subscription = %desired.label(),
                "subscription created"
            );
            CreateResult::Created
        }
        Ok(CreateOutcome::AlreadyExists) => {
            counter!("subscription_create_total", "outcome" => "already_exists").increment(1);
            debug!(
                stage = "reconcile",
                user_id = %desired.user_id,
                subscription = %desired.label(),
                "subscription already exists"
            );
            CreateResult::AlreadyExists
        }
        Err(RegistryError::AuthorizationRevoked { user_id }) => {
            counter!("subscription_create_total", "outcome" => "revoked").increment(1);
            let first = revoked
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(user_id.clone());
            if !first {
                return CreateResult::Failed;
            }
            match users.delete(&user_id).await {
                Ok(deleted) => warn!(
                    stage = "reconcile",
                    %user_id,
                    deleted,
                    "authorization revoked, user removed"
                ),
                Err(err) => error!(
                    stage = "reconcile",
                    %user_id,
                    error = %err,
                    "authorization revoked but user could not be removed"
                ),
            }
            CreateResult::Revoked(user_id)
        }
        Err(err) => {
            counter!("subscription_create_total", "outcome" => "failed").increment(1);
            warn!(
                stage = "reconcile",
                user_id = %desired.user_id,
                subscription = %desired.label(),
                error = %err,
                "subscription create failed"
            );
            if let Err(err) = users.mark_updated(&desired.user_id).await {
                error!(
                    stage = "reconcile",
                    user_id = %desired.user_id,
                    error = %err,
                    "failed to flag user for retry"
                );
            }
            CreateResult::Failed
        }
    }
}
