//! Wires C1-C9 into one running process: config in, a shared `AppState`
//! out, plus the background tasks `main.rs` spawns once the singleton
//! locks are resolved. Mirrors the teacher's `AppState::new` assembly in
//! `controller/mod.rs`, generalized from one `BatteryController` to the
//! nine components this system actually has.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::coordinator::SyncCoordinator;
use crate::curtailment::CurtailmentController;
use crate::demand::DemandController;
use crate::device::{DeviceController, DeviceFactory, TokenRefreshCallback};
use crate::domain::{ChannelType, ForecastType, UserPolicy};
use crate::executor::SyncExecutor;
use crate::price_source::pull::AmberPullClient;
use crate::price_source::push::AmberPushClient;
use crate::price_source::wholesale::AemoClient;
use crate::price_source::PriceSource;
use crate::repo::policy::PolicyRepository;
use crate::repo::Repositories;
use crate::scheduler::{Scheduler, SchedulerJob};
use crate::singleton_lock::{self, SingletonLock};
use crate::spike::SpikeController;

/// Everything the administrative surface and the background jobs need,
/// built once at startup and handed out by `Arc` clone (cheap, the way
/// `AppState` does in the teacher).
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub repo: Arc<Repositories>,
    pub device: Arc<dyn DeviceController>,
    pub executor: Arc<SyncExecutor>,
    pub curtailment: Arc<CurtailmentController>,
    pub spike: Arc<SpikeController>,
    pub demand: Arc<DemandController>,
    pub pull: Arc<AmberPullClient>,
    pub push: Option<Arc<AmberPushClient>>,
    pub coordinator: Arc<SyncCoordinator>,
}

/// The running process: `AppState` plus the handles `main.rs` needs to
/// spawn tasks and to keep the singleton lock guards alive for the
/// process lifetime (dropping a guard releases the lock).
pub struct Application {
    pub state: AppState,
    pub scheduler: Option<Arc<Scheduler>>,
    _scheduler_lock: Option<SingletonLock>,
    _websocket_lock: Option<SingletonLock>,
    push_sync_rx: Option<mpsc::Receiver<()>>,
}

impl Application {
    /// Single-site bootstrap: one `UserPolicy` row drives one device and
    /// one Amber site, matching the source deployment's "registration
    /// disabled after first user" shape (§REDESIGN, multi-tenancy is a
    /// data-model affordance, not a validated deployment mode).
    pub async fn bootstrap(cfg: AppConfig) -> Result<Self> {
        singleton_lock::startup_stagger(&cfg.lock).await;

        let repo = Arc::new(Repositories::new(&cfg).await.context("building repository layer")?);

        let on_token_refresh: TokenRefreshCallback = Arc::new(|_access: String, _refresh: String, _expires_in: u64| {
            info!("device credentials refreshed");
        });
        let device: Arc<dyn DeviceController> = DeviceFactory::create(&cfg.device, on_token_refresh);
        let site_id = cfg.amber.site_id.clone();

        ensure_bootstrap_policy(repo.as_ref(), &site_id).await?;

        let pull = Arc::new(
            AmberPullClient::new(&cfg.amber, site_id.clone(), ForecastType::Predicted).context("building REST price client")?,
        );
        let aemo = Arc::new(AemoClient::new().context("building AEMO wholesale client")?);

        let executor = Arc::new(SyncExecutor::new(device.clone()));
        let curtailment = Arc::new(CurtailmentController::new(device.clone()));
        let spike = Arc::new(SpikeController::new(
            device.clone(),
            aemo,
            repo.policies.clone(),
            std::time::Duration::from_secs(cfg.spike.enter_wait_secs),
            std::time::Duration::from_secs(cfg.spike.exit_wait_secs),
        ));
        let demand = Arc::new(DemandController::new(device.clone()));
        let coordinator = Arc::new(SyncCoordinator::new());

        let scheduler_lock = singleton_lock::try_acquire_scheduler_lock(&cfg.lock);
        let websocket_lock = singleton_lock::try_acquire_websocket_lock(&cfg.lock);

        let (push, push_sync_rx) = if websocket_lock.is_some() {
            let (tx, rx) = mpsc::channel(1);
            let client = Arc::new(AmberPushClient::new(&cfg.amber, site_id, ForecastType::Predicted, tx));
            (Some(client), Some(rx))
        } else {
            info!("websocket lock not acquired, this worker will rely on the REST fallback only");
            (None, None)
        };

        let state = AppState {
            cfg: Arc::new(cfg.clone()),
            repo,
            device,
            executor,
            curtailment,
            spike,
            demand,
            pull,
            push,
            coordinator,
        };

        let scheduler = if scheduler_lock.is_some() {
            Some(Arc::new(build_scheduler(&cfg, &state)))
        } else {
            info!("scheduler lock not acquired, this worker will not run periodic jobs");
            None
        };

        Ok(Self {
            state,
            scheduler,
            _scheduler_lock: scheduler_lock,
            _websocket_lock: websocket_lock,
            push_sync_rx,
        })
    }

    /// Starts the scheduler (if this worker won its lock) and the push
    /// client's reconnect loop plus its sync-notification listener (if
    /// this worker won the websocket lock). Call once after `bootstrap`.
    pub fn spawn_background_tasks(&mut self) {
        if let Some(scheduler) = self.scheduler.clone() {
            scheduler.start();
        }

        if let Some(push) = self.state.push.clone() {
            tokio::spawn(push.clone().run_forever());
            if let Some(rx) = self.push_sync_rx.take() {
                tokio::spawn(run_push_sync_listener(self.state.clone(), rx));
            }
        }
    }
}

/// Seeds a single well-known policy row (`Uuid::nil()`) on first boot so the
/// scheduler and the administrative surface have a user to act on, matching
/// the single-tenant shape of the source deployment.
async fn ensure_bootstrap_policy(repo: &Repositories, site_id: &str) -> Result<()> {
    if !repo.policies.all().await?.is_empty() {
        return Ok(());
    }
    let policy = UserPolicy {
        user_id: Uuid::nil(),
        site_id: site_id.to_string(),
        forecast_type: ForecastType::Predicted,
        sync_enabled: true,
        last_tariff_hash: None,
        last_update_time: None,
        last_update_status: None,
        solar_curtailment_enabled: false,
        curtailment_threshold_cents: 1.0,
        current_export_rule: None,
        current_export_rule_updated_at: None,
        spike_enabled: false,
        spike_region: "NSW1".to_string(),
        spike_threshold_per_mwh: 300.0,
        spike_sell_multiplier: 3.0,
        spike_test_mode: false,
        in_spike_mode: false,
        spike_start_time: None,
        saved_tariff_id: None,
        pre_spike_operation_mode: None,
        aemo_last_check: None,
        aemo_last_price: None,
        demand_window: None,
        grid_charging_disabled_for_demand: false,
    };
    info!(site_id, "seeding bootstrap user policy");
    repo.policies.save(&policy).await
}

fn build_scheduler(cfg: &AppConfig, state: &AppState) -> Scheduler {
    let jobs: Vec<(Arc<dyn SchedulerJob>, u64)> = vec![
        (Arc::new(SyncFallbackJob { state: state.clone() }), cfg.scheduler.sync_interval_secs),
        (Arc::new(CurtailmentFallbackJob { state: state.clone() }), cfg.scheduler.curtailment_interval_secs),
        (Arc::new(PriceHistoryJob { state: state.clone() }), cfg.scheduler.sync_interval_secs),
        (Arc::new(EnergyUsageJob { state: state.clone() }), 60),
        (Arc::new(SpikeMonitorJob { state: state.clone() }), cfg.scheduler.spike_check_interval_secs),
        (Arc::new(DemandGridChargingJob { state: state.clone() }), cfg.scheduler.demand_check_interval_secs),
    ];
    Scheduler::new(jobs)
}

/// Listens for C1's sync-notification channel and runs C5/C6 immediately
/// for every eligible user, the event-driven half of C4's dispatch.
async fn run_push_sync_listener(state: AppState, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        if !state.coordinator.claim_period().await {
            continue;
        }
        let Some(push) = state.push.clone() else { continue };
        let current = match push.current_prices(chrono::Duration::seconds(120)).await {
            Ok(samples) => samples,
            Err(e) => {
                warn!(error = %e, "push update arrived but cache already stale, falling back to empty current sample");
                Vec::new()
            }
        };
        sync_all_users(&state, &current).await;
        curtail_all_users(&state, &current).await;
    }
}

async fn sync_all_users(state: &AppState, current_samples: &[crate::domain::PriceInterval]) {
    let forecast = match state.pull.forecast().await {
        Ok(f) => f,
        Err(e) => {
            error!(error = %e, "sync skipped: could not fetch forecast");
            return;
        }
    };
    let policies = match state.repo.policies.all().await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "sync skipped: could not load user policies");
            return;
        }
    };
    for mut policy in policies {
        let now = Utc::now();
        match state.executor.sync_user(&mut policy, &forecast, current_samples, now).await {
            Ok(outcome) => info!(user_id = %policy.user_id, ?outcome, "sync tick complete"),
            Err(e) => error!(user_id = %policy.user_id, error = %e, "sync tick failed"),
        }
        if let Err(e) = state.repo.policies.save(&policy).await {
            error!(user_id = %policy.user_id, error = %e, "failed to persist policy after sync");
        }
    }
}

async fn curtail_all_users(state: &AppState, current_samples: &[crate::domain::PriceInterval]) {
    let Some(feed_in) = current_samples.iter().find(|i| i.channel_type == ChannelType::FeedIn) else { return };
    let policies = match state.repo.policies.all().await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "curtailment skipped: could not load user policies");
            return;
        }
    };
    for mut policy in policies {
        match state.curtailment.check_user(&mut policy, feed_in.per_kwh, Utc::now()).await {
            Ok(outcome) => info!(user_id = %policy.user_id, ?outcome, "curtailment tick complete"),
            Err(e) => error!(user_id = %policy.user_id, error = %e, "curtailment tick failed"),
        }
        if let Err(e) = state.repo.policies.save(&policy).await {
            error!(user_id = %policy.user_id, error = %e, "failed to persist policy after curtailment check");
        }
    }
}

/// `sync_tou`: the cron-fallback half of C4/C5. Self-suppresses if a push
/// update already claimed this 5-minute period.
struct SyncFallbackJob {
    state: AppState,
}

#[async_trait]
impl SchedulerJob for SyncFallbackJob {
    fn name(&self) -> &str {
        "sync_tou"
    }

    async fn run(&self) -> Result<()> {
        if !self.state.coordinator.claim_period().await {
            info!("period already claimed by the push path, skipping fallback sync");
            return Ok(());
        }
        let current = self.state.pull.current_prices(chrono::Duration::seconds(120)).await.unwrap_or_default();
        sync_all_users(&self.state, &current).await;
        Ok(())
    }
}

/// `solar_curtailment`: runs independently of the period claim, matching
/// §4.6/§4.9 ("C6 ... independent of C5's ordering").
struct CurtailmentFallbackJob {
    state: AppState,
}

#[async_trait]
impl SchedulerJob for CurtailmentFallbackJob {
    fn name(&self) -> &str {
        "solar_curtailment"
    }

    async fn run(&self) -> Result<()> {
        let current = self.state.pull.current_prices(chrono::Duration::seconds(120)).await.unwrap_or_default();
        curtail_all_users(&self.state, &current).await;
        Ok(())
    }
}

struct PriceHistoryJob {
    state: AppState,
}

#[async_trait]
impl SchedulerJob for PriceHistoryJob {
    fn name(&self) -> &str {
        "save_price_history"
    }

    async fn run(&self) -> Result<()> {
        let samples = self.state.pull.current_prices(chrono::Duration::seconds(300)).await.unwrap_or_default();
        if samples.is_empty() {
            return Ok(());
        }
        let policies = self.state.repo.policies.all().await?;
        for policy in policies {
            self.state.repo.history.save_price_samples(&policy.site_id, &samples).await?;
        }
        Ok(())
    }
}

struct EnergyUsageJob {
    state: AppState,
}

#[async_trait]
impl SchedulerJob for EnergyUsageJob {
    fn name(&self) -> &str {
        "save_energy_usage"
    }

    async fn run(&self) -> Result<()> {
        let policies = self.state.repo.policies.all().await?;
        for policy in policies {
            let status = match self.state.device.site_status(&policy.site_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(site_id = %policy.site_id, error = %e, "could not read site status for history");
                    continue;
                }
            };
            let sample = crate::repo::history::EnergyUsageSample {
                site_id: policy.site_id.clone(),
                recorded_at: Utc::now(),
                solar_power_w: status.solar_power_w,
                battery_power_w: status.battery_power_w,
                load_power_w: status.load_power_w,
                grid_power_w: status.grid_power_w,
            };
            self.state.repo.history.save_energy_usage(&sample).await?;
        }
        Ok(())
    }
}

struct SpikeMonitorJob {
    state: AppState,
}

#[async_trait]
impl SchedulerJob for SpikeMonitorJob {
    fn name(&self) -> &str {
        "monitor_spike"
    }

    async fn run(&self) -> Result<()> {
        let policies = self.state.repo.policies.all().await?;
        for mut policy in policies {
            if let Err(e) = self.state.spike.check_user(&mut policy, Utc::now()).await {
                error!(user_id = %policy.user_id, error = %e, "spike check failed");
            }
            self.state.repo.policies.save(&policy).await?;
        }
        Ok(())
    }
}

struct DemandGridChargingJob {
    state: AppState,
}

#[async_trait]
impl SchedulerJob for DemandGridChargingJob {
    fn name(&self) -> &str {
        "demand_grid_charging"
    }

    async fn run(&self) -> Result<()> {
        let policies = self.state.repo.policies.all().await?;
        for mut policy in policies {
            if let Err(e) = self.state.demand.check_user(&mut policy, Utc::now()).await {
                error!(user_id = %policy.user_id, error = %e, "demand lockout check failed");
            }
            self.state.repo.policies.save(&policy).await?;
        }
        Ok(())
    }
}

/// Convenience used by the administrative surface to look a user up by id
/// without going through a scheduler job.
pub async fn find_policy(state: &AppState, user_id: Uuid) -> Result<Option<UserPolicy>> {
    state.repo.policies.get(user_id).await
}
