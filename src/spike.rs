//! C7: watches wholesale price and swaps in/out a short-window export-spike
//! tariff, saving and restoring operation mode around the swap. Grounded in
//! `monitor_aemo_prices`/`force_tariff_refresh`/`create_spike_tariff`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::device::{resolve_device_timezone, DeviceController};
use crate::domain::{OperationMode, SavedTariff, UserPolicy};
use crate::price_source::wholesale::AemoClient;
use crate::tariff_builder;

const TYPICAL_BUY_DOLLARS: f64 = 0.30;
const TYPICAL_SELL_DOLLARS: f64 = 0.08;
/// Battery is considered "already exporting meaningfully" above this.
const EXPORTING_THRESHOLD_W: f64 = 100.0;

/// Persists and retrieves the per-user default-tariff backup used as the
/// spike-exit restore point. Implemented by the administrative store;
/// this trait exists so C7 can be exercised without one.
#[async_trait]
pub trait TariffBackupStore: Send + Sync {
    async fn default_for(&self, user_id: Uuid) -> anyhow::Result<Option<SavedTariff>>;
    async fn save_as_default(&self, user_id: Uuid, document: serde_json::Value) -> anyhow::Result<SavedTariff>;
}

/// What the spike check decided and did for one user this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpikeOutcome {
    NotEligible,
    NoChangeNormal,
    NoChangeSpiking,
    Entered,
    EnteredWithoutTariff,
    Exited,
    ExitedWithoutBackup,
    ExitSkippedTestMode,
}

pub struct SpikeController {
    device: Arc<dyn DeviceController>,
    aemo: Arc<AemoClient>,
    backups: Arc<dyn TariffBackupStore>,
    enter_wait: StdDuration,
    exit_wait: StdDuration,
}

impl SpikeController {
    pub fn new(
        device: Arc<dyn DeviceController>,
        aemo: Arc<AemoClient>,
        backups: Arc<dyn TariffBackupStore>,
        enter_wait: StdDuration,
        exit_wait: StdDuration,
    ) -> Self {
        Self { device, aemo, backups, enter_wait, exit_wait }
    }

    pub async fn check_user(&self, policy: &mut UserPolicy, now: DateTime<Utc>) -> anyhow::Result<SpikeOutcome> {
        if !policy.is_spike_eligible() {
            return Ok(SpikeOutcome::NotEligible);
        }

        let summary = self.aemo.current_price(&policy.spike_region).await.context("fetching AEMO wholesale price")?;
        policy.aemo_last_check = Some(now);
        policy.aemo_last_price = Some(summary.price_per_mwh);
        let is_spike = summary.price_per_mwh >= policy.spike_threshold_per_mwh;

        match (policy.in_spike_mode, is_spike) {
            (false, true) => self.enter_spike_mode(policy, summary.price_per_mwh, summary.cents_per_kwh(), now).await,
            (true, false) if policy.spike_test_mode => {
                info!(site_id = %policy.site_id, "price normalized but spike test mode is on, leaving state alone");
                Ok(SpikeOutcome::ExitSkippedTestMode)
            }
            (true, false) => self.exit_spike_mode(policy, now).await,
            (true, true) => Ok(SpikeOutcome::NoChangeSpiking),
            (false, false) => Ok(SpikeOutcome::NoChangeNormal),
        }
    }

    async fn enter_spike_mode(
        &self,
        policy: &mut UserPolicy,
        current_price_per_mwh: f64,
        current_price_cents_per_kwh: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<SpikeOutcome> {
        warn!(site_id = %policy.site_id, current_price_per_mwh, threshold = policy.spike_threshold_per_mwh, "spike detected");

        let status = self.device.site_status(&policy.site_id).await.context("reading site status")?;
        if status.battery_export_w() > EXPORTING_THRESHOLD_W {
            info!(
                site_id = %policy.site_id,
                battery_export_w = status.battery_export_w(),
                "battery already exporting to grid, skipping spike tariff upload"
            );
            self.ensure_default_backup(policy).await?;
            policy.in_spike_mode = true;
            policy.spike_start_time = Some(now);
            return Ok(SpikeOutcome::EnteredWithoutTariff);
        }

        self.ensure_default_backup(policy).await?;

        let pre_mode = self.device.operation_mode(&policy.site_id).await.context("reading operation mode")?;
        policy.pre_spike_operation_mode = pre_mode;
        if pre_mode != Some(OperationMode::Autonomous) {
            self.device
                .set_operation_mode(&policy.site_id, OperationMode::Autonomous)
                .await
                .context("switching to autonomous mode for spike")?;
        }

        let device_tz = resolve_device_timezone(self.device.as_ref(), &policy.site_id).await;
        let spike_tariff = tariff_builder::build_spike_tariff(
            current_price_cents_per_kwh,
            policy.spike_sell_multiplier,
            TYPICAL_BUY_DOLLARS,
            TYPICAL_SELL_DOLLARS,
            device_tz,
            now,
        );
        self.device.set_tariff(&policy.site_id, &spike_tariff).await.context("publishing spike tariff")?;

        self.force_tariff_refresh(&policy.site_id, self.enter_wait).await;

        policy.in_spike_mode = true;
        policy.spike_start_time = Some(now);
        info!(site_id = %policy.site_id, "entered spike mode");
        Ok(SpikeOutcome::Entered)
    }

    async fn exit_spike_mode(&self, policy: &mut UserPolicy, _now: DateTime<Utc>) -> anyhow::Result<SpikeOutcome> {
        info!(site_id = %policy.site_id, "price normalized, exiting spike mode");

        let backup = self.backups.default_for(policy.user_id).await.context("loading saved tariff")?;
        let Some(backup) = backup else {
            warn!(site_id = %policy.site_id, "no backup tariff saved, exiting spike mode anyway");
            policy.in_spike_mode = false;
            policy.spike_start_time = None;
            policy.pre_spike_operation_mode = None;
            return Ok(SpikeOutcome::ExitedWithoutBackup);
        };

        self.device
            .set_operation_mode(&policy.site_id, OperationMode::SelfConsumption)
            .await
            .context("switching to self_consumption before tariff restore")?;
        self.device
            .set_tariff_raw(&policy.site_id, &backup.document)
            .await
            .context("restoring backup tariff")?;

        tokio::time::sleep(self.exit_wait).await;

        let restore_mode = policy.pre_spike_operation_mode.unwrap_or(OperationMode::Autonomous);
        self.device
            .set_operation_mode(&policy.site_id, restore_mode)
            .await
            .context("restoring pre-spike operation mode")?;

        policy.in_spike_mode = false;
        policy.spike_start_time = None;
        policy.pre_spike_operation_mode = None;
        info!(site_id = %policy.site_id, "exited spike mode");
        Ok(SpikeOutcome::Exited)
    }

    /// §4.7 step 2: reuse an existing default backup, or save the device's
    /// current tariff as the new one.
    async fn ensure_default_backup(&self, policy: &mut UserPolicy) -> anyhow::Result<()> {
        if let Some(existing) = self.backups.default_for(policy.user_id).await.context("checking for default saved tariff")? {
            policy.saved_tariff_id = Some(existing.id);
            return Ok(());
        }
        let current = self.device.current_tariff(&policy.site_id).await.context("fetching current tariff for backup")?;
        match current {
            Some(document) => {
                let saved = self.backups.save_as_default(policy.user_id, document).await.context("saving default tariff backup")?;
                policy.saved_tariff_id = Some(saved.id);
            }
            None => warn!(site_id = %policy.site_id, "no current tariff available to back up before spike"),
        }
        Ok(())
    }

    /// Device-specific workaround: some firmwares only recompute their
    /// schedule on an operation-mode transition, so a spurious round trip
    /// forces the new tariff to apply immediately. Failures here are
    /// logged but don't fail spike entry — the tariff is already uploaded.
    async fn force_tariff_refresh(&self, site_id: &str, wait: StdDuration) {
        if let Err(e) = self.device.set_operation_mode(site_id, OperationMode::SelfConsumption).await {
            warn!(site_id, error = %e, "force tariff refresh: failed to switch to self_consumption");
            return;
        }
        tokio::time::sleep(wait).await;
        if let Err(e) = self.device.set_operation_mode(site_id, OperationMode::Autonomous).await {
            warn!(site_id, error = %e, "force tariff refresh: failed to switch back to autonomous");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GridExportSettings, SiteStatus};
    use crate::domain::{DeviceError, ExportRule, ForecastType, TariffDocument};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct MockDevice {
        export_w: f64,
        mode: StdMutex<OperationMode>,
        tariff_calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl DeviceController for MockDevice {
        async fn test_connection(&self, _site_id: &str) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn site_info(&self, _site_id: &str) -> Result<serde_json::Value, DeviceError> {
            Ok(serde_json::json!({"installation_time_zone": "Australia/Sydney"}))
        }
        async fn site_status(&self, _site_id: &str) -> Result<SiteStatus, DeviceError> {
            Ok(SiteStatus { solar_power_w: 0.0, battery_power_w: self.export_w, load_power_w: 0.0, grid_power_w: 0.0 })
        }
        async fn operation_mode(&self, _site_id: &str) -> Result<Option<OperationMode>, DeviceError> {
            Ok(Some(*self.mode.lock().unwrap()))
        }
        async fn current_tariff(&self, _site_id: &str) -> Result<Option<serde_json::Value>, DeviceError> {
            Ok(Some(serde_json::json!({"name": "Original"})))
        }
        async fn set_operation_mode(&self, _site_id: &str, mode: OperationMode) -> Result<(), DeviceError> {
            *self.mode.lock().unwrap() = mode;
            Ok(())
        }
        async fn set_tariff(&self, _site_id: &str, _tariff: &TariffDocument) -> Result<(), DeviceError> {
            self.tariff_calls.lock().unwrap().push("spike".to_string());
            Ok(())
        }
        async fn set_tariff_raw(&self, _site_id: &str, _tariff: &serde_json::Value) -> Result<(), DeviceError> {
            self.tariff_calls.lock().unwrap().push("restore".to_string());
            Ok(())
        }
        async fn grid_import_export(&self, _site_id: &str) -> Result<GridExportSettings, DeviceError> {
            unimplemented!()
        }
        async fn set_grid_export_rule(&self, _site_id: &str, _rule: ExportRule) -> Result<(), DeviceError> {
            unimplemented!()
        }
        async fn set_grid_charging_enabled(&self, _site_id: &str, _enabled: bool) -> Result<(), DeviceError> {
            unimplemented!()
        }
    }

    struct MockBackupStore {
        saved: AsyncMutex<Option<SavedTariff>>,
    }

    #[async_trait]
    impl TariffBackupStore for MockBackupStore {
        async fn default_for(&self, _user_id: Uuid) -> anyhow::Result<Option<SavedTariff>> {
            Ok(self.saved.lock().await.clone())
        }
        async fn save_as_default(&self, user_id: Uuid, document: serde_json::Value) -> anyhow::Result<SavedTariff> {
            let saved = SavedTariff { id: Uuid::new_v4(), user_id, is_default: true, saved_at: Utc::now(), document };
            *self.saved.lock().await = Some(saved.clone());
            Ok(saved)
        }
    }

    fn sample_policy() -> UserPolicy {
        UserPolicy {
            user_id: Uuid::new_v4(),
            site_id: "site".into(),
            forecast_type: ForecastType::Predicted,
            sync_enabled: false,
            last_tariff_hash: None,
            last_update_time: None,
            last_update_status: None,
            solar_curtailment_enabled: false,
            curtailment_threshold_cents: 1.0,
            current_export_rule: None,
            current_export_rule_updated_at: None,
            spike_enabled: true,
            spike_region: "NSW1".into(),
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
        }
    }

    fn controller(export_w: f64) -> (SpikeController, Arc<MockDevice>, Arc<MockBackupStore>) {
        let device = Arc::new(MockDevice {
            export_w,
            mode: StdMutex::new(OperationMode::SelfConsumption),
            tariff_calls: StdMutex::new(Vec::new()),
        });
        let backups = Arc::new(MockBackupStore { saved: AsyncMutex::new(None) });
        let aemo = Arc::new(AemoClient::new().unwrap());
        let controller = SpikeController::new(
            device.clone(),
            aemo,
            backups.clone(),
            StdDuration::from_millis(1),
            StdDuration::from_millis(1),
        );
        (controller, device, backups)
    }

    #[tokio::test]
    async fn not_eligible_when_sync_enabled() {
        let (controller, _device, _backups) = controller(0.0);
        let mut policy = sample_policy();
        policy.sync_enabled = true;
        let outcome = controller.check_user(&mut policy, Utc::now()).await.unwrap();
        assert_eq!(outcome, SpikeOutcome::NotEligible);
    }

    #[tokio::test]
    async fn battery_already_exporting_skips_tariff_upload() {
        let (controller, device, _backups) = controller(500.0);
        let mut policy = sample_policy();
        policy.in_spike_mode = false;
        policy.aemo_last_price = None;

        // Drive directly through enter_spike_mode's public surface by
        // forcing a spike via check_user with the mocked price path: the
        // AemoClient hits the real network, so exercise enter_spike_mode's
        // battery-export branch directly instead.
        let outcome = controller.enter_spike_mode(&mut policy, 50000.0, 500.0, Utc::now()).await.unwrap();
        assert_eq!(outcome, SpikeOutcome::EnteredWithoutTariff);
        assert!(policy.in_spike_mode);
        assert!(device.tariff_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enter_then_exit_round_trip() {
        let (controller, device, backups) = controller(0.0);
        let mut policy = sample_policy();

        let entered = controller.enter_spike_mode(&mut policy, 50000.0, 500.0, Utc::now()).await.unwrap();
        assert_eq!(entered, SpikeOutcome::Entered);
        assert!(policy.in_spike_mode);
        assert_eq!(*device.mode.lock().unwrap(), OperationMode::Autonomous);
        assert!(backups.default_for(policy.user_id).await.unwrap().is_some());

        let exited = controller.exit_spike_mode(&mut policy, Utc::now()).await.unwrap();
        assert_eq!(exited, SpikeOutcome::Exited);
        assert!(!policy.in_spike_mode);
        assert_eq!(*device.mode.lock().unwrap(), OperationMode::SelfConsumption);
        assert_eq!(device.tariff_calls.lock().unwrap().as_slice(), ["spike", "restore"]);
    }

    #[tokio::test]
    async fn exit_without_backup_still_clears_state() {
        let (controller, _device, _backups) = controller(0.0);
        let mut policy = sample_policy();
        policy.in_spike_mode = true;
        let outcome = controller.exit_spike_mode(&mut policy, Utc::now()).await.unwrap();
        assert_eq!(outcome, SpikeOutcome::ExitedWithoutBackup);
        assert!(!policy.in_spike_mode);
    }
}
