//! C6: curtails solar export when it's no longer worth paying to export at
//! negative or near-zero feed-in prices, and restores it once prices
//! recover. Grounded in `solar_curtailment_check`/
//! `solar_curtailment_with_websocket_data`.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::device::DeviceController;
use crate::domain::{ExportRule, UserPolicy};

/// What the curtailment check decided and did for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurtailmentOutcome {
    NotEligible,
    AlreadyCurtailed,
    CurtailmentApplied,
    AlreadyNormal,
    Restored,
}

pub struct CurtailmentController {
    device: Arc<dyn DeviceController>,
}

impl CurtailmentController {
    pub fn new(device: Arc<dyn DeviceController>) -> Self {
        Self { device }
    }

    /// `feed_in_per_kwh` is the latest feed-in sample's `per_kwh`, already
    /// sign-normalized by [`crate::domain::PriceInterval::ingest`] so a
    /// positive value means the site earns money to export — no further
    /// sign flip needed here, unlike the upstream raw convention.
    pub async fn check_user(
        &self,
        policy: &mut UserPolicy,
        feed_in_per_kwh: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CurtailmentOutcome> {
        if !policy.solar_curtailment_enabled {
            return Ok(CurtailmentOutcome::NotEligible);
        }

        let export_earnings = feed_in_per_kwh;
        info!(
            site_id = %policy.site_id,
            export_earnings,
            threshold = policy.curtailment_threshold_cents,
            "checking solar curtailment"
        );

        let current_rule = self.resolve_current_rule(policy).await?;

        if export_earnings < policy.curtailment_threshold_cents {
            warn!(site_id = %policy.site_id, export_earnings, "curtailment triggered: export earnings below threshold");
            if current_rule == Some(ExportRule::Never) {
                info!(site_id = %policy.site_id, "already curtailed, no action needed");
                return Ok(CurtailmentOutcome::AlreadyCurtailed);
            }
            self.device
                .set_grid_export_rule(&policy.site_id, ExportRule::Never)
                .await
                .context("applying curtailment (export -> never)")?;
            policy.current_export_rule = Some(ExportRule::Never);
            policy.current_export_rule_updated_at = Some(now);
            info!(site_id = %policy.site_id, "curtailment applied");
            Ok(CurtailmentOutcome::CurtailmentApplied)
        } else {
            if current_rule == Some(ExportRule::Never) {
                info!(site_id = %policy.site_id, "restoring export from curtailment");
                self.device
                    .set_grid_export_rule(&policy.site_id, ExportRule::BatteryOk)
                    .await
                    .context("restoring export (never -> battery_ok)")?;
                policy.current_export_rule = Some(ExportRule::BatteryOk);
                policy.current_export_rule_updated_at = Some(now);
                info!(site_id = %policy.site_id, "curtailment restored");
                return Ok(CurtailmentOutcome::Restored);
            }
            info!(site_id = %policy.site_id, "already in normal export mode, no action needed");
            Ok(CurtailmentOutcome::AlreadyNormal)
        }
    }

    /// The device is authoritative; its `None` (neither an explicit rule
    /// nor a derivable VPP state) falls back to the last cached value, the
    /// same as the Python original.
    async fn resolve_current_rule(&self, policy: &UserPolicy) -> anyhow::Result<Option<ExportRule>> {
        let settings = self.device.grid_import_export(&policy.site_id).await.context("reading grid export settings")?;
        Ok(settings.customer_preferred_export_rule.or(policy.current_export_rule))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GridExportSettings, SiteStatus};
    use crate::domain::{DeviceError, ForecastType, OperationMode, TariffDocument};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    struct MockDevice {
        rule: StdMutex<Option<ExportRule>>,
    }

    #[async_trait]
    impl DeviceController for MockDevice {
        async fn test_connection(&self, _site_id: &str) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn site_info(&self, _site_id: &str) -> Result<serde_json::Value, DeviceError> {
            unimplemented!()
        }
        async fn site_status(&self, _site_id: &str) -> Result<SiteStatus, DeviceError> {
            unimplemented!()
        }
        async fn operation_mode(&self, _site_id: &str) -> Result<Option<OperationMode>, DeviceError> {
            unimplemented!()
        }
        async fn current_tariff(&self, _site_id: &str) -> Result<Option<serde_json::Value>, DeviceError> {
            unimplemented!()
        }
        async fn set_operation_mode(&self, _site_id: &str, _mode: OperationMode) -> Result<(), DeviceError> {
            unimplemented!()
        }
        async fn set_tariff(&self, _site_id: &str, _tariff: &TariffDocument) -> Result<(), DeviceError> {
            unimplemented!()
        }
        async fn set_tariff_raw(&self, _site_id: &str, _tariff: &serde_json::Value) -> Result<(), DeviceError> {
            unimplemented!()
        }
        async fn grid_import_export(&self, _site_id: &str) -> Result<GridExportSettings, DeviceError> {
            Ok(GridExportSettings {
                customer_preferred_export_rule: *self.rule.lock().unwrap(),
                disallow_charge_from_grid_with_solar_installed: None,
                non_export_configured: None,
            })
        }
        async fn set_grid_export_rule(&self, _site_id: &str, rule: ExportRule) -> Result<(), DeviceError> {
            *self.rule.lock().unwrap() = Some(rule);
            Ok(())
        }
        async fn set_grid_charging_enabled(&self, _site_id: &str, _enabled: bool) -> Result<(), DeviceError> {
            unimplemented!()
        }
    }

    fn sample_policy() -> UserPolicy {
        UserPolicy {
            user_id: Uuid::nil(),
            site_id: "site".into(),
            forecast_type: ForecastType::Predicted,
            sync_enabled: false,
            last_tariff_hash: None,
            last_update_time: None,
            last_update_status: None,
            solar_curtailment_enabled: true,
            curtailment_threshold_cents: 1.0,
            current_export_rule: None,
            current_export_rule_updated_at: None,
            spike_enabled: false,
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

    #[tokio::test]
    async fn curtails_when_earnings_below_threshold() {
        let device = Arc::new(MockDevice { rule: StdMutex::new(Some(ExportRule::BatteryOk)) });
        let controller = CurtailmentController::new(device.clone());
        let mut policy = sample_policy();
        let now = Utc::now();
        let outcome = controller.check_user(&mut policy, 0.5, now).await.unwrap();
        assert_eq!(outcome, CurtailmentOutcome::CurtailmentApplied);
        assert_eq!(*device.rule.lock().unwrap(), Some(ExportRule::Never));
        assert_eq!(policy.current_export_rule, Some(ExportRule::Never));
    }

    #[tokio::test]
    async fn already_curtailed_is_a_no_op() {
        let device = Arc::new(MockDevice { rule: StdMutex::new(Some(ExportRule::Never)) });
        let controller = CurtailmentController::new(device.clone());
        let mut policy = sample_policy();
        let outcome = controller.check_user(&mut policy, -2.0, Utc::now()).await.unwrap();
        assert_eq!(outcome, CurtailmentOutcome::AlreadyCurtailed);
    }

    #[tokio::test]
    async fn restores_when_earnings_recover() {
        let device = Arc::new(MockDevice { rule: StdMutex::new(Some(ExportRule::Never)) });
        let controller = CurtailmentController::new(device.clone());
        let mut policy = sample_policy();
        let outcome = controller.check_user(&mut policy, 5.0, Utc::now()).await.unwrap();
        assert_eq!(outcome, CurtailmentOutcome::Restored);
        assert_eq!(*device.rule.lock().unwrap(), Some(ExportRule::BatteryOk));
    }

    #[tokio::test]
    async fn not_eligible_when_disabled() {
        let device = Arc::new(MockDevice { rule: StdMutex::new(None) });
        let controller = CurtailmentController::new(device);
        let mut policy = sample_policy();
        policy.solar_curtailment_enabled = false;
        let outcome = controller.check_user(&mut policy, 0.0, Utc::now()).await.unwrap();
        assert_eq!(outcome, CurtailmentOutcome::NotEligible);
    }
}
