//! C8: keeps grid-charging locked out during a user's configured demand
//! peak window, independent of the regular tariff sync. Structured like
//! [`crate::curtailment`]'s controller — a device-state read, a desired-
//! value comparison, and a single corrective call when they diverge.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::device::{resolve_device_timezone, DeviceController};
use crate::domain::UserPolicy;

/// What the demand-window check decided and did for one user this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandOutcome {
    NotEligible,
    AlreadyCorrect,
    LockedOut,
    Restored,
}

pub struct DemandController {
    device: Arc<dyn DeviceController>,
}

impl DemandController {
    pub fn new(device: Arc<dyn DeviceController>) -> Self {
        Self { device }
    }

    /// Evaluates `now` against the user's peak window in the device's own
    /// timezone — the window's weekday mask and midnight-crossing handling
    /// only make sense relative to local wall clock.
    pub async fn check_user(&self, policy: &mut UserPolicy, now: DateTime<Utc>) -> anyhow::Result<DemandOutcome> {
        let Some(window_policy) = policy.demand_window.as_ref().filter(|w| w.enabled) else {
            return Ok(DemandOutcome::NotEligible);
        };

        let device_tz = resolve_device_timezone(self.device.as_ref(), &policy.site_id).await;
        let now_local = now.with_timezone(&device_tz);
        let in_peak = window_policy.peak_window.contains(now_local.weekday(), now_local.hour(), now_local.minute());
        let desired_disabled = in_peak;

        if policy.grid_charging_disabled_for_demand == desired_disabled {
            return Ok(DemandOutcome::AlreadyCorrect);
        }

        self.device
            .set_grid_charging_enabled(&policy.site_id, !desired_disabled)
            .await
            .context("toggling grid-charging allowance for demand window")?;
        policy.grid_charging_disabled_for_demand = desired_disabled;

        if desired_disabled {
            info!(site_id = %policy.site_id, "entered demand peak window, grid charging locked out");
            Ok(DemandOutcome::LockedOut)
        } else {
            info!(site_id = %policy.site_id, "left demand peak window, grid charging restored");
            Ok(DemandOutcome::Restored)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GridExportSettings, SiteStatus};
    use crate::domain::{
        AppliesTo, DemandWindowPolicy, DeviceError, ExportRule, ForecastType, OperationMode, TariffDocument,
        TimeWindow, WeekdayMask,
    };
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    struct MockDevice {
        charging_enabled: StdMutex<bool>,
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
            unimplemented!()
        }
        async fn set_grid_export_rule(&self, _site_id: &str, _rule: ExportRule) -> Result<(), DeviceError> {
            unimplemented!()
        }
        async fn set_grid_charging_enabled(&self, _site_id: &str, enabled: bool) -> Result<(), DeviceError> {
            *self.charging_enabled.lock().unwrap() = enabled;
            Ok(())
        }
    }

    fn sample_policy(window: Option<DemandWindowPolicy>) -> UserPolicy {
        UserPolicy {
            user_id: Uuid::nil(),
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
            demand_window: window,
            grid_charging_disabled_for_demand: false,
        }
    }

    fn peak_window() -> DemandWindowPolicy {
        DemandWindowPolicy {
            enabled: true,
            peak_window: TimeWindow { start_hour: 16, start_minute: 0, end_hour: 20, end_minute: 0, weekdays: WeekdayMask::ALL },
            shoulder_window: None,
            applies_to: AppliesTo::Both,
            peak_rate_per_kw: 15.0,
            shoulder_rate_per_kw: 5.0,
            off_peak_rate_per_kw: 0.0,
            daily_supply_charge: None,
            monthly_supply_charge: None,
        }
    }

    #[tokio::test]
    async fn not_eligible_without_demand_window() {
        let device = Arc::new(MockDevice { charging_enabled: StdMutex::new(true) });
        let controller = DemandController::new(device);
        let mut policy = sample_policy(None);
        let now: DateTime<Utc> = "2024-06-10T07:00:00Z".parse().unwrap();
        let outcome = controller.check_user(&mut policy, now).await.unwrap();
        assert_eq!(outcome, DemandOutcome::NotEligible);
    }

    #[tokio::test]
    async fn locks_out_grid_charging_inside_peak_window() {
        let device = Arc::new(MockDevice { charging_enabled: StdMutex::new(true) });
        let controller = DemandController::new(device.clone());
        let mut policy = sample_policy(Some(peak_window()));
        // 17:30 Sydney (+10) is inside the 16:00-20:00 peak window.
        let now: DateTime<Utc> = "2024-06-10T07:30:00Z".parse().unwrap();
        let outcome = controller.check_user(&mut policy, now).await.unwrap();
        assert_eq!(outcome, DemandOutcome::LockedOut);
        assert!(policy.grid_charging_disabled_for_demand);
        assert!(!*device.charging_enabled.lock().unwrap());
    }

    #[tokio::test]
    async fn restores_grid_charging_outside_peak_window() {
        let device = Arc::new(MockDevice { charging_enabled: StdMutex::new(false) });
        let controller = DemandController::new(device.clone());
        let mut policy = sample_policy(Some(peak_window()));
        policy.grid_charging_disabled_for_demand = true;
        // 21:00 Sydney is outside the 16:00-20:00 peak window.
        let now: DateTime<Utc> = "2024-06-10T11:00:00Z".parse().unwrap();
        let outcome = controller.check_user(&mut policy, now).await.unwrap();
        assert_eq!(outcome, DemandOutcome::Restored);
        assert!(!policy.grid_charging_disabled_for_demand);
        assert!(*device.charging_enabled.lock().unwrap());
    }

    #[tokio::test]
    async fn already_correct_is_a_no_op() {
        let device = Arc::new(MockDevice { charging_enabled: StdMutex::new(true) });
        let controller = DemandController::new(device);
        let mut policy = sample_policy(Some(peak_window()));
        let now: DateTime<Utc> = "2024-06-10T11:00:00Z".parse().unwrap();
        let outcome = controller.check_user(&mut policy, now).await.unwrap();
        assert_eq!(outcome, DemandOutcome::AlreadyCorrect);
    }
}
