//! Persistent per-user configuration and state consumed by C3/C6/C7/C8.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::price::ForecastType;
use super::tariff::AppliesTo;

/// Device grid-export rule, as understood by C2/C6.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportRule {
    Never,
    PvOnly,
    BatteryOk,
}

/// Battery controller operation mode.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    SelfConsumption,
    Autonomous,
    Backup,
}

/// `Mon=bit0 .. Sun=bit6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekdayMask(pub u8);

impl WeekdayMask {
    pub const ALL: WeekdayMask = WeekdayMask(0b0111_1111);

    pub fn contains(&self, weekday: chrono::Weekday) -> bool {
        let bit = weekday.num_days_from_monday();
        self.0 & (1 << bit) != 0
    }
}

/// A time-of-day window, possibly crossing midnight, gated by a weekday mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u8,
    pub start_minute: u8,
    pub end_hour: u8,
    pub end_minute: u8,
    pub weekdays: WeekdayMask,
}

impl TimeWindow {
    /// Whether `(hour, minute)` on `weekday` falls inside this window,
    /// handling the case where `end < start` (crosses midnight).
    pub fn contains(&self, weekday: chrono::Weekday, hour: u32, minute: u32) -> bool {
        if !self.weekdays.contains(weekday) {
            return false;
        }
        let now_mins = hour * 60 + minute;
        let start_mins = self.start_hour as u32 * 60 + self.start_minute as u32;
        let end_mins = self.end_hour as u32 * 60 + self.end_minute as u32;
        if start_mins <= end_mins {
            now_mins >= start_mins && now_mins < end_mins
        } else {
            now_mins >= start_mins || now_mins < end_mins
        }
    }
}

/// Demand-charge configuration consumed by C3 (tariff build) and C8 (lockout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandWindowPolicy {
    pub enabled: bool,
    pub peak_window: TimeWindow,
    pub shoulder_window: Option<TimeWindow>,
    pub applies_to: AppliesTo,
    pub peak_rate_per_kw: f64,
    pub shoulder_rate_per_kw: f64,
    pub off_peak_rate_per_kw: f64,
    pub daily_supply_charge: Option<f64>,
    pub monthly_supply_charge: Option<f64>,
}

/// Persistent configuration and live state for one user/site, consumed by
/// C3/C6/C7/C8. One row per site in the administrative store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPolicy {
    pub user_id: Uuid,
    pub site_id: String,

    pub forecast_type: ForecastType,

    pub sync_enabled: bool,
    pub last_tariff_hash: Option<String>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub last_update_status: Option<String>,

    pub solar_curtailment_enabled: bool,
    /// Minimum cents/kWh of export earnings before curtailment engages.
    /// Open question in the source spec: kept tunable rather than hardcoded.
    pub curtailment_threshold_cents: f64,
    pub current_export_rule: Option<ExportRule>,
    pub current_export_rule_updated_at: Option<DateTime<Utc>>,

    pub spike_enabled: bool,
    pub spike_region: String,
    pub spike_threshold_per_mwh: f64,
    /// Multiplier applied to current wholesale price to get the spike
    /// sell rate ($/kWh). Open question in the source spec: kept tunable.
    pub spike_sell_multiplier: f64,
    pub spike_test_mode: bool,
    pub in_spike_mode: bool,
    pub spike_start_time: Option<DateTime<Utc>>,
    pub saved_tariff_id: Option<Uuid>,
    pub pre_spike_operation_mode: Option<OperationMode>,
    pub aemo_last_check: Option<DateTime<Utc>>,
    pub aemo_last_price: Option<f64>,

    pub demand_window: Option<DemandWindowPolicy>,
    pub grid_charging_disabled_for_demand: bool,
}

impl UserPolicy {
    pub fn is_sync_eligible(&self) -> bool {
        self.sync_enabled
    }

    /// Per §4.7: the spike controller and the tariff sync must not both
    /// drive the tariff for the same user.
    pub fn is_spike_eligible(&self) -> bool {
        self.spike_enabled && !self.sync_enabled
    }
}

/// Immutable snapshot of a previously-fetched device tariff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedTariff {
    pub id: Uuid,
    pub user_id: Uuid,
    pub is_default: bool,
    pub saved_at: DateTime<Utc>,
    pub document: serde_json::Value,
}
