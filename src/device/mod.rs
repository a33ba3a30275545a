//! C2: the battery controller side of the pipeline. Two backends speak the
//! same vendor protocol through different doors — one holds OAuth
//! credentials directly, the other delegates to a broker that already
//! authenticated on the user's behalf.

pub mod fleet;
pub mod proxy;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{DeviceBackend, DeviceConfig};
use crate::domain::{DeviceError, ExportRule, OperationMode, TariffDocument};

/// Invoked after a successful OAuth token refresh so the caller can persist
/// the new pair; mirrors the Python client's `on_token_refresh` callback.
pub type TokenRefreshCallback = Arc<dyn Fn(String, String, u64) + Send + Sync>;

/// Current grid import/export configuration, with the VPP-derived fallback
/// applied (§4.6's `non_export_configured` handling).
#[derive(Debug, Clone, Serialize)]
pub struct GridExportSettings {
    pub customer_preferred_export_rule: Option<ExportRule>,
    pub disallow_charge_from_grid_with_solar_installed: Option<bool>,
    pub non_export_configured: Option<bool>,
}

/// Live power flow, read by C7's enter-spike-mode check to avoid disrupting
/// a battery that's already exporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SiteStatus {
    pub solar_power_w: f64,
    pub battery_power_w: f64,
    pub load_power_w: f64,
    pub grid_power_w: f64,
}

impl SiteStatus {
    /// The battery is exporting to the grid once it's producing more than
    /// the load that's left over after solar covers what it can.
    pub fn battery_export_w(&self) -> f64 {
        let net_load_after_solar = (self.load_power_w - self.solar_power_w).max(0.0);
        self.battery_power_w - net_load_after_solar
    }
}

/// The vendor-protocol surface C2 needs, implemented once per backend.
#[async_trait]
pub trait DeviceController: Send + Sync {
    async fn test_connection(&self, site_id: &str) -> Result<(), DeviceError>;

    async fn site_info(&self, site_id: &str) -> Result<serde_json::Value, DeviceError>;

    async fn site_status(&self, site_id: &str) -> Result<SiteStatus, DeviceError>;

    async fn operation_mode(&self, site_id: &str) -> Result<Option<OperationMode>, DeviceError>;

    async fn current_tariff(&self, site_id: &str) -> Result<Option<serde_json::Value>, DeviceError>;

    async fn set_operation_mode(&self, site_id: &str, mode: OperationMode) -> Result<(), DeviceError>;

    async fn set_tariff(&self, site_id: &str, tariff: &TariffDocument) -> Result<(), DeviceError>;

    async fn set_tariff_raw(&self, site_id: &str, tariff: &serde_json::Value) -> Result<(), DeviceError>;

    async fn grid_import_export(&self, site_id: &str) -> Result<GridExportSettings, DeviceError>;

    async fn set_grid_export_rule(&self, site_id: &str, rule: ExportRule) -> Result<(), DeviceError>;

    async fn set_grid_charging_enabled(&self, site_id: &str, enabled: bool) -> Result<(), DeviceError>;
}

/// Picks the backend named in configuration, falling back gracefully the
/// way the teacher's hardware factory does for unconfigured real backends.
pub struct DeviceFactory;

impl DeviceFactory {
    pub fn create(cfg: &DeviceConfig, on_token_refresh: TokenRefreshCallback) -> Arc<dyn DeviceController> {
        match cfg.backend {
            DeviceBackend::Direct => Arc::new(fleet::FleetDeviceController::new(cfg, on_token_refresh)),
            DeviceBackend::Proxy => Arc::new(proxy::ProxyDeviceController::new(cfg)),
        }
    }
}

pub(crate) fn operation_mode_wire(mode: OperationMode) -> &'static str {
    match mode {
        OperationMode::SelfConsumption => "self_consumption",
        OperationMode::Autonomous => "autonomous",
        OperationMode::Backup => "backup",
    }
}

pub(crate) fn export_rule_wire(rule: ExportRule) -> &'static str {
    match rule {
        ExportRule::Never => "never",
        ExportRule::PvOnly => "pv_only",
        ExportRule::BatteryOk => "battery_ok",
    }
}

pub(crate) fn parse_operation_mode(raw: &str) -> Option<OperationMode> {
    match raw {
        "self_consumption" => Some(OperationMode::SelfConsumption),
        "autonomous" => Some(OperationMode::Autonomous),
        "backup" => Some(OperationMode::Backup),
        _ => None,
    }
}

/// Resolves a site's IANA timezone from `installation_time_zone`, falling
/// back to UTC (and logging a warning) on any failure — shared by C5 and
/// C7, both of which need device-local bucket alignment.
pub async fn resolve_device_timezone(device: &dyn DeviceController, site_id: &str) -> chrono_tz::Tz {
    use std::str::FromStr;
    match device.site_info(site_id).await {
        Ok(info) => {
            let raw = info.get("installation_time_zone").and_then(|v| v.as_str());
            match raw.map(chrono_tz::Tz::from_str) {
                Some(Ok(tz)) => tz,
                Some(Err(_)) => {
                    tracing::warn!(site_id, raw = ?raw, "unrecognized installation_time_zone, defaulting to UTC");
                    chrono_tz::UTC
                }
                None => {
                    tracing::warn!(site_id, "no installation_time_zone in site_info, defaulting to UTC");
                    chrono_tz::UTC
                }
            }
        }
        Err(e) => {
            tracing::warn!(site_id, error = %e, "failed to fetch site_info for timezone, defaulting to UTC");
            chrono_tz::UTC
        }
    }
}

pub(crate) fn site_status_from_json(data: &serde_json::Value) -> SiteStatus {
    let get = |key: &str| data.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
    SiteStatus {
        solar_power_w: get("solar_power"),
        battery_power_w: get("battery_power"),
        load_power_w: get("load_power"),
        grid_power_w: get("grid_power"),
    }
}

/// Checks the vendor's `{"response": {"result": false, "reason": ...}}`
/// structural failure shape, distinct from a non-2xx HTTP status (§4.2,
/// §7): the call can succeed transport-wise and still be rejected.
pub(crate) fn check_result_envelope(body: &serde_json::Value) -> Result<(), DeviceError> {
    let response = body.get("response").unwrap_or(body);
    if let Some(result) = response.get("result").and_then(|v| v.as_bool()) {
        if !result {
            let reason = response.get("reason").and_then(|v| v.as_str()).unwrap_or("unknown reason");
            return Err(DeviceError::UpstreamLogicalFailure(reason.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_envelope_rejects_explicit_false() {
        let body = serde_json::json!({"response": {"result": false, "reason": "busy"}});
        let err = check_result_envelope(&body).unwrap_err();
        assert!(matches!(err, DeviceError::UpstreamLogicalFailure(r) if r == "busy"));
    }

    #[test]
    fn result_envelope_accepts_missing_result_field() {
        let body = serde_json::json!({"response": {"some_field": 1}});
        assert!(check_result_envelope(&body).is_ok());
    }
}
