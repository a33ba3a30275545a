//! Brokered backend: a proxy service (e.g. Teslemetry) that already holds
//! vendor credentials on the user's behalf, reached with a single static
//! API key. No token refresh loop — the broker owns that problem.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde_json::json;

use crate::config::DeviceConfig;
use crate::domain::{DeviceError, ExportRule, OperationMode, TariffDocument};

use super::{
    check_result_envelope, export_rule_wire, operation_mode_wire, parse_operation_mode, site_status_from_json,
    DeviceController, GridExportSettings, SiteStatus,
};

pub struct ProxyDeviceController {
    client: ClientWithMiddleware,
    base_url: String,
    api_key: String,
}

impl ProxyDeviceController {
    pub fn new(cfg: &DeviceConfig) -> Self {
        let inner = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(cfg.http_timeout_secs))
            .user_agent("open-energy-controller/0.2")
            .build()
            .expect("reqwest client builds with static config");
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.access_token.clone().unwrap_or_default(),
        }
    }

    async fn call(&self, method: Method, path: &str, body: Option<&serde_json::Value>) -> Result<serde_json::Value, DeviceError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.request(method, &url).bearer_auth(&self.api_key);
        if let Some(b) = body {
            builder = builder.json(b);
        }
        let resp = builder.send().await.map_err(|e| DeviceError::TransientHttp(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 401 {
            return Err(DeviceError::AuthExpired("proxy rejected the configured API key".to_string()));
        }
        if status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeviceError::ClientError(format!("HTTP {status}: {body}")));
        }
        if !status.is_success() {
            return Err(DeviceError::TransientHttp(format!("HTTP {status}")));
        }
        resp.json().await.map_err(|e| DeviceError::ParseError(e.to_string()))
    }
}

#[async_trait]
impl DeviceController for ProxyDeviceController {
    async fn test_connection(&self, site_id: &str) -> Result<(), DeviceError> {
        self.call(Method::GET, &format!("/api/1/energy_sites/{site_id}/site_info"), None).await?;
        Ok(())
    }

    async fn site_info(&self, site_id: &str) -> Result<serde_json::Value, DeviceError> {
        let data = self.call(Method::GET, &format!("/api/1/energy_sites/{site_id}/site_info"), None).await?;
        Ok(data.get("response").cloned().unwrap_or(data))
    }

    async fn site_status(&self, site_id: &str) -> Result<SiteStatus, DeviceError> {
        let data = self.call(Method::GET, &format!("/api/1/energy_sites/{site_id}/live_status"), None).await?;
        let response = data.get("response").cloned().unwrap_or(data);
        Ok(site_status_from_json(&response))
    }

    async fn operation_mode(&self, site_id: &str) -> Result<Option<OperationMode>, DeviceError> {
        let site_info = self.site_info(site_id).await?;
        Ok(site_info.get("default_real_mode").and_then(|v| v.as_str()).and_then(parse_operation_mode))
    }

    async fn current_tariff(&self, site_id: &str) -> Result<Option<serde_json::Value>, DeviceError> {
        let site_info = self.site_info(site_id).await?;
        Ok(site_info.get("tariff_content_v2").cloned())
    }

    async fn set_operation_mode(&self, site_id: &str, mode: OperationMode) -> Result<(), DeviceError> {
        let body = json!({ "default_real_mode": operation_mode_wire(mode) });
        let data = self
            .call(Method::POST, &format!("/api/1/energy_sites/{site_id}/operation"), Some(&body))
            .await?;
        check_result_envelope(&data)
    }

    /// Teslemetry's `set_tariff_rate` wraps the full wire document in
    /// `tou_settings.tariff_content_v2` rather than posting it bare.
    async fn set_tariff(&self, site_id: &str, tariff: &TariffDocument) -> Result<(), DeviceError> {
        let wire = serde_json::to_value(tariff.to_wire()).map_err(|e| DeviceError::ParseError(e.to_string()))?;
        let payload = json!({ "tou_settings": { "tariff_content_v2": wire } });
        let data = self
            .call(Method::POST, &format!("/api/1/energy_sites/{site_id}/time_of_use_settings"), Some(&payload))
            .await?;
        check_result_envelope(&data)
    }

    async fn set_tariff_raw(&self, site_id: &str, tariff: &serde_json::Value) -> Result<(), DeviceError> {
        let payload = json!({ "tou_settings": { "tariff_content_v2": tariff } });
        let data = self
            .call(Method::POST, &format!("/api/1/energy_sites/{site_id}/time_of_use_settings"), Some(&payload))
            .await?;
        check_result_envelope(&data)
    }

    async fn grid_import_export(&self, site_id: &str) -> Result<GridExportSettings, DeviceError> {
        let site_info = self.site_info(site_id).await?;
        let export_rule_str = site_info.get("customer_preferred_export_rule").and_then(|v| v.as_str());
        let non_export_configured = site_info.get("components_non_export_configured").and_then(|v| v.as_bool());

        let resolved_rule = match export_rule_str {
            Some("never") => Some(ExportRule::Never),
            Some("pv_only") => Some(ExportRule::PvOnly),
            Some("battery_ok") => Some(ExportRule::BatteryOk),
            _ => non_export_configured.map(|configured| if configured { ExportRule::Never } else { ExportRule::BatteryOk }),
        };

        Ok(GridExportSettings {
            customer_preferred_export_rule: resolved_rule,
            disallow_charge_from_grid_with_solar_installed: site_info
                .get("disallow_charge_from_grid_with_solar_installed")
                .and_then(|v| v.as_bool()),
            non_export_configured,
        })
    }

    async fn set_grid_export_rule(&self, site_id: &str, rule: ExportRule) -> Result<(), DeviceError> {
        let body = json!({ "customer_preferred_export_rule": export_rule_wire(rule) });
        let data = self
            .call(Method::POST, &format!("/api/1/energy_sites/{site_id}/grid_import_export"), Some(&body))
            .await?;
        check_result_envelope(&data)
    }

    async fn set_grid_charging_enabled(&self, site_id: &str, enabled: bool) -> Result<(), DeviceError> {
        let body = json!({ "disallow_charge_from_grid_with_solar_installed": !enabled });
        let data = self
            .call(Method::POST, &format!("/api/1/energy_sites/{site_id}/grid_import_export"), Some(&body))
            .await?;
        check_result_envelope(&data)
    }
}
