//! Direct Tesla Fleet API backend: holds OAuth tokens itself and refreshes
//! them in-process on a 401, exactly once per call, exactly as the source
//! client did.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::DeviceConfig;
use crate::domain::{DeviceError, ExportRule, OperationMode, TariffDocument};

use super::{
    check_result_envelope, export_rule_wire, operation_mode_wire, parse_operation_mode, site_status_from_json,
    DeviceController, GridExportSettings, SiteStatus, TokenRefreshCallback,
};

const TOKEN_URL: &str = "https://auth.tesla.com/oauth2/v3/token";

struct TokenPair {
    access_token: String,
    refresh_token: Option<String>,
}

pub struct FleetDeviceController {
    client: ClientWithMiddleware,
    base_url: String,
    tokens: RwLock<TokenPair>,
    client_id: Option<String>,
    client_secret: Option<String>,
    on_token_refresh: TokenRefreshCallback,
    http_timeout: StdDuration,
}

impl FleetDeviceController {
    pub fn new(cfg: &DeviceConfig, on_token_refresh: TokenRefreshCallback) -> Self {
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
            tokens: RwLock::new(TokenPair {
                access_token: cfg.access_token.clone().unwrap_or_default(),
                refresh_token: cfg.refresh_token.clone(),
            }),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            on_token_refresh,
            http_timeout: StdDuration::from_secs(cfg.http_timeout_secs),
        }
    }

    async fn refresh_access_token(&self) -> Result<(), DeviceError> {
        let (refresh_token, client_id) = {
            let tokens = self.tokens.read().await;
            (tokens.refresh_token.clone(), self.client_id.clone())
        };
        let refresh_token = refresh_token.ok_or_else(|| DeviceError::AuthExpired("no refresh token available".to_string()))?;
        let client_id = client_id.ok_or_else(|| DeviceError::AuthExpired("no client id configured for refresh".to_string()))?;

        info!("refreshing Fleet API access token");
        let resp = self
            .client
            .post(TOKEN_URL)
            .json(&json!({
                "grant_type": "refresh_token",
                "client_id": client_id,
                "refresh_token": refresh_token,
            }))
            .timeout(StdDuration::from_secs(10))
            .send()
            .await
            .map_err(|e| DeviceError::TransientHttp(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(DeviceError::AuthExpired(format!("token refresh failed: HTTP {}", resp.status())));
        }
        let data: serde_json::Value = resp.json().await.map_err(|e| DeviceError::ParseError(e.to_string()))?;
        let access_token = data
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DeviceError::ParseError("token response missing access_token".to_string()))?
            .to_string();
        let new_refresh = data.get("refresh_token").and_then(|v| v.as_str()).map(|s| s.to_string());
        let expires_in = data.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(28_800);

        {
            let mut tokens = self.tokens.write().await;
            tokens.access_token = access_token.clone();
            if let Some(rt) = &new_refresh {
                tokens.refresh_token = Some(rt.clone());
            }
        }

        (self.on_token_refresh)(access_token, new_refresh.unwrap_or(refresh_token), expires_in);
        info!("Fleet API access token refreshed");
        Ok(())
    }

    async fn send(&self, method: Method, path: &str, body: Option<&serde_json::Value>) -> Result<reqwest::Response, DeviceError> {
        let token = self.tokens.read().await.access_token.clone();
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.request(method, &url).bearer_auth(token).timeout(self.http_timeout);
        if let Some(b) = body {
            builder = builder.json(b);
        }
        builder.send().await.map_err(|e| DeviceError::TransientHttp(e.to_string()))
    }

    /// Sends the request, refreshing and retrying exactly once on a 401.
    async fn call(&self, method: Method, path: &str, body: Option<&serde_json::Value>) -> Result<serde_json::Value, DeviceError> {
        let resp = self.send(method.clone(), path, body).await?;
        let resp = if resp.status().as_u16() == 401 {
            warn!(path, "Fleet API returned 401, attempting token refresh");
            self.refresh_access_token().await?;
            self.send(method, path, body).await?
        } else {
            resp
        };
        Self::parse(resp).await
    }

    async fn parse(resp: reqwest::Response) -> Result<serde_json::Value, DeviceError> {
        let status = resp.status();
        if status.as_u16() == 401 {
            return Err(DeviceError::AuthExpired("still unauthorized after refresh".to_string()));
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
impl DeviceController for FleetDeviceController {
    async fn test_connection(&self, _site_id: &str) -> Result<(), DeviceError> {
        self.call(Method::GET, "/api/1/products", None).await?;
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

    async fn set_tariff(&self, site_id: &str, tariff: &TariffDocument) -> Result<(), DeviceError> {
        let body = serde_json::to_value(tariff.to_wire()).map_err(|e| DeviceError::ParseError(e.to_string()))?;
        let data = self
            .call(Method::POST, &format!("/api/1/energy_sites/{site_id}/time_of_use_settings"), Some(&body))
            .await?;
        check_result_envelope(&data)
    }

    async fn set_tariff_raw(&self, site_id: &str, tariff: &serde_json::Value) -> Result<(), DeviceError> {
        let data = self
            .call(Method::POST, &format!("/api/1/energy_sites/{site_id}/time_of_use_settings"), Some(tariff))
            .await?;
        check_result_envelope(&data)
    }

    async fn grid_import_export(&self, site_id: &str) -> Result<GridExportSettings, DeviceError> {
        let site_info = self.site_info(site_id).await?;
        let components = site_info.get("components").cloned().unwrap_or(serde_json::Value::Null);

        let get_bool = |key: &str| -> Option<bool> {
            components.get(key).and_then(|v| v.as_bool()).or_else(|| site_info.get(key).and_then(|v| v.as_bool()))
        };
        let export_rule_str = components
            .get("customer_preferred_export_rule")
            .and_then(|v| v.as_str())
            .or_else(|| site_info.get("customer_preferred_export_rule").and_then(|v| v.as_str()))
            .map(|s| s.to_string());
        let disallow_charge = get_bool("disallow_charge_from_grid_with_solar_installed");
        let non_export_configured = get_bool("non_export_configured").or_else(|| get_bool("components_non_export_configured"));

        let resolved_rule = match export_rule_str.as_deref() {
            Some("never") => Some(ExportRule::Never),
            Some("pv_only") => Some(ExportRule::PvOnly),
            Some("battery_ok") => Some(ExportRule::BatteryOk),
            _ => match non_export_configured {
                Some(true) => {
                    info!(site_id, "VPP user detected: derived export_rule=never from non_export_configured");
                    Some(ExportRule::Never)
                }
                Some(false) => {
                    info!(site_id, "VPP user detected: derived export_rule=battery_ok from non_export_configured");
                    Some(ExportRule::BatteryOk)
                }
                None => None,
            },
        };

        Ok(GridExportSettings {
            customer_preferred_export_rule: resolved_rule,
            disallow_charge_from_grid_with_solar_installed: disallow_charge,
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
        let disallow_value = !enabled;
        let body = json!({ "disallow_charge_from_grid_with_solar_installed": disallow_value });
        let data = self
            .call(Method::POST, &format!("/api/1/energy_sites/{site_id}/grid_import_export"), Some(&body))
            .await;
        match data {
            Ok(v) => check_result_envelope(&v),
            Err(e) => {
                error!(site_id, error = %e, "failed to set grid charging");
                Err(e)
            }
        }
    }
}
