use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    api::error::ApiError,
    api::response::ApiResponse,
    app::{find_policy, AppState},
    auth::AuthBearer,
    config::Config,
    price_source::{HealthStatus, PriceSource},
};

pub fn router(state: AppState, cfg: &Config) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status/:user_id", get(get_status))
        .route("/sync/:user_id", post(trigger_sync))
        .with_state(state)
        .layer(crate::auth::auth_layer(cfg.auth.token.clone()))
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct UserStatus {
    pub user_id: Uuid,
    pub site_id: String,
    pub sync_enabled: bool,
    pub last_update_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_update_status: Option<String>,
    pub in_spike_mode: bool,
    pub grid_charging_disabled_for_demand: bool,
    pub push_feed_health: Option<HealthStatus>,
}

pub async fn get_status(
    State(st): State<AppState>,
    AuthBearer: AuthBearer,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let policy = find_policy(&st, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no policy for user {user_id}")))?;

    let push_feed_health = st.push.as_ref().map(|push| push.health());

    let status = UserStatus {
        user_id: policy.user_id,
        site_id: policy.site_id,
        sync_enabled: policy.sync_enabled,
        last_update_time: policy.last_update_time,
        last_update_status: policy.last_update_status,
        in_spike_mode: policy.in_spike_mode,
        grid_charging_disabled_for_demand: policy.grid_charging_disabled_for_demand,
        push_feed_health,
    };

    Ok((StatusCode::OK, Json(ApiResponse::success(status))))
}

/// Manual fallback trigger: runs the same sync a `sync_tou` tick would,
/// for one user, ignoring the coordinator's period claim (an operator
/// asking for a sync wants one now, not a deferral to the next period).
pub async fn trigger_sync(
    State(st): State<AppState>,
    AuthBearer: AuthBearer,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut policy = find_policy(&st, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no policy for user {user_id}")))?;

    let forecast = st
        .pull
        .forecast()
        .await
        .map_err(|e| ApiError::ServiceUnavailable(e.to_string()))?;
    let current = st
        .pull
        .current_prices(chrono::Duration::seconds(120))
        .await
        .unwrap_or_default();

    let outcome = st
        .executor
        .sync_user(&mut policy, &forecast, &current, chrono::Utc::now())
        .await?;

    st.repo.policies.save(&policy).await?;

    Ok((StatusCode::OK, Json(ApiResponse::success(format!("{outcome:?}")))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_status_serializes() {
        let status = UserStatus {
            user_id: Uuid::nil(),
            site_id: "site".to_string(),
            sync_enabled: true,
            last_update_time: None,
            last_update_status: None,
            in_spike_mode: false,
            grid_charging_disabled_for_demand: false,
            push_feed_health: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["site_id"], "site");
    }
}
