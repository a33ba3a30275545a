use anyhow::Result;
use axum::Router;
use open_energy_controller::config::Config;
use open_energy_controller::telemetry::{self, init_tracing};
use open_energy_controller::{api, app};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    let mut application = app::Application::bootstrap(cfg.clone()).await?;

    let mut app: Router = api::router(application.state.clone(), &cfg);

    #[cfg(feature = "metrics")]
    {
        app = api::with_metrics(app);
    }

    let addr = cfg.server.socket_addr()?;
    info!(%addr, "starting Open Energy Controller");

    application.spawn_background_tasks();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    warn!("shutdown complete");
    Ok(())
}
