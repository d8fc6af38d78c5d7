//! Attribution Service: standalone binary hosting the attribution engine
//! behind an RPC API.
//!
//! Default: http://127.0.0.1:9110/

use attribution_backend::clock::{Clock, SystemClock};
use attribution_backend::collaborators::{
    AggregationService, ClearTextAggregationService, StaticCookieChecker,
    UnsupportedOsLevelManager,
};
use attribution_backend::config::Config;
use attribution_backend::manager::{AttributionManager, Collaborators};
use attribution_backend::network::HttpReportSender;
use attribution_backend::observers::LogObserver;
use attribution_backend::policy::OriginPolicy;
use attribution_backend::routes::{self, AppState};
use attribution_backend::storage::{Db, SqliteResolver};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Config::from_env()?;

    log::info!("Opening database at: {}", config.db_path);
    let db = Arc::new(Db::open(&config.db_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let aggregation_service: Option<Arc<dyn AggregationService>> = if config.cleartext_aggregation
    {
        log::warn!("Clear-text aggregation enabled, aggregatable payloads are not encrypted");
        Some(Arc::new(ClearTextAggregationService))
    } else {
        None
    };

    let collab = Collaborators {
        resolver: Arc::new(SqliteResolver::new(db, clock.clone())),
        cookie_checker: Arc::new(StaticCookieChecker::new(
            config.debug_cookie_origins.iter().cloned(),
        )),
        report_sender: Arc::new(HttpReportSender::new(Duration::from_secs(
            config.report_timeout_secs,
        ))?),
        os_level_manager: Arc::new(UnsupportedOsLevelManager),
        aggregation_service,
        policy: Arc::new(OriginPolicy::new(config.blocked_origins.iter().cloned())),
        clock,
    };

    let manager = AttributionManager::start(config.engine.clone(), collab).await;
    manager.add_observer(Arc::new(LogObserver));

    let state = Arc::new(AppState {
        manager,
        start_time: Instant::now(),
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        .route("/rpc/sources/register", axum::routing::post(routes::register_source))
        .route("/rpc/triggers/register", axum::routing::post(routes::register_trigger))
        .route("/rpc/os/register", axum::routing::post(routes::register_os))
        .route("/rpc/sources/active", axum::routing::get(routes::active_sources))
        .route("/rpc/reports/pending", axum::routing::get(routes::pending_reports))
        .route("/rpc/reports/send", axum::routing::post(routes::send_report))
        .route("/rpc/data/clear", axum::routing::post(routes::clear_data))
        .route("/rpc/data/keys", axum::routing::get(routes::data_keys))
        .route("/rpc/data/keys/remove", axum::routing::post(routes::remove_data_key))
        .route("/rpc/debug_mode", axum::routing::post(routes::debug_mode))
        .route("/rpc/connectivity", axum::routing::post(routes::connectivity))
        .route("/rpc/status", axum::routing::get(routes::status))
        .with_state(state)
        .layer(cors);

    let addr = format!("127.0.0.1:{}", config.port);
    log::info!("Attribution Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutting down");
        })
        .await?;

    Ok(())
}
