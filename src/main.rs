use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{extract::ConnectInfo, Router};
use axum_prometheus::PrometheusMetricLayer;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use entity_pubsub::changelog::ChangeLog;
use entity_pubsub::config::Config;
use entity_pubsub::connections::ConnectionManager;
use entity_pubsub::db;
use entity_pubsub::fanout::FanoutEngine;
use entity_pubsub::gateway;
use entity_pubsub::health;
use entity_pubsub::heartbeat;
use entity_pubsub::listener::NotifyListener;
use entity_pubsub::poller::PollWatcher;
use entity_pubsub::state::AppState;
use entity_pubsub::subscriptions::SubscriptionRegistry;

/// Restricts `/metrics` to loopback connections — the same guard the
/// teacher applies, generalised to this service's single metrics route.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "entity_pubsub=info,tower_http=info,sqlx=warn".parse().unwrap());

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("entity-pubsub starting");

    let config = Config::from_env().expect("failed to load configuration");
    info!("configuration loaded");

    let pool = db::create_pool(&config.database_url)
        .await
        .expect("failed to create database pool");

    db::run_migrations(&pool)
        .await
        .expect("failed to run database migrations");
    info!("database migrations applied");

    db::health_check(&pool)
        .await
        .expect("database health check failed");
    info!("database health check passed");

    let connections = ConnectionManager::new(config.outbound_byte_cap);
    let subscriptions = SubscriptionRegistry::new(pool.clone(), config.db_call_deadline);
    let change_log = ChangeLog::new(pool.clone(), config.db_call_deadline);
    let fanout = Arc::new(FanoutEngine::new(connections.clone(), subscriptions.clone()));
    let pod_id = Uuid::new_v4();

    let app_state = AppState {
        pool: pool.clone(),
        jwt_secret: Arc::from(config.jwt_secret.as_str()),
        connections: connections.clone(),
        subscriptions: subscriptions.clone(),
        change_log: change_log.clone(),
        fanout: fanout.clone(),
        pod_id,
        token_expiry_warning: config.token_expiry_warning,
        stale_subscription_window: config.stale_subscription_window,
        socket_write_deadline: config.socket_write_deadline,
    };

    let cancel = tokio_util::sync::CancellationToken::new();

    // Notify Listener (C5) — primary delivery path.
    let listener = NotifyListener::new(
        config.database_url.clone(),
        config.listen_channel.clone(),
        change_log.clone(),
        fanout.clone(),
        config.reconnect_base_delay,
        config.reconnect_attempt_ceiling,
    );
    tokio::spawn(listener.run(cancel.clone()));

    // Poll Watcher (C6) — delivery safety net.
    let poller = Arc::new(PollWatcher::new(
        change_log.clone(),
        fanout.clone(),
        config.poll_interval,
        config.poll_batch_size,
    ));
    tokio::spawn(poller.run(cancel.clone()));

    // Heartbeat writer — keeps this pod's connections claimed in the shared
    // heartbeat table so `cleanup_stale` doesn't reap them cross-pod.
    tokio::spawn(heartbeat::run(pool.clone(), connections.clone(), pod_id));

    // Token-expiry sweep (I2) + TOKEN_EXPIRING_SOON warning.
    tokio::spawn(gateway::run_expiry_sweep(app_state.clone(), cancel.clone()));

    // Stale-subscription reaper (spec section 4.3 invariant I3): runs far
    // less often than the heartbeat tick, since it only needs to catch
    // subscription rows nobody's heartbeat has touched in a while.
    let stale_subscriptions = subscriptions.clone();
    let stale_window = config.stale_subscription_window;
    let stale_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(stale_window);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stale_cancel.cancelled() => return,
            }
            match stale_subscriptions.cleanup_stale(stale_window).await {
                Ok(removed) if removed > 0 => {
                    tracing::debug!(removed, "reaped stale subscription rows");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = ?e, "stale-subscription sweep failed"),
            }
        }
    });

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(40)
            .finish()
            .expect("invalid governor configuration"),
    );

    let app = Router::new()
        .route("/health", get(health::health_check))
        .route("/ws", get(gateway::upgrade))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        .layer(GovernorLayer {
            config: governor_conf,
        })
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = config.server_addr();
    info!(%addr, "server listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel))
    .await
    .expect("server failed to start");
}

/// Resolves on Ctrl-C or SIGTERM, whichever comes first, and cancels the
/// Notify Listener / Poll Watcher / sweep tasks cooperatively (spec section
/// 5's `stop()`) before axum stops accepting new connections.
async fn shutdown_signal(cancel: tokio_util::sync::CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; stopping background tasks");
    cancel.cancel();
}
