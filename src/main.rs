use paperdesk::config::Config;
use paperdesk::services::{LedgerStore, MarkCache, TradingService};
use paperdesk::sources::PriceFeed;
use paperdesk::websocket::RoomManager;
use paperdesk::{app, AppState};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paperdesk=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    info!("Starting Paperdesk server on {}:{}", config.host, config.port);

    let store = Arc::new(LedgerStore::new(
        &config.database_path,
        config.fees,
        config.initial_balance,
    )?);
    info!(
        "Ledger at {} (fee rate {}, leverage {}, initial balance {})",
        config.database_path, config.fees.fee_rate, config.fees.leverage, config.initial_balance
    );

    let room_manager = RoomManager::new();
    let marks = MarkCache::new();
    let trading_service =
        TradingService::with_room_manager(store, marks.clone(), room_manager.clone());

    // Live marks drive bracket monitoring
    let feed = if config.feed.enabled {
        let (feed, ticks) = PriceFeed::new(config.feed.clone());
        tokio::spawn(trading_service.clone().run_tick_loop(ticks));

        let runner = feed.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!("Price feed terminated: {}", e);
            }
        });
        info!("Price feed tracking {:?}", config.feed.symbols);
        Some(feed)
    } else {
        info!("Price feed disabled");
        None
    };

    tokio::spawn(
        trading_service
            .clone()
            .run_pnl_broadcaster(config.pnl_broadcast_interval()),
    );

    let state = AppState {
        config: config.clone(),
        trading_service,
        room_manager,
        marks,
        feed: feed.clone(),
    };

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = app(state).layer(cors).layer(TraceLayer::new_for_http());

    // Start the server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Paperdesk server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            if let Some(feed) = feed {
                feed.stop();
            }
        })
        .await?;

    Ok(())
}
