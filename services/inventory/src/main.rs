use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use event_bus::{EventBus, InMemoryBus, NatsBus};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use inventory::config::Config;
use inventory::events::consumer_tasks;
use inventory::events::outbox::{run_publisher_task, Outbox, PostgresOutbox};
use inventory::handlers::InventoryService;
use inventory::routes::inventory_router;
use inventory::store::{InventoryStore, PostgresInventoryStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().expect("invalid configuration");

    let db = PgPoolOptions::new()
        .max_connections(if config.is_test { 5 } else { 10 })
        .connect(&config.database_url)
        .await
        .expect("failed to connect to Postgres");

    sqlx::migrate!("./db/migrations")
        .run(&db)
        .await
        .expect("failed to run database migrations");
    tracing::info!("inventory migrations applied");

    let event_bus: Arc<dyn EventBus> = match config.bus_type.to_lowercase().as_str() {
        "nats" => {
            tracing::info!(nats_url = %config.nats_url, "connecting to NATS");
            let client = async_nats::connect(&config.nats_url)
                .await
                .expect("failed to connect to NATS");
            Arc::new(NatsBus::new(client))
        }
        _ => {
            tracing::info!("using in-memory event bus");
            Arc::new(InMemoryBus::new())
        }
    };

    let store: Arc<dyn InventoryStore> = Arc::new(PostgresInventoryStore::new(db.clone()));
    let outbox: Arc<dyn Outbox> = Arc::new(PostgresOutbox::new(db.clone()));
    let ledger = entity_store::PostgresIdempotencyLedger::new(db.clone(), "applied_compensations");
    let service = Arc::new(InventoryService::new(store, outbox, Arc::new(ledger)));

    tokio::spawn({
        let publisher_db = db.clone();
        let publisher_bus = event_bus.clone();
        let publisher_token = config.bus_auth_token.clone();
        async move { run_publisher_task(publisher_db, publisher_bus, publisher_token).await }
    });

    let consumer_ledger: Arc<dyn entity_store::IdempotencyLedger> =
        Arc::new(entity_store::PostgresIdempotencyLedger::new(db.clone(), "processed_events"));
    consumer_tasks::spawn_all(event_bus.clone(), service.clone(), consumer_ledger);

    let app = Router::new()
        .merge(health::health_router("inventory", env!("CARGO_PKG_VERSION")))
        .merge(inventory_router())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port)
        .parse()
        .expect("invalid HTTP_PORT");
    tracing::info!(%addr, "inventory listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .await
        .expect("server error");
}
