use actix_web::{middleware::Logger, web, App, HttpServer};
use realtime_messaging::{
    config, db, error, logging, routes,
    state::AppState,
    store::{MemoryStore, MessageStore, PgStore},
};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    let cfg = Arc::new(config::Config::from_env()?);
    logging::init_tracing(cfg.log_json);

    let store: Arc<dyn MessageStore> = match cfg.database_url.as_deref() {
        Some(url) => {
            let pool = db::create_pool(url, cfg.db_max_connections)
                .await
                .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| error::AppError::StartServer(format!("migrations: {e}")))?;
            tracing::info!("using postgres message store");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory message store");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::with_jwt(cfg.clone(), store);

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting realtime-messaging");

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind: {e}")))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(format!("server: {e}")))
}
