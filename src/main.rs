use actix_web::{web, App, HttpServer};
use std::sync::Arc;

use securechat_gateway::services::directory::{Directory, PgDirectory};
use securechat_gateway::services::encryption::EncryptionManager;
use securechat_gateway::services::message_store::{MessageStore, PgMessageStore};
use securechat_gateway::websocket::RoomRegistry;
use securechat_gateway::{config, db, error, logging, routes, state::AppState};

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let pool = db::init_pool(&cfg.database_url).await?;
    db::ensure_schema(&pool).await?;

    let crypto = Arc::new(EncryptionManager::new(cfg.rsa_key_bits));
    let directory: Arc<dyn Directory> =
        Arc::new(PgDirectory::new(pool.clone(), crypto.clone()));
    let store: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(pool));
    let registry = RoomRegistry::new();

    let state = AppState {
        registry: registry.clone(),
        directory,
        store,
        crypto,
        config: cfg.clone(),
    };

    tracing::info!(port = cfg.port, "secure chat gateway listening");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(routes::wsroute::chat_ws)
    })
    .bind(("0.0.0.0", cfg.port))
    .map_err(|e| error::AppError::StartServer(e.to_string()))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(e.to_string()))?;

    // refuse new joins while the workers drain
    registry.shutdown().await;
    Ok(())
}
