// src/main.rs

use std::sync::Arc;

use actix::Actor;
use actix_cors::Cors;
use actix_web::{http, middleware::Logger, web, App, HttpServer};
use env_logger::Env;
use log::{info, warn};

use taskline_chat::auth::Authentication;
use taskline_chat::chat_db::MongoDB;
use taskline_chat::chat_server::ChatServer;
use taskline_chat::directory::{InMemoryDirectory, MongoDirectory, ProjectDirectory};
use taskline_chat::store::{InMemoryMessageStore, MessageStore, MongoMessageStore};
use taskline_chat::{routes, AppState, ChatError, Config};

fn io_error(e: ChatError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

async fn backends(
    config: &Config,
) -> Result<(Arc<dyn MessageStore>, Arc<dyn ProjectDirectory>), ChatError> {
    match &config.mongo_uri {
        Some(uri) => {
            let mongodb = MongoDB::init(uri, &config.database_name).await?;
            let store = MongoMessageStore::new(&mongodb, config.max_message_len);
            store.ensure_indexes().await?;
            Ok((Arc::new(store), Arc::new(MongoDirectory::new(&mongodb))))
        }
        None => {
            warn!("MONGO_URI is not set: using the in-memory store, every user may join every room");
            Ok((
                Arc::new(InMemoryMessageStore::new(config.max_message_len)),
                Arc::new(InMemoryDirectory::open()),
            ))
        }
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Config::from_env().map_err(io_error)?;
    let (store, directory) = backends(&config).await.map_err(io_error)?;

    // Start the ChatServer actor
    let chat_server = ChatServer::new(store.clone(), directory.clone()).start();

    info!("Server running at http://{}", config.bind_addr);
    info!("Allowed CORS Origin: {}", config.frontend_origin);

    let state = AppState {
        chat_server,
        store,
        directory,
        config: config.clone(),
    };

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&state.config.frontend_origin)
            .allowed_methods(vec!["GET", "POST", "OPTIONS"])
            .allowed_headers(vec![
                http::header::CONTENT_TYPE,
                http::header::ACCEPT,
                http::header::AUTHORIZATION,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .wrap(Authentication::new(&state.config.jwt_secret))
            .app_data(web::Data::new(state.clone()))
            .configure(routes)
    })
    .bind(&config.bind_addr)?
    .run()
    .await
}
