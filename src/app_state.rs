use crate::chat_server::ChatServer;
use crate::config::Config;
use crate::directory::ProjectDirectory;
use crate::store::MessageStore;
use actix::Addr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub chat_server: Addr<ChatServer>,
    pub store: Arc<dyn MessageStore>,
    pub directory: Arc<dyn ProjectDirectory>,
    pub config: Config,
}
