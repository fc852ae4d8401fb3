use std::sync::Arc;

use crate::config::Config;
use crate::services::directory::Directory;
use crate::services::encryption::EncryptionManager;
use crate::services::message_store::MessageStore;
use crate::websocket::RoomRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: RoomRegistry,
    pub directory: Arc<dyn Directory>,
    pub store: Arc<dyn MessageStore>,
    pub crypto: Arc<EncryptionManager>,
    pub config: Arc<Config>,
}
