pub mod directory;
pub mod encryption;
pub mod memory;
pub mod message_store;

pub use directory::{Directory, PgDirectory};
pub use encryption::{EncryptionManager, Envelope};
pub use message_store::{MessageStore, PgMessageStore};
