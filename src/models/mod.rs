pub mod identity;
pub mod message;
pub mod room;

pub use identity::{Identity, KeyPair};
pub use message::{MessageView, StoredMessage};
pub use room::{Membership, Room};
