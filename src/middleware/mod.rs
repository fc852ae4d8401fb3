pub mod auth;

pub use auth::{verify_jwt, Claims};
