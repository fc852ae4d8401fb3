use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("no shared room with {0}")]
    NoSharedRoom(String),

    #[error("fan-out backend unavailable")]
    FanoutUnavailable,

    #[error("encryption failure: {0}")]
    Encryption(String),

    #[error("decryption failure: {0}")]
    Decryption(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("message {0} not found")]
    MessageNotFound(i64),
}

impl AppError {
    /// WebSocket close code for errors that terminate a session.
    ///
    /// The handshake always completes; rejections are delivered as a close
    /// frame so the client can distinguish auth failures from room failures.
    pub fn close_code(&self) -> u16 {
        match self {
            AppError::Unauthenticated => 401,
            AppError::NoSharedRoom(_) | AppError::MessageNotFound(_) => 400,
            _ => 500,
        }
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Database(e.to_string())
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let body = serde_json::json!({ "error": self.to_string() });
        match self.close_code() {
            400 => HttpResponse::BadRequest().json(body),
            401 => HttpResponse::Unauthorized().json(body),
            _ => HttpResponse::InternalServerError().json(body),
        }
    }
}
