use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;

use crate::middleware::auth;
use crate::state::AppState;
use crate::websocket::session::{Gate, WsSession};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Decide the session's fate before the actor starts.
///
/// The upstream issuer has already validated credentials; this only reads
/// the token's identity and resolves it against the directory. Failures
/// become a 401 close frame, not a refused handshake, so the client always
/// gets a protocol-level close code.
async fn resolve_gate(
    req: &HttpRequest,
    query_token: Option<&str>,
    peer_username: String,
    state: &AppState,
) -> Gate {
    let token = auth::bearer_token(req).or_else(|| query_token.map(|t| t.to_string()));

    let Some(token) = token else {
        return Gate::Rejected {
            code: 401,
            reason: "not authenticated".into(),
        };
    };

    let claims = match auth::verify_jwt(&token, &state.config.jwt_secret) {
        Ok(claims) => claims,
        Err(_) => {
            return Gate::Rejected {
                code: 401,
                reason: "not authenticated".into(),
            }
        }
    };

    match state.directory.identity_by_id(claims.user_id).await {
        Ok(Some(identity)) => Gate::Authenticated {
            identity,
            peer_username,
        },
        Ok(None) => Gate::Rejected {
            code: 401,
            reason: "not authenticated".into(),
        },
        Err(e) => {
            tracing::error!(error = %e, "directory lookup failed during gate");
            Gate::Rejected {
                code: 500,
                reason: "directory unavailable".into(),
            }
        }
    }
}

#[get("/chat/{peer_username}")]
pub async fn chat_ws(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    query: web::Query<WsQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let peer_username = path.into_inner();
    let gate = resolve_gate(&req, query.token.as_deref(), peer_username, state.get_ref()).await;
    ws::start(WsSession::new(state.get_ref().clone(), gate), &req, stream)
}
