pub mod handler;
mod wire;

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chorus_core::AppState;
use serde::Deserialize;

/// Largest inbound frame the gateway accepts.
const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct GatewayParams {
    pub token: Option<String>,
}

/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// peer address keys the connection rate limit.
pub fn gateway_router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<GatewayParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let credential = params.token.or_else(|| bearer_token(&headers));
    let address = peer.ip().to_string();
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handler::handle_connection(socket, state, credential, address))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_is_parsed() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer  abc "));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
