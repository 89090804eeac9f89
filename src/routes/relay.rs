//! OpenAI-compatible relay endpoints.
//!
//! Every endpoint shares one handler; the relay mode comes from the path.

use std::net::SocketAddr;

use axum::{
    Extension,
    body::Bytes,
    extract::{ConnectInfo, OriginalUri, State},
    http::{HeaderMap, header::USER_AGENT},
    response::Response,
};

use crate::{
    AppState,
    api_types::RelayMode,
    middleware::RequestId,
    relay::{Caller, RelayError, RequestMeta},
};

pub const CONVERSATION_ID_HEADER: &str = "X-Conversation-ID";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

pub(crate) fn request_meta(
    headers: &HeaderMap,
    request_id: Option<&RequestId>,
    peer: Option<SocketAddr>,
) -> RequestMeta {
    RequestMeta {
        request_id: request_id
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| RequestId::new().0),
        client_ip: client_ip(headers, peer),
        user_agent: header_str(headers, USER_AGENT.as_str())
            .unwrap_or_default()
            .to_string(),
        conversation_header: header_str(headers, CONVERSATION_ID_HEADER).map(str::to_string),
    }
}

#[tracing::instrument(name = "relay.handler", skip_all, fields(path = %uri.path()))]
pub async fn relay(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    request_id: Option<Extension<RequestId>>,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let mode = RelayMode::from_path(uri.path());
    let meta = request_meta(
        &headers,
        request_id.as_ref().map(|Extension(id)| id),
        peer.map(|Extension(ConnectInfo(addr))| addr),
    );
    state.pipeline.relay(caller, meta, mode, body).await
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.9");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "127.0.0.1");
        assert_eq!(client_ip(&HeaderMap::new(), None), "");
    }

    #[test]
    fn test_request_meta_reads_conversation_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CONVERSATION_ID_HEADER, HeaderValue::from_static("conv-42"));
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8"));

        let meta = request_meta(&headers, Some(&RequestId("req-1".into())), None);
        assert_eq!(meta.request_id, "req-1");
        assert_eq!(meta.user_agent, "curl/8");
        assert_eq!(meta.conversation_header.as_deref(), Some("conv-42"));
    }
}
