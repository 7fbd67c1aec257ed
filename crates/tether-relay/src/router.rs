//! External HTTP surface of the relay

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use http::header::{HeaderName, CONNECTION};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::catalog;
use crate::config::RelayConfig;
use crate::error::RouteError;
use crate::registry::SessionRegistry;
use crate::server::agent_upgrade;
use crate::session::{Session, SessionState};

/// Query parameter naming the target agent; never forwarded
pub const ROUTING_PARAM: &str = "proxy_node";

/// Headers meaningful only for a single hop
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// State shared by all relay handlers
#[derive(Clone)]
pub struct RelayState {
    pub registry: SessionRegistry,
    pub config: Arc<RelayConfig>,
}

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/v1/{*path}", any(proxy))
        .route("/nodes", get(list_nodes))
        .route("/nodes/{name}", get(node_detail))
        .route("/catalog", get(aggregate_catalog))
        .route("/health", get(health))
        .route(&state.config.agent_path, get(agent_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Tunnel a request to the agent named by `proxy_node`
async fn proxy(State(state): State<RelayState>, request: Request) -> Result<Response, RouteError> {
    let (parts, body) = request.into_parts();

    let (target, remaining) = split_routing_param(parts.uri.query().unwrap_or(""));
    let name = target
        .filter(|name| !name.is_empty())
        .ok_or(RouteError::MissingRoutingTarget)?;
    let session = state
        .registry
        .get(&name)
        .ok_or_else(|| RouteError::UnknownAgent(name.clone()))?;

    let body = axum::body::to_bytes(body, state.config.body_limit)
        .await
        .map_err(|_| RouteError::BodyTooLarge)?;

    let target_uri = match remaining {
        Some(query) => format!("{}?{}", parts.uri.path(), query),
        None => parts.uri.path().to_string(),
    };
    let uri = target_uri
        .parse::<http::Uri>()
        .map_err(|e| RouteError::BadRequest(e.to_string()))?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    let client = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    if let Some(addr) = client {
        append_forwarded_for(&mut headers, addr);
    }

    let mut outbound = http::Request::new(body);
    *outbound.method_mut() = parts.method;
    *outbound.uri_mut() = uri;
    *outbound.headers_mut() = headers;

    debug!(agent = %name, method = %outbound.method(), uri = %outbound.uri(), "Forwarding");

    let response = session
        .forward(outbound)
        .await
        .map_err(|source| RouteError::Forward {
            agent: name.clone(),
            source,
        })?;

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Body::from(body)))
}

/// Pull the routing parameter out of a raw query string
///
/// Returns the first `proxy_node` value and the remaining pairs, untouched
/// and in their original order.
pub fn split_routing_param(query: &str) -> (Option<String>, Option<String>) {
    let mut target = None;
    let mut kept = Vec::new();

    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let decoded = url::form_urlencoded::parse(pair.as_bytes()).next();
        match decoded {
            Some((key, value)) if key == ROUTING_PARAM => {
                if target.is_none() {
                    target = Some(value.into_owned());
                }
            }
            _ => kept.push(pair),
        }
    }

    let remaining = if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    };
    (target, remaining)
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let prior: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let client = addr.ip().to_string();
    let value = if prior.is_empty() {
        client
    } else {
        format!("{}, {}", prior.join(", "), client)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

async fn list_nodes(State(state): State<RelayState>) -> Json<Vec<String>> {
    Json(state.registry.names())
}

#[derive(Debug, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub session_id: String,
    pub hostname: String,
    pub platform: String,
    pub version: String,
    pub labels: BTreeMap<String, String>,
    pub state: String,
    pub connected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_round_trip_ms: Option<u64>,
}

impl NodeInfo {
    fn from_session(session: &Session) -> Self {
        let metadata = session.metadata();
        let heartbeat = session.last_heartbeat();
        let state = match session.state() {
            SessionState::Connecting => "connecting".to_string(),
            SessionState::Active => "active".to_string(),
            SessionState::Terminated(reason) => format!("terminated ({})", reason),
        };

        Self {
            name: metadata.name.clone(),
            session_id: session.id().to_string(),
            hostname: metadata.hostname.clone(),
            platform: metadata.platform.clone(),
            version: metadata.version.clone(),
            labels: metadata.labels.clone(),
            state,
            connected_at: session.connected_at(),
            last_heartbeat_at: heartbeat.map(|h| h.at),
            last_round_trip_ms: heartbeat.map(|h| h.round_trip.as_millis() as u64),
        }
    }
}

async fn node_detail(
    State(state): State<RelayState>,
    Path(name): Path<String>,
) -> Result<Json<NodeInfo>, RouteError> {
    state
        .registry
        .get(&name)
        .map(|session| Json(NodeInfo::from_session(&session)))
        .ok_or(RouteError::UnknownAgent(name))
}

async fn aggregate_catalog(State(state): State<RelayState>) -> impl IntoResponse {
    let plugins = catalog::aggregate(state.registry.all(), &state.config.catalog_path).await;
    Json(serde_json::json!({ "plugins": plugins }))
}

async fn health(State(state): State<RelayState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "nodes": state.registry.len(),
        })),
    )
}
