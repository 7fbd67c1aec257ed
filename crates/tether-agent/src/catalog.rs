//! Demo local REST API served by the agent binary

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One entry of the agent's plugin catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginList {
    pub plugins: Vec<Plugin>,
}

/// `GET /v1/plugins` and `GET /v1/health`
pub fn catalog_router(plugins: Vec<Plugin>) -> Router {
    let catalog = Arc::new(PluginList { plugins });

    Router::new()
        .route("/v1/plugins", get(list_plugins))
        .route("/v1/health", get(health))
        .with_state(catalog)
}

async fn list_plugins(State(catalog): State<Arc<PluginList>>) -> Json<PluginList> {
    Json((*catalog).clone())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
