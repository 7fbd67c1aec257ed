//! Catalog aggregation across every live agent

use bytes::Bytes;
use futures::future::join_all;
use http::Request;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::session::Session;

/// Query `path` on every session and concatenate their `plugins` arrays
///
/// Sessions are queried concurrently. A session whose call fails, answers
/// with a non-2xx status, or returns something other than
/// `{"plugins": [...]}` contributes nothing; the aggregate itself never fails.
pub async fn aggregate(sessions: Vec<Arc<Session>>, path: &str) -> Vec<Value> {
    let queries = sessions.iter().map(|session| query(session, path));
    let results = join_all(queries).await;

    let mut merged = Vec::new();
    for (session, result) in sessions.iter().zip(results) {
        match result {
            Ok(mut items) => {
                debug!(name = %session.name(), count = items.len(), "Catalog collected");
                merged.append(&mut items);
            }
            Err(reason) => {
                warn!(name = %session.name(), reason = %reason, "Omitting agent from catalog");
            }
        }
    }
    merged
}

async fn query(session: &Session, path: &str) -> Result<Vec<Value>, String> {
    let request = Request::get(path)
        .header(http::header::ACCEPT, "application/json")
        .body(Bytes::new())
        .map_err(|e| e.to_string())?;

    let response = session.forward(request).await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("status {}", response.status()));
    }

    let body: Value = serde_json::from_slice(response.body()).map_err(|e| e.to_string())?;
    match body.get("plugins") {
        Some(Value::Array(items)) => Ok(items.clone()),
        _ => Err("response has no plugins array".to_string()),
    }
}
