use bytes::Bytes;
use http::{Request, StatusCode};
use std::time::Duration;
use tether_agent::{catalog_router, Agent, AgentConfig, AgentError, Plugin, TowerService};
use tether_proto::{decode_response, encode_request, methods, unix_millis, AgentMetadata};
use tether_transport::{CallTransport, TransportConfig};
use tether_transport_websocket::WebSocketConnection;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A bare relay stand-in: accepts one agent and hands back its call transport
async fn fake_relay() -> (String, oneshot::Receiver<CallTransport>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let transport = CallTransport::new(TransportConfig::default());
        let _ = tx.send(transport.clone());
        let _ = transport.serve(WebSocketConnection::new(ws)).await;
    });

    (format!("ws://{}/ws", addr), rx)
}

fn plugins() -> Vec<Plugin> {
    vec![Plugin {
        name: "disk".to_string(),
        version: "0.3.1".to_string(),
        description: Some("disk usage".to_string()),
    }]
}

#[tokio::test]
async fn test_agent_answers_relay_calls() {
    init_tracing();
    let (url, relay) = fake_relay().await;

    let config = AgentConfig {
        name: "node-a".to_string(),
        relay_url: url,
        ..Default::default()
    };
    let handle = Agent::connect(config, TowerService::router(catalog_router(plugins())))
        .await
        .unwrap();
    let relay = relay.await.unwrap();

    let metadata: AgentMetadata = relay
        .call_typed(methods::METADATA, &"session-1".to_string(), None)
        .await
        .unwrap();
    assert_eq!(metadata.name, "node-a");

    let before = unix_millis();
    let stamp: u64 = relay
        .call_typed(methods::HEARTBEAT, &before, None)
        .await
        .unwrap();
    assert!(stamp >= before);

    let request = Request::get("/v1/plugins").body(Bytes::new()).unwrap();
    let reply = relay
        .call(methods::HANDLE, encode_request(&request))
        .await
        .unwrap();
    let response = decode_response(&reply).unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["plugins"][0]["name"], "disk");

    handle.stop();
    tokio::time::timeout(Duration::from_secs(2), handle.closed())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_agent_labels_reported() {
    init_tracing();
    let (url, relay) = fake_relay().await;

    let mut config = AgentConfig {
        name: "node-b".to_string(),
        relay_url: url,
        ..Default::default()
    };
    config.labels.insert("region".to_string(), "eu-west".to_string());

    let _handle = Agent::connect(config, TowerService::router(catalog_router(Vec::new())))
        .await
        .unwrap();
    let relay = relay.await.unwrap();

    let metadata: AgentMetadata = relay
        .call_typed(methods::METADATA, &String::new(), None)
        .await
        .unwrap();
    assert_eq!(metadata.labels.get("region").map(String::as_str), Some("eu-west"));
}

#[tokio::test]
async fn test_relay_disconnect_ends_agent() {
    init_tracing();
    let (url, relay) = fake_relay().await;

    let config = AgentConfig {
        name: "node-c".to_string(),
        relay_url: url,
        ..Default::default()
    };
    let handle = Agent::connect(config, TowerService::router(catalog_router(Vec::new())))
        .await
        .unwrap();

    relay.await.unwrap().stop();

    tokio::time::timeout(Duration::from_secs(2), handle.closed())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_connect_failure_is_returned() {
    init_tracing();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let config = AgentConfig {
        name: "node-d".to_string(),
        relay_url: format!("ws://127.0.0.1:{}/ws", port),
        ..Default::default()
    };
    let result = Agent::connect(config, TowerService::router(catalog_router(Vec::new()))).await;

    assert!(matches!(result, Err(AgentError::Connect { .. })));
}

#[tokio::test]
async fn test_empty_name_rejected() {
    init_tracing();
    let config = AgentConfig {
        name: "  ".to_string(),
        ..Default::default()
    };
    let result = Agent::connect(config, TowerService::router(catalog_router(Vec::new()))).await;

    assert!(matches!(result, Err(AgentError::InvalidConfig(_))));
}
