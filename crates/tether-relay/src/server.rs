//! Relay server: agent WebSocket accept plus the external HTTP surface

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::header::AUTHORIZATION;
use http::{Extensions, HeaderMap, StatusCode};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_transport::{CallTransport, DuplexConnection};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::registry::SessionRegistry;
use crate::router::{build_router, RelayState};
use crate::session::Session;
use crate::ws::AgentSocket;

/// The relay
pub struct RelayServer {
    state: RelayState,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: RelayState {
                registry: SessionRegistry::new(),
                config: Arc::new(config),
            },
        }
    }

    pub fn registry(&self) -> SessionRegistry {
        self.state.registry.clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.state.config
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.state.config.validate()?;
        let addr = self.state.config.listen_addr;

        if self.state.config.tls_enabled() {
            return self.run_tls(addr, shutdown).await;
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        self.serve(listener, shutdown).await
    }

    /// Serve plain HTTP/WS on an already bound listener
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.state.config.validate()?;
        info!(
            "Relay listening on http://{} (agents on {})",
            listener.local_addr()?,
            self.state.config.agent_path
        );

        let registry = self.registry();
        let app = self.router();

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            stop_all(&registry);
        })
        .await?;

        info!("Relay stopped");
        Ok(())
    }

    async fn run_tls<F>(self, addr: SocketAddr, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (cert, key) = match (&self.state.config.tls_cert, &self.state.config.tls_key) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => return Err(RelayError::Tls("certificate and key are both required".into())),
        };

        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
            .await
            .map_err(|e| {
                RelayError::Tls(format!(
                    "failed to load {} / {}: {}",
                    cert.display(),
                    key.display(),
                    e
                ))
            })?;

        let handle = axum_server::Handle::new();
        {
            let handle = handle.clone();
            let registry = self.registry();
            tokio::spawn(async move {
                shutdown.await;
                stop_all(&registry);
                handle.graceful_shutdown(Some(Duration::from_secs(10)));
            });
        }

        info!(
            "Relay listening on https://{} (agents on {})",
            addr, self.state.config.agent_path
        );

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(
                self.router()
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await?;

        info!("Relay stopped");
        Ok(())
    }
}

fn stop_all(registry: &SessionRegistry) {
    let sessions = registry.all();
    if !sessions.is_empty() {
        info!("Disconnecting {} agent(s)", sessions.len());
    }
    for session in sessions {
        session.stop();
    }
}

fn authorized(config: &RelayConfig, headers: &HeaderMap) -> bool {
    let Some(token) = &config.agent_token else {
        return true;
    };

    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == token)
}

/// `GET <agent path>`: upgrade an agent connection
pub(crate) async fn agent_upgrade(
    State(state): State<RelayState>,
    headers: HeaderMap,
    extensions: Extensions,
    ws: WebSocketUpgrade,
) -> Response {
    let remote = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    if !authorized(&state.config, &headers) {
        warn!(remote = ?remote, "Rejected agent without a valid token");
        return (StatusCode::UNAUTHORIZED, "missing or invalid agent token").into_response();
    }

    ws.max_message_size(state.config.transport.max_frame_size)
        .on_upgrade(move |socket| handle_agent(state, socket, remote))
}

/// Drive one agent connection from identity call to eviction
async fn handle_agent(state: RelayState, socket: WebSocket, remote: Option<SocketAddr>) {
    let connection = AgentSocket::new(socket, remote);
    let connection_id = connection.connection_id();
    debug!("[{}] Agent connected", connection_id);

    let transport = CallTransport::new(state.config.transport.clone());
    let serve = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.serve(connection).await })
    };

    let session = match Session::identify(transport.clone(), state.config.session.clone()).await {
        Ok(session) => session,
        Err(e) => {
            warn!("[{}] Agent failed to identify: {}", connection_id, e);
            transport.stop();
            let _ = serve.await;
            return;
        }
    };

    state.registry.put(session.clone());
    session.activate();

    let reason = session.terminated().await;
    state.registry.remove_if_current(&session);

    match serve.await {
        Ok(Err(e)) => debug!("[{}] Serve loop ended with error: {}", connection_id, e),
        Err(e) => warn!("[{}] Serve loop panicked: {}", connection_id, e),
        Ok(Ok(())) => {}
    }

    info!(
        name = %session.name(),
        session_id = %session.id(),
        reason = %reason,
        "Agent disconnected"
    );
}
