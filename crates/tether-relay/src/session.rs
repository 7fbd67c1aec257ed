//! Relay-side handle on one connected agent

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Request, Response};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tether_proto::{
    decode_response_for, encode_request, methods, unix_millis, AgentMetadata, PROTOCOL_VERSION,
};
use tether_transport::CallTransport;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::SessionError;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    HeartbeatFailed(String),
    ConnectionClosed,
    Stopped,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::HeartbeatFailed(e) => write!(f, "heartbeat failed: {}", e),
            TerminationReason::ConnectionClosed => write!(f, "connection closed"),
            TerminationReason::Stopped => write!(f, "stopped"),
        }
    }
}

/// Connecting -> Active -> Terminated, never back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Terminated(TerminationReason),
}

/// Last successful heartbeat
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSample {
    pub at: DateTime<Utc>,
    pub round_trip: Duration,
    /// Agent clock (unix millis) when it answered
    pub agent_time: u64,
}

/// One connected agent
pub struct Session {
    id: Uuid,
    metadata: AgentMetadata,
    transport: CallTransport,
    config: SessionConfig,
    connected_at: DateTime<Utc>,
    last_heartbeat: Mutex<Option<HeartbeatSample>>,
    state: watch::Sender<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.metadata.name)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Session {
    /// Wrap a transport whose agent has already identified itself
    pub fn new(
        id: Uuid,
        metadata: AgentMetadata,
        transport: CallTransport,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Connecting);
        Arc::new(Self {
            id,
            metadata,
            transport,
            config,
            connected_at: Utc::now(),
            last_heartbeat: Mutex::new(None),
            state,
        })
    }

    /// Ask a freshly connected agent who it is
    ///
    /// The transport must already be serving. The session id is sent as the
    /// caller id so the agent can log which session it belongs to.
    pub async fn identify(
        transport: CallTransport,
        config: SessionConfig,
    ) -> Result<Arc<Self>, SessionError> {
        let id = Uuid::new_v4();
        let metadata: AgentMetadata = transport
            .call_typed(
                methods::METADATA,
                &id.to_string(),
                Some(config.identity_timeout),
            )
            .await?;

        if metadata.name.trim().is_empty() {
            return Err(SessionError::InvalidIdentity(
                "agent reported an empty name".to_string(),
            ));
        }
        if metadata.protocol_version != PROTOCOL_VERSION {
            return Err(SessionError::InvalidIdentity(format!(
                "agent speaks protocol {}, relay speaks {}",
                metadata.protocol_version, PROTOCOL_VERSION
            )));
        }

        debug!(
            session_id = %id,
            name = %metadata.name,
            hostname = %metadata.hostname,
            "Agent identified"
        );

        Ok(Self::new(id, metadata, transport, config))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Registry key
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &AgentMetadata {
        &self.metadata
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_heartbeat(&self) -> Option<HeartbeatSample> {
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::Active)
    }

    /// Tunnel one HTTP exchange to the agent
    pub async fn forward(&self, request: Request<Bytes>) -> Result<Response<Bytes>, SessionError> {
        let method = request.method().clone();
        let payload = encode_request(&request);
        let reply = self
            .transport
            .call_with_timeout(methods::HANDLE, payload, Some(self.config.forward_timeout))
            .await?;

        decode_response_for(&method, &reply)
            .map_err(|e| SessionError::MalformedResponse(e.to_string()))
    }

    /// Issue one heartbeat call, timed out after one heartbeat interval
    pub async fn heartbeat(&self) -> Result<Duration, SessionError> {
        let started = Instant::now();
        let agent_time: u64 = self
            .transport
            .call_typed(
                methods::HEARTBEAT,
                &unix_millis(),
                Some(self.config.heartbeat_interval),
            )
            .await?;
        let round_trip = started.elapsed();

        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Some(HeartbeatSample {
            at: Utc::now(),
            round_trip,
            agent_time,
        });

        Ok(round_trip)
    }

    /// Enter Active and start the heartbeat task
    ///
    /// Called once the session is in the registry. Returns false if the
    /// session already terminated.
    pub fn activate(self: &Arc<Self>) -> bool {
        let activated = self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });

        if activated {
            info!(
                session_id = %self.id,
                name = %self.metadata.name,
                "Session active"
            );
            tokio::spawn(self.clone().heartbeat_loop());
        }
        activated
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.transport.closed() => {
                    self.terminate(TerminationReason::ConnectionClosed);
                    break;
                }
                _ = ticker.tick() => {
                    match self.heartbeat().await {
                        Ok(rtt) => debug!(name = %self.metadata.name, rtt_ms = rtt.as_millis() as u64, "Heartbeat"),
                        Err(e) => {
                            warn!(name = %self.metadata.name, error = %e, "Heartbeat failed");
                            self.terminate(TerminationReason::HeartbeatFailed(e.to_string()));
                            break;
                        }
                    }
                }
            }
        }

        debug!(session_id = %self.id, "Heartbeat task ended");
    }

    /// Move to Terminated and close the connection; later calls are no-ops
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Terminated(_)) {
                return false;
            }
            *state = SessionState::Terminated(reason.clone());
            true
        });

        if changed {
            info!(
                session_id = %self.id,
                name = %self.metadata.name,
                reason = %reason,
                "Session terminated"
            );
            // Fails every in-flight forward/heartbeat with Disconnected
            self.transport.stop();
        }
        changed
    }

    /// Explicit stop
    pub fn stop(&self) {
        self.terminate(TerminationReason::Stopped);
    }

    /// Wait for the session to reach Terminated
    pub async fn terminated(&self) -> TerminationReason {
        let mut rx = self.state.subscribe();
        let result = rx
            .wait_for(|state| matches!(state, SessionState::Terminated(_)))
            .await
            .map(|state| state.clone());

        match result {
            Ok(SessionState::Terminated(reason)) => reason,
            // The sender lives in self, so the channel cannot close while we wait
            _ => TerminationReason::Stopped,
        }
    }
}
