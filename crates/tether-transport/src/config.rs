//! Call transport configuration

use std::time::Duration;

/// Tuning knobs for a [`crate::CallTransport`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Default deadline applied by [`crate::CallTransport::call`]
    ///
    /// `None` waits until the response arrives or the connection closes.
    pub call_timeout: Option<Duration>,

    /// Depth of the outbound frame queue feeding the writer task
    pub outbound_queue: usize,

    /// Largest frame accepted from or sent to the connection
    pub max_frame_size: usize,
}

impl TransportConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            outbound_queue: 256,
            max_frame_size: tether_proto::MAX_FRAME_SIZE,
        }
    }
}
