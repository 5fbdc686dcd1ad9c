//! Probe Channel: unsolicited liveness datagrams pushed by the driver process.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use super::protocol::ProbeMessage;
use super::transport::DatagramSocket;
use crate::error::{UnitError, UnitResult};

/// Receiving end of the probe socket.
#[derive(Debug)]
pub struct ProbeChannel {
    socket: RwLock<Option<Arc<DatagramSocket>>>,
    equipment: String,
    timeout: Duration,
}

impl ProbeChannel {
    /// Wrap a bound probe socket.
    pub fn new(socket: DatagramSocket, equipment: impl Into<String>, timeout: Duration) -> Self {
        Self {
            socket: RwLock::new(Some(Arc::new(socket))),
            equipment: equipment.into(),
            timeout,
        }
    }

    /// Silence tolerated before [`UnitError::Timeout`].
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the next probe message.
    pub async fn receive(&self) -> UnitResult<ProbeMessage> {
        let socket = self.socket.read().clone().ok_or(UnitError::ShuttingDown)?;
        match tokio::time::timeout(self.timeout, socket.recv()).await {
            Ok(bytes) => ProbeMessage::parse(&bytes?, &self.equipment),
            Err(_) => Err(UnitError::Timeout {
                equipment: self.equipment.clone(),
                waited: self.timeout,
            }),
        }
    }

    /// Release the socket.
    pub fn close(&self) {
        self.socket.write().take();
    }
}
