//! Transport Channel: local datagram socket carrying LIPP requests and responses.
//!
//! Datagrams are bounded by `max_message_bytes`. Oversized outbound payloads
//! are refused before sending; oversized inbound datagrams are detected by
//! reading into a buffer one byte larger than the bound and rejected instead
//! of being handed on truncated.
//!
//! Two receive timeouts apply. The long `ready` timeout covers first contact
//! with a freshly spawned process; after the first successful read the
//! channel switches to the short `response` timeout until [`TransportChannel::rearm`].

use parking_lot::RwLock;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;

use super::address::LippAddress;
use crate::error::{UnitError, UnitResult};

const BIND_ATTEMPTS: u32 = 20;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(50);

// =============================================================================
// DatagramSocket
// =============================================================================

/// Non-blocking Unix datagram socket registered with the tokio reactor.
#[derive(Debug)]
pub struct DatagramSocket {
    inner: AsyncFd<UnixDatagram>,
    local: LippAddress,
    max_message_bytes: usize,
}

impl DatagramSocket {
    /// Bind `local`, retrying briefly while a previous owner releases the name.
    ///
    /// Stale socket files of filesystem addresses are removed first.
    pub async fn bind(local: &LippAddress, max_message_bytes: usize) -> io::Result<Self> {
        if let Some(path) = local.path() {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let addr = local.to_socket_addr()?;
        let mut attempt = 0;
        let socket = loop {
            match UnixDatagram::bind_addr(&addr) {
                Ok(socket) => break socket,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt + 1 < BIND_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(address = %local, attempt, "address in use, retrying bind");
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        };
        socket.set_nonblocking(true)?;

        Ok(Self {
            inner: AsyncFd::new(socket)?,
            local: local.clone(),
            max_message_bytes,
        })
    }

    /// Address this socket is bound to.
    pub fn local(&self) -> &LippAddress {
        &self.local
    }

    /// Send one datagram to `peer`.
    pub async fn send_to(&self, payload: &[u8], peer: &LippAddress) -> UnitResult<()> {
        if payload.len() > self.max_message_bytes {
            return Err(UnitError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_bytes,
            });
        }
        let addr = peer.to_socket_addr()?;
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to_addr(payload, &addr)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram, rejecting anything over the bound.
    pub async fn recv(&self) -> UnitResult<Vec<u8>> {
        let mut buf = vec![0u8; self.max_message_bytes + 1];
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv(&mut buf)) {
                Ok(result) => {
                    let n = result?;
                    if n > self.max_message_bytes {
                        return Err(UnitError::MessageTooLarge {
                            size: n,
                            max: self.max_message_bytes,
                        });
                    }
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Discard every datagram already queued, returning how many were dropped.
    pub fn drain(&self) -> usize {
        let mut buf = vec![0u8; self.max_message_bytes + 1];
        let mut dropped = 0;
        while self.inner.get_ref().recv(&mut buf).is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        if let Some(path) = self.local.path() {
            let _ = std::fs::remove_file(path);
        }
    }
}

// =============================================================================
// TransportChannel
// =============================================================================

/// Request/response channel between the unit and one driver process.
#[derive(Debug)]
pub struct TransportChannel {
    socket: RwLock<Option<Arc<DatagramSocket>>>,
    peer: LippAddress,
    equipment: String,
    ready_timeout: Duration,
    response_timeout: Duration,
    steady: AtomicBool,
}

impl TransportChannel {
    /// Wrap a bound socket talking to `peer`.
    pub fn new(
        socket: DatagramSocket,
        peer: LippAddress,
        equipment: impl Into<String>,
        ready_timeout: Duration,
        response_timeout: Duration,
    ) -> Self {
        Self {
            socket: RwLock::new(Some(Arc::new(socket))),
            peer,
            equipment: equipment.into(),
            ready_timeout,
            response_timeout,
            steady: AtomicBool::new(false),
        }
    }

    fn socket(&self) -> UnitResult<Arc<DatagramSocket>> {
        self.socket.read().clone().ok_or(UnitError::ShuttingDown)
    }

    /// Driver-side peer address.
    pub fn peer(&self) -> &LippAddress {
        &self.peer
    }

    /// Timeout the next receive will use.
    pub fn current_timeout(&self) -> Duration {
        if self.steady.load(Ordering::Acquire) {
            self.response_timeout
        } else {
            self.ready_timeout
        }
    }

    /// Go back to the long ready timeout for a new process incarnation.
    pub fn rearm(&self) {
        self.steady.store(false, Ordering::Release);
    }

    /// Send a payload to the driver process.
    ///
    /// Fails with [`UnitError::PeerUnavailable`] when nothing is bound at the peer address.
    pub async fn send(&self, payload: &[u8]) -> UnitResult<()> {
        let socket = self.socket()?;
        socket
            .send_to(payload, &self.peer)
            .await
            .map_err(|e| match e {
                UnitError::Io(io)
                    if matches!(
                        io.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    UnitError::PeerUnavailable {
                        equipment: self.equipment.clone(),
                        address: self.peer.to_string(),
                    }
                }
                other => other,
            })
    }

    /// Receive one datagram within the current timeout.
    pub async fn receive(&self) -> UnitResult<Vec<u8>> {
        let socket = self.socket()?;
        let waited = self.current_timeout();
        match tokio::time::timeout(waited, socket.recv()).await {
            Ok(Ok(bytes)) => {
                if !self.steady.swap(true, Ordering::AcqRel) {
                    tracing::debug!(
                        equipment = %self.equipment,
                        timeout = ?self.response_timeout,
                        "first contact, switching to response timeout"
                    );
                }
                Ok(bytes)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(UnitError::Timeout {
                equipment: self.equipment.clone(),
                waited,
            }),
        }
    }

    /// Drop late responses left over from timed-out exchanges.
    pub fn drain_stale(&self) {
        if let Ok(socket) = self.socket() {
            let dropped = socket.drain();
            if dropped > 0 {
                tracing::warn!(equipment = %self.equipment, dropped, "discarded stale datagrams");
            }
        }
    }

    /// Release the socket; later calls fail with [`UnitError::ShuttingDown`].
    pub fn close(&self) {
        self.socket.write().take();
    }

    /// Whether [`TransportChannel::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.socket.read().is_none()
    }
}
