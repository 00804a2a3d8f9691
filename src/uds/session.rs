use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use crate::bus::device::DriverBus;
use crate::bus::types::{hex_dump, request_id, response_id, BusMessage, CLIENT_NODE_ID};
use crate::bus::Channel;
use crate::config::SessionConfig;
use crate::uds::error::{NegativeResponseCode, UdsError};

/// Single driver read while polling for a response
const POLL_READ_TIMEOUT_MS: u32 = 10;
/// Pause between two empty polls
const POLL_SLEEP_MS: u64 = 5;
/// Upper bound for one drain pass. Foreign traffic may keep the queue busy indefinitely.
const DRAIN_DEADLINE_MS: u64 = 100;

/// Session open failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectError {
    #[error("Failed to open bus driver: {0}")]
    Driver(String),
    #[error("Invalid server node id {0}")]
    InvalidNodeId(u8),
}

/// Addressed client/server session on one bus. Owns the bus channel exclusively.
pub struct TransportSession<C: Channel> {
    channel: C,
    config: SessionConfig,
    bitrate_kbit: u32,
    tx_id: u32,
    rx_id: u32,
    timeout_ms: u32,
    closed: bool,
}

impl TransportSession<DriverBus> {
    /// Load and open the configured bus driver
    pub fn open(config: SessionConfig) -> Result<Self, ConnectError> {
        Self::open_with(config, |cfg, bitrate| {
            DriverBus::open(&cfg.driver_path, bitrate, cfg.bus_id)
        })
    }
}

impl<C: Channel> TransportSession<C> {
    /// Open a session over a channel produced by `connect`, which receives the effective bitrate
    pub fn open_with<F>(config: SessionConfig, connect: F) -> Result<Self, ConnectError>
    where
        F: FnOnce(&SessionConfig, u32) -> Result<C, String>,
    {
        if config.server_node_id >= CLIENT_NODE_ID {
            return Err(ConnectError::InvalidNodeId(config.server_node_id));
        }
        let bitrate = config.effective_bitrate();
        log::info!(
            "[Bus] Opening '{}' at {} kbit/s, bus {}, node {} -> {}",
            config.driver_path,
            bitrate,
            config.bus_id,
            config.client_node_id(),
            config.server_node_id
        );
        let channel = connect(&config, bitrate).map_err(ConnectError::Driver)?;
        Ok(Self::attach(channel, config, bitrate))
    }

    fn attach(channel: C, config: SessionConfig, bitrate_kbit: u32) -> Self {
        Self {
            channel,
            tx_id: request_id(config.server_node_id),
            rx_id: response_id(config.server_node_id),
            timeout_ms: config.polling_timeout_ms,
            bitrate_kbit,
            config,
            closed: false,
        }
    }

    /// Send a request and receive the response. NRC 0x78 (ResponsePending) keeps the wait
    /// going, but never beyond the active timeout.
    pub fn send_recv(&self, request: &[u8]) -> Result<Vec<u8>, UdsError> {
        let service_id = *request
            .first()
            .ok_or_else(|| UdsError::InvalidResponse("Empty request".into()))?;
        log::trace!("[Bus] TX {} {}", describe_service(service_id), hex_dump(request));

        let msg = BusMessage::new(self.tx_id, request)
            .map_err(|e| UdsError::TransportError(e.to_string()))?;
        self.channel
            .send(&msg, self.timeout_ms)
            .map_err(UdsError::TransportError)?;

        let timeout = Duration::from_millis(self.timeout_ms as u64);
        let start = Instant::now();

        loop {
            if start.elapsed() > timeout {
                log::debug!(
                    "[Bus] Timeout after {} ms waiting for {}",
                    self.timeout_ms,
                    describe_service(service_id)
                );
                return Err(UdsError::Timeout);
            }

            let msgs = self
                .channel
                .read(POLL_READ_TIMEOUT_MS)
                .map_err(UdsError::TransportError)?;

            for msg in msgs {
                if msg.id() != self.rx_id {
                    log::trace!("[Bus] Ignoring frame from 0x{:03X}", msg.id());
                    continue;
                }
                let payload = msg.payload();
                if payload.is_empty() {
                    continue;
                }

                // Check for negative response
                if payload[0] == 0x7F && payload.len() >= 3 {
                    let resp_service = payload[1];
                    let nrc = NegativeResponseCode::from_byte(payload[2]);

                    if nrc.is_pending() {
                        log::trace!("[Bus] Response pending...");
                        continue;
                    }

                    log::debug!("[Bus] RX {} NRC: {}", describe_service(resp_service), nrc);
                    return Err(UdsError::NegativeResponse {
                        service_id: resp_service,
                        nrc,
                    });
                }

                // Check for positive response (service_id + 0x40)
                let expected_response_id = service_id.wrapping_add(0x40);
                if payload[0] == expected_response_id {
                    log::trace!("[Bus] RX {} {}", describe_service(service_id), hex_dump(payload));
                    return Ok(payload.to_vec());
                }

                log::debug!(
                    "[Bus] Unexpected response: expected 0x{:02X}, got 0x{:02X}",
                    expected_response_id,
                    payload[0]
                );
            }

            std::thread::sleep(Duration::from_millis(POLL_SLEEP_MS));
        }
    }

    /// Send a functional request to every node on the bus
    pub fn broadcast(&self, request: &[u8]) -> Result<(), UdsError> {
        log::trace!("[Bus] TX broadcast {}", hex_dump(request));
        let msg = BusMessage::new_functional(request)
            .map_err(|e| UdsError::TransportError(e.to_string()))?;
        self.channel
            .send(&msg, self.timeout_ms)
            .map_err(UdsError::TransportError)
    }

    /// Discard everything received so far. Returns the number of frames read and discarded.
    /// Gives up after a short deadline when the bus never runs dry.
    pub fn drain_receive_queue(&self) -> usize {
        if let Err(e) = self.channel.clear_rx_buffer() {
            log::warn!("[Bus] Clearing receive buffer failed: {}", e);
        }
        let deadline = Duration::from_millis(DRAIN_DEADLINE_MS);
        let start = Instant::now();
        let mut discarded = 0;
        loop {
            if start.elapsed() > deadline {
                log::debug!("[Bus] Drain stopped after {} ms, bus still busy", DRAIN_DEADLINE_MS);
                break;
            }
            match self.channel.read(0) {
                Ok(msgs) if !msgs.is_empty() => discarded += msgs.len(),
                Ok(_) => break,
                Err(e) => {
                    log::warn!("[Bus] Read while draining failed: {}", e);
                    break;
                }
            }
        }
        if discarded > 0 {
            log::debug!("[Bus] Drained {} stale frames", discarded);
        }
        discarded
    }

    pub fn set_timeout(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }

    /// Back to the configured polling timeout
    pub fn reset_timeout(&mut self) {
        self.timeout_ms = self.config.polling_timeout_ms;
    }

    /// Raise the timeout until the returned guard is dropped
    pub fn scoped_timeout(&mut self, timeout_ms: u32) -> TimeoutGuard<'_, C> {
        self.set_timeout(timeout_ms);
        TimeoutGuard { session: self }
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn bitrate_kbit(&self) -> u32 {
        self.bitrate_kbit
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tx_id(&self) -> u32 {
        self.tx_id
    }

    pub fn rx_id(&self) -> u32 {
        self.rx_id
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Detach the transport and close the driver. Both steps always run; failures are only logged.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.channel.clear_rx_buffer() {
            log::warn!("[Bus] Detaching transport failed: {}", e);
        }
        if let Err(e) = self.channel.close() {
            log::warn!("[Bus] Closing bus driver failed: {}", e);
        }
        log::debug!("[Bus] Session to node {} closed", self.config.server_node_id);
    }
}

impl<C: Channel> Drop for TransportSession<C> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Restores the session's polling timeout when dropped
pub struct TimeoutGuard<'a, C: Channel> {
    session: &'a mut TransportSession<C>,
}

impl<C: Channel> Deref for TimeoutGuard<'_, C> {
    type Target = TransportSession<C>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<C: Channel> DerefMut for TimeoutGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<C: Channel> Drop for TimeoutGuard<'_, C> {
    fn drop(&mut self) {
        self.session.reset_timeout();
    }
}

fn describe_service(service_id: u8) -> String {
    match service_id {
        0x10 => "DiagnosticSessionControl".to_string(),
        0x11 => "ECUReset".to_string(),
        0x22 => "ReadDataByIdentifier".to_string(),
        0x27 => "SecurityAccess".to_string(),
        0x2E => "WriteDataByIdentifier".to_string(),
        0x31 => "RoutineControl".to_string(),
        0x34 => "RequestDownload".to_string(),
        0x36 => "TransferData".to_string(),
        0x37 => "RequestTransferExit".to_string(),
        0x3E => "TesterPresent".to_string(),
        _ => format!("Service 0x{:02X}", service_id),
    }
}
