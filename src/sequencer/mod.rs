//! Firmware update state machine.
//!
//! `UpdateSequencer` owns one transport session and walks a device from its
//! application into the flashloader, through authentication and block
//! transfer, back to a reset. Every step reports before and after running.

pub mod identity;
pub mod report;
#[cfg(test)]
pub(crate) mod sim;

use std::thread;
use std::time::{Duration, Instant};

use crate::bus::device::DriverBus;
use crate::bus::types::MAX_PAYLOAD_SIZE;
use crate::bus::Channel;
use crate::config::{SessionConfig, Timings};
use crate::error::{FlashError, ResultCode};
use crate::fleet::CancelFlag;
use crate::image::{FirmwareImage, ReadError};
use crate::timeout::adapted_transfer_timeout;
use crate::uds::error::{NegativeResponseCode, UdsError};
use crate::uds::services::{self, did, DiagSession, ResetType};
use crate::uds::session::TransportSession;

pub use self::identity::DeviceIdentity;
pub use self::report::{LogReporter, ProgressReporter, TransferProgress};

/// Seed the non-secure handshake expects
pub const EXPECTED_SEED: u32 = 0x0000_002A;
/// Key answering the non-secure seed
pub const FIXED_KEY: [u8; 4] = [0x00, 0x00, 0x00, 0x2A];
/// First request plus one retry after "required time delay not expired"
const SEED_REQUEST_ATTEMPTS: u8 = 2;
/// Bytes of each TransferData frame reserved for framing
const TRANSFER_FRAME_OVERHEAD: u32 = 5;
const MAX_USERNAME_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Connected,
    FlashloaderActive,
    SessionProgramming,
    Authenticated,
    Transferring { block: usize },
    Finalized,
    Done,
    Error(ResultCode),
}

pub struct UpdateSequencer<C: Channel, R: ProgressReporter> {
    session: Option<TransportSession<C>>,
    reporter: R,
    timings: Timings,
    state: SequencerState,
    identity: Option<DeviceIdentity>,
}

impl<R: ProgressReporter> UpdateSequencer<DriverBus, R> {
    /// Open the configured bus driver
    pub fn init(&mut self, config: SessionConfig) -> Result<(), FlashError> {
        self.init_with(config, |cfg, bitrate| {
            DriverBus::open(&cfg.driver_path, bitrate, cfg.bus_id)
        })
    }
}

impl<C: Channel, R: ProgressReporter> UpdateSequencer<C, R> {
    pub fn new(reporter: R, timings: Timings) -> Self {
        Self {
            session: None,
            reporter,
            timings,
            state: SequencerState::Idle,
            identity: None,
        }
    }

    /// Open a session over a channel built by `connect`. Stays `Idle` on failure.
    pub fn init_with<F>(&mut self, config: SessionConfig, connect: F) -> Result<(), FlashError>
    where
        F: FnOnce(&SessionConfig, u32) -> Result<C, String>,
    {
        if self.session.is_some() {
            return Err(FlashError::InvalidState(self.state));
        }
        let node = config.server_node_id;
        self.reporter
            .on_progress(ResultCode::Ok, &format!("Connecting to node {}...", node));
        match TransportSession::open_with(config, connect) {
            Ok(session) => {
                self.session = Some(session);
                self.identity = None;
                self.state = SequencerState::Connected;
                self.reporter
                    .on_progress(ResultCode::Ok, &format!("Connected to node {}", node));
                Ok(())
            }
            Err(e) => {
                let err = FlashError::from(e);
                log::error!("[Sequencer] {}", err);
                self.reporter.on_progress(err.code(), &err.to_string());
                self.state = SequencerState::Idle;
                Err(err)
            }
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn session(&self) -> Option<&TransportSession<C>> {
        self.session.as_ref()
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn reporter_mut(&mut self) -> &mut R {
        &mut self.reporter
    }

    /// Bring the device into its flashloader and the preprogramming session.
    ///
    /// The request-programming routine and the reset are best effort: a
    /// device can also be power cycled by hand while the broadcast loop runs.
    /// The loop lasts at least `max(wait_time_ms, activation floor)`.
    pub fn activate_flashloader(&mut self, wait_time_ms: u64) -> Result<(), FlashError> {
        self.require(|s| {
            matches!(
                s,
                SequencerState::Connected | SequencerState::FlashloaderActive
            )
        })?;
        self.run_step("Activate flashloader", true, |seq| {
            let session = seq.session.as_ref().ok_or(FlashError::NotConnected)?;

            if let Err(e) = services::request_programming(session) {
                log::warn!("[Sequencer] Request programming rejected: {}", e);
                seq.reporter.on_progress(
                    ResultCode::Ok,
                    &format!("Request programming rejected ({}), reset the device manually", e),
                );
            }
            if let Err(e) = services::ecu_reset(session, ResetType::ResetToFlashloader) {
                log::warn!("[Sequencer] Reset to flashloader rejected: {}", e);
                seq.reporter.on_progress(
                    ResultCode::Ok,
                    &format!("Reset to flashloader rejected ({}), reset the device manually", e),
                );
            }

            let duration = Duration::from_millis(wait_time_ms.max(seq.timings.activation_floor_ms));
            let interval = Duration::from_millis(seq.timings.broadcast_interval_ms);
            let start = Instant::now();
            let mut broadcasts = 0u32;
            let last = loop {
                let result = services::broadcast_preprogramming(session);
                broadcasts += 1;
                if result.is_err() || start.elapsed() >= duration {
                    break result;
                }
                thread::sleep(interval);
            };
            let drained = session.drain_receive_queue();
            log::debug!(
                "[Sequencer] {} preprogramming broadcasts in {} ms, {} stale frames drained",
                broadcasts,
                start.elapsed().as_millis(),
                drained
            );
            last.map_err(|e| FlashError::com("Preprogramming broadcast", e))
        })?;
        self.state = SequencerState::FlashloaderActive;
        Ok(())
    }

    /// Read the complete identity. Nothing is kept if any read fails.
    pub fn read_device_information(&mut self) -> Result<DeviceIdentity, FlashError> {
        self.require(|s| !matches!(s, SequencerState::Idle | SequencerState::Error(_)))?;
        self.identity = None;
        let identity = self.run_step("Read device information", true, |seq| {
            let session = seq.session.as_ref().ok_or(FlashError::NotConnected)?;
            identity::read(session)
        })?;
        self.reporter
            .on_device_info(&identity.device_name, &identity);
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    pub fn enter_programming_session(&mut self) -> Result<(), FlashError> {
        self.require(|s| {
            matches!(
                s,
                SequencerState::FlashloaderActive | SequencerState::SessionProgramming
            )
        })?;
        self.run_step("Enter programming session", true, |seq| {
            let session = seq.session.as_ref().ok_or(FlashError::NotConnected)?;
            services::diagnostic_session(session, DiagSession::Programming)
                .map(|_| ())
                .map_err(FlashError::Session)
        })?;
        self.state = SequencerState::SessionProgramming;
        Ok(())
    }

    /// Non-secure seed/key handshake
    pub fn authenticate(&mut self) -> Result<(), FlashError> {
        self.require(|s| matches!(s, SequencerState::SessionProgramming))?;
        self.run_step("Authenticate", true, |seq| {
            let session = seq.session.as_ref().ok_or(FlashError::NotConnected)?;

            let mut remaining_attempts = SEED_REQUEST_ATTEMPTS;
            let seed = loop {
                remaining_attempts -= 1;
                match services::security_request_seed(session, services::SECURITY_LEVEL_SEED) {
                    Ok(seed) => break seed,
                    Err(e)
                        if e.nrc() == Some(NegativeResponseCode::RequiredTimeDelayNotExpired)
                            && remaining_attempts > 0 =>
                    {
                        log::warn!(
                            "[Sequencer] Seed request delayed by device, retrying in {} ms",
                            seq.timings.seed_retry_delay_ms
                        );
                        thread::sleep(Duration::from_millis(seq.timings.seed_retry_delay_ms));
                    }
                    Err(e) => return Err(FlashError::com("Security access seed request", e)),
                }
            };

            if seed.secure_mode {
                return Err(FlashError::SecureModeUnsupported);
            }
            if seed.seed != EXPECTED_SEED {
                log::warn!(
                    "[Sequencer] Unexpected seed 0x{:08X} (expected 0x{:08X}), sending key anyway",
                    seed.seed,
                    EXPECTED_SEED
                );
            }
            services::security_send_key(session, services::SECURITY_LEVEL_KEY, &FIXED_KEY)
                .map_err(|e| FlashError::com("Security access key", e))
        })?;
        self.state = SequencerState::Authenticated;
        Ok(())
    }

    pub fn check_flash_availability(&mut self, image: &FirmwareImage) -> Result<(), FlashError> {
        self.require(|s| matches!(s, SequencerState::Authenticated))?;
        self.run_step("Check flash memory", true, |seq| {
            let session = seq.session.as_ref().ok_or(FlashError::NotConnected)?;
            for block in image.blocks() {
                services::check_flash_memory_available(session, block.address_offset, block.size())
                    .map_err(|source| FlashError::FlashNotAvailable {
                        offset: block.address_offset,
                        size: block.size(),
                        source,
                    })?;
            }
            Ok(())
        })
    }

    /// Record date, time and user of this flash. Failures are reported, not fatal.
    pub fn write_fingerprint(&mut self) -> Result<(), FlashError> {
        self.require(|s| matches!(s, SequencerState::Authenticated))?;
        self.run_step("Write fingerprint", false, |seq| {
            let session = seq.session.as_ref().ok_or(FlashError::NotConnected)?;
            let now = chrono::Local::now();
            let date = now.format("%y %m %d").to_string();
            let time = now.format("%H %M %S").to_string();
            let user = current_username();
            log::debug!("[Sequencer] Fingerprint {} {} by '{}'", date, time, user);

            services::write_did(session, did::FINGERPRINT_DATE, &decimal_fields(&date))
                .map_err(|e| FlashError::com("Write fingerprint date", e))?;
            services::write_did(session, did::FINGERPRINT_TIME, &decimal_fields(&time))
                .map_err(|e| FlashError::com("Write fingerprint time", e))?;
            services::write_did(session, did::FINGERPRINT_USERNAME, user.as_bytes())
                .map_err(|e| FlashError::com("Write fingerprint user", e))
        })
    }

    /// Erase and write every block, verifying the signature with the last exit
    pub fn transfer_blocks(&mut self, image: &FirmwareImage) -> Result<(), FlashError> {
        self.require(|s| matches!(s, SequencerState::Authenticated))?;
        let result = self.run_step("Transfer blocks", true, |seq| seq.transfer_all(image));
        if result.is_ok() {
            self.state = SequencerState::Finalized;
        }
        result
    }

    fn transfer_all(&mut self, image: &FirmwareImage) -> Result<(), FlashError> {
        let signature_address = image
            .signature_block_address()
            .ok_or(FlashError::MissingSignatureAddress)?;
        let blocks = image.blocks();
        if blocks.is_empty() {
            return Err(FlashError::Image(ReadError::InvalidBlocks(
                "image contains no blocks".into(),
            )));
        }
        let bytes_total = image.total_len();
        let mut bytes_transferred = 0u64;

        for (index, block) in blocks.iter().enumerate() {
            self.state = SequencerState::Transferring { block: index };
            let session = self.session.as_mut().ok_or(FlashError::NotConnected)?;
            let (download_timeout, write_budget) = (
                session.config().request_download_timeout_ms,
                session.config().transfer_data_timeout_ms,
            );
            let bitrate = session.bitrate_kbit();

            log::info!(
                "[Sequencer] Block {}/{}: 0x{:08X}, {} bytes",
                index + 1,
                blocks.len(),
                block.address_offset,
                block.size()
            );

            let max_block_length = {
                let guard = session.scoped_timeout(download_timeout);
                services::request_download(&*guard, block.address_offset, block.size())
                    .map_err(|e| FlashError::com("RequestDownload", e))?
            };
            if max_block_length <= TRANSFER_FRAME_OVERHEAD {
                return Err(FlashError::com(
                    "RequestDownload",
                    UdsError::InvalidResponse(format!(
                        "max block length {} leaves no room for data",
                        max_block_length
                    )),
                ));
            }
            let chunk_len = ((max_block_length - TRANSFER_FRAME_OVERHEAD) as usize)
                .min(MAX_PAYLOAD_SIZE - 2);
            let transfer_timeout = adapted_transfer_timeout(write_budget, max_block_length, bitrate);
            log::debug!(
                "[Sequencer] Max block length {}, chunks of {} bytes, timeout {} ms",
                max_block_length,
                chunk_len,
                transfer_timeout
            );

            let guard = session.scoped_timeout(transfer_timeout);
            let mut sequence_counter: u8 = 1;
            for chunk in block.data.chunks(chunk_len) {
                services::transfer_data(&*guard, sequence_counter, chunk)
                    .map_err(|e| FlashError::com("TransferData", e))?;
                sequence_counter = sequence_counter.wrapping_add(1);
                bytes_transferred += chunk.len() as u64;
                self.reporter.on_transfer(TransferProgress::new(
                    index,
                    blocks.len(),
                    bytes_transferred,
                    bytes_total,
                ));
            }

            let verify = if index + 1 == blocks.len() {
                log::info!(
                    "[Sequencer] Verifying signature block at 0x{:08X}",
                    signature_address
                );
                Some(signature_address)
            } else {
                None
            };
            services::request_transfer_exit(&*guard, verify)
                .map_err(|e| FlashError::com("RequestTransferExit", e))?;
        }
        Ok(())
    }

    /// Hard reset. The device is assumed to be resetting even if it does not confirm.
    pub fn reset_system(&mut self) -> Result<(), FlashError> {
        self.require(|s| !matches!(s, SequencerState::Idle))?;
        let result = self.run_step("Reset device", false, |seq| {
            let session = seq.session.as_ref().ok_or(FlashError::NotConnected)?;
            services::ecu_reset(session, ResetType::HardReset)
                .map(|_| ())
                .map_err(|e| FlashError::com("ECUReset", e))
        });
        thread::sleep(Duration::from_millis(self.timings.reset_settle_ms));
        if self.state == SequencerState::Finalized {
            self.state = SequencerState::Done;
        }
        result
    }

    /// Close the session. Never fails.
    pub fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.reporter.on_progress(ResultCode::Ok, "Disconnecting...");
            session.close();
            self.reporter.on_progress(ResultCode::Ok, "Disconnected");
        }
        if !matches!(self.state, SequencerState::Done | SequencerState::Error(_)) {
            self.state = SequencerState::Idle;
        }
    }

    /// Program a device whose flashloader is active, checking `cancel` between steps
    pub fn update_node(&mut self, image: &FirmwareImage, cancel: &CancelFlag) -> Result<(), FlashError> {
        self.checkpoint(cancel)?;
        self.enter_programming_session()?;
        self.checkpoint(cancel)?;
        self.authenticate()?;
        self.checkpoint(cancel)?;
        self.check_flash_availability(image)?;
        self.checkpoint(cancel)?;
        if let Err(e) = self.write_fingerprint() {
            log::warn!("[Sequencer] Continuing without fingerprint: {}", e);
        }
        self.checkpoint(cancel)?;
        self.transfer_blocks(image)?;
        if let Err(e) = self.reset_system() {
            log::warn!("[Sequencer] Reset not confirmed: {}", e);
        }
        Ok(())
    }

    /// Stop with `Cancelled` when `cancel` is set
    pub(crate) fn checkpoint(&mut self, cancel: &CancelFlag) -> Result<(), FlashError> {
        if cancel.is_cancelled() {
            log::warn!("[Sequencer] Update cancelled");
            self.reporter
                .on_progress(ResultCode::Cancelled, "Update cancelled");
            self.state = SequencerState::Error(ResultCode::Cancelled);
            return Err(FlashError::Cancelled);
        }
        Ok(())
    }

    fn require(&self, allowed: impl Fn(SequencerState) -> bool) -> Result<(), FlashError> {
        if self.session.is_none() {
            return Err(FlashError::NotConnected);
        }
        if allowed(self.state) {
            Ok(())
        } else {
            Err(FlashError::InvalidState(self.state))
        }
    }

    /// Report around one step. Fatal failures move the sequencer into `Error`.
    fn run_step<T>(
        &mut self,
        name: &str,
        fatal: bool,
        step: impl FnOnce(&mut Self) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        log::info!("[Sequencer] {}...", name);
        self.reporter.on_progress(ResultCode::Ok, &format!("{}...", name));
        match step(self) {
            Ok(value) => {
                self.reporter.on_progress(ResultCode::Ok, &format!("{} done", name));
                Ok(value)
            }
            Err(e) => {
                let code = e.code();
                let message = format!("{} failed: {}", name, e);
                if fatal {
                    log::error!("[Sequencer] {}", message);
                    self.state = SequencerState::Error(code);
                } else {
                    log::warn!("[Sequencer] {}", message);
                }
                self.reporter.on_progress(code, &message);
                Err(e)
            }
        }
    }
}

impl<C: Channel, R: ProgressReporter> Drop for UpdateSequencer<C, R> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn current_username() -> String {
    let name = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let name: String = name
        .trim()
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .take(MAX_USERNAME_LEN)
        .collect();
    if name.is_empty() {
        "unknown".to_string()
    } else {
        name
    }
}

/// "26 10 16" -> [26, 10, 16]
fn decimal_fields(text: &str) -> Vec<u8> {
    text.split(' ').filter_map(|field| field.parse().ok()).collect()
}
