use crate::error::ResultCode;
use crate::sequencer::identity::DeviceIdentity;

/// Position within a block transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub block_index: usize,
    pub block_count: usize,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub percentage: u8,
}

impl TransferProgress {
    pub fn new(block_index: usize, block_count: usize, bytes_transferred: u64, bytes_total: u64) -> Self {
        let percentage = if bytes_total == 0 {
            100
        } else {
            (bytes_transferred.min(bytes_total) * 100 / bytes_total) as u8
        };
        Self {
            block_index,
            block_count,
            bytes_transferred,
            bytes_total,
            percentage,
        }
    }
}

/// Receives status from the sequencer. Called synchronously from inside each step.
pub trait ProgressReporter {
    fn on_progress(&mut self, result: ResultCode, message: &str);

    fn on_percentage(&mut self, percent: u8);

    fn on_device_info(&mut self, name: &str, identity: &DeviceIdentity);

    fn on_transfer(&mut self, progress: TransferProgress) {
        self.on_percentage(progress.percentage);
    }
}

impl<R: ProgressReporter + ?Sized> ProgressReporter for &mut R {
    fn on_progress(&mut self, result: ResultCode, message: &str) {
        (**self).on_progress(result, message);
    }

    fn on_percentage(&mut self, percent: u8) {
        (**self).on_percentage(percent);
    }

    fn on_device_info(&mut self, name: &str, identity: &DeviceIdentity) {
        (**self).on_device_info(name, identity);
    }

    fn on_transfer(&mut self, progress: TransferProgress) {
        (**self).on_transfer(progress);
    }
}

/// Writes every report to the log
#[derive(Debug, Default)]
pub struct LogReporter {
    last_percentage: Option<u8>,
}

impl ProgressReporter for LogReporter {
    fn on_progress(&mut self, result: ResultCode, message: &str) {
        if result.is_ok() {
            log::info!("[Sequencer] {}", message);
        } else {
            log::error!("[Sequencer] {} ({})", message, result);
        }
    }

    fn on_percentage(&mut self, percent: u8) {
        // One line per 10 %
        let bucket = percent / 10;
        if self.last_percentage.map(|p| p / 10) != Some(bucket) {
            log::info!("[Sequencer] Progress {}%", percent);
        }
        self.last_percentage = Some(percent);
    }

    fn on_device_info(&mut self, name: &str, identity: &DeviceIdentity) {
        log::info!(
            "[Sequencer] Device '{}': article {}, hardware {}, serial {}, flashed {} times",
            name,
            identity.article_number,
            identity.hardware_version,
            identity.serial_number,
            identity.flash_count
        );
        match serde_json::to_string(identity) {
            Ok(json) => log::debug!("[Sequencer] Identity {}", json),
            Err(e) => log::warn!("[Sequencer] Failed to serialize identity: {}", e),
        }
    }
}
