//! Firmware update engine for bus-attached nodes.
//!
//! `image` reads firmware files, `uds` talks to one node over a loaded bus
//! driver, `sequencer` runs the flash sequence, `route` decides how a node
//! is reached and `fleet` combines both for several nodes.

pub mod bus;
pub mod config;
pub mod error;
pub mod fleet;
pub mod image;
pub mod route;
pub mod sequencer;
pub mod timeout;
pub mod uds;

use std::io::Write;

pub use config::{FlashConfig, SessionConfig, Timings};
pub use error::{FlashError, ResultCode};
pub use fleet::{CancelFlag, FleetTarget, FleetUpdater};
pub use image::FirmwareImage;
pub use sequencer::{LogReporter, ProgressReporter, UpdateSequencer};

/// Install the log backend. `RUST_LOG` overrides the default `info` level.
/// Later calls are ignored.
pub fn init_logging() {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .try_init();
    if result.is_ok() {
        log::debug!("Logging initialized");
    }
}
