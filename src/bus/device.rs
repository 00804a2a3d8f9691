use std::sync::Arc;

use crate::bus::dll::DriverLib;
use crate::bus::types::*;

/// An opened and initialised bus driver channel
pub struct DriverBus {
    lib: Arc<DriverLib>,
    handle: u32,
    closed: bool,
}

impl DriverBus {
    /// Load the driver at `path`, open the bus at `bitrate_kbit` and initialise it
    pub fn open(path: &str, bitrate_kbit: u32, bus_id: u8) -> Result<Self, String> {
        let lib = Arc::new(DriverLib::load(path)?);
        Self::open_with(lib, bitrate_kbit, bus_id)
    }

    pub fn open_with(lib: Arc<DriverLib>, bitrate_kbit: u32, bus_id: u8) -> Result<Self, String> {
        let mut handle: u32 = 0;
        let ret = unsafe { (lib.bus_open)(bitrate_kbit, bus_id, &mut handle) };
        if let Some(err) = DriverError::from_code(ret) {
            return Err(format!("BusOpen failed: {}", err));
        }
        let bus = Self {
            lib,
            handle,
            closed: false,
        };
        let ret = unsafe { (bus.lib.bus_init)(bus.handle) };
        if let Some(err) = DriverError::from_code(ret) {
            // dropping `bus` closes the half-opened handle
            return Err(format!("BusInit failed: {}", err));
        }
        Ok(bus)
    }

    /// Send a message on the bus
    pub fn send(&self, msg: &BusMessage, timeout_ms: u32) -> Result<(), String> {
        let ret = unsafe { (self.lib.bus_write)(self.handle, msg, timeout_ms) };
        if let Some(err) = DriverError::from_code(ret) {
            return Err(format!("BusWrite failed: {}", err));
        }
        Ok(())
    }

    /// Read pending messages from the bus
    pub fn read(&self, timeout_ms: u32) -> Result<Vec<BusMessage>, String> {
        let mut msgs = vec![BusMessage::default(); 10];
        let mut num_msgs: u32 = msgs.len() as u32;
        let ret = unsafe {
            (self.lib.bus_read)(self.handle, msgs.as_mut_ptr(), &mut num_msgs, timeout_ms)
        };
        if let Some(err) = DriverError::from_code(ret) {
            if !err.is_empty_read() {
                return Err(format!("BusRead failed: {}", err));
            }
        }
        msgs.truncate(num_msgs as usize);
        Ok(msgs)
    }

    /// Clear receive buffer
    pub fn clear_rx_buffer(&self) -> Result<(), String> {
        let ret = unsafe { (self.lib.bus_clear_rx)(self.handle) };
        if let Some(err) = DriverError::from_code(ret) {
            return Err(format!("BusClearRx failed: {}", err));
        }
        Ok(())
    }

    /// Close the driver handle. Subsequent calls are no-ops.
    pub fn close(&mut self) -> Result<(), String> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let ret = unsafe { (self.lib.bus_close)(self.handle) };
        if let Some(err) = DriverError::from_code(ret) {
            return Err(format!("BusClose failed: {}", err));
        }
        Ok(())
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }
}

impl Drop for DriverBus {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("[Bus] {}", e);
        }
    }
}
