pub mod device;
pub mod dll;
#[cfg(test)]
pub mod mock;
pub mod types;

use types::BusMessage;

/// Duplex frame channel to one bus, implemented by the loaded driver and the test mock
pub trait Channel: Send {
    fn send(&self, msg: &BusMessage, timeout_ms: u32) -> Result<(), String>;
    fn read(&self, timeout_ms: u32) -> Result<Vec<BusMessage>, String>;
    fn clear_rx_buffer(&self) -> Result<(), String>;
    fn close(&mut self) -> Result<(), String>;
}

/// Implement Channel for the real driver-backed bus
impl Channel for device::DriverBus {
    fn send(&self, msg: &BusMessage, timeout_ms: u32) -> Result<(), String> {
        self.send(msg, timeout_ms)
    }

    fn read(&self, timeout_ms: u32) -> Result<Vec<BusMessage>, String> {
        self.read(timeout_ms)
    }

    fn clear_rx_buffer(&self) -> Result<(), String> {
        self.clear_rx_buffer()
    }

    fn close(&mut self) -> Result<(), String> {
        self.close()
    }
}
