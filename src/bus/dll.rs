use crate::bus::types::BusMessage;

/// Type aliases for driver library function pointers
type BusOpenFn = unsafe extern "C" fn(u32, u8, *mut u32) -> u32;
type BusCloseFn = unsafe extern "C" fn(u32) -> u32;
type BusInitFn = unsafe extern "C" fn(u32) -> u32;
type BusWriteFn = unsafe extern "C" fn(u32, *const BusMessage, u32) -> u32;
type BusReadFn = unsafe extern "C" fn(u32, *mut BusMessage, *mut u32, u32) -> u32;
type BusClearRxFn = unsafe extern "C" fn(u32) -> u32;

/// Holds a dynamically loaded bus driver library and its function pointers
pub struct DriverLib {
    _lib: libloading::Library,
    pub bus_open: BusOpenFn,
    pub bus_close: BusCloseFn,
    pub bus_init: BusInitFn,
    pub bus_write: BusWriteFn,
    pub bus_read: BusReadFn,
    pub bus_clear_rx: BusClearRxFn,
}

impl DriverLib {
    /// Load a bus driver library from the given path
    pub fn load(path: &str) -> Result<Self, String> {
        unsafe {
            let lib = libloading::Library::new(path)
                .map_err(|e| format!("Failed to load bus driver '{}': {}", path, e))?;

            let bus_open = *lib
                .get::<BusOpenFn>(b"BusOpen\0")
                .map_err(|e| format!("BusOpen not found: {}", e))?;
            let bus_close = *lib
                .get::<BusCloseFn>(b"BusClose\0")
                .map_err(|e| format!("BusClose not found: {}", e))?;
            let bus_init = *lib
                .get::<BusInitFn>(b"BusInit\0")
                .map_err(|e| format!("BusInit not found: {}", e))?;
            let bus_write = *lib
                .get::<BusWriteFn>(b"BusWrite\0")
                .map_err(|e| format!("BusWrite not found: {}", e))?;
            let bus_read = *lib
                .get::<BusReadFn>(b"BusRead\0")
                .map_err(|e| format!("BusRead not found: {}", e))?;
            let bus_clear_rx = *lib
                .get::<BusClearRxFn>(b"BusClearRx\0")
                .map_err(|e| format!("BusClearRx not found: {}", e))?;

            Ok(Self {
                _lib: lib,
                bus_open,
                bus_close,
                bus_init,
                bus_write,
                bus_read,
                bus_clear_rx,
            })
        }
    }
}
