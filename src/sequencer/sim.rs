//! Simulated flashloader device for sequencer tests.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::bus::mock::DeviceHandler;
use crate::bus::types::response_id;
use crate::uds::services::did;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Application,
    Flashloader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Session {
    Default,
    PreProgramming,
    Programming,
}

#[derive(Debug, Clone)]
struct DownloadWindow {
    address: u32,
    size: u32,
    expected_counter: u8,
    received: Vec<u8>,
}

/// Device behaviour knobs and everything the device observed
#[derive(Debug)]
pub(crate) struct SimState {
    pub mode: Mode,
    pub session: Session,
    pub unlocked: bool,

    pub seed: u32,
    pub secure_mode: bool,
    /// Seed requests answered with NRC 0x37 before a seed is handed out
    pub seed_delays: u32,
    pub request_programming_nrc: Option<u8>,
    pub fail_did: Option<u16>,
    pub fail_fingerprint: bool,
    pub reject_flash_check_at: Option<u32>,
    pub max_block_length: u16,
    pub pending_on_download: bool,
    /// Fail the n-th TransferData request (0-based, across blocks)
    pub fail_transfer_at: Option<usize>,
    pub answer_broadcasts: bool,

    pub features: u32,
    pub extended_serial: Vec<u8>,

    pub requests: Vec<Vec<u8>>,
    pub broadcasts: usize,
    pub dids_read: Vec<u16>,
    pub seed_requests: usize,
    pub keys: Vec<Vec<u8>>,
    pub flash_checks: Vec<(u32, u32)>,
    pub fingerprint_writes: Vec<(u16, Vec<u8>)>,
    pub downloads: Vec<(u32, u32)>,
    pub counters: Vec<u8>,
    pub exits: Vec<Option<u32>>,
    pub written: Vec<(u32, Vec<u8>)>,
    pub resets: Vec<u8>,
    window: Option<DownloadWindow>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            mode: Mode::Application,
            session: Session::Default,
            unlocked: false,
            seed: 0x2A,
            secure_mode: false,
            seed_delays: 0,
            request_programming_nrc: None,
            fail_did: None,
            fail_fingerprint: false,
            reject_flash_check_at: None,
            max_block_length: 1024,
            pending_on_download: false,
            fail_transfer_at: None,
            answer_broadcasts: false,
            features: 0x0000_0001,
            extended_serial: b"\x01SN-EXT-42".to_vec(),
            requests: Vec::new(),
            broadcasts: 0,
            dids_read: Vec::new(),
            seed_requests: 0,
            keys: Vec::new(),
            flash_checks: Vec::new(),
            fingerprint_writes: Vec::new(),
            downloads: Vec::new(),
            counters: Vec::new(),
            exits: Vec::new(),
            written: Vec::new(),
            resets: Vec::new(),
            window: None,
        }
    }
}

/// Shared handle: one clone goes into the `MockBus`, the test keeps another
#[derive(Clone)]
pub(crate) struct SimulatedDevice {
    node_id: u8,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn nrc(service: u8, code: u8) -> Vec<Vec<u8>> {
    vec![vec![0x7F, service, code]]
}

fn ok(payload: Vec<u8>) -> Vec<Vec<u8>> {
    vec![payload]
}

fn did_response(id: u16, data: &[u8]) -> Vec<Vec<u8>> {
    let mut resp = vec![0x62];
    resp.extend_from_slice(&id.to_be_bytes());
    resp.extend_from_slice(data);
    ok(resp)
}

fn padded(text: &str, len: usize) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(len, 0);
    bytes
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl SimState {
    fn handle_functional(&mut self, request: &[u8]) -> Vec<Vec<u8>> {
        match request {
            [0x10, sub] if sub & 0x7F == 0x60 => {
                self.broadcasts += 1;
                if self.mode == Mode::Flashloader {
                    self.session = Session::PreProgramming;
                }
                if self.answer_broadcasts {
                    ok(vec![0x50, 0x60])
                } else {
                    vec![]
                }
            }
            _ => vec![],
        }
    }

    fn handle_physical(&mut self, request: &[u8]) -> Vec<Vec<u8>> {
        self.requests.push(request.to_vec());
        match request {
            [0x31, 0x01, 0x02, 0x06] => match self.request_programming_nrc {
                Some(code) => nrc(0x31, code),
                None => ok(vec![0x71, 0x01, 0x02, 0x06]),
            },

            [0x11, reset_type] => {
                self.resets.push(*reset_type);
                match *reset_type {
                    0x60 => self.mode = Mode::Flashloader,
                    _ => self.mode = Mode::Application,
                }
                self.session = Session::Default;
                self.unlocked = false;
                ok(vec![0x51, *reset_type])
            }

            [0x10, 0x02] => {
                if self.session != Session::PreProgramming && self.session != Session::Programming {
                    return nrc(0x10, 0x22);
                }
                self.session = Session::Programming;
                ok(vec![0x50, 0x02, 0x00, 0x19, 0x01, 0xF4])
            }

            [0x22, hi, lo] => {
                let id = u16::from_be_bytes([*hi, *lo]);
                self.dids_read.push(id);
                if self.fail_did == Some(id) {
                    return nrc(0x22, 0x31);
                }
                self.read_did(id)
            }

            [0x27, 0x05] => {
                if self.session != Session::Programming {
                    return nrc(0x27, 0x22);
                }
                self.seed_requests += 1;
                if self.seed_delays > 0 {
                    self.seed_delays -= 1;
                    return nrc(0x27, 0x37);
                }
                let mut resp = vec![0x67, 0x05];
                resp.extend_from_slice(&self.seed.to_be_bytes());
                resp.push(u8::from(self.secure_mode));
                ok(resp)
            }

            [0x27, 0x06, key @ ..] => {
                self.keys.push(key.to_vec());
                if key == [0x00, 0x00, 0x00, 0x2A] {
                    self.unlocked = true;
                    ok(vec![0x67, 0x06])
                } else {
                    nrc(0x27, 0x35)
                }
            }

            [0x31, 0x01, 0x02, 0x04, params @ ..] if params.len() == 8 => {
                if !self.unlocked {
                    return nrc(0x31, 0x33);
                }
                let (address, size) = (be_u32(&params[..4]), be_u32(&params[4..]));
                self.flash_checks.push((address, size));
                if self.reject_flash_check_at == Some(address) {
                    return nrc(0x31, 0x31);
                }
                ok(vec![0x71, 0x01, 0x02, 0x04, 0x00])
            }

            [0x2E, hi, lo, data @ ..] => {
                if !self.unlocked {
                    return nrc(0x2E, 0x33);
                }
                if self.fail_fingerprint {
                    return nrc(0x2E, 0x72);
                }
                let id = u16::from_be_bytes([*hi, *lo]);
                self.fingerprint_writes.push((id, data.to_vec()));
                ok(vec![0x6E, *hi, *lo])
            }

            [0x34, 0x00, 0x44, params @ ..] if params.len() == 8 => {
                if !self.unlocked {
                    return nrc(0x34, 0x33);
                }
                let (address, size) = (be_u32(&params[..4]), be_u32(&params[4..]));
                self.downloads.push((address, size));
                self.window = Some(DownloadWindow {
                    address,
                    size,
                    expected_counter: 1,
                    received: Vec::new(),
                });
                let [hi, lo] = self.max_block_length.to_be_bytes();
                let positive = vec![0x74, 0x20, hi, lo];
                if self.pending_on_download {
                    vec![vec![0x7F, 0x34, 0x78], positive]
                } else {
                    ok(positive)
                }
            }

            [0x36, counter, data @ ..] => {
                let index = self.counters.len();
                self.counters.push(*counter);
                let fail = self.fail_transfer_at == Some(index);
                let Some(window) = self.window.as_mut() else {
                    return nrc(0x36, 0x24);
                };
                if *counter != window.expected_counter {
                    return nrc(0x36, 0x73);
                }
                if fail {
                    return nrc(0x36, 0x72);
                }
                window.received.extend_from_slice(data);
                window.expected_counter = counter.wrapping_add(1);
                ok(vec![0x76, *counter])
            }

            [0x37, rest @ ..] => {
                let Some(window) = self.window.take() else {
                    return nrc(0x37, 0x24);
                };
                if window.received.len() as u32 != window.size {
                    return nrc(0x37, 0x24);
                }
                let verify = match rest {
                    [] => None,
                    [0x01, addr @ ..] if addr.len() == 4 => Some(be_u32(addr)),
                    _ => return nrc(0x37, 0x13),
                };
                self.exits.push(verify);
                self.written.push((window.address, window.received));
                ok(vec![0x77])
            }

            [sid, ..] => nrc(*sid, 0x11),
            [] => vec![],
        }
    }

    fn read_did(&self, id: u16) -> Vec<Vec<u8>> {
        match id {
            did::ARTICLE_NUMBER => did_response(id, &padded("ART-1001", 16)),
            did::HARDWARE_VERSION => did_response(id, b"HW-03"),
            did::DEVICE_NAME => did_response(id, &padded("DoorCtrl", 20)),
            did::PROTOCOL_VERSION => did_response(id, &[1, 4]),
            did::FLASHLOADER_SW_VERSION => did_response(id, b"FL 2.1.0"),
            did::FLASHLOADER_PROTOCOL_VERSION => did_response(id, &[2, 0]),
            did::FLASH_COUNT => did_response(id, &7u32.to_be_bytes()),
            did::FINGERPRINT_DATE => did_response(id, &[26, 10, 16]),
            did::FINGERPRINT_TIME => did_response(id, &[8, 15, 0]),
            did::FINGERPRINT_USERNAME => did_response(id, &padded("tester", 20)),
            did::FEATURE_LIST => did_response(id, &self.features.to_be_bytes()),
            did::MAX_BLOCK_LENGTH => did_response(id, &(self.max_block_length as u32).to_be_bytes()),
            did::SERIAL_NUMBER => did_response(id, &[0x12, 0x34, 0x56, 0x78, 0x90, 0x12]),
            did::SERIAL_NUMBER_EXT => did_response(id, &self.extended_serial),
            _ => nrc(0x22, 0x31),
        }
    }
}

impl DeviceHandler for SimulatedDevice {
    fn handle(&mut self, request: &[u8], functional: bool) -> Vec<Vec<u8>> {
        let mut state = self.state();
        if functional {
            state.handle_functional(request)
        } else {
            state.handle_physical(request)
        }
    }

    fn response_id(&self) -> u32 {
        response_id(self.node_id)
    }
}
