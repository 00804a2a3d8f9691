use std::cell::RefCell;
use std::collections::VecDeque;

use crate::bus::types::*;
use crate::bus::Channel;

/// A single expected request → response pair
#[derive(Debug, Clone)]
struct Expectation {
    /// Expected request identifier
    tx_id: u32,
    /// Expected payload (without identifier header)
    expected_request: Vec<u8>,
    /// Response payloads to return (multiple for pending scenarios)
    responses: Vec<Vec<u8>>,
}

/// Device-side logic plugged into a `MockBus`
pub trait DeviceHandler: Send {
    /// Build zero or more responses for a request. Functional requests carry `functional = true`.
    fn handle(&mut self, request: &[u8], functional: bool) -> Vec<Vec<u8>>;

    /// Identifier the simulated device answers with
    fn response_id(&self) -> u32;
}

/// Mock bus channel for testing sessions and the sequencer without hardware.
pub struct MockBus {
    expectations: RefCell<VecDeque<Expectation>>,
    /// Pending responses to deliver on next read() call
    pending_responses: RefCell<VecDeque<(u32, Vec<u8>)>>,
    /// Track sent messages for assertions: (id, payload, functional)
    sent_messages: RefCell<Vec<(u32, Vec<u8>, bool)>>,
    /// Write timeout of every sent message, in send order
    send_timeouts: RefCell<Vec<u32>>,
    handler: RefCell<Option<Box<dyn DeviceHandler>>>,
    /// If true, read() returns empty when no pending (simulates timeout)
    timeout_mode: RefCell<bool>,
    /// Fail every send from this call index onwards
    fail_sends_from: RefCell<Option<usize>>,
    /// Frame returned by every read, on top of queued responses
    flood: RefCell<Option<(u32, Vec<u8>)>>,
    fail_close: bool,
    closed: bool,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            expectations: RefCell::new(VecDeque::new()),
            pending_responses: RefCell::new(VecDeque::new()),
            sent_messages: RefCell::new(Vec::new()),
            send_timeouts: RefCell::new(Vec::new()),
            handler: RefCell::new(None),
            timeout_mode: RefCell::new(false),
            fail_sends_from: RefCell::new(None),
            flood: RefCell::new(None),
            fail_close: false,
            closed: false,
        }
    }

    /// Route every unmatched request to a simulated device
    pub fn with_handler(handler: impl DeviceHandler + 'static) -> Self {
        let mock = Self::new();
        *mock.handler.borrow_mut() = Some(Box::new(handler));
        mock
    }

    /// Expect a request with given payload on tx_id, respond with given payload on tx_id + 0x80.
    pub fn expect_request(&self, tx_id: u32, request: Vec<u8>, response: Vec<u8>) {
        self.expect_request_multi(tx_id, request, vec![response]);
    }

    /// Expect a request that returns multiple responses (e.g., pending then OK).
    pub fn expect_request_multi(&self, tx_id: u32, request: Vec<u8>, responses: Vec<Vec<u8>>) {
        self.expectations.borrow_mut().push_back(Expectation {
            tx_id,
            expected_request: request,
            responses,
        });
    }

    /// Queue an unsolicited frame, e.g. a late broadcast answer
    pub fn inject_response(&self, id: u32, payload: Vec<u8>) {
        self.pending_responses.borrow_mut().push_back((id, payload));
    }

    /// In timeout mode read() returns nothing, as if the device were silent
    pub fn set_timeout_mode(&self, enabled: bool) {
        *self.timeout_mode.borrow_mut() = enabled;
    }

    /// Deliver this frame on every read, so the receive queue never runs dry
    pub fn set_flood(&self, id: u32, payload: Vec<u8>) {
        *self.flood.borrow_mut() = Some((id, payload));
    }

    /// Make the n-th send (0-based) and every later one fail
    pub fn fail_sends_from(&self, index: usize) {
        *self.fail_sends_from.borrow_mut() = Some(index);
    }

    pub fn set_fail_close(&mut self, fail: bool) {
        self.fail_close = fail;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_count(&self) -> usize {
        self.pending_responses.borrow().len()
    }

    /// Get all messages that were sent through this bus
    pub fn sent_messages(&self) -> Vec<(u32, Vec<u8>, bool)> {
        self.sent_messages.borrow().clone()
    }

    /// Every sent payload with the write timeout it was sent under
    pub fn sent_with_timeouts(&self) -> Vec<(Vec<u8>, u32)> {
        self.sent_messages
            .borrow()
            .iter()
            .zip(self.send_timeouts.borrow().iter())
            .map(|((_, payload, _), timeout)| (payload.clone(), *timeout))
            .collect()
    }

    /// Payloads of physically addressed requests only
    pub fn sent_requests(&self) -> Vec<Vec<u8>> {
        self.sent_messages
            .borrow()
            .iter()
            .filter(|(_, _, functional)| !functional)
            .map(|(_, payload, _)| payload.clone())
            .collect()
    }

    /// Verify all expectations were consumed
    pub fn verify(&self) {
        let remaining = self.expectations.borrow().len();
        assert_eq!(
            remaining, 0,
            "MockBus: {} expectations were not consumed",
            remaining
        );
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MockBus {
    fn send(&self, msg: &BusMessage, timeout_ms: u32) -> Result<(), String> {
        let id = msg.id();
        let payload = msg.payload().to_vec();
        let functional = msg.is_functional();

        let index = self.sent_messages.borrow().len();
        self.sent_messages
            .borrow_mut()
            .push((id, payload.clone(), functional));
        self.send_timeouts.borrow_mut().push(timeout_ms);

        if let Some(from) = *self.fail_sends_from.borrow() {
            if index >= from {
                return Err("BusWrite failed: Bus off".into());
            }
        }

        // Match against expectations
        let mut expectations = self.expectations.borrow_mut();
        if let Some(pos) = expectations
            .iter()
            .position(|e| e.tx_id == id && e.expected_request == payload)
        {
            if let Some(exp) = expectations.remove(pos) {
                for resp in exp.responses {
                    self.pending_responses
                        .borrow_mut()
                        .push_back((id + 0x80, resp));
                }
            }
            return Ok(());
        }
        drop(expectations);

        if let Some(handler) = self.handler.borrow_mut().as_mut() {
            let rx_id = handler.response_id();
            for resp in handler.handle(&payload, functional) {
                self.pending_responses.borrow_mut().push_back((rx_id, resp));
            }
        }

        Ok(())
    }

    fn read(&self, _timeout_ms: u32) -> Result<Vec<BusMessage>, String> {
        if *self.timeout_mode.borrow() {
            return Ok(vec![]);
        }

        let mut responses = self.pending_responses.borrow_mut();
        let mut msgs = Vec::new();
        while let Some((rx_id, payload)) = responses.pop_front() {
            msgs.push(BusMessage::new(rx_id, &payload).map_err(|e| e.to_string())?);
        }
        if let Some((id, payload)) = self.flood.borrow().as_ref() {
            msgs.push(BusMessage::new(*id, payload).map_err(|e| e.to_string())?);
        }
        Ok(msgs)
    }

    fn clear_rx_buffer(&self) -> Result<(), String> {
        self.pending_responses.borrow_mut().clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), String> {
        self.closed = true;
        if self.fail_close {
            return Err("BusClose failed: Device not connected".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoDevice;

    impl DeviceHandler for EchoDevice {
        fn handle(&mut self, request: &[u8], _functional: bool) -> Vec<Vec<u8>> {
            vec![vec![request[0] + 0x40]]
        }

        fn response_id(&self) -> u32 {
            0x685
        }
    }

    #[test]
    fn test_mock_basic_send_recv() {
        let mock = MockBus::new();
        mock.expect_request(0x605, vec![0x22, 0xF1, 0x90], vec![0x62, 0xF1, 0x90, 0x41]);

        let tx = BusMessage::new(0x605, &[0x22, 0xF1, 0x90]).unwrap();
        mock.send(&tx, 2000).unwrap();

        let rx = mock.read(500).unwrap();
        assert_eq!(rx.len(), 1);
        assert_eq!(rx[0].payload(), &[0x62, 0xF1, 0x90, 0x41]);
        assert_eq!(rx[0].id(), 0x685);
        mock.verify();
    }

    #[test]
    fn test_mock_pending_then_ok() {
        let mock = MockBus::new();
        mock.expect_request_multi(
            0x605,
            vec![0x31, 0x01, 0x02, 0x04],
            vec![vec![0x7F, 0x31, 0x78], vec![0x71, 0x01, 0x02, 0x04]],
        );

        let tx = BusMessage::new(0x605, &[0x31, 0x01, 0x02, 0x04]).unwrap();
        mock.send(&tx, 2000).unwrap();

        let rx = mock.read(500).unwrap();
        assert_eq!(rx.len(), 2);
        assert_eq!(rx[0].payload()[2], 0x78);
        assert_eq!(rx[1].payload()[0], 0x71);
        mock.verify();
    }

    #[test]
    fn test_mock_handler_fallback() {
        let mock = MockBus::with_handler(EchoDevice);
        let tx = BusMessage::new_functional(&[0x10, 0xE0]).unwrap();
        mock.send(&tx, 100).unwrap();

        let rx = mock.read(100).unwrap();
        assert_eq!(rx[0].id(), 0x685);
        assert_eq!(rx[0].payload(), &[0x50]);
        assert_eq!(mock.sent_messages()[0].2, true);
        assert!(mock.sent_requests().is_empty());
    }

    #[test]
    fn test_mock_timeout() {
        let mock = MockBus::new();
        mock.inject_response(0x685, vec![0x50, 0x02]);
        mock.set_timeout_mode(true);
        assert!(mock.read(500).unwrap().is_empty());
        assert_eq!(mock.pending_count(), 1);
    }

    #[test]
    fn test_mock_send_failure_injection() {
        let mock = MockBus::new();
        mock.fail_sends_from(1);
        let tx = BusMessage::new(0x605, &[0x3E, 0x00]).unwrap();
        assert!(mock.send(&tx, 100).is_ok());
        assert!(mock.send(&tx, 100).is_err());
        assert_eq!(mock.sent_messages().len(), 2);
    }

    #[test]
    fn test_mock_clear_and_close() {
        let mut mock = MockBus::new();
        mock.inject_response(0x685, vec![0x50, 0x60]);
        mock.clear_rx_buffer().unwrap();
        assert_eq!(mock.pending_count(), 0);

        mock.set_fail_close(true);
        assert!(mock.close().is_err());
        assert!(mock.is_closed());
    }
}
