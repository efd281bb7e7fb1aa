//! Shared helpers for the ferrocan end-to-end tests.

use std::collections::VecDeque;

use ferrocan_linux::stack::GatewayParser;

/// A gateway parser stub that records everything fed to it and plays back
/// queued responses, with a bounded input buffer like the real one.
#[derive(Default)]
pub struct RecordingParser {
    /// All bytes the gateway fed in, in order.
    pub fed: Vec<u8>,
    /// Responses waiting for the write path.
    pub responses: VecDeque<Vec<u8>>,
    /// Free space to report; 0 means "pretend the buffer is full".
    pub space: usize,
}

impl RecordingParser {
    /// A parser with plenty of input space.
    pub fn new() -> Self {
        Self {
            fed: Vec::new(),
            responses: VecDeque::new(),
            space: 1024,
        }
    }

    /// Queue a response for the next poll.
    pub fn respond(&mut self, data: &[u8]) {
        self.responses.push_back(data.to_vec());
    }
}

impl GatewayParser for RecordingParser {
    fn free_space(&self) -> usize {
        self.space
    }

    fn feed(&mut self, data: &[u8]) {
        self.fed.extend_from_slice(data);
    }

    fn poll_response(&mut self, write: &mut dyn FnMut(&[u8]) -> usize) {
        while let Some(front) = self.responses.front_mut() {
            let n = write(front);
            if n == 0 {
                return;
            }
            if n < front.len() {
                front.drain(..n);
                return;
            }
            self.responses.pop_front();
        }
    }
}

/// Pick a free TCP port by binding to port 0 and releasing it.
pub fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// The CAN interface to run hardware tests against, if the environment
/// provides one (e.g. `FERROCAN_TEST_CAN_IFACE=vcan0`).
pub fn test_can_iface() -> Option<String> {
    std::env::var("FERROCAN_TEST_CAN_IFACE").ok()
}
