//! Mock transport for unit testing

use super::{LineSettings, Transport};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cloneable handle; clones share state so a test can inspect a transport
/// after handing it to a session.
#[derive(Clone)]
pub(crate) struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
pub(crate) struct MockTransportInner {
    pub name: String,
    pub open: bool,
    pub opens: usize,
    pub closes: usize,
    pub fail_open: bool,
    pub fail_close: bool,
    pub fail_write: bool,
    pub fail_read: bool,
    pub settings: Option<LineSettings>,
    pub timeout: Option<Duration>,
    /// Bytes waiting to be read
    pub pending: VecDeque<u8>,
    /// Replies released into `pending`, one per write
    pub replies: VecDeque<Vec<u8>>,
    pub written: Vec<Vec<u8>>,
    pub read_timeouts: Vec<Duration>,
}

impl MockTransport {
    pub fn new(name: &str) -> Self {
        MockTransport {
            inner: Arc::new(Mutex::new(MockTransportInner {
                name: name.to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap()
    }

    /// Bytes already sitting in the receive buffer
    pub fn inject_pending(&self, data: &[u8]) {
        self.state().pending.extend(data);
    }

    /// Reply the sensor sends after the next unanswered write
    pub fn queue_reply(&self, data: &[u8]) {
        self.state().replies.push_back(data.to_vec());
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> io::Result<()> {
        let mut inner = self.state();
        inner.opens += 1;
        if inner.fail_open {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "busy"));
        }
        inner.open = true;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let mut inner = self.state();
        inner.closes += 1;
        if inner.fail_close {
            return Err(io::Error::new(io::ErrorKind::Other, "stuck"));
        }
        inner.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn configure(&mut self, settings: &LineSettings) -> io::Result<()> {
        self.state().settings = Some(*settings);
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.state().timeout = Some(timeout);
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state().pending.clear();
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.state();
        if inner.fail_write {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        }
        inner.written.push(data.to_vec());
        if let Some(reply) = inner.replies.pop_front() {
            inner.pending.extend(reply);
        }
        Ok(data.len())
    }

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut inner = self.state();
        inner.read_timeouts.push(timeout);
        if inner.fail_read {
            return Err(io::Error::new(io::ErrorKind::Other, "framing"));
        }
        let available = inner.pending.len().min(buffer.len());
        for item in buffer.iter_mut().take(available) {
            *item = inner.pending.pop_front().unwrap();
        }
        Ok(available)
    }

    fn system_port_name(&self) -> String {
        self.state().name.clone()
    }
}
