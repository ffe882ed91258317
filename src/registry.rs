use crate::session::Session;
use crate::transport::Transport;
#[cfg(feature = "serial")]
use crate::transport::SerialTransport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Read timeout used when none is given on acquisition
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

type Factory<T> = Box<dyn Fn(&str) -> T + Send + Sync>;

/// One [`Session`] per port identifier.
///
/// Acquiring an identifier a second time returns the session created the
/// first time, with its read timeout replaced by the newly requested one.
/// Sessions are never removed.
pub struct Registry<T> {
    factory: Factory<T>,
    sessions: Mutex<HashMap<String, Arc<Session<T>>>>,
}

impl<T: Transport> Registry<T> {
    /// `factory` builds the transport for a port identifier the first time it
    /// is acquired. It should not touch the device; that happens on `open`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> T + Send + Sync + 'static,
    {
        Registry {
            factory: Box::new(factory),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(&self, port: &str) -> Arc<Session<T>> {
        self.acquire_with_timeout(port, DEFAULT_TIMEOUT)
    }

    pub fn acquire_with_timeout(&self, port: &str, timeout: Duration) -> Arc<Session<T>> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let session = sessions
            .entry(port.to_string())
            .or_insert_with(|| {
                log::debug!("[{}] new session", port);
                Arc::new(Session::new(port, (self.factory)(port), timeout))
            });
        session.set_timeout(timeout);
        Arc::clone(session)
    }

    /// Identifiers acquired so far
    pub fn ports(&self) -> Vec<String> {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ports: Vec<String> = sessions.keys().cloned().collect();
        ports.sort();
        ports
    }
}

#[cfg(feature = "serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
impl Registry<SerialTransport> {
    /// Registry of host serial ports, keyed by device path
    pub fn serial() -> Self {
        Registry::new(|port: &str| SerialTransport::new(port))
    }
}
