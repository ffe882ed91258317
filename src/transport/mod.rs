//! Byte-level transports a [`Session`](crate::Session) talks through.

use std::io;
use std::time::Duration;

mod hal;
pub use hal::{HalTransport, MonotonicCounter};

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
pub use serial::SerialTransport;

#[cfg(test)]
pub(crate) mod mock;

/// UART parity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// UART line parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl LineSettings {
    /// 9600 baud, 8N1, as required by the MH-Z19B
    pub const MHZ19B: LineSettings = LineSettings {
        baud_rate: 9600,
        data_bits: 8,
        stop_bits: 1,
        parity: Parity::None,
    };
}

impl Default for LineSettings {
    fn default() -> Self {
        LineSettings::MHZ19B
    }
}

/// Port owned by a single session.
///
/// `open` and `close` may be called repeatedly over the transport's lifetime.
pub trait Transport: Send {
    fn open(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    fn is_open(&self) -> bool;

    /// Apply line parameters to an open port
    fn configure(&mut self, settings: &LineSettings) -> io::Result<()>;

    /// Blocking timeout for both reads and writes
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard any inbound bytes not read yet
    fn clear_input(&mut self) -> io::Result<()>;

    /// Write `data`, returning the number of bytes accepted
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Fill `buffer`, blocking for at most `timeout`.
    ///
    /// Returns the number of bytes read; fewer than `buffer.len()` means the
    /// timeout elapsed first.
    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Name the operating system uses for the port
    fn system_port_name(&self) -> String;
}
