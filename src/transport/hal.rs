//! Transport over any `embedded-hal` serial peripheral

use super::{LineSettings, Transport};
use core::fmt::Debug;
use embedded_hal::serial::{Read, Write};
use std::io;
use std::time::Duration;

pub trait MonotonicCounter {
    /// Returns a measurement of the monotonic counter
    fn value(&self) -> u32;

    /// Returns the frequency at which the monotonic counter is operating at
    fn frequency(&self) -> u32;
}

impl MonotonicCounter for std::time::Instant {
    fn value(&self) -> u32 {
        (self.elapsed().as_millis() & 0xffffffff) as u32
    }

    fn frequency(&self) -> u32 {
        1000
    }
}

/// Wraps a non-blocking `embedded-hal` serial peripheral and a counter used to
/// time out reads and writes.
///
/// The peripheral is expected to be configured for 9600 8N1 by whoever
/// created it; `open` and `close` only track the logical state.
pub struct HalTransport<S, C> {
    name: String,
    serial: S,
    counter: C,
    timeout: Duration,
    open: bool,
}

impl<E, S, C> HalTransport<S, C>
where
    E: Debug,
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    C: MonotonicCounter,
{
    pub fn new(name: impl Into<String>, serial: S, counter: C) -> Self {
        Self {
            name: name.into(),
            serial,
            counter,
            timeout: crate::DEFAULT_TIMEOUT,
            open: false,
        }
    }

    pub fn free(self) -> (S, C) {
        (self.serial, self.counter)
    }

    /// `timeout` expressed in counter ticks, at least one
    fn ticks(&self, timeout: Duration) -> u32 {
        let ticks = timeout.as_micros() * u128::from(self.counter.frequency()) / 1_000_000;
        ticks.clamp(1, u128::from(u32::MAX)) as u32
    }

    fn expired(&self, t0: u32, dt: u32) -> bool {
        self.counter.value().wrapping_sub(t0) >= dt
    }
}

fn serial_error<E: Debug>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("serial error: {:?}", e))
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what))
}

impl<E, S, C> Transport for HalTransport<S, C>
where
    E: Debug,
    S: Read<u8, Error = E> + Write<u8, Error = E> + Send,
    C: MonotonicCounter + Send,
{
    fn open(&mut self) -> io::Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn configure(&mut self, settings: &LineSettings) -> io::Result<()> {
        log::debug!(
            "[{}] line settings {:?} are owned by the HAL peripheral",
            self.name,
            settings
        );
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let t0 = self.counter.value();
        let dt = self.ticks(self.timeout);

        loop {
            if self.expired(t0, dt) {
                return Err(timed_out("clearing input"));
            }
            match self.serial.read() {
                Ok(_) => continue,
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(serial_error(e)),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let t0 = self.counter.value();
        let dt = self.ticks(self.timeout);

        for b in data {
            loop {
                if self.expired(t0, dt) {
                    return Err(timed_out("write"));
                }
                match self.serial.write(*b) {
                    Ok(()) => break,
                    Err(nb::Error::Other(e)) => return Err(serial_error(e)),
                    Err(nb::Error::WouldBlock) => {}
                }
            }
        }

        loop {
            if self.expired(t0, dt) {
                return Err(timed_out("flush"));
            }
            match self.serial.flush() {
                Ok(()) => return Ok(data.len()),
                Err(nb::Error::Other(e)) => return Err(serial_error(e)),
                Err(nb::Error::WouldBlock) => {}
            }
        }
    }

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let t0 = self.counter.value();
        let dt = self.ticks(timeout);

        let mut filled = 0;
        while filled < buffer.len() {
            if self.expired(t0, dt) {
                break;
            }
            match self.serial.read() {
                Ok(byte) => {
                    buffer[filled] = byte;
                    filled += 1;
                }
                Err(nb::Error::Other(e)) => return Err(serial_error(e)),
                Err(nb::Error::WouldBlock) => {}
            }
        }
        Ok(filled)
    }

    fn system_port_name(&self) -> String {
        self.name.clone()
    }
}
